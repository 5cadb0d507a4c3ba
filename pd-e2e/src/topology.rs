//! Accessibility requirement construction.

use std::collections::HashMap;

use thiserror::Error;

use crate::csi;

/// Segment key under which GCE PD drivers advertise their zone.
pub const ZONE_TOPOLOGY_KEY: &str = "topology.gke.io/zone";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("topology segment key must be non-empty")]
    EmptyKey,
}

/// Builds a `TopologyRequirement` from zero or more requisite segments.
///
/// Each call to [`zone`](TopologyBuilder::zone) or
/// [`segment`](TopologyBuilder::segment) adds one requisite entry, so a
/// multi-zone requirement lets the driver pick any listed zone. An empty
/// builder yields no requirement at all, leaving placement entirely to the
/// driver.
#[derive(Debug, Default)]
pub struct TopologyBuilder {
    requisite: Vec<HashMap<String, String>>,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a requisite zone under [`ZONE_TOPOLOGY_KEY`].
    pub fn zone(self, zone: &str) -> Self {
        self.segment(ZONE_TOPOLOGY_KEY, zone)
    }

    /// Adds a requisite entry with a single arbitrary segment.
    pub fn segment(mut self, key: &str, value: &str) -> Self {
        let mut segments = HashMap::new();
        segments.insert(key.to_string(), value.to_string());
        self.requisite.push(segments);
        self
    }

    pub fn build(self) -> Result<Option<csi::TopologyRequirement>, TopologyError> {
        if self.requisite.is_empty() {
            return Ok(None);
        }
        for segments in &self.requisite {
            if segments.keys().any(|key| key.is_empty()) {
                return Err(TopologyError::EmptyKey);
            }
        }
        let requisite = self
            .requisite
            .into_iter()
            .map(|segments| csi::Topology { segments })
            .collect();
        Ok(Some(csi::TopologyRequirement {
            requisite,
            preferred: Vec::new(),
        }))
    }
}

/// Requirement pinning a volume to exactly one zone.
pub fn zone_requirement(zone: &str) -> csi::TopologyRequirement {
    let mut segments = HashMap::new();
    segments.insert(ZONE_TOPOLOGY_KEY.to_string(), zone.to_string());
    csi::TopologyRequirement {
        requisite: vec![csi::Topology { segments }],
        preferred: Vec::new(),
    }
}
