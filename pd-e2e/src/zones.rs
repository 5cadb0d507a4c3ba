//! Zone and region name handling.
//!
//! GCE zone names are `<region>-<suffix>`, e.g. `us-central1-a` belongs to
//! region `us-central1`. Regional resources carry their replica zones as full
//! resource URLs, so callers usually strip the URL first with
//! [`crate::compute::resource_tail`].

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ZoneError {
    #[error("zone '{0}' has no region component")]
    Malformed(String),

    #[error("zones disagree on region: '{0}' vs '{1}'")]
    RegionMismatch(String, String),

    #[error("no zones provided")]
    Empty,
}

/// Derives the region name from a zone name by dropping the final
/// `-<suffix>` segment.
pub fn region_from_zone(zone: &str) -> Result<String, ZoneError> {
    match zone.rsplit_once('-') {
        Some((region, suffix)) if !region.is_empty() && !suffix.is_empty() => {
            Ok(region.to_string())
        }
        _ => Err(ZoneError::Malformed(zone.to_string())),
    }
}

/// Derives the region shared by all given zones, failing if they span more
/// than one region or if the list is empty.
pub fn common_region<'a, I>(zones: I) -> Result<String, ZoneError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut region: Option<String> = None;
    for zone in zones {
        let candidate = region_from_zone(zone)?;
        match &region {
            None => region = Some(candidate),
            Some(current) if *current != candidate => {
                return Err(ZoneError::RegionMismatch(current.clone(), candidate));
            }
            Some(_) => {}
        }
    }
    region.ok_or(ZoneError::Empty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_is_zone_without_suffix() {
        assert_eq!(region_from_zone("us-central1-a").unwrap(), "us-central1");
        assert_eq!(region_from_zone("europe-west1-b").unwrap(), "europe-west1");
    }

    #[test]
    fn malformed_zone_is_rejected() {
        assert_eq!(
            region_from_zone("uscentral1"),
            Err(ZoneError::Malformed("uscentral1".to_string()))
        );
        assert!(region_from_zone("").is_err());
        assert!(region_from_zone("us-central1-").is_err());
    }

    #[test]
    fn common_region_requires_agreement() {
        let region = common_region(["us-central1-a", "us-central1-c"]).unwrap();
        assert_eq!(region, "us-central1");

        let err = common_region(["us-central1-a", "us-east1-b"]).unwrap_err();
        assert_eq!(
            err,
            ZoneError::RegionMismatch("us-central1".to_string(), "us-east1".to_string())
        );
    }

    #[test]
    fn common_region_of_nothing_is_an_error() {
        assert_eq!(common_region([]), Err(ZoneError::Empty));
    }
}
