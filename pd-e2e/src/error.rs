//! Failure taxonomy shared across the harness.
//!
//! Every scenario outcome is classified by phase: setup failures mean the
//! harness never got a working driver, protocol errors are driver calls
//! gone wrong, verification errors are backend state disagreeing with what
//! the protocol promised, and teardown failures are collected separately so
//! they can never mask the error that triggered cleanup.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::compute::ComputeError;
use crate::config::ConfigError;
use crate::topology::TopologyError;
use crate::zones::ZoneError;

// ============================================================================
// Setup
// ============================================================================

#[derive(Error, Debug)]
pub enum SetupError {
    #[error("failed to launch driver on instance '{instance}': {source}")]
    Launch {
        instance: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to driver at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("driver at {endpoint} not ready after {waited:?}")]
    NotReady { endpoint: String, waited: Duration },

    #[error("setup call {op} failed: {status}")]
    Rpc {
        op: &'static str,
        status: Box<tonic::Status>,
    },

    #[error("driver on '{instance}' reports zone '{reported}' but the instance is in '{expected}'")]
    ZoneMismatch {
        instance: String,
        reported: String,
        expected: String,
    },
}

// ============================================================================
// Protocol
// ============================================================================

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("{op} failed: {status}")]
    Call {
        op: &'static str,
        status: Box<tonic::Status>,
    },

    #[error("{op} called out of order: volume '{volume}' is {state}")]
    OutOfOrder {
        op: &'static str,
        volume: String,
        state: &'static str,
    },

    #[error("{op} rejected before dispatch: {detail}")]
    Invalid { op: &'static str, detail: String },

    #[error("{op} returned a malformed response: {detail}")]
    Malformed { op: &'static str, detail: String },

    #[error("{op} on target failed: {source}")]
    Remote {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl ProtocolError {
    pub fn call(op: &'static str, status: tonic::Status) -> Self {
        ProtocolError::Call {
            op,
            status: Box::new(status),
        }
    }

    /// The gRPC status behind this error, if it came off the wire.
    pub fn status(&self) -> Option<&tonic::Status> {
        match self {
            ProtocolError::Call { status, .. } => Some(status),
            _ => None,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        self.code() == Some(tonic::Code::AlreadyExists)
    }

    /// True for ABORTED, the code drivers use while another operation on
    /// the same volume is still pending.
    pub fn is_operation_pending(&self) -> bool {
        self.code() == Some(tonic::Code::Aborted)
    }

    fn code(&self) -> Option<tonic::Code> {
        self.status().map(|status| status.code())
    }
}

// ============================================================================
// Verification
// ============================================================================

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("disk '{name}': {field} is '{actual}', expected '{expected}'")]
    Mismatch {
        name: String,
        field: &'static str,
        expected: String,
        actual: String,
    },

    #[error("disk '{name}' did not settle within {waited:?}: {last}")]
    SettleTimeout {
        name: String,
        waited: Duration,
        last: String,
    },

    #[error("disk '{name}' still present {waited:?} after deletion")]
    StillPresent { name: String, waited: Duration },

    #[error("marker at '{path}' reads back '{actual}', expected '{expected}'")]
    MarkerMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("{op} succeeded but should have been refused: {detail}")]
    UnexpectedSuccess { op: &'static str, detail: String },

    #[error("backend query failed: {0}")]
    Backend(#[source] ComputeError),
}

// ============================================================================
// Teardown
// ============================================================================

/// A cleanup step that did not complete. Collected, logged, and reported
/// alongside the scenario outcome instead of replacing it.
#[derive(Error, Debug)]
#[error("teardown step {step} for '{resource}' failed: {detail}")]
pub struct TeardownFailure {
    pub step: &'static str,
    pub resource: String,
    pub detail: String,
}

impl TeardownFailure {
    pub fn new(step: &'static str, resource: impl Into<String>, error: impl ToString) -> Self {
        Self {
            step,
            resource: resource.into(),
            detail: error.to_string(),
        }
    }
}

// ============================================================================
// Scenario
// ============================================================================

#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error("scenario panicked: {0}")]
    Panicked(String),
}

impl ScenarioError {
    /// Phase label used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            ScenarioError::Config(_) => "config",
            ScenarioError::Setup(_) => "setup",
            ScenarioError::Protocol(_) => "protocol",
            ScenarioError::Verify(_) => "verification",
            ScenarioError::Panicked(_) => "panic",
        }
    }
}

impl From<TopologyError> for ScenarioError {
    fn from(error: TopologyError) -> Self {
        ScenarioError::Config(ConfigError::Topology(error))
    }
}

impl From<ZoneError> for ScenarioError {
    fn from(error: ZoneError) -> Self {
        ScenarioError::Config(ConfigError::Zone(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_classifies_status_codes() {
        let exists = ProtocolError::call(
            "CreateVolume",
            tonic::Status::already_exists("volume exists with different size"),
        );
        assert!(exists.is_already_exists());
        assert!(!exists.is_operation_pending());

        let pending = ProtocolError::call(
            "CreateVolume",
            tonic::Status::aborted("operation pending for volume"),
        );
        assert!(pending.is_operation_pending());

        let ordered = ProtocolError::OutOfOrder {
            op: "NodeStageVolume",
            volume: "pd-e2e-x".to_string(),
            state: "created",
        };
        assert!(!ordered.is_already_exists());
        assert!(ordered.status().is_none());
    }

    #[test]
    fn scenario_error_reports_its_phase() {
        let error = ScenarioError::from(ProtocolError::call(
            "DeleteVolume",
            tonic::Status::internal("boom"),
        ));
        assert_eq!(error.kind(), "protocol");
        assert_eq!(ScenarioError::Panicked("?".to_string()).kind(), "panic");
    }
}
