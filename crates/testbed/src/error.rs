//! Environment error types.

use std::collections::BTreeMap;
use std::fmt;

use testbed_core::RemoteError;
use thiserror::Error;

/// Result type alias for environment operations.
pub type EnvResult<T> = Result<T, EnvError>;

/// Which side of the deploy call a hook runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    Before,
    After,
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookStage::Before => f.write_str("before"),
            HookStage::After => f.write_str("after"),
        }
    }
}

/// Errors that can occur while building, deploying or connecting an environment.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("invalid environment: {0}")]
    Validation(String),

    #[error("workload already exists: {0}")]
    DuplicateWorkload(String),

    #[error("workload not found: {0}")]
    WorkloadNotFound(String),

    #[error("no connection of workload {workload} exposes port {port:?}")]
    PortNotFound { workload: String, port: String },

    #[error("workload {workload} has no instance {ordinal} with scope {scope:?}")]
    InstanceNotFound {
        workload: String,
        ordinal: u32,
        scope: String,
    },

    #[error("workload {0} has not been deployed")]
    NotDeployed(String),

    #[error("{operation} failed for {workload}: {source}")]
    Remote {
        workload: String,
        operation: &'static str,
        #[source]
        source: RemoteError,
    },

    #[error("{stage} hook of {workload} failed: {source}")]
    Hook {
        workload: String,
        stage: HookStage,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{0}")]
    PartialFailure(FailureReport),

    #[error("malformed environment document: {0}")]
    MalformedDescriptor(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EnvError {
    pub(crate) fn remote(workload: &str, operation: &'static str, source: RemoteError) -> Self {
        EnvError::Remote {
            workload: workload.to_string(),
            operation,
            source,
        }
    }

    /// Unknown workload, instance, or a port lookup with no match.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EnvError::WorkloadNotFound(_)
                | EnvError::PortNotFound { .. }
                | EnvError::InstanceNotFound { .. }
        )
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EnvError::Validation(_) | EnvError::DuplicateWorkload(_)
        )
    }
}

/// Aggregate outcome of a fan-out operation that did not fully succeed.
///
/// Names every workload that succeeded, failed, or never ran because an
/// earlier group failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureReport {
    pub operation: &'static str,
    pub succeeded: Vec<String>,
    /// Failed target → rendered error.
    pub failed: BTreeMap<String, String>,
    pub skipped: Vec<String>,
}

impl FailureReport {
    pub(crate) fn new(operation: &'static str) -> Self {
        Self {
            operation,
            ..Self::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} succeeded, {} failed",
            self.operation,
            self.succeeded.len(),
            self.failed.len()
        )?;
        if !self.skipped.is_empty() {
            write!(f, ", {} skipped", self.skipped.len())?;
        }
        for (name, err) in &self.failed {
            write!(f, "; {name}: {err}")?;
        }
        Ok(())
    }
}
