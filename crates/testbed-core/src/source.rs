//! Where a workload bundle is installed from.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkloadSource {
    /// Bundle directory on the local filesystem: ./charts/node
    Local { path: PathBuf },
    /// Packaged bundle fetched remotely: https://charts.example.com/nginx-9.5.13.tgz
    /// or oci://registry.example.com/charts/nginx
    Remote { url: String },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("empty workload source")]
    Empty,
    #[error("unsupported source scheme: {0}")]
    UnsupportedScheme(String),
}

impl WorkloadSource {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        WorkloadSource::Local { path: path.into() }
    }

    pub fn remote(url: impl Into<String>) -> Self {
        WorkloadSource::Remote { url: url.into() }
    }

    pub fn parse(source: &str) -> Result<Self, SourceError> {
        let source = source.trim();
        if source.is_empty() {
            return Err(SourceError::Empty);
        }
        if source.starts_with("https://")
            || source.starts_with("http://")
            || source.starts_with("oci://")
        {
            Ok(WorkloadSource::Remote { url: source.to_string() })
        } else if let Some(path) = source.strip_prefix("file://") {
            Ok(WorkloadSource::Local { path: PathBuf::from(path) })
        } else if source.contains("://") {
            Err(SourceError::UnsupportedScheme(source.to_string()))
        } else {
            Ok(WorkloadSource::Local { path: PathBuf::from(source) })
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, WorkloadSource::Remote { .. })
    }
}

impl fmt::Display for WorkloadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadSource::Local { path } => write!(f, "{}", path.display()),
            WorkloadSource::Remote { url } => f.write_str(url),
        }
    }
}
