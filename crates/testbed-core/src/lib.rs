//! testbed-core — shared types for ephemeral test environments.
//!
//! - **`values`**: nested workload configuration and deep merge
//! - **`source`**: local or remote workload bundle references
//! - **`config`**: `testbed.toml` parsing
//! - **`cluster`**: collaborator traits every remote effect goes through
//! - **`mock`**: in-memory implementation of all collaborators

pub mod cluster;
pub mod config;
pub mod error;
pub mod mock;
pub mod source;
pub mod values;

pub use cluster::*;
pub use config::TestbedConfig;
pub use error::{RemoteError, RemoteResult};
pub use source::{SourceError, WorkloadSource};
pub use values::{deep_merge, get_path, set_path, Value, Values};
