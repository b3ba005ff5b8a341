//! testbed — ephemeral, namespaced test environments.
//!
//! Describe workloads, deploy them in priority groups, tunnel to every
//! exposed port, inject faults, and save the result so a later run can
//! reattach instead of redeploying.
//!
//! # Architecture
//!
//! ```text
//! Environment (cloneable handle)
//!   ├── EnvironmentDescriptor (namespace + workloads, one mutex)
//!   ├── scheduler   priority groups on a JoinSet, barrier between groups
//!   ├── connect     tunnels keyed by (instance, remote port), URL views
//!   ├── chaos       fault sessions with tokio-clock expiry
//!   └── Collaborators (testbed-core traits: helm/kubectl or MockCluster)
//! ```

pub mod chaos;
pub mod connect;
pub mod descriptor;
pub mod environment;
pub mod error;
pub mod persist;
pub mod presets;
pub mod scheduler;
pub mod workload;

pub use chaos::{FaultSession, FaultSpec};
pub use connect::{Connections, Scheme};
pub use descriptor::EnvironmentDescriptor;
pub use environment::{Environment, EnvironmentBuilder, TeardownGuard};
pub use error::{EnvError, EnvResult, FailureReport, HookStage};
pub use persist::{EnvironmentDocument, WorkloadDocument, WorkloadsDocument};
pub use scheduler::DeployReport;
pub use workload::{connection_id, ConnectionId, ConnectionRecord, DeployStatus, Hook, WorkloadDescriptor};

pub use testbed_core::{
    Collaborators, ExecOutput, FaultHandle, FaultKind, TestbedConfig, Value, Values,
    WorkloadSource,
};
