//! Workload descriptors: one deployable unit of an environment.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use testbed_core::{Values, WorkloadSource};

use crate::environment::Environment;

/// Callback run right before or after a workload's deploy call.
///
/// Runs synchronously on the deploying task. Anything it captures is
/// shared with sibling tasks of the same priority group.
pub type Hook = Arc<dyn Fn(&Environment) -> anyhow::Result<()> + Send + Sync>;

/// Connection identifier: `<instance label>_<ordinal>_<scope>`.
pub type ConnectionId = String;

pub fn connection_id(label: &str, ordinal: u32, scope: &str) -> ConnectionId {
    format!("{label}_{ordinal}_{scope}")
}

/// Lifecycle of a workload within one environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStatus {
    Pending,
    Deploying,
    Deployed,
    Failed,
}

/// Local and remote ports captured for one (instance, scope).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectionRecord {
    #[serde(default)]
    pub ordinal: u32,
    #[serde(default)]
    pub scope: String,
    /// In-cluster address of the instance, used for remote URLs.
    #[serde(default)]
    pub remote_host: String,
    #[serde(default)]
    pub local_ports: BTreeMap<String, u16>,
    #[serde(default)]
    pub remote_ports: BTreeMap<String, u16>,
}

/// A deployable unit: identity, install source, values, ordering, hooks,
/// and the connections discovered for it.
#[derive(Clone)]
pub struct WorkloadDescriptor {
    /// Unique key within the environment.
    pub name: String,
    /// Identity of the installed release; defaults to `name`.
    pub release_name: String,
    pub source: Option<WorkloadSource>,
    pub values: Values,
    /// Deployment group; lower priorities deploy first.
    pub priority: i32,
    pub before_hook: Option<Hook>,
    pub after_hook: Option<Hook>,
    /// Connect right after the deploy call, before the after-hook.
    pub auto_connect: bool,
    pub connections: BTreeMap<ConnectionId, ConnectionRecord>,
    pub status: DeployStatus,
    pub last_error: Option<String>,
    /// The release exists in the cluster (install succeeded at some point).
    pub(crate) installed: bool,
}

impl WorkloadDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            release_name: name.clone(),
            name,
            source: None,
            values: Values::new(),
            priority: 0,
            before_hook: None,
            after_hook: None,
            auto_connect: false,
            connections: BTreeMap::new(),
            status: DeployStatus::Pending,
            last_error: None,
            installed: false,
        }
    }

    pub fn with_release_name(mut self, release: impl Into<String>) -> Self {
        self.release_name = release.into();
        self
    }

    pub fn with_source(mut self, source: WorkloadSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_values(mut self, values: Values) -> Self {
        self.values = values;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn with_before_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Environment) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.before_hook = Some(Arc::new(hook));
        self
    }

    pub fn with_after_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Environment) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.after_hook = Some(Arc::new(hook));
        self
    }

    pub fn is_deployed(&self) -> bool {
        self.status == DeployStatus::Deployed
    }

    pub(crate) fn mark_deploying(&mut self) {
        self.status = DeployStatus::Deploying;
        self.last_error = None;
    }

    pub(crate) fn mark_deployed(&mut self) {
        self.status = DeployStatus::Deployed;
        self.last_error = None;
    }

    pub(crate) fn mark_failed(&mut self, error: String) {
        self.status = DeployStatus::Failed;
        self.last_error = Some(error);
    }

    /// Treat the release as already running (reattach path).
    pub(crate) fn mark_attached(&mut self) {
        self.status = DeployStatus::Deployed;
        self.installed = true;
    }

    pub(crate) fn reset(&mut self) {
        self.status = DeployStatus::Pending;
        self.installed = false;
        self.connections.clear();
    }
}

impl fmt::Debug for WorkloadDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkloadDescriptor")
            .field("name", &self.name)
            .field("release_name", &self.release_name)
            .field("source", &self.source)
            .field("priority", &self.priority)
            .field("auto_connect", &self.auto_connect)
            .field("before_hook", &self.before_hook.is_some())
            .field("after_hook", &self.after_hook.is_some())
            .field("status", &self.status)
            .field("connections", &self.connections.len())
            .finish()
    }
}
