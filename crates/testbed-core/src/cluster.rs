//! Cluster collaborator traits.
//!
//! The environment never talks to the cluster directly. Every remote
//! effect goes through one of these narrow capabilities so the
//! scheduler and connection manager can run against a real cluster
//! (`testbed-kube`) or the in-memory [`MockCluster`](crate::mock::MockCluster).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RemoteResult;
use crate::source::WorkloadSource;
use crate::values::Values;

/// Returned by a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallHandle {
    pub release: String,
    pub revision: u32,
}

/// One running replica of a workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// Cluster-side name used to address the instance (pod name).
    pub name: String,
    pub ordinal: u32,
    /// App label of the instance; prefixes its connection ids.
    pub label: String,
    /// Address reachable from inside the cluster.
    pub address: String,
    pub scopes: Vec<Scope>,
}

/// A logical sub-component of an instance (container) and its named ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub name: String,
    pub ports: BTreeMap<String, u16>,
}

/// Outcome of a command executed inside an instance.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Label selector a fault is applied against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    pub key: String,
    pub value: String,
}

/// Kind of failure to inject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FaultKind {
    /// Instances become unavailable for the duration.
    PodFailure,
    /// Instances are killed once and left to restart.
    PodKill,
    /// Outbound traffic of matching instances is delayed.
    NetworkDelay {
        #[serde(with = "millis")]
        latency: Duration,
    },
    /// Matching instances are cut off from the rest of the namespace.
    NetworkPartition,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::PodFailure => f.write_str("pod-failure"),
            FaultKind::PodKill => f.write_str("pod-kill"),
            FaultKind::NetworkDelay { .. } => f.write_str("network-delay"),
            FaultKind::NetworkPartition => f.write_str("network-partition"),
        }
    }
}

/// Opaque reference to a running fault.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FaultHandle(pub String);

impl fmt::Display for FaultHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Installs, upgrades and removes workload releases.
#[async_trait]
pub trait WorkloadInstaller: Send + Sync {
    async fn install(
        &self,
        namespace: &str,
        release: &str,
        source: &WorkloadSource,
        values: &Values,
    ) -> RemoteResult<InstallHandle>;

    async fn upgrade(
        &self,
        namespace: &str,
        release: &str,
        source: &WorkloadSource,
        values: &Values,
    ) -> RemoteResult<()>;

    async fn uninstall(&self, namespace: &str, release: &str) -> RemoteResult<()>;
}

/// Creates and removes the namespace that isolates an environment.
#[async_trait]
pub trait NamespaceProvisioner: Send + Sync {
    async fn create_namespace(&self, namespace: &str) -> RemoteResult<()>;

    async fn delete_namespace(&self, namespace: &str) -> RemoteResult<()>;
}

/// Lists the running instances of a release.
#[async_trait]
pub trait InstanceDiscovery: Send + Sync {
    /// Instances ordered by ordinal.
    async fn list_instances(&self, namespace: &str, release: &str) -> RemoteResult<Vec<Instance>>;
}

/// Opens and closes local port tunnels to instance ports.
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Open a tunnel from a freshly allocated local port; returns that port.
    async fn open_tunnel(&self, namespace: &str, instance: &str, remote_port: u16) -> RemoteResult<u16>;

    async fn close_tunnel(&self, local_port: u16) -> RemoteResult<()>;
}

/// Runs commands inside an instance scope.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    async fn exec(
        &self,
        namespace: &str,
        instance: &str,
        scope: &str,
        command: &[String],
    ) -> RemoteResult<ExecOutput>;
}

/// Starts and cancels injected faults.
#[async_trait]
pub trait FaultInjector: Send + Sync {
    async fn start_fault(
        &self,
        namespace: &str,
        selector: &Selector,
        kind: &FaultKind,
        duration: Duration,
    ) -> RemoteResult<FaultHandle>;

    async fn cancel_fault(&self, namespace: &str, handle: &FaultHandle) -> RemoteResult<()>;
}

/// The full set of collaborators an environment needs.
#[derive(Clone)]
pub struct Collaborators {
    pub installer: Arc<dyn WorkloadInstaller>,
    pub namespaces: Arc<dyn NamespaceProvisioner>,
    pub discovery: Arc<dyn InstanceDiscovery>,
    pub tunnels: Arc<dyn TunnelProvider>,
    pub exec: Arc<dyn RemoteExec>,
    pub faults: Arc<dyn FaultInjector>,
}

impl Collaborators {
    /// Use one backend for every capability.
    pub fn from_cluster<C>(cluster: Arc<C>) -> Self
    where
        C: WorkloadInstaller
            + NamespaceProvisioner
            + InstanceDiscovery
            + TunnelProvider
            + RemoteExec
            + FaultInjector
            + 'static,
    {
        Self {
            installer: cluster.clone(),
            namespaces: cluster.clone(),
            discovery: cluster.clone(),
            tunnels: cluster.clone(),
            exec: cluster.clone(),
            faults: cluster,
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
