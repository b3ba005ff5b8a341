//! In-memory cluster for tests and local development.
//!
//! Simulates releases, instances, tunnels, exec and faults without a
//! cluster. Instance topology is declared per release with
//! [`MockCluster::with_workload`]; the replica count is read from the
//! release's `replicas` value at discovery time.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Barrier;
use tracing::debug;

use crate::cluster::*;
use crate::error::{RemoteError, RemoteResult};
use crate::source::WorkloadSource;
use crate::values::{Value, Values};

const FIRST_LOCAL_PORT: u16 = 40_000;

/// Declared shape of a mock workload's instances.
#[derive(Debug, Clone)]
struct Topology {
    label: String,
    scopes: Vec<Scope>,
}

#[derive(Debug, Clone)]
struct MockRelease {
    values: Values,
    revision: u32,
}

#[derive(Default)]
struct MockState {
    namespaces: BTreeSet<String>,
    releases: HashMap<(String, String), MockRelease>,
    topologies: HashMap<String, Topology>,
    tunnels: BTreeMap<u16, (String, u16)>,
    faults: BTreeMap<FaultHandle, Selector>,
    cancelled: Vec<FaultHandle>,
    failing_installs: HashSet<String>,
    failing_tunnels: HashSet<String>,
    failing_uninstalls: HashSet<String>,
    failing_closes: HashSet<u16>,
    slow_tunnels: HashMap<String, Duration>,
    down: HashSet<String>,
    events: Vec<String>,
}

/// In-memory stand-in for every cluster collaborator.
#[derive(Default)]
pub struct MockCluster {
    state: Mutex<MockState>,
    next_port: AtomicU16,
    next_fault: AtomicU64,
    install_delay: Option<Duration>,
    install_barrier: Option<Arc<Barrier>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self {
            next_port: AtomicU16::new(FIRST_LOCAL_PORT),
            ..Self::default()
        }
    }

    /// Declare the scopes and ports every instance of `release` exposes.
    pub fn with_workload<S, P, I>(self, release: &str, scopes: I) -> Self
    where
        S: Into<String>,
        P: IntoIterator<Item = (&'static str, u16)>,
        I: IntoIterator<Item = (S, P)>,
    {
        let scopes = scopes
            .into_iter()
            .map(|(name, ports)| Scope {
                name: name.into(),
                ports: ports
                    .into_iter()
                    .map(|(port, number)| (port.to_string(), number))
                    .collect(),
            })
            .collect();
        self.lock().topologies.insert(
            release.to_string(),
            Topology {
                label: release.to_string(),
                scopes,
            },
        );
        self
    }

    /// Override the app label instances of `release` carry.
    pub fn with_label(self, release: &str, label: &str) -> Self {
        if let Some(t) = self.lock().topologies.get_mut(release) {
            t.label = label.to_string();
        }
        self
    }

    /// Make every install sleep before returning.
    pub fn with_install_delay(mut self, delay: Duration) -> Self {
        self.install_delay = Some(delay);
        self
    }

    /// Make every install wait on a shared barrier.
    pub fn with_install_barrier(mut self, barrier: Arc<Barrier>) -> Self {
        self.install_barrier = Some(barrier);
        self
    }

    pub fn fail_install(&self, release: &str) {
        self.lock().failing_installs.insert(release.to_string());
    }

    pub fn fail_tunnels(&self, instance: &str) {
        self.lock().failing_tunnels.insert(instance.to_string());
    }

    pub fn fail_uninstall(&self, release: &str) {
        self.lock().failing_uninstalls.insert(release.to_string());
    }

    /// Make closing `local_port` fail; the tunnel stays open.
    pub fn fail_close(&self, local_port: u16) {
        self.lock().failing_closes.insert(local_port);
    }

    /// Make tunnels to `instance` take `delay` to open.
    pub fn delay_tunnels(&self, instance: &str, delay: Duration) {
        self.lock().slow_tunnels.insert(instance.to_string(), delay);
    }

    /// Drop every scripted install, uninstall, tunnel and close failure.
    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.failing_installs.clear();
        state.failing_tunnels.clear();
        state.failing_uninstalls.clear();
        state.failing_closes.clear();
    }

    /// Hide every instance of `release` from discovery.
    pub fn take_down(&self, release: &str) {
        self.lock().down.insert(release.to_string());
    }

    pub fn events(&self) -> Vec<String> {
        self.lock().events.clone()
    }

    pub fn open_tunnels(&self) -> Vec<u16> {
        self.lock().tunnels.keys().copied().collect()
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.lock().namespaces.iter().cloned().collect()
    }

    pub fn is_installed(&self, namespace: &str, release: &str) -> bool {
        self.lock()
            .releases
            .contains_key(&(namespace.to_string(), release.to_string()))
    }

    pub fn release_values(&self, namespace: &str, release: &str) -> Option<Values> {
        self.lock()
            .releases
            .get(&(namespace.to_string(), release.to_string()))
            .map(|r| r.values.clone())
    }

    pub fn active_faults(&self) -> Vec<FaultHandle> {
        self.lock().faults.keys().cloned().collect()
    }

    pub fn cancelled_faults(&self) -> Vec<FaultHandle> {
        self.lock().cancelled.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, event: String) {
        debug!(%event, "mock cluster");
        self.lock().events.push(event);
    }
}

fn replicas(values: &Values) -> u32 {
    values
        .get("replicas")
        .and_then(Value::as_i64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(1)
}

#[async_trait]
impl WorkloadInstaller for MockCluster {
    async fn install(
        &self,
        namespace: &str,
        release: &str,
        _source: &WorkloadSource,
        values: &Values,
    ) -> RemoteResult<InstallHandle> {
        self.record(format!("install-start:{release}"));
        if let Some(barrier) = &self.install_barrier {
            barrier.wait().await;
        }
        if let Some(delay) = self.install_delay {
            tokio::time::sleep(delay).await;
        }

        let result = {
            let mut state = self.lock();
            let key = (namespace.to_string(), release.to_string());
            if state.failing_installs.contains(release) {
                Err(RemoteError::Unavailable(format!("install of {release} rejected")))
            } else if state.releases.contains_key(&key) {
                Err(RemoteError::Unavailable(format!(
                    "release {release} already exists in {namespace}"
                )))
            } else {
                state.releases.insert(
                    key,
                    MockRelease {
                        values: values.clone(),
                        revision: 1,
                    },
                );
                Ok(InstallHandle {
                    release: release.to_string(),
                    revision: 1,
                })
            }
        };
        self.record(format!("install-end:{release}"));
        result
    }

    async fn upgrade(
        &self,
        namespace: &str,
        release: &str,
        _source: &WorkloadSource,
        values: &Values,
    ) -> RemoteResult<()> {
        self.record(format!("upgrade:{release}"));
        let mut state = self.lock();
        let entry = state
            .releases
            .get_mut(&(namespace.to_string(), release.to_string()))
            .ok_or_else(|| RemoteError::Unavailable(format!("release {release} not found")))?;
        entry.values = values.clone();
        entry.revision += 1;
        Ok(())
    }

    async fn uninstall(&self, namespace: &str, release: &str) -> RemoteResult<()> {
        self.record(format!("uninstall:{release}"));
        let mut state = self.lock();
        if state.failing_uninstalls.contains(release) {
            return Err(RemoteError::Unavailable(format!("uninstall of {release} rejected")));
        }
        state
            .releases
            .remove(&(namespace.to_string(), release.to_string()));
        Ok(())
    }
}

#[async_trait]
impl NamespaceProvisioner for MockCluster {
    async fn create_namespace(&self, namespace: &str) -> RemoteResult<()> {
        self.record(format!("namespace-create:{namespace}"));
        self.lock().namespaces.insert(namespace.to_string());
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> RemoteResult<()> {
        self.record(format!("namespace-delete:{namespace}"));
        let mut state = self.lock();
        state.namespaces.remove(namespace);
        state.releases.retain(|(ns, _), _| ns != namespace);
        Ok(())
    }
}

#[async_trait]
impl InstanceDiscovery for MockCluster {
    async fn list_instances(&self, namespace: &str, release: &str) -> RemoteResult<Vec<Instance>> {
        let state = self.lock();
        if state.down.contains(release) {
            return Ok(Vec::new());
        }
        let Some(installed) = state
            .releases
            .get(&(namespace.to_string(), release.to_string()))
        else {
            return Ok(Vec::new());
        };
        let Some(topology) = state.topologies.get(release) else {
            return Ok(Vec::new());
        };

        Ok((0..replicas(&installed.values))
            .map(|ordinal| Instance {
                name: format!("{}-{ordinal}", topology.label),
                ordinal,
                label: topology.label.clone(),
                address: format!("{}-{ordinal}.{namespace}", topology.label),
                scopes: topology.scopes.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl TunnelProvider for MockCluster {
    async fn open_tunnel(&self, _namespace: &str, instance: &str, remote_port: u16) -> RemoteResult<u16> {
        let delay = self.lock().slow_tunnels.get(instance).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        if state.failing_tunnels.contains(instance) {
            return Err(RemoteError::Unavailable(format!(
                "port-forward to {instance}:{remote_port} refused"
            )));
        }
        let local = self.next_port.fetch_add(1, Ordering::Relaxed);
        state.tunnels.insert(local, (instance.to_string(), remote_port));
        Ok(local)
    }

    async fn close_tunnel(&self, local_port: u16) -> RemoteResult<()> {
        let mut state = self.lock();
        if state.failing_closes.contains(&local_port) {
            return Err(RemoteError::Unavailable(format!(
                "tunnel on {local_port} did not stop"
            )));
        }
        state.tunnels.remove(&local_port);
        Ok(())
    }
}

#[async_trait]
impl RemoteExec for MockCluster {
    async fn exec(
        &self,
        _namespace: &str,
        instance: &str,
        scope: &str,
        command: &[String],
    ) -> RemoteResult<ExecOutput> {
        self.record(format!("exec:{instance}/{scope}:{}", command.join(" ")));
        let exit_code = if command.first().map(String::as_str) == Some("false") {
            1
        } else {
            0
        };
        Ok(ExecOutput {
            stdout: command.join(" "),
            stderr: String::new(),
            exit_code,
        })
    }
}

#[async_trait]
impl FaultInjector for MockCluster {
    async fn start_fault(
        &self,
        _namespace: &str,
        selector: &Selector,
        kind: &FaultKind,
        _duration: Duration,
    ) -> RemoteResult<FaultHandle> {
        let n = self.next_fault.fetch_add(1, Ordering::Relaxed);
        let handle = FaultHandle(format!("{kind}-{n}"));
        self.lock().faults.insert(handle.clone(), selector.clone());
        self.record(format!("fault-start:{handle}"));
        Ok(handle)
    }

    async fn cancel_fault(&self, _namespace: &str, handle: &FaultHandle) -> RemoteResult<()> {
        let mut state = self.lock();
        state.faults.remove(handle);
        state.cancelled.push(handle.clone());
        Ok(())
    }
}
