//! Local tunnels to every exposed instance port.
//!
//! Tunnels are tracked per workload and keyed by (instance, remote port), so
//! a reconnect reuses the tunnels that still point at a live instance and
//! closes the rest. Connection records are rebuilt from scratch on every
//! connect and swapped into the descriptor in one step.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use testbed_core::{ExecOutput, RemoteError};
use tokio::task::JoinSet;
use tracing::{debug, info, warn, Instrument};

use crate::environment::Environment;
use crate::error::{EnvError, EnvResult, FailureReport};
use crate::workload::{connection_id, ConnectionId, ConnectionRecord};

/// URL scheme used when rendering connection URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
    Ws,
    Wss,
    Tcp,
    Postgres,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
            Scheme::Tcp => "tcp",
            Scheme::Postgres => "postgres",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TunnelKey {
    instance: String,
    remote_port: u16,
}

type TunnelSet = HashMap<TunnelKey, u16>;

/// Open tunnels of every workload: workload name → (instance, remote port) → local port.
#[derive(Debug, Default)]
pub(crate) struct TunnelTable {
    tunnels: Mutex<HashMap<String, TunnelSet>>,
}

impl TunnelTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, TunnelSet>> {
        self.tunnels.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self, workload: &str) -> TunnelSet {
        self.lock().get(workload).cloned().unwrap_or_default()
    }

    fn snapshot_all(&self) -> HashMap<String, TunnelSet> {
        self.lock().clone()
    }

    fn insert(&self, workload: &str, key: TunnelKey, local_port: u16) {
        self.lock()
            .entry(workload.to_string())
            .or_default()
            .insert(key, local_port);
    }

    fn remove(&self, workload: &str, key: &TunnelKey) {
        let mut tunnels = self.lock();
        if let Some(set) = tunnels.get_mut(workload) {
            set.remove(key);
            if set.is_empty() {
                tunnels.remove(workload);
            }
        }
    }

    pub(crate) fn open_count(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }
}

/// Discover the instances of `name` and (re)build its connections.
///
/// Every tunnel is registered in the table the moment it opens and removed
/// only once it is closed, so dropping this future part-way leaves nothing
/// untracked: a later disconnect or teardown still closes it.
pub(crate) async fn connect(env: &Environment, name: &str) -> EnvResult<()> {
    let namespace = env.require_namespace()?;
    let release = env.with_descriptor(|d| d.get(name).map(|w| w.release_name.clone()))?;
    let collaborators = env.collaborators();

    let instances = collaborators
        .discovery
        .list_instances(&namespace, &release)
        .await
        .map_err(|e| EnvError::remote(name, "discover", e))?;

    let table = env.tunnels();
    let mut stale = table.snapshot(name);
    let mut current = TunnelSet::new();
    let mut opened = Vec::new();
    let mut records = BTreeMap::new();
    let mut failure = None;

    'instances: for instance in &instances {
        for scope in &instance.scopes {
            let mut record = ConnectionRecord {
                ordinal: instance.ordinal,
                scope: scope.name.clone(),
                remote_host: instance.address.clone(),
                ..ConnectionRecord::default()
            };
            for (port_name, &remote_port) in &scope.ports {
                let key = TunnelKey {
                    instance: instance.name.clone(),
                    remote_port,
                };
                let local_port = if let Some(&port) = current.get(&key) {
                    port
                } else if let Some(port) = stale.remove(&key) {
                    port
                } else {
                    match collaborators
                        .tunnels
                        .open_tunnel(&namespace, &instance.name, remote_port)
                        .await
                    {
                        Ok(port) => {
                            table.insert(name, key.clone(), port);
                            opened.push((key.clone(), port));
                            port
                        }
                        Err(e) => {
                            failure = Some((key, e));
                            break 'instances;
                        }
                    }
                };
                current.insert(key, local_port);
                record.local_ports.insert(port_name.clone(), local_port);
                record.remote_ports.insert(port_name.clone(), remote_port);
            }
            records.insert(
                connection_id(&instance.label, instance.ordinal, &scope.name),
                record,
            );
        }
    }

    if let Some((key, err)) = failure {
        warn!(
            workload = %name,
            instance = %key.instance,
            remote_port = key.remote_port,
            error = %err,
            "tunnel failed, rolling back connect"
        );
        // Reused and stale tunnels stay registered with the previous records.
        for (key, port) in &opened {
            match collaborators.tunnels.close_tunnel(*port).await {
                Ok(()) => table.remove(name, key),
                Err(e) => {
                    warn!(workload = %name, local_port = port, error = %e, "failed to close tunnel");
                }
            }
        }
        return Err(EnvError::remote(name, "open tunnel", err));
    }

    let tunnel_count = current.len();
    env.with_descriptor_mut(|d| {
        if let Ok(workload) = d.get_mut(name) {
            workload.connections = records;
        }
    });

    for (key, port) in stale {
        debug!(workload = %name, instance = %key.instance, local_port = port, "closing stale tunnel");
        match collaborators.tunnels.close_tunnel(port).await {
            Ok(()) => table.remove(name, &key),
            Err(e) => {
                warn!(workload = %name, local_port = port, error = %e, "failed to close stale tunnel");
            }
        }
    }

    info!(
        workload = %name,
        instances = instances.len(),
        tunnels = tunnel_count,
        opened = opened.len(),
        "workload connected"
    );
    Ok(())
}

/// Connect every workload concurrently; failures never stop the others.
pub(crate) async fn connect_all(env: &Environment) -> EnvResult<()> {
    let names: Vec<String> = env.with_descriptor(|d| d.workloads.keys().cloned().collect());
    let mut report = FailureReport::new("connect");
    let mut set = JoinSet::new();

    for name in names {
        let env = env.clone();
        let span = env.span().clone();
        set.spawn(
            async move {
                let result = connect(&env, &name).await;
                (name, result)
            }
            .instrument(span),
        );
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((name, Ok(()))) => report.succeeded.push(name),
            Ok((name, Err(e))) => {
                report.failed.insert(name, e.to_string());
            }
            Err(e) => {
                report
                    .failed
                    .insert(format!("task {}", report.failed.len()), e.to_string());
            }
        }
    }
    report.succeeded.sort();

    if report.is_clean() {
        Ok(())
    } else {
        Err(EnvError::PartialFailure(report))
    }
}

/// Close the tunnels of one workload and clear its connections.
pub(crate) async fn disconnect_workload(env: &Environment, name: &str) -> EnvResult<()> {
    env.with_descriptor(|d| d.get(name).map(|_| ()))?;
    let set = env.tunnels().snapshot(name);
    let mut report = FailureReport::new("disconnect");
    close_set(env, name, set, &mut report).await;
    env.with_descriptor_mut(|d| {
        if let Ok(workload) = d.get_mut(name) {
            workload.connections.clear();
        }
    });
    finish(report)
}

/// Close every tracked tunnel and clear the connections of every workload.
///
/// Tunnels that fail to close stay tracked so a later call retries them.
pub(crate) async fn disconnect(env: &Environment) -> EnvResult<()> {
    let all = env.tunnels().snapshot_all();
    let mut report = FailureReport::new("disconnect");
    for (name, set) in all {
        close_set(env, &name, set, &mut report).await;
    }
    env.with_descriptor_mut(|d| {
        for workload in d.workloads.values_mut() {
            workload.connections.clear();
        }
    });
    finish(report)
}

async fn close_set(env: &Environment, name: &str, set: TunnelSet, report: &mut FailureReport) {
    let tunnels = &env.collaborators().tunnels;
    for (key, port) in set {
        let target = format!("{name}/{}:{}", key.instance, key.remote_port);
        match tunnels.close_tunnel(port).await {
            Ok(()) => {
                env.tunnels().remove(name, &key);
                report.succeeded.push(target);
            }
            Err(e) => {
                warn!(workload = %name, local_port = port, error = %e, "failed to close tunnel");
                report.failed.insert(target, e.to_string());
            }
        }
    }
}

fn finish(report: FailureReport) -> EnvResult<()> {
    if report.is_clean() {
        debug!(closed = report.succeeded.len(), "tunnels closed");
        Ok(())
    } else {
        Err(EnvError::PartialFailure(report))
    }
}

/// Run a command inside one instance scope, bypassing tunnels.
pub(crate) async fn execute_in_pod(
    env: &Environment,
    name: &str,
    ordinal: u32,
    scope: &str,
    command: &[String],
) -> EnvResult<ExecOutput> {
    let namespace = env.require_namespace()?;
    let release = env.with_descriptor(|d| d.get(name).map(|w| w.release_name.clone()))?;
    let collaborators = env.collaborators();

    let instances = collaborators
        .discovery
        .list_instances(&namespace, &release)
        .await
        .map_err(|e| EnvError::remote(name, "discover", e))?;
    let instance = instances
        .iter()
        .find(|i| i.ordinal == ordinal && i.scopes.iter().any(|s| s.name == scope))
        .ok_or_else(|| EnvError::InstanceNotFound {
            workload: name.to_string(),
            ordinal,
            scope: scope.to_string(),
        })?;

    let output = collaborators
        .exec
        .exec(&namespace, &instance.name, scope, command)
        .await
        .map_err(|e| EnvError::remote(name, "exec", e))?;

    debug!(
        workload = %name,
        instance = %instance.name,
        %scope,
        exit_code = output.exit_code,
        "command executed"
    );
    if output.exit_code != 0 {
        return Err(EnvError::remote(
            name,
            "exec",
            RemoteError::Command {
                command: command.join(" "),
                status: output.exit_code,
                stderr: output.stderr,
            },
        ));
    }
    Ok(output)
}

/// Snapshot of one workload's connections with URL helpers.
#[derive(Debug, Clone, PartialEq)]
pub struct Connections {
    workload: String,
    local_host: String,
    records: BTreeMap<ConnectionId, ConnectionRecord>,
}

impl Connections {
    pub(crate) fn new(
        workload: impl Into<String>,
        local_host: impl Into<String>,
        records: BTreeMap<ConnectionId, ConnectionRecord>,
    ) -> Self {
        Self {
            workload: workload.into(),
            local_host: local_host.into(),
            records,
        }
    }

    pub fn workload(&self) -> &str {
        &self.workload
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn get(&self, id: &str) -> Option<&ConnectionRecord> {
        self.records.get(id)
    }

    pub fn records(&self) -> &BTreeMap<ConnectionId, ConnectionRecord> {
        &self.records
    }

    /// URLs of every local tunnel for `port`, ordered by instance ordinal.
    pub fn local_urls_by_port(&self, port: &str, scheme: Scheme) -> EnvResult<Vec<String>> {
        self.urls(port, |record| {
            record
                .local_ports
                .get(port)
                .map(|p| format!("{scheme}://{}:{p}", self.local_host))
        })
    }

    /// In-cluster URLs for `port`, ordered by instance ordinal.
    pub fn remote_urls_by_port(&self, port: &str, scheme: Scheme) -> EnvResult<Vec<String>> {
        self.urls(port, |record| {
            record
                .remote_ports
                .get(port)
                .map(|p| format!("{scheme}://{}:{p}", record.remote_host))
        })
    }

    pub fn local_port(&self, id: &str, port: &str) -> EnvResult<u16> {
        self.records
            .get(id)
            .and_then(|r| r.local_ports.get(port).copied())
            .ok_or_else(|| self.port_not_found(port))
    }

    pub fn remote_port(&self, id: &str, port: &str) -> EnvResult<u16> {
        self.records
            .get(id)
            .and_then(|r| r.remote_ports.get(port).copied())
            .ok_or_else(|| self.port_not_found(port))
    }

    fn urls<F>(&self, port: &str, render: F) -> EnvResult<Vec<String>>
    where
        F: Fn(&ConnectionRecord) -> Option<String>,
    {
        let mut ordered: Vec<(&ConnectionId, &ConnectionRecord)> = self.records.iter().collect();
        ordered.sort_by(|(a_id, a), (b_id, b)| a.ordinal.cmp(&b.ordinal).then_with(|| a_id.cmp(b_id)));

        let urls: Vec<String> = ordered.into_iter().filter_map(|(_, r)| render(r)).collect();
        if urls.is_empty() {
            return Err(self.port_not_found(port));
        }
        Ok(urls)
    }

    fn port_not_found(&self, port: &str) -> EnvError {
        EnvError::PortNotFound {
            workload: self.workload.clone(),
            port: port.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ordinal: u32, scope: &str, host: &str, local: u16, remote: u16) -> ConnectionRecord {
        ConnectionRecord {
            ordinal,
            scope: scope.into(),
            remote_host: host.into(),
            local_ports: [("access".to_string(), local)].into(),
            remote_ports: [("access".to_string(), remote)].into(),
        }
    }

    fn two_nodes() -> Connections {
        let mut records = BTreeMap::new();
        // Ordinal 10 sorts before 2 as a string; URLs must follow ordinals.
        records.insert(
            "node_10_node".to_string(),
            record(10, "node", "node-10.ns", 40010, 6688),
        );
        records.insert(
            "node_2_node".to_string(),
            record(2, "node", "node-2.ns", 40002, 6688),
        );
        Connections::new("node", "127.0.0.1", records)
    }

    #[test]
    fn urls_follow_ordinal_order() {
        let conns = two_nodes();
        assert_eq!(
            conns.local_urls_by_port("access", Scheme::Http).unwrap(),
            vec!["http://127.0.0.1:40002", "http://127.0.0.1:40010"]
        );
        assert_eq!(
            conns.remote_urls_by_port("access", Scheme::Ws).unwrap(),
            vec!["ws://node-2.ns:6688", "ws://node-10.ns:6688"]
        );
    }

    #[test]
    fn absent_port_is_not_found() {
        let conns = two_nodes();
        let err = conns.local_urls_by_port("p2p", Scheme::Tcp).unwrap_err();
        assert!(err.is_not_found());
        assert!(conns.local_port("node_2_node", "p2p").is_err());
        assert_eq!(conns.local_port("node_2_node", "access").unwrap(), 40002);
        assert_eq!(conns.remote_port("node_10_node", "access").unwrap(), 6688);
    }

    #[test]
    fn empty_connections_report_not_found() {
        let conns = Connections::new("geth", "127.0.0.1", BTreeMap::new());
        assert!(conns.is_empty());
        assert!(matches!(
            conns.remote_urls_by_port("http-rpc", Scheme::Http),
            Err(EnvError::PortNotFound { .. })
        ));
    }

    #[test]
    fn schemes_render_lowercase() {
        assert_eq!(Scheme::Postgres.to_string(), "postgres");
        assert_eq!(Scheme::Wss.as_str(), "wss");
    }

    #[test]
    fn tunnel_table_drops_empty_workloads() {
        let table = TunnelTable::default();
        let key = TunnelKey {
            instance: "geth-0".into(),
            remote_port: 8544,
        };
        table.insert("geth", key.clone(), 40_000);
        assert_eq!(table.open_count(), 1);
        assert_eq!(table.snapshot("geth")[&key], 40_000);

        table.remove("geth", &key);
        assert_eq!(table.open_count(), 0);
        assert!(table.snapshot_all().is_empty());
    }
}
