//! Faults as Chaos Mesh resources.
//!
//! Pod faults become `PodChaos`, network faults `NetworkChaos`. A handle is
//! `<resource>/<name>`, which is exactly what `kubectl delete` takes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value as Json};
use testbed_core::{FaultHandle, FaultInjector, FaultKind, RemoteError, RemoteResult, Selector};
use tracing::info;

use crate::command::{strings, CommandRunner, Tool};

const API_VERSION: &str = "chaos-mesh.org/v1alpha1";

pub struct ChaosMesh {
    runner: CommandRunner,
    counter: AtomicU64,
}

impl ChaosMesh {
    pub fn new(runner: CommandRunner) -> Self {
        Self {
            runner,
            counter: AtomicU64::new(0),
        }
    }

    fn next_name(&self, kind: &FaultKind) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{kind}-{}-{n}", std::process::id())
    }
}

/// Go-style duration string as Chaos Mesh expects it.
fn go_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 1000 == 0 {
        format!("{}s", millis / 1000)
    } else {
        format!("{millis}ms")
    }
}

/// Resource kind and plural used for `kubectl delete`.
fn resource(kind: &FaultKind) -> (&'static str, &'static str) {
    match kind {
        FaultKind::PodFailure | FaultKind::PodKill => ("PodChaos", "podchaos"),
        FaultKind::NetworkDelay { .. } | FaultKind::NetworkPartition => {
            ("NetworkChaos", "networkchaos")
        }
    }
}

pub(crate) fn manifest(
    namespace: &str,
    name: &str,
    selector: &Selector,
    kind: &FaultKind,
    duration: Duration,
) -> Json {
    let mut labels = serde_json::Map::new();
    labels.insert(selector.key.clone(), json!(selector.value));
    let target = json!({
        "namespaces": [namespace],
        "labelSelectors": labels,
    });
    let mut spec = json!({
        "mode": "all",
        "selector": target,
        "duration": go_duration(duration),
    });
    match kind {
        FaultKind::PodFailure => spec["action"] = json!("pod-failure"),
        FaultKind::PodKill => spec["action"] = json!("pod-kill"),
        FaultKind::NetworkDelay { latency } => {
            spec["action"] = json!("delay");
            spec["direction"] = json!("to");
            spec["delay"] = json!({ "latency": go_duration(*latency) });
        }
        FaultKind::NetworkPartition => {
            spec["action"] = json!("partition");
            spec["direction"] = json!("both");
            spec["target"] = json!({
                "mode": "all",
                "selector": { "namespaces": [namespace] },
            });
        }
    }

    let (resource_kind, _) = resource(kind);
    json!({
        "apiVersion": API_VERSION,
        "kind": resource_kind,
        "metadata": { "name": name, "namespace": namespace },
        "spec": spec,
    })
}

#[async_trait]
impl FaultInjector for ChaosMesh {
    async fn start_fault(
        &self,
        namespace: &str,
        selector: &Selector,
        kind: &FaultKind,
        duration: Duration,
    ) -> RemoteResult<FaultHandle> {
        let name = self.next_name(kind);
        let body = serde_json::to_string(&manifest(namespace, &name, selector, kind, duration))
            .map_err(|e| RemoteError::Parse(e.to_string()))?;
        let args = strings(["apply", "--namespace", namespace, "--filename", "-"]);
        self.runner.run(Tool::Kubectl, &args, Some(body.as_str())).await?;

        let (_, plural) = resource(kind);
        let handle = FaultHandle(format!("{plural}/{name}"));
        info!(%namespace, %handle, %kind, "chaos experiment applied");
        Ok(handle)
    }

    async fn cancel_fault(&self, namespace: &str, handle: &FaultHandle) -> RemoteResult<()> {
        let args = strings([
            "delete", "--namespace", namespace, handle.0.as_str(), "--ignore-not-found",
        ]);
        self.runner.run(Tool::Kubectl, &args, None).await?;
        info!(%namespace, %handle, "chaos experiment removed");
        Ok(())
    }
}
