//! Namespaces, pod discovery and exec through kubectl.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use testbed_core::{
    ExecOutput, Instance, InstanceDiscovery, NamespaceProvisioner, RemoteError, RemoteExec,
    RemoteResult, Scope,
};
use tracing::{debug, info};

use crate::command::{strings, CommandRunner, Tool};

/// Label helm puts on every resource of a release.
pub const RELEASE_LABEL: &str = "app.kubernetes.io/instance";
/// Label whose value prefixes connection ids; falls back to the release.
pub const APP_LABEL: &str = "app";

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: PodMeta,
    spec: PodSpec,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Deserialize)]
struct PodMeta {
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct PodSpec {
    #[serde(default)]
    containers: Vec<Container>,
}

#[derive(Debug, Deserialize)]
struct Container {
    name: String,
    #[serde(default)]
    ports: Vec<ContainerPort>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerPort {
    #[serde(default)]
    name: Option<String>,
    container_port: u16,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatus {
    #[serde(default)]
    phase: Option<String>,
    #[serde(default, rename = "podIP")]
    pod_ip: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Kubectl {
    runner: CommandRunner,
}

impl Kubectl {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }
}

/// Turn `kubectl get pods -o json` output into instances ordered by ordinal.
///
/// StatefulSet pods (`name-<n>`) sort by their numeric suffix; ordinals are
/// the positions in that order. Finished pods are skipped.
pub(crate) fn parse_instances(json: &str, namespace: &str, release: &str) -> RemoteResult<Vec<Instance>> {
    let list: PodList =
        serde_json::from_str(json).map_err(|e| RemoteError::Parse(format!("pod list: {e}")))?;

    let mut pods: Vec<Pod> = list
        .items
        .into_iter()
        .filter(|p| !matches!(p.status.phase.as_deref(), Some("Succeeded" | "Failed")))
        .collect();
    pods.sort_by(|a, b| {
        (stateful_index(&a.metadata.name), &a.metadata.name)
            .cmp(&(stateful_index(&b.metadata.name), &b.metadata.name))
    });

    Ok(pods
        .into_iter()
        .enumerate()
        .map(|(ordinal, pod)| {
            let label = pod
                .metadata
                .labels
                .get(APP_LABEL)
                .cloned()
                .unwrap_or_else(|| release.to_string());
            let address = pod
                .status
                .pod_ip
                .clone()
                .unwrap_or_else(|| format!("{}.{namespace}", pod.metadata.name));
            Instance {
                ordinal: ordinal as u32,
                label,
                address,
                scopes: pod
                    .spec
                    .containers
                    .into_iter()
                    .map(|c| Scope {
                        name: c.name,
                        ports: c
                            .ports
                            .into_iter()
                            .map(|p| {
                                let name = p.name.unwrap_or_else(|| p.container_port.to_string());
                                (name, p.container_port)
                            })
                            .collect(),
                    })
                    .collect(),
                name: pod.metadata.name,
            }
        })
        .collect())
}

fn stateful_index(name: &str) -> Option<u32> {
    name.rsplit_once('-').and_then(|(_, n)| n.parse().ok())
}

#[async_trait]
impl NamespaceProvisioner for Kubectl {
    async fn create_namespace(&self, namespace: &str) -> RemoteResult<()> {
        let args = strings(["create", "namespace", namespace]);
        match self.runner.run(Tool::Kubectl, &args, None).await {
            Ok(_) => {
                info!(%namespace, "namespace created");
                Ok(())
            }
            Err(RemoteError::Command { stderr, .. }) if stderr.contains("AlreadyExists") => {
                debug!(%namespace, "namespace already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_namespace(&self, namespace: &str) -> RemoteResult<()> {
        let args = strings(["delete", "namespace", namespace, "--ignore-not-found"]);
        self.runner.run(Tool::Kubectl, &args, None).await?;
        info!(%namespace, "namespace deleted");
        Ok(())
    }
}

#[async_trait]
impl InstanceDiscovery for Kubectl {
    async fn list_instances(&self, namespace: &str, release: &str) -> RemoteResult<Vec<Instance>> {
        let selector = format!("{RELEASE_LABEL}={release}");
        let args = strings([
            "get", "pods", "--namespace", namespace, "--selector", selector.as_str(), "--output", "json",
        ]);
        let stdout = self.runner.run(Tool::Kubectl, &args, None).await?;
        parse_instances(&stdout, namespace, release)
    }
}

#[async_trait]
impl RemoteExec for Kubectl {
    async fn exec(
        &self,
        namespace: &str,
        instance: &str,
        scope: &str,
        command: &[String],
    ) -> RemoteResult<ExecOutput> {
        let mut args = strings(["exec", "--namespace", namespace, instance, "--container", scope, "--"]);
        args.extend(command.iter().cloned());
        let output = self.runner.output(Tool::Kubectl, &args, None).await?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PODS: &str = r#"{
        "items": [
            {
                "metadata": {"name": "plugin-node-10", "labels": {"app": "plugin-node"}},
                "spec": {"containers": [
                    {"name": "node", "ports": [{"name": "access", "containerPort": 6688}]}
                ]},
                "status": {"phase": "Running", "podIP": "10.0.0.12"}
            },
            {
                "metadata": {"name": "plugin-node-2", "labels": {"app": "plugin-node"}},
                "spec": {"containers": [
                    {"name": "node", "ports": [{"name": "access", "containerPort": 6688}]},
                    {"name": "db", "ports": [{"containerPort": 5432}]}
                ]},
                "status": {"phase": "Running", "podIP": "10.0.0.7"}
            },
            {
                "metadata": {"name": "plugin-node-migrate-x7k2p"},
                "spec": {"containers": [{"name": "migrate"}]},
                "status": {"phase": "Succeeded"}
            }
        ]
    }"#;

    #[test]
    fn pods_become_instances_in_stateful_order() {
        let instances = parse_instances(PODS, "ns", "plugin").unwrap();
        assert_eq!(instances.len(), 2);

        assert_eq!(instances[0].name, "plugin-node-2");
        assert_eq!(instances[0].ordinal, 0);
        assert_eq!(instances[0].label, "plugin-node");
        assert_eq!(instances[0].address, "10.0.0.7");
        assert_eq!(instances[0].scopes[1].ports["5432"], 5432);

        assert_eq!(instances[1].name, "plugin-node-10");
        assert_eq!(instances[1].ordinal, 1);
        assert_eq!(instances[1].scopes[0].ports["access"], 6688);
    }

    #[test]
    fn label_and_address_fall_back() {
        let json = r#"{"items": [{"metadata": {"name": "geth-7d9f"}, "spec": {"containers": []}}]}"#;
        let instances = parse_instances(json, "ns", "geth").unwrap();
        assert_eq!(instances[0].label, "geth");
        assert_eq!(instances[0].address, "geth-7d9f.ns");
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(
            parse_instances("not json", "ns", "geth"),
            Err(RemoteError::Parse(_))
        ));
    }
}
