//! Release management through the helm CLI.
//!
//! Values are written to helm's stdin as JSON (`--values -`); JSON is
//! valid YAML, so no YAML serializer is needed.

use async_trait::async_trait;
use serde::Deserialize;
use testbed_core::{
    InstallHandle, RemoteError, RemoteResult, Values, WorkloadInstaller, WorkloadSource,
};
use tracing::info;

use crate::command::{strings, CommandRunner, Tool};

/// The part of `helm install --output json` we read back.
#[derive(Debug, Deserialize)]
struct ReleaseInfo {
    name: String,
    version: u32,
}

#[derive(Debug, Clone)]
pub struct Helm {
    runner: CommandRunner,
}

impl Helm {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }

    fn chart(source: &WorkloadSource) -> String {
        match source {
            WorkloadSource::Local { path } => path.display().to_string(),
            WorkloadSource::Remote { url } => url.clone(),
        }
    }

    fn wait_flags(&self, args: &mut Vec<String>) {
        let config = self.runner.config();
        if config.wait {
            args.push("--wait".to_string());
            args.push("--timeout".to_string());
            args.push(config.install_timeout.clone());
        }
    }

    pub(crate) fn install_args(&self, namespace: &str, release: &str, source: &WorkloadSource) -> Vec<String> {
        let chart = Self::chart(source);
        let mut args = strings([
            "install", release, chart.as_str(), "--namespace", namespace, "--values", "-", "--output", "json",
        ]);
        self.wait_flags(&mut args);
        args
    }

    pub(crate) fn upgrade_args(&self, namespace: &str, release: &str, source: &WorkloadSource) -> Vec<String> {
        let chart = Self::chart(source);
        let mut args = strings(["upgrade", release, chart.as_str(), "--namespace", namespace, "--values", "-"]);
        self.wait_flags(&mut args);
        args
    }
}

fn values_json(values: &Values) -> RemoteResult<String> {
    serde_json::to_string(values).map_err(|e| RemoteError::Parse(e.to_string()))
}

#[async_trait]
impl WorkloadInstaller for Helm {
    async fn install(
        &self,
        namespace: &str,
        release: &str,
        source: &WorkloadSource,
        values: &Values,
    ) -> RemoteResult<InstallHandle> {
        let args = self.install_args(namespace, release, source);
        let values = values_json(values)?;
        let stdout = self
            .runner
            .run(Tool::Helm, &args, Some(values.as_str()))
            .await?;
        let info: ReleaseInfo = serde_json::from_str(&stdout)
            .map_err(|e| RemoteError::Parse(format!("helm install output: {e}")))?;
        info!(%namespace, release = %info.name, revision = info.version, "helm release installed");
        Ok(InstallHandle {
            release: info.name,
            revision: info.version,
        })
    }

    async fn upgrade(
        &self,
        namespace: &str,
        release: &str,
        source: &WorkloadSource,
        values: &Values,
    ) -> RemoteResult<()> {
        let args = self.upgrade_args(namespace, release, source);
        let values = values_json(values)?;
        self.runner
            .run(Tool::Helm, &args, Some(values.as_str()))
            .await?;
        info!(%namespace, %release, "helm release upgraded");
        Ok(())
    }

    async fn uninstall(&self, namespace: &str, release: &str) -> RemoteResult<()> {
        let args = strings(["uninstall", release, "--namespace", namespace]);
        self.runner.run(Tool::Helm, &args, None).await?;
        info!(%namespace, %release, "helm release uninstalled");
        Ok(())
    }
}
