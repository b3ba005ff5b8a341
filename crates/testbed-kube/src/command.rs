//! Subprocess plumbing shared by every kube collaborator.

use std::process::{Output, Stdio};

use testbed_core::config::KubeConfig;
use testbed_core::{RemoteError, RemoteResult};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Helm,
    Kubectl,
}

/// Builds and runs `helm` / `kubectl` invocations.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    config: KubeConfig,
}

impl CommandRunner {
    pub fn new(config: KubeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &KubeConfig {
        &self.config
    }

    fn binary(&self, tool: Tool) -> &str {
        match tool {
            Tool::Helm => &self.config.helm_bin,
            Tool::Kubectl => &self.config.kubectl_bin,
        }
    }

    /// Full argument list: `args` followed by the cluster selection flags.
    pub fn args(&self, tool: Tool, args: &[String]) -> Vec<String> {
        let mut full = args.to_vec();
        if let Some(kubeconfig) = &self.config.kubeconfig {
            full.push("--kubeconfig".to_string());
            full.push(kubeconfig.display().to_string());
        }
        if let Some(context) = &self.config.context {
            full.push(match tool {
                Tool::Helm => "--kube-context".to_string(),
                Tool::Kubectl => "--context".to_string(),
            });
            full.push(context.clone());
        }
        full
    }

    pub fn display(&self, tool: Tool, args: &[String]) -> String {
        format!("{} {}", self.binary(tool), args.join(" "))
    }

    pub fn command(&self, tool: Tool, args: &[String]) -> Command {
        let mut cmd = Command::new(self.binary(tool));
        cmd.args(self.args(tool, args));
        cmd
    }

    /// Run to completion and return the raw output, whatever the exit status.
    pub async fn output(
        &self,
        tool: Tool,
        args: &[String],
        stdin: Option<&str>,
    ) -> RemoteResult<Output> {
        debug!(command = %self.display(tool, args), "running");
        let mut cmd = self.command(tool, args);
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = cmd.spawn()?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            pipe.shutdown().await?;
        }
        Ok(child.wait_with_output().await?)
    }

    /// Run to completion; a non-zero exit is a `Command` error. Returns stdout.
    pub async fn run(&self, tool: Tool, args: &[String], stdin: Option<&str>) -> RemoteResult<String> {
        let output = self.output(tool, args, stdin).await?;
        if !output.status.success() {
            return Err(RemoteError::Command {
                command: self.display(tool, args),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

pub(crate) fn strings<const N: usize>(args: [&str; N]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn cluster_flags_follow_tool() {
        let runner = CommandRunner::new(KubeConfig {
            kubeconfig: Some(PathBuf::from("/tmp/kubeconfig")),
            context: Some("kind-local".into()),
            ..KubeConfig::default()
        });
        let args = strings(["get", "pods"]);
        assert_eq!(
            runner.args(Tool::Kubectl, &args),
            strings(["get", "pods", "--kubeconfig", "/tmp/kubeconfig", "--context", "kind-local"])
        );
        assert_eq!(
            &runner.args(Tool::Helm, &args)[4..],
            &strings(["--kube-context", "kind-local"])[..]
        );
        assert_eq!(runner.display(Tool::Helm, &args), "helm get pods");
    }

    #[test]
    fn defaults_add_no_flags() {
        let runner = CommandRunner::new(KubeConfig::default());
        let args = strings(["version"]);
        assert_eq!(runner.args(Tool::Kubectl, &args), args);
    }
}
