//! Local tunnels as `kubectl port-forward` child processes.
//!
//! Each tunnel asks kubectl for a random local port (`:<remote>`) and reads
//! the chosen port back from its first `Forwarding from` line. The child is
//! kept until the tunnel is closed and is killed if the forwarder is dropped.
//! Both output pipes are drained for the life of the child; kubectl blocks
//! once either pipe buffer fills.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use regex::Regex;
use testbed_core::{RemoteError, RemoteResult, TunnelProvider};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::command::{strings, CommandRunner, Tool};

pub struct PortForwarder {
    runner: CommandRunner,
    forwarding_re: Regex,
    children: Mutex<HashMap<u16, Child>>,
}

impl PortForwarder {
    pub fn new(runner: CommandRunner) -> anyhow::Result<Self> {
        let forwarding_re = Regex::new(r"^Forwarding from (?:127\.0\.0\.1|\[::1\]):(\d+) -> (\d+)")?;
        Ok(Self {
            runner,
            forwarding_re,
            children: Mutex::new(HashMap::new()),
        })
    }

    fn children(&self) -> MutexGuard<'_, HashMap<u16, Child>> {
        self.children.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Local port announced by a kubectl output line, if any.
    pub(crate) fn local_port(&self, line: &str) -> Option<u16> {
        self.forwarding_re
            .captures(line.trim())
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    pub(crate) fn args(namespace: &str, instance: &str, remote_port: u16) -> Vec<String> {
        let target = format!("pod/{instance}");
        let ports = format!(":{remote_port}");
        strings([
            "port-forward", "--namespace", namespace, target.as_str(), ports.as_str(),
        ])
    }

    pub fn open_count(&self) -> usize {
        self.children().len()
    }
}

/// Log every stderr line of a running tunnel until the pipe closes.
///
/// kubectl writes one error line per failed forwarded connection. Resolves
/// to the number of lines read.
pub(crate) fn drain_stderr<R>(stderr: R, local_port: u16) -> JoinHandle<usize>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut count = 0;
        while let Ok(Some(line)) = lines.next_line().await {
            count += 1;
            debug!(local_port, %line, "port-forward error output");
        }
        count
    })
}

#[async_trait]
impl TunnelProvider for PortForwarder {
    async fn open_tunnel(&self, namespace: &str, instance: &str, remote_port: u16) -> RemoteResult<u16> {
        let args = Self::args(namespace, instance, remote_port);
        let mut child = self
            .runner
            .command(Tool::Kubectl, &args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RemoteError::Unavailable("port-forward stdout not captured".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let mut local_port = None;
        while let Some(line) = lines.next_line().await? {
            if let Some(port) = self.local_port(&line) {
                local_port = Some(port);
                break;
            }
            trace!(%line, "port-forward output");
        }

        let Some(local_port) = local_port else {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                pipe.read_to_string(&mut stderr).await?;
            }
            let status = child.wait().await?;
            return Err(RemoteError::Command {
                command: self.runner.display(Tool::Kubectl, &args),
                status: status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        };

        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                trace!(local_port, %line, "port-forward output");
            }
        });
        if let Some(stderr) = child.stderr.take() {
            drain_stderr(stderr, local_port);
        }

        debug!(%namespace, %instance, remote_port, local_port, "tunnel opened");
        self.children().insert(local_port, child);
        Ok(local_port)
    }

    async fn close_tunnel(&self, local_port: u16) -> RemoteResult<()> {
        let Some(mut child) = self.children().remove(&local_port) else {
            return Ok(());
        };
        if let Err(e) = child.kill().await {
            warn!(local_port, error = %e, "failed to stop port-forward");
            return Err(e.into());
        }
        debug!(local_port, "tunnel closed");
        Ok(())
    }
}
