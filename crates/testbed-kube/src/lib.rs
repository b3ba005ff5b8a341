//! testbed-kube — cluster collaborators that shell out to `helm` and `kubectl`.
//!
//! - **`command`**: runs the binaries with the configured kubeconfig and context
//! - **`helm`**: installs, upgrades and uninstalls releases
//! - **`kubectl`**: namespaces, pod discovery and exec
//! - **`port_forward`**: one `kubectl port-forward` process per tunnel
//! - **`chaos_mesh`**: faults as Chaos Mesh `PodChaos` / `NetworkChaos` resources

use std::sync::Arc;

use testbed_core::config::KubeConfig;
use testbed_core::Collaborators;

pub mod chaos_mesh;
pub mod command;
pub mod helm;
pub mod kubectl;
pub mod port_forward;

pub use chaos_mesh::ChaosMesh;
pub use command::{CommandRunner, Tool};
pub use helm::Helm;
pub use kubectl::Kubectl;
pub use port_forward::PortForwarder;

/// Collaborators for a real cluster reachable with `config`.
pub fn collaborators(config: &KubeConfig) -> anyhow::Result<Collaborators> {
    let runner = CommandRunner::new(config.clone());
    let kubectl = Arc::new(Kubectl::new(runner.clone()));
    Ok(Collaborators {
        installer: Arc::new(Helm::new(runner.clone())),
        namespaces: kubectl.clone(),
        discovery: kubectl.clone(),
        tunnels: Arc::new(PortForwarder::new(runner.clone())?),
        exec: kubectl,
        faults: Arc::new(ChaosMesh::new(runner)),
    })
}
