//! Priority-group deployment with a barrier between groups.
//!
//! Pending workloads are partitioned by priority. Each group runs one task
//! per workload; the next group starts only when every task of the current
//! one has finished and all of them succeeded. Nothing is rolled back.
//!
//! ```text
//! group -1 ──► [adapter]
//!                 │ barrier
//! group  1 ──► [geth] [mockserver]
//!                 │ barrier
//! group  2 ──► [plugin]
//! ```

use std::collections::HashMap;

use testbed_core::{Values, WorkloadSource};
use tokio::task::JoinSet;
use tracing::{debug, error, info, Instrument};

use crate::environment::Environment;
use crate::error::{EnvError, EnvResult, FailureReport, HookStage};
use crate::workload::Hook;

/// Outcome of a fully successful deploy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployReport {
    /// Deployed workloads in completion order within each group.
    pub deployed: Vec<String>,
    pub groups: usize,
}

/// Everything a deploy task needs, copied out of the descriptor so the lock
/// is never held while remote calls or hooks run.
struct DeployPlan {
    release: String,
    source: Option<WorkloadSource>,
    values: Values,
    before_hook: Option<Hook>,
    after_hook: Option<Hook>,
    auto_connect: bool,
    installed: bool,
}

pub(crate) async fn deploy_all(env: &Environment) -> EnvResult<DeployReport> {
    env.require_namespace()?;
    let groups = env.with_descriptor(|d| d.priority_groups());
    let mut report = FailureReport::new("deploy");

    for (index, (priority, names)) in groups.iter().enumerate() {
        info!(priority, workloads = names.len(), "deploying priority group");

        let mut set = JoinSet::new();
        let mut tasks = HashMap::new();
        for name in names {
            let task_env = env.clone();
            let task_name = name.clone();
            let handle = set.spawn(
                async move { deploy(&task_env, &task_name).await }.instrument(env.span().clone()),
            );
            tasks.insert(handle.id(), name.clone());
        }

        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((id, Ok(()))) => {
                    if let Some(name) = tasks.remove(&id) {
                        report.succeeded.push(name);
                    }
                }
                Ok((id, Err(e))) => {
                    if let Some(name) = tasks.remove(&id) {
                        report.failed.insert(name, e.to_string());
                    }
                }
                Err(join_err) => {
                    if let Some(name) = tasks.remove(&join_err.id()) {
                        let message = if join_err.is_panic() {
                            "deploy task panicked".to_string()
                        } else {
                            join_err.to_string()
                        };
                        error!(workload = %name, %message, "deploy task aborted");
                        env.with_descriptor_mut(|d| {
                            if let Ok(w) = d.get_mut(&name) {
                                w.mark_failed(message.clone());
                            }
                        });
                        report.failed.insert(name, message);
                    }
                }
            }
        }

        if !report.is_clean() {
            report.skipped = groups[index + 1..]
                .iter()
                .flat_map(|(_, names)| names.iter().cloned())
                .collect();
            error!(%report, "deployment stopped");
            return Err(EnvError::PartialFailure(report));
        }
    }

    info!(deployed = report.succeeded.len(), groups = groups.len(), "environment deployed");
    Ok(DeployReport {
        deployed: report.succeeded,
        groups: groups.len(),
    })
}

/// Deploy one workload: before-hook, install or upgrade, auto-connect,
/// after-hook. The workload's status reflects the outcome.
pub(crate) async fn deploy(env: &Environment, name: &str) -> EnvResult<()> {
    let namespace = env.require_namespace()?;
    let plan = env.with_descriptor_mut(|d| {
        let w = d.get_mut(name)?;
        w.mark_deploying();
        Ok::<_, EnvError>(DeployPlan {
            release: w.release_name.clone(),
            source: w.source.clone(),
            values: w.values.clone(),
            before_hook: w.before_hook.clone(),
            after_hook: w.after_hook.clone(),
            auto_connect: w.auto_connect,
            installed: w.installed,
        })
    })?;

    let result = run(env, &namespace, name, plan).await;
    env.with_descriptor_mut(|d| {
        if let Ok(w) = d.get_mut(name) {
            match &result {
                Ok(()) => w.mark_deployed(),
                Err(e) => w.mark_failed(e.to_string()),
            }
        }
    });
    match &result {
        Ok(()) => info!(workload = %name, "workload deployed"),
        Err(e) => error!(workload = %name, error = %e, "workload deploy failed"),
    }
    result
}

async fn run(env: &Environment, namespace: &str, name: &str, plan: DeployPlan) -> EnvResult<()> {
    let source = plan
        .source
        .ok_or_else(|| EnvError::Validation(format!("workload {name} has no source")))?;

    if let Some(hook) = &plan.before_hook {
        run_hook(env, name, HookStage::Before, hook)?;
    }

    let installer = &env.collaborators().installer;
    if plan.installed {
        debug!(workload = %name, release = %plan.release, "release exists, upgrading");
        installer
            .upgrade(namespace, &plan.release, &source, &plan.values)
            .await
            .map_err(|e| EnvError::remote(name, "upgrade", e))?;
    } else {
        let handle = installer
            .install(namespace, &plan.release, &source, &plan.values)
            .await
            .map_err(|e| EnvError::remote(name, "install", e))?;
        debug!(workload = %name, release = %handle.release, revision = handle.revision, "release installed");
        env.with_descriptor_mut(|d| {
            if let Ok(w) = d.get_mut(name) {
                w.installed = true;
            }
        });
    }

    if plan.auto_connect {
        crate::connect::connect(env, name).await?;
    }

    if let Some(hook) = &plan.after_hook {
        run_hook(env, name, HookStage::After, hook)?;
    }
    Ok(())
}

fn run_hook(env: &Environment, name: &str, stage: HookStage, hook: &Hook) -> EnvResult<()> {
    debug!(workload = %name, %stage, "running hook");
    hook(env).map_err(|e| EnvError::Hook {
        workload: name.to_string(),
        stage,
        source: e.into(),
    })
}

/// Re-apply a deployed workload's current values.
pub(crate) async fn upgrade(env: &Environment, name: &str) -> EnvResult<()> {
    let (release, source, values, deployed) = env.with_descriptor(|d| {
        d.get(name).map(|w| {
            (
                w.release_name.clone(),
                w.source.clone(),
                w.values.clone(),
                w.installed,
            )
        })
    })?;
    if !deployed {
        return Err(EnvError::NotDeployed(name.to_string()));
    }
    let source =
        source.ok_or_else(|| EnvError::Validation(format!("workload {name} has no source")))?;
    let namespace = env.require_namespace()?;

    env.collaborators()
        .installer
        .upgrade(&namespace, &release, &source, &values)
        .await
        .map_err(|e| EnvError::remote(name, "upgrade", e))?;
    info!(workload = %name, %release, "workload upgraded");
    Ok(())
}
