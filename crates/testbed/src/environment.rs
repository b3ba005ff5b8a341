//! The environment handle tests hold.
//!
//! An `Environment` is cheap to clone; clones share one descriptor, one
//! tunnel table and one fault registry. The descriptor sits behind a single
//! mutex that is only taken for short synchronous sections, never across a
//! remote call or a hook.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use testbed_core::{
    deep_merge, Collaborators, ExecOutput, FaultHandle, TestbedConfig, Values,
};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{error, field, info, info_span, warn, Instrument, Span};

use crate::chaos::{self, FaultRegistry, FaultSession, FaultSpec};
use crate::connect::{self, Connections, TunnelTable};
use crate::descriptor::EnvironmentDescriptor;
use crate::error::{EnvError, EnvResult, FailureReport};
use crate::scheduler::{self, DeployReport};
use crate::workload::WorkloadDescriptor;

struct Inner {
    descriptor: Mutex<EnvironmentDescriptor>,
    collaborators: Collaborators,
    config: TestbedConfig,
    span: Span,
    tunnels: TunnelTable,
    faults: FaultRegistry,
    /// Set once teardown has completed cleanly; cleared by `init`.
    torn_down: AtomicBool,
}

/// A test environment: one namespace and the workloads deployed into it.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<Inner>,
}

/// Configures an [`Environment`] before it is created.
pub struct EnvironmentBuilder {
    descriptor: EnvironmentDescriptor,
    collaborators: Collaborators,
    config: TestbedConfig,
    span: Option<Span>,
}

impl EnvironmentBuilder {
    /// Use `config`; its namespace prefix applies when the descriptor has none.
    pub fn config(mut self, config: TestbedConfig) -> Self {
        self.config = config;
        self
    }

    /// Parent span for every log line the environment emits.
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn build(mut self) -> Environment {
        if self.descriptor.namespace_prefix.is_empty() {
            self.descriptor.namespace_prefix = self.config.namespace_prefix.clone();
        }
        let span = self.span.unwrap_or_else(|| {
            info_span!(
                "testbed",
                namespace = field::Empty,
                prefix = %self.descriptor.namespace_prefix
            )
        });
        if let Some(namespace) = self.descriptor.namespace() {
            span.record("namespace", namespace);
        }
        Environment {
            inner: Arc::new(Inner {
                descriptor: Mutex::new(self.descriptor),
                collaborators: self.collaborators,
                config: self.config,
                span,
                tunnels: TunnelTable::default(),
                faults: FaultRegistry::default(),
                torn_down: AtomicBool::new(false),
            }),
        }
    }
}

impl Environment {
    pub fn new(descriptor: EnvironmentDescriptor, collaborators: Collaborators) -> Self {
        Self::builder(descriptor, collaborators).build()
    }

    pub fn builder(
        descriptor: EnvironmentDescriptor,
        collaborators: Collaborators,
    ) -> EnvironmentBuilder {
        EnvironmentBuilder {
            descriptor,
            collaborators,
            config: TestbedConfig::default(),
            span: None,
        }
    }

    /// Reattach to an environment that is already running.
    ///
    /// Every workload is treated as deployed; nothing is installed.
    pub fn load(descriptor: EnvironmentDescriptor, collaborators: Collaborators) -> Self {
        Self::load_with(Self::builder(descriptor, collaborators))
    }

    /// Like [`Environment::load`], from a configured builder.
    pub fn load_with(builder: EnvironmentBuilder) -> Self {
        let env = builder.build();
        env.with_descriptor_mut(|d| {
            for workload in d.workloads.values_mut() {
                workload.mark_attached();
            }
        });
        info!(
            parent: env.span(),
            workloads = env.with_descriptor(|d| d.workloads.len()),
            "environment loaded"
        );
        env
    }

    /// Reuse the environment saved at `config.persisted_path` if the file
    /// exists, reconnecting to it; otherwise initialize and deploy the
    /// template and save it there.
    pub async fn deploy_or_load(
        template: EnvironmentDescriptor,
        collaborators: Collaborators,
        config: TestbedConfig,
    ) -> EnvResult<Self> {
        let persisted = config.persisted_path.clone();
        match persisted.as_deref() {
            Some(path) if path.exists() => {
                let mut descriptor = template;
                let json = std::fs::read_to_string(path)?;
                descriptor.load_into(&json)?;
                let env = Self::load_with(Self::builder(descriptor, collaborators).config(config));
                env.connect_all().await?;
                Ok(env)
            }
            _ => {
                let env = Self::builder(template, collaborators).config(config).build();
                env.init(None).await?;
                env.deploy_all().await?;
                if let Some(path) = persisted.as_deref() {
                    env.save_to_file(path)?;
                }
                Ok(env)
            }
        }
    }

    pub fn config(&self) -> &TestbedConfig {
        &self.inner.config
    }

    pub fn span(&self) -> &Span {
        &self.inner.span
    }

    pub fn namespace(&self) -> Option<String> {
        self.with_descriptor(|d| d.namespace().map(str::to_string))
    }

    /// Snapshot of the descriptor.
    pub fn descriptor(&self) -> EnvironmentDescriptor {
        self.with_descriptor(Clone::clone)
    }

    /// Snapshot of one workload.
    pub fn workload(&self, name: &str) -> EnvResult<WorkloadDescriptor> {
        self.with_descriptor(|d| d.get(name).cloned())
    }

    /// Assign the namespace and create it in the cluster.
    pub async fn init(&self, name: Option<&str>) -> EnvResult<String> {
        let namespace = self.with_descriptor_mut(|d| d.init(name))?;
        self.span().record("namespace", namespace.as_str());
        self.inner
            .collaborators
            .namespaces
            .create_namespace(&namespace)
            .instrument(self.span().clone())
            .await
            .map_err(|e| EnvError::remote(&namespace, "create namespace", e))?;
        self.inner.torn_down.store(false, Ordering::SeqCst);
        info!(parent: self.span(), %namespace, "environment initialized");
        Ok(namespace)
    }

    pub fn add_workload(&self, workload: WorkloadDescriptor) -> EnvResult<()> {
        self.with_descriptor_mut(|d| d.add_workload(workload))
    }

    pub async fn deploy(&self, name: &str) -> EnvResult<()> {
        scheduler::deploy(self, name)
            .instrument(self.span().clone())
            .await
    }

    pub async fn deploy_all(&self) -> EnvResult<DeployReport> {
        scheduler::deploy_all(self)
            .instrument(self.span().clone())
            .await
    }

    pub async fn upgrade(&self, name: &str) -> EnvResult<()> {
        scheduler::upgrade(self, name)
            .instrument(self.span().clone())
            .await
    }

    /// Replace a workload's values. Takes effect on the next deploy or upgrade.
    pub fn set_values(&self, name: &str, values: Values) -> EnvResult<()> {
        self.with_descriptor_mut(|d| {
            d.get_mut(name)?.values = values;
            Ok(())
        })
    }

    /// Deep-merge `overlay` into a workload's values.
    pub fn merge_values(&self, name: &str, overlay: &Values) -> EnvResult<()> {
        self.with_descriptor_mut(|d| {
            deep_merge(&mut d.get_mut(name)?.values, overlay);
            Ok(())
        })
    }

    pub async fn connect(&self, name: &str) -> EnvResult<()> {
        connect::connect(self, name)
            .instrument(self.span().clone())
            .await
    }

    pub async fn connect_all(&self) -> EnvResult<()> {
        connect::connect_all(self)
            .instrument(self.span().clone())
            .await
    }

    pub async fn disconnect(&self) -> EnvResult<()> {
        connect::disconnect(self)
            .instrument(self.span().clone())
            .await
    }

    pub async fn disconnect_workload(&self, name: &str) -> EnvResult<()> {
        connect::disconnect_workload(self, name)
            .instrument(self.span().clone())
            .await
    }

    /// Current connections of a workload.
    pub fn connections(&self, name: &str) -> EnvResult<Connections> {
        let records = self.with_descriptor(|d| d.get(name).map(|w| w.connections.clone()))?;
        Ok(Connections::new(
            name,
            self.inner.config.connection.local_host.clone(),
            records,
        ))
    }

    /// Run `command` in the `scope` of the workload's instance `ordinal`.
    pub async fn execute_in_pod<S: AsRef<str>>(
        &self,
        name: &str,
        ordinal: u32,
        scope: &str,
        command: &[S],
    ) -> EnvResult<ExecOutput> {
        let command: Vec<String> = command.iter().map(|s| s.as_ref().to_string()).collect();
        connect::execute_in_pod(self, name, ordinal, scope, &command)
            .instrument(self.span().clone())
            .await
    }

    pub async fn apply_fault(&self, spec: FaultSpec) -> EnvResult<FaultHandle> {
        chaos::apply(self, spec)
            .instrument(self.span().clone())
            .await
    }

    pub async fn stop_fault(&self, handle: &FaultHandle) -> EnvResult<()> {
        chaos::stop(self, handle)
            .instrument(self.span().clone())
            .await
    }

    /// Stop every tracked fault session; returns how many were tracked.
    pub async fn stop_all_faults(&self) -> EnvResult<usize> {
        chaos::stop_all(self)
            .instrument(self.span().clone())
            .await
    }

    /// Fault sessions whose duration has not elapsed yet.
    pub fn active_faults(&self) -> Vec<FaultSession> {
        self.inner.faults.active()
    }

    pub fn save(&self) -> EnvResult<String> {
        self.with_descriptor(|d| d.save())
    }

    pub fn save_to_file(&self, path: &Path) -> EnvResult<()> {
        self.with_descriptor(|d| d.save_to_file(path))
    }

    /// Remove everything the environment created.
    ///
    /// Disconnects, stops faults, uninstalls every installed workload and
    /// deletes the namespace. Every step is attempted; failures are
    /// collected into one `PartialFailure` and a later call retries what is
    /// left. Once it succeeds, calling it again is a no-op.
    pub async fn teardown(&self) -> EnvResult<()> {
        self.teardown_inner()
            .instrument(self.span().clone())
            .await
    }

    async fn teardown_inner(&self) -> EnvResult<()> {
        if self.inner.torn_down.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut report = FailureReport::new("teardown");

        if let Err(e) = connect::disconnect(self).await {
            report.failed.insert("disconnect".to_string(), e.to_string());
        }
        if let Err(e) = chaos::stop_all(self).await {
            report.failed.insert("faults".to_string(), e.to_string());
        }

        let Some(namespace) = self.namespace() else {
            info!("teardown of uninitialized environment");
            return finish_teardown(self, report);
        };

        let installed: Vec<(String, String)> = self.with_descriptor(|d| {
            d.workloads
                .values()
                .filter(|w| w.installed)
                .map(|w| (w.name.clone(), w.release_name.clone()))
                .collect()
        });
        let installer = &self.inner.collaborators.installer;
        for (name, release) in installed {
            match installer.uninstall(&namespace, &release).await {
                Ok(()) => {
                    self.with_descriptor_mut(|d| {
                        if let Ok(w) = d.get_mut(&name) {
                            w.reset();
                        }
                    });
                    report.succeeded.push(name);
                }
                Err(e) => {
                    warn!(workload = %name, error = %e, "uninstall failed");
                    report.failed.insert(name, e.to_string());
                }
            }
        }

        if let Err(e) = self
            .inner
            .collaborators
            .namespaces
            .delete_namespace(&namespace)
            .await
        {
            warn!(%namespace, error = %e, "namespace delete failed");
            report.failed.insert(namespace.clone(), e.to_string());
        }

        finish_teardown(self, report)
    }

    /// Tear the environment down when the returned guard is dropped.
    ///
    /// With `config.persistent` set the environment is kept for reattach.
    pub fn defer_teardown(&self) -> TeardownGuard {
        TeardownGuard {
            env: Some(self.clone()),
        }
    }

    pub(crate) fn lock_descriptor(&self) -> MutexGuard<'_, EnvironmentDescriptor> {
        self.inner
            .descriptor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn with_descriptor<R>(&self, f: impl FnOnce(&EnvironmentDescriptor) -> R) -> R {
        f(&self.lock_descriptor())
    }

    pub(crate) fn with_descriptor_mut<R>(
        &self,
        f: impl FnOnce(&mut EnvironmentDescriptor) -> R,
    ) -> R {
        f(&mut self.lock_descriptor())
    }

    pub(crate) fn collaborators(&self) -> &Collaborators {
        &self.inner.collaborators
    }

    pub(crate) fn tunnels(&self) -> &TunnelTable {
        &self.inner.tunnels
    }

    pub(crate) fn faults(&self) -> &FaultRegistry {
        &self.inner.faults
    }

    pub(crate) fn require_namespace(&self) -> EnvResult<String> {
        self.namespace().ok_or_else(|| {
            EnvError::Validation("environment is not initialized; call init first".to_string())
        })
    }

    /// Number of tunnels currently open across all workloads.
    pub fn open_tunnels(&self) -> usize {
        self.inner.tunnels.open_count()
    }
}

fn finish_teardown(env: &Environment, report: FailureReport) -> EnvResult<()> {
    if report.is_clean() {
        env.inner.torn_down.store(true, Ordering::SeqCst);
        info!(uninstalled = report.succeeded.len(), "environment torn down");
        Ok(())
    } else {
        error!(%report, "teardown incomplete");
        Err(EnvError::PartialFailure(report))
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("descriptor", &*self.lock_descriptor())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// Runs [`Environment::teardown`] when dropped.
///
/// On a multi-threaded runtime the drop blocks until teardown finishes; on a
/// current-thread runtime teardown is spawned and finishes in the
/// background.
#[must_use = "teardown runs when the guard is dropped"]
pub struct TeardownGuard {
    env: Option<Environment>,
}

impl TeardownGuard {
    /// Keep the environment alive; nothing runs on drop.
    pub fn disarm(mut self) {
        self.env = None;
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        let Some(env) = self.env.take() else {
            return;
        };
        if env.config().persistent {
            info!(
                parent: env.span(),
                namespace = ?env.namespace(),
                "persistent environment kept"
            );
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!(parent: env.span(), "no tokio runtime, skipping deferred teardown");
            return;
        };
        match handle.runtime_flavor() {
            RuntimeFlavor::MultiThread => {
                let result =
                    tokio::task::block_in_place(|| handle.block_on(env.teardown()));
                if let Err(e) = result {
                    error!(parent: env.span(), error = %e, "deferred teardown failed");
                }
            }
            _ => {
                handle.spawn(async move {
                    if let Err(e) = env.teardown().await {
                        error!(parent: env.span(), error = %e, "deferred teardown failed");
                    }
                });
            }
        }
    }
}
