//! Fault-injection sessions.
//!
//! A session is registered when its fault starts and stays tracked until it
//! is stopped. Expiry is measured from when the start call returned, so it
//! only filters `active()`; stopping always cancels remotely because the
//! fault may have started later and its resource outlives the duration.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use testbed_core::{FaultHandle, FaultKind, Selector};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::environment::Environment;
use crate::error::{EnvError, EnvResult, FailureReport};

/// A fault to inject against the instances matching a label selector.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultSpec {
    pub selector_key: String,
    pub selector_value: String,
    pub kind: FaultKind,
    pub duration: Duration,
}

impl FaultSpec {
    pub fn new(
        selector_key: impl Into<String>,
        selector_value: impl Into<String>,
        kind: FaultKind,
        duration: Duration,
    ) -> Self {
        Self {
            selector_key: selector_key.into(),
            selector_value: selector_value.into(),
            kind,
            duration,
        }
    }

    /// Target every instance carrying `app=<label>`.
    pub fn for_app(label: impl Into<String>, kind: FaultKind, duration: Duration) -> Self {
        Self::new("app", label, kind, duration)
    }

    fn validate(&self) -> EnvResult<()> {
        if self.selector_key.trim().is_empty() || self.selector_value.trim().is_empty() {
            return Err(EnvError::Validation(
                "fault selector key and value must be set".to_string(),
            ));
        }
        if self.duration.is_zero() {
            return Err(EnvError::Validation(
                "fault duration must be positive".to_string(),
            ));
        }
        if let FaultKind::NetworkDelay { latency } = &self.kind {
            if latency.is_zero() {
                return Err(EnvError::Validation(
                    "network delay latency must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn selector(&self) -> Selector {
        Selector {
            key: self.selector_key.clone(),
            value: self.selector_value.clone(),
        }
    }
}

/// A running fault.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultSession {
    pub handle: FaultHandle,
    pub spec: FaultSpec,
    pub started_at: Instant,
}

impl FaultSession {
    pub fn expires_at(&self) -> Instant {
        self.started_at + self.spec.duration
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at()
    }
}

#[derive(Debug, Default)]
pub(crate) struct FaultRegistry {
    sessions: Mutex<BTreeMap<FaultHandle, FaultSession>>,
}

impl FaultRegistry {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<FaultHandle, FaultSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn active(&self) -> Vec<FaultSession> {
        self.lock()
            .values()
            .filter(|s| !s.is_expired())
            .cloned()
            .collect()
    }
}

pub(crate) async fn apply(env: &Environment, spec: FaultSpec) -> EnvResult<FaultHandle> {
    spec.validate()?;
    let namespace = env.require_namespace()?;
    let target = format!("{}={}", spec.selector_key, spec.selector_value);

    let handle = env
        .collaborators()
        .faults
        .start_fault(&namespace, &spec.selector(), &spec.kind, spec.duration)
        .await
        .map_err(|e| EnvError::remote(&target, "start fault", e))?;

    info!(
        %handle,
        kind = %spec.kind,
        selector = %target,
        duration_ms = u64::try_from(spec.duration.as_millis()).unwrap_or(u64::MAX),
        "fault started"
    );
    env.faults().lock().insert(
        handle.clone(),
        FaultSession {
            handle: handle.clone(),
            spec,
            started_at: Instant::now(),
        },
    );
    Ok(handle)
}

/// Stop one session; unknown handles are a validation error.
pub(crate) async fn stop(env: &Environment, handle: &FaultHandle) -> EnvResult<()> {
    let session = env
        .faults()
        .lock()
        .remove(handle)
        .ok_or_else(|| EnvError::Validation(format!("unknown fault session {handle}")))?;
    cancel(env, &session).await
}

/// Stop every tracked session, returning how many were tracked.
pub(crate) async fn stop_all(env: &Environment) -> EnvResult<usize> {
    let sessions = std::mem::take(&mut *env.faults().lock());
    if sessions.is_empty() {
        return Ok(0);
    }

    let count = sessions.len();
    let mut report = FailureReport::new("stop faults");
    for (handle, session) in sessions {
        match cancel(env, &session).await {
            Ok(()) => report.succeeded.push(handle.to_string()),
            Err(e) => {
                report.failed.insert(handle.to_string(), e.to_string());
            }
        }
    }

    if report.is_clean() {
        info!(stopped = count, "fault sessions stopped");
        Ok(count)
    } else {
        Err(EnvError::PartialFailure(report))
    }
}

async fn cancel(env: &Environment, session: &FaultSession) -> EnvResult<()> {
    let namespace = env.require_namespace()?;
    env.collaborators()
        .faults
        .cancel_fault(&namespace, &session.handle)
        .await
        .map_err(|e| {
            warn!(handle = %session.handle, error = %e, "failed to cancel fault");
            EnvError::remote(&session.handle.0, "cancel fault", e)
        })?;
    debug!(
        handle = %session.handle,
        expired = session.is_expired(),
        "fault cancelled"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_validation() {
        let ok = FaultSpec::for_app("geth", FaultKind::PodFailure, Duration::from_secs(30));
        assert!(ok.validate().is_ok());
        assert_eq!(ok.selector().key, "app");

        let no_selector = FaultSpec::new("", "geth", FaultKind::PodKill, Duration::from_secs(1));
        assert!(no_selector.validate().unwrap_err().is_validation());

        let no_duration = FaultSpec::for_app("geth", FaultKind::NetworkPartition, Duration::ZERO);
        assert!(no_duration.validate().is_err());

        let no_latency = FaultSpec::for_app(
            "geth",
            FaultKind::NetworkDelay {
                latency: Duration::ZERO,
            },
            Duration::from_secs(5),
        );
        assert!(no_latency.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn session_expiry_follows_tokio_clock() {
        let session = FaultSession {
            handle: FaultHandle("pod-failure-0".into()),
            spec: FaultSpec::for_app("geth", FaultKind::PodFailure, Duration::from_secs(10)),
            started_at: Instant::now(),
        };
        assert!(!session.is_expired());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(session.is_expired());
    }
}
