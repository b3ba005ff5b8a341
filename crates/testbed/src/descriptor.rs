//! Namespace identity plus the workload set.
//!
//! The descriptor is plain data. Deployment order is derived from each
//! workload's priority, never from insertion order.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::error::{EnvError, EnvResult};
use crate::workload::{DeployStatus, WorkloadDescriptor};

/// Max length of a namespace name (DNS-1123 label).
const MAX_NAMESPACE_LEN: usize = 63;

#[derive(Debug, Clone)]
pub struct EnvironmentDescriptor {
    pub namespace_prefix: String,
    namespace_name: Option<String>,
    pub workloads: BTreeMap<String, WorkloadDescriptor>,
}

impl Default for EnvironmentDescriptor {
    fn default() -> Self {
        Self::new("testbed")
    }
}

impl EnvironmentDescriptor {
    pub fn new(namespace_prefix: impl Into<String>) -> Self {
        Self {
            namespace_prefix: namespace_prefix.into(),
            namespace_name: None,
            workloads: BTreeMap::new(),
        }
    }

    /// Pin the namespace name up front instead of generating one at init.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace_name = Some(namespace.into());
        self
    }

    /// Insert or replace a workload while building a template.
    pub fn with_workload(mut self, workload: WorkloadDescriptor) -> Self {
        self.workloads.insert(workload.name.clone(), workload);
        self
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace_name.as_deref()
    }

    /// Assign the namespace.
    ///
    /// An explicit name wins; otherwise `<prefix>-<suffix>` is generated.
    /// Once assigned the name never changes: re-init with the same (or no)
    /// name is a no-op, a different name is rejected.
    pub fn init(&mut self, name: Option<&str>) -> EnvResult<String> {
        let requested = name.map(str::trim).filter(|n| !n.is_empty());

        if let Some(existing) = &self.namespace_name {
            return match requested {
                Some(n) if n != existing => Err(EnvError::Validation(format!(
                    "namespace already set to {existing}, cannot change to {n}"
                ))),
                _ => {
                    validate_namespace(existing)?;
                    Ok(existing.clone())
                }
            };
        }

        let namespace = match requested {
            Some(n) => n.to_string(),
            None => format!("{}-{}", self.namespace_prefix, unique_suffix()),
        };
        validate_namespace(&namespace)?;
        self.namespace_name = Some(namespace.clone());
        Ok(namespace)
    }

    /// Add a workload; its name must not already be present.
    pub fn add_workload(&mut self, workload: WorkloadDescriptor) -> EnvResult<()> {
        if workload.name.trim().is_empty() {
            return Err(EnvError::Validation("workload name is empty".to_string()));
        }
        if workload.release_name.trim().is_empty() {
            return Err(EnvError::Validation(format!(
                "workload {} has an empty release name",
                workload.name
            )));
        }
        if self.workloads.contains_key(&workload.name) {
            return Err(EnvError::DuplicateWorkload(workload.name));
        }
        self.workloads.insert(workload.name.clone(), workload);
        Ok(())
    }

    pub fn get(&self, name: &str) -> EnvResult<&WorkloadDescriptor> {
        self.workloads
            .get(name)
            .ok_or_else(|| EnvError::WorkloadNotFound(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> EnvResult<&mut WorkloadDescriptor> {
        self.workloads
            .get_mut(name)
            .ok_or_else(|| EnvError::WorkloadNotFound(name.to_string()))
    }

    /// Pending workloads grouped by priority, lowest priority first.
    pub fn priority_groups(&self) -> Vec<(i32, Vec<String>)> {
        let mut groups: BTreeMap<i32, Vec<String>> = BTreeMap::new();
        for workload in self.workloads.values() {
            if workload.status == DeployStatus::Pending {
                groups
                    .entry(workload.priority)
                    .or_default()
                    .push(workload.name.clone());
            }
        }
        groups.into_iter().collect()
    }
}

fn validate_namespace(name: &str) -> EnvResult<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_edges = !name.starts_with('-') && !name.ends_with('-');
    if name.is_empty() || name.len() > MAX_NAMESPACE_LEN || !valid_chars || !valid_edges {
        return Err(EnvError::Validation(format!(
            "invalid namespace name {name:?}: must be a lowercase DNS label of at most {MAX_NAMESPACE_LEN} characters"
        )));
    }
    Ok(())
}

/// Eight lowercase hex characters from a random v4 UUID.
fn unique_suffix() -> String {
    let mut suffix = Uuid::new_v4().simple().to_string();
    suffix.truncate(8);
    suffix
}
