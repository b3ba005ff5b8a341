//! Saving, loading and layering environment descriptors.
//!
//! The persisted form is JSON. Only what is needed to reattach is written:
//! namespace identity, and per workload its release name, values and
//! connections. Priority, sources and hooks are deploy-time only.
//!
//! ```text
//! {
//!   "namespace_prefix": "plugin",
//!   "namespace_name": "plugin-k2f9x0ab",
//!   "workloads": {
//!     "geth": {
//!       "release_name": "geth",
//!       "values": { "replicas": 1 },
//!       "connections": {
//!         "geth_0_geth-network": {
//!           "local_ports": { "http-rpc": 40001 },
//!           "remote_ports": { "http-rpc": 8544 }
//!         }
//!       }
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use testbed_core::{deep_merge, Values};
use tracing::debug;

use crate::descriptor::EnvironmentDescriptor;
use crate::error::{EnvError, EnvResult};
use crate::workload::{ConnectionId, ConnectionRecord, WorkloadDescriptor};

/// Persisted state of one workload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,
    #[serde(default)]
    pub values: Values,
    #[serde(default)]
    pub connections: BTreeMap<ConnectionId, ConnectionRecord>,
}

/// Persisted state of a whole environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentDocument {
    #[serde(default)]
    pub namespace_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_name: Option<String>,
    #[serde(default)]
    pub workloads: BTreeMap<String, WorkloadDocument>,
}

/// Overlay keyed by workload name.
pub type WorkloadsDocument = BTreeMap<String, WorkloadDocument>;

impl EnvironmentDescriptor {
    pub fn to_document(&self) -> EnvironmentDocument {
        EnvironmentDocument {
            namespace_prefix: self.namespace_prefix.clone(),
            namespace_name: self.namespace().map(str::to_string),
            workloads: self
                .workloads
                .iter()
                .map(|(name, w)| {
                    (
                        name.clone(),
                        WorkloadDocument {
                            release_name: Some(w.release_name.clone()),
                            values: w.values.clone(),
                            connections: w.connections.clone(),
                        },
                    )
                })
                .collect(),
        }
    }

    /// Serialize the environment as pretty-printed JSON.
    pub fn save(&self) -> EnvResult<String> {
        serde_json::to_string_pretty(&self.to_document())
            .map_err(|e| EnvError::MalformedDescriptor(e.to_string()))
    }

    pub fn save_to_file(&self, path: &Path) -> EnvResult<()> {
        let json = self.save()?;
        std::fs::write(path, json)?;
        debug!(path = %path.display(), "environment saved");
        Ok(())
    }

    /// Build a descriptor from a saved document.
    pub fn load(json: &str) -> EnvResult<Self> {
        let mut descriptor = Self::new("");
        descriptor.load_into(json)?;
        Ok(descriptor)
    }

    pub fn load_from_file(path: &Path) -> EnvResult<Self> {
        let json = std::fs::read_to_string(path)?;
        let descriptor = Self::load(&json)?;
        debug!(path = %path.display(), workloads = descriptor.workloads.len(), "environment loaded");
        Ok(descriptor)
    }

    /// Merge a saved environment document into this descriptor.
    ///
    /// The document's namespace must agree with an already assigned one.
    pub fn load_into(&mut self, json: &str) -> EnvResult<()> {
        let doc: EnvironmentDocument =
            serde_json::from_str(json).map_err(|e| EnvError::MalformedDescriptor(e.to_string()))?;
        self.merge_document(doc)
    }

    pub fn merge_document(&mut self, doc: EnvironmentDocument) -> EnvResult<()> {
        if !doc.namespace_prefix.is_empty() {
            self.namespace_prefix = doc.namespace_prefix;
        }
        if let Some(namespace) = doc.namespace_name.as_deref() {
            self.init(Some(namespace))?;
        }
        self.merge_workloads(doc.workloads);
        Ok(())
    }

    /// Layer a workloads overlay (an object keyed by workload name) onto
    /// this descriptor.
    ///
    /// Values are deep-merged into existing workloads; unknown names are
    /// added as new pending workloads without a source. Connections in the
    /// overlay replace the workload's connections.
    pub fn decode_workloads(&mut self, json: &str) -> EnvResult<()> {
        let doc: WorkloadsDocument =
            serde_json::from_str(json).map_err(|e| EnvError::MalformedDescriptor(e.to_string()))?;
        self.merge_workloads(doc);
        Ok(())
    }

    pub fn decode_workloads_file(&mut self, path: &Path) -> EnvResult<()> {
        let json = std::fs::read_to_string(path)?;
        self.decode_workloads(&json)
    }

    fn merge_workloads(&mut self, workloads: WorkloadsDocument) {
        for (name, doc) in workloads {
            let workload = self
                .workloads
                .entry(name.clone())
                .or_insert_with(|| WorkloadDescriptor::new(name));
            if let Some(release) = doc.release_name {
                workload.release_name = release;
            }
            deep_merge(&mut workload.values, &doc.values);
            if !doc.connections.is_empty() {
                workload.connections = doc.connections;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use testbed_core::{get_path, set_path, Value};

    use super::*;

    fn connected_descriptor() -> EnvironmentDescriptor {
        let mut values = Values::new();
        set_path(&mut values, &["geth", "image", "version"], "v1.10.0");
        set_path(&mut values, &["replicas"], 2);
        set_path(&mut values, &["ratio"], 0.25);
        values.insert("args".into(), Value::from(vec!["--dev", "--http"]));

        let mut geth = WorkloadDescriptor::new("geth").with_values(values).with_priority(1);
        geth.connections.insert(
            "geth_0_geth-network".into(),
            ConnectionRecord {
                ordinal: 0,
                scope: "geth-network".into(),
                remote_host: "geth-0.ns".into(),
                local_ports: [("http-rpc".to_string(), 40001)].into(),
                remote_ports: [("http-rpc".to_string(), 8544)].into(),
            },
        );

        let mut env = EnvironmentDescriptor::new("plugin")
            .with_workload(geth)
            .with_workload(WorkloadDescriptor::new("plugin").with_release_name("plugin-node"));
        env.init(Some("plugin-test")).unwrap();
        env
    }

    #[test]
    fn save_load_roundtrip_preserves_values_and_connections() {
        let env = connected_descriptor();
        let json = env.save().unwrap();
        let loaded = EnvironmentDescriptor::load(&json).unwrap();

        assert_eq!(loaded.namespace(), Some("plugin-test"));
        assert_eq!(loaded.namespace_prefix, "plugin");
        for (name, original) in &env.workloads {
            let back = loaded.get(name).unwrap();
            assert_eq!(back.values, original.values);
            assert_eq!(back.connections, original.connections);
            assert_eq!(back.release_name, original.release_name);
        }
        // Canonical ordering makes the serialized form stable.
        assert_eq!(loaded.save().unwrap(), json);
    }

    #[test]
    fn roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.json");
        let env = connected_descriptor();
        env.save_to_file(&path).unwrap();

        let loaded = EnvironmentDescriptor::load_from_file(&path).unwrap();
        assert_eq!(loaded.to_document(), env.to_document());
    }

    #[test]
    fn load_is_independent_of_key_order() {
        let a = r#"{"workloads":{"b":{"values":{"y":1,"x":{"q":true,"p":"s"}}},"a":{}}}"#;
        let b = r#"{"workloads":{"a":{},"b":{"values":{"x":{"p":"s","q":true},"y":1}}}}"#;
        let da = EnvironmentDescriptor::load(a).unwrap();
        let db = EnvironmentDescriptor::load(b).unwrap();
        assert_eq!(da.to_document(), db.to_document());
    }

    #[test]
    fn decode_layers_literal_values_over_base() {
        let mut base = Values::new();
        set_path(&mut base, &["plugin", "image", "image"], "default/plugin");
        set_path(&mut base, &["plugin", "resources", "cpu"], "2");
        let mut env = EnvironmentDescriptor::new("plugin")
            .with_workload(WorkloadDescriptor::new("plugin").with_values(base).with_priority(2));

        let overlay = r#"{
            "geth": {"values": {"geth": {"image": {"image": "test/geth/image", "version": "v0.6.5"}}}},
            "plugin": {"values": {"plugin": {"image": {"image": "test/plugin/image", "version": "v0.6.4"}}}}
        }"#;
        env.decode_workloads(overlay).unwrap();

        let plugin = env.get("plugin").unwrap();
        assert_eq!(plugin.priority, 2);
        assert_eq!(
            get_path(&plugin.values, &["plugin", "image", "image"]),
            Some(&Value::from("test/plugin/image"))
        );
        assert_eq!(
            get_path(&plugin.values, &["plugin", "image", "version"]),
            Some(&Value::from("v0.6.4"))
        );
        assert_eq!(
            get_path(&plugin.values, &["plugin", "resources", "cpu"]),
            Some(&Value::from("2"))
        );

        let geth = env.get("geth").unwrap();
        assert!(geth.source.is_none());
        assert_eq!(
            get_path(&geth.values, &["geth", "image", "version"]),
            Some(&Value::from("v0.6.5"))
        );
    }

    #[test]
    fn decode_twice_equals_decode_once() {
        let overlay = r#"{"plugin": {"values": {"replicas": 3, "plugin": {"image": {"version": "v2"}}}}}"#;
        let mut base = Values::new();
        set_path(&mut base, &["plugin", "image", "image"], "default/plugin");

        let mut once = EnvironmentDescriptor::default()
            .with_workload(WorkloadDescriptor::new("plugin").with_values(base));
        once.decode_workloads(overlay).unwrap();
        let mut twice = once.clone();
        twice.decode_workloads(overlay).unwrap();

        assert_eq!(once.get("plugin").unwrap().values, twice.get("plugin").unwrap().values);
    }

    #[test]
    fn decode_ignores_unknown_fields() {
        let mut env = EnvironmentDescriptor::default();
        env.decode_workloads(r#"{"geth": {"values": {}, "chart_path": "/charts/geth", "index": 1}}"#)
            .unwrap();
        assert!(env.get("geth").is_ok());
    }

    #[test]
    fn malformed_documents_are_rejected() {
        let mut env = EnvironmentDescriptor::default();
        for bad in [r#"[1, 2]"#, r#"{"geth": {"values": "oops"}}"#, r#"{"geth": "#] {
            let err = env.decode_workloads(bad).unwrap_err();
            assert!(matches!(err, EnvError::MalformedDescriptor(_)), "{bad}: {err}");
        }
        assert!(matches!(
            EnvironmentDescriptor::load(r#"{"workloads": 3}"#),
            Err(EnvError::MalformedDescriptor(_))
        ));
    }

    #[test]
    fn load_into_rejects_conflicting_namespace() {
        let json = connected_descriptor().save().unwrap();
        let mut other = EnvironmentDescriptor::new("plugin").with_namespace("another-ns");
        assert!(other.load_into(&json).unwrap_err().is_validation());
    }
}
