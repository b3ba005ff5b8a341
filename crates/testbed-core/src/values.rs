//! Workload configuration values.
//!
//! Values are an arbitrarily nested tree handed to the installer as-is.
//! They are modelled as a closed recursive enum so merging and
//! serialization are fully defined: maps merge key-by-key, everything
//! else is replaced wholesale by the overlay.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Top-level values mapping for one workload.
pub type Values = BTreeMap<String, Value>;

/// A single configuration value.
///
/// Serialized untagged, so a `Value` reads and writes as plain JSON/TOML.
/// Maps are `BTreeMap`s, which keeps the serialized form canonical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Seq(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Build a map value from key/value pairs.
    pub fn map<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Merge `overlay` into `self`.
    ///
    /// Two maps merge recursively; any other combination replaces `self`
    /// with a clone of `overlay`.
    pub fn merge(&mut self, overlay: &Value) {
        match (self, overlay) {
            (Value::Map(base), Value::Map(over)) => deep_merge(base, over),
            (slot, over) => *slot = over.clone(),
        }
    }
}

/// Deep-merge `overlay` into `base`.
///
/// Applying the same overlay twice yields the same result as applying it once.
pub fn deep_merge(base: &mut Values, overlay: &Values) {
    for (key, over) in overlay {
        match base.get_mut(key) {
            Some(existing) => existing.merge(over),
            None => {
                base.insert(key.clone(), over.clone());
            }
        }
    }
}

/// Look up a nested value by key path.
pub fn get_path<'a>(values: &'a Values, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = values.get(*first)?;
    for key in rest {
        current = current.as_map()?.get(*key)?;
    }
    Some(current)
}

/// Set a nested value by key path, creating (or overwriting non-map)
/// intermediate entries as maps.
pub fn set_path(values: &mut Values, path: &[&str], value: impl Into<Value>) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = values;
    for key in parents {
        let slot = current
            .entry((*key).to_string())
            .or_insert_with(|| Value::Map(BTreeMap::new()));
        if !matches!(slot, Value::Map(_)) {
            *slot = Value::Map(BTreeMap::new());
        }
        current = match slot {
            Value::Map(m) => m,
            _ => return,
        };
    }
    current.insert((*last).to_string(), value.into());
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Seq(v.into_iter().map(Into::into).collect())
    }
}

impl From<Values> for Value {
    fn from(v: Values) -> Self {
        Value::Map(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(name: &str, version: &str) -> Values {
        let mut v = Values::new();
        set_path(&mut v, &["node", "image", "image"], name);
        set_path(&mut v, &["node", "image", "version"], version);
        v
    }

    #[test]
    fn merge_overrides_leaf_and_keeps_siblings() {
        let mut base = image("repo/node", "v1");
        set_path(&mut base, &["replicas"], 1);

        let mut overlay = Values::new();
        set_path(&mut overlay, &["node", "image", "version"], "v2");

        deep_merge(&mut base, &overlay);

        assert_eq!(
            get_path(&base, &["node", "image", "version"]),
            Some(&Value::from("v2"))
        );
        assert_eq!(
            get_path(&base, &["node", "image", "image"]),
            Some(&Value::from("repo/node"))
        );
        assert_eq!(get_path(&base, &["replicas"]), Some(&Value::Int(1)));
    }

    #[test]
    fn merge_is_idempotent() {
        let mut once = image("repo/node", "v1");
        let overlay = image("repo/other", "v9");
        deep_merge(&mut once, &overlay);

        let mut twice = once.clone();
        deep_merge(&mut twice, &overlay);

        assert_eq!(once, twice);
    }

    #[test]
    fn sequences_are_replaced_not_concatenated() {
        let mut base = Values::new();
        base.insert("args".into(), Value::from(vec!["a", "b"]));
        let mut overlay = Values::new();
        overlay.insert("args".into(), Value::from(vec!["c"]));

        deep_merge(&mut base, &overlay);
        assert_eq!(base["args"], Value::from(vec!["c"]));
    }

    #[test]
    fn scalar_overlay_replaces_map() {
        let mut base = image("repo/node", "v1");
        let mut overlay = Values::new();
        overlay.insert("node".into(), Value::from("disabled"));

        deep_merge(&mut base, &overlay);
        assert_eq!(base["node"], Value::from("disabled"));
    }

    #[test]
    fn set_path_replaces_scalar_parent() {
        let mut v = Values::new();
        v.insert("db".into(), Value::from(true));
        set_path(&mut v, &["db", "resources", "cpu"], "1");
        assert_eq!(get_path(&v, &["db", "resources", "cpu"]), Some(&Value::from("1")));
    }

    #[test]
    fn json_shape_is_plain() {
        let mut v = image("repo/node", "v1");
        v.insert("replicas".into(), Value::Int(3));
        v.insert("ratio".into(), Value::Float(0.5));
        v.insert("enabled".into(), Value::Bool(true));
        v.insert("extra".into(), Value::Null);

        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(
            json,
            r#"{"enabled":true,"extra":null,"node":{"image":{"image":"repo/node","version":"v1"}},"ratio":0.5,"replicas":3}"#
        );

        let back: Values = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
        assert_eq!(serde_json::to_string(&back).unwrap(), json);
    }
}
