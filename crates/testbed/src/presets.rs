//! Ready-made environments and workload values for simulated networks.

use std::collections::BTreeMap;
use std::path::Path;

use testbed_core::{set_path, Value, Values, WorkloadSource};
use tracing::warn;

use crate::descriptor::EnvironmentDescriptor;
use crate::workload::WorkloadDescriptor;

/// Priority simulated networks deploy at.
pub const NETWORK_PRIORITY: i32 = 1;

/// Namespace prefix of the plugin environments when none is given.
pub const DEFAULT_PREFIX: &str = "plugin";

pub const MOCKSERVER_CONFIG: &str = "mockserver-config";
pub const MOCKSERVER: &str = "mockserver";
pub const PLUGIN: &str = "plugin";

/// A simulated network: workload name plus its values.
pub type SimulatedNetwork = fn() -> (String, Values);

/// Low-power geth with chart defaults.
pub fn default_geth() -> (String, Values) {
    ("geth".to_string(), Values::new())
}

/// Geth with more resources, bigger blocks and one-second blocks.
pub fn performance_geth() -> (String, Values) {
    let mut values = Values::new();
    values.insert("resources".into(), resources("1", "1024Mi"));
    values.insert(
        "config_args".into(),
        geth_args("1", "30000000000").into(),
    );
    ("geth".to_string(), values)
}

/// Geth tuned to mainnet block timing.
pub fn realistic_geth() -> (String, Values) {
    let mut values = Values::new();
    values.insert("resources".into(), resources("1", "1024Mi"));
    values.insert(
        "config_args".into(),
        geth_args("14", "15000000000").into(),
    );
    ("geth".to_string(), values)
}

fn geth_args(period: &str, gas_target: &str) -> Values {
    [
        ("--dev.period", period),
        ("--miner.threads", "1"),
        ("--miner.gasprice", "10000000000"),
        ("--miner.gastarget", gas_target),
        ("--cache", "4096"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), Value::from(v)))
    .collect()
}

/// Equal requests and limits for cpu and memory.
pub fn resources(cpu: &str, memory: &str) -> Value {
    let mut quota = Values::new();
    quota.insert("cpu".into(), cpu.into());
    quota.insert("memory".into(), memory.into());
    let mut res = Values::new();
    res.insert("requests".into(), quota.clone().into());
    res.insert("limits".into(), quota.into());
    res.into()
}

/// Add simulated network workloads, sourced from `charts_root/<name>`.
///
/// Networks sharing a workload name collapse into one workload whose
/// `replicas` counts them; the first network's values win.
pub fn add_networks(
    descriptor: &mut EnvironmentDescriptor,
    charts_root: &Path,
    networks: &[SimulatedNetwork],
) {
    let mut collected: BTreeMap<String, (u32, Values)> = BTreeMap::new();
    for network in networks {
        let (name, values) = network();
        match collected.get_mut(&name) {
            None => {
                collected.insert(name, (1, values));
            }
            Some((replicas, first)) => {
                if *first != values {
                    warn!(
                        workload = %name,
                        "networks of the same type with different values; only the first one's values are used"
                    );
                }
                *replicas += 1;
            }
        }
    }

    for (name, (replicas, values)) in collected {
        let values = with_replicas(values, replicas);
        let workload = WorkloadDescriptor::new(name.clone())
            .with_source(WorkloadSource::local(charts_root.join(&name)))
            .with_values(values)
            .with_priority(NETWORK_PRIORITY);
        descriptor.workloads.insert(name, workload);
    }
}

/// The plain plugin environment for functional tests.
///
/// `mockserver-config` deploys first; `mockserver` and `plugin` follow
/// together. Simulated networks deploy alongside `mockserver-config`.
pub fn plugin_environment(
    plugin_values: Values,
    prefix: Option<&str>,
    charts_root: &Path,
    networks: &[SimulatedNetwork],
) -> EnvironmentDescriptor {
    build_plugin_environment(plugin_values, Values::new(), prefix, charts_root, networks)
}

/// The plugin environment with resources raised for load tests: 2 cpu and
/// 4Gi for the node, 1 cpu and 2Gi for its database, 1 cpu and 1Gi for
/// the mockserver.
pub fn performance_plugin_environment(
    mut plugin_values: Values,
    prefix: Option<&str>,
    charts_root: &Path,
    networks: &[SimulatedNetwork],
) -> EnvironmentDescriptor {
    set_path(&mut plugin_values, &["plugin", "resources"], resources("2", "4096Mi"));
    set_path(&mut plugin_values, &["db", "resources"], resources("1", "2048Mi"));
    let mut mockserver_values = Values::new();
    set_path(&mut mockserver_values, &["app", "resources"], resources("1", "1024Mi"));
    build_plugin_environment(plugin_values, mockserver_values, prefix, charts_root, networks)
}

fn build_plugin_environment(
    plugin_values: Values,
    mockserver_values: Values,
    prefix: Option<&str>,
    charts_root: &Path,
    networks: &[SimulatedNetwork],
) -> EnvironmentDescriptor {
    let prefix = prefix.filter(|p| !p.is_empty()).unwrap_or(DEFAULT_PREFIX);
    let mut descriptor = EnvironmentDescriptor::new(prefix);
    for (name, priority, values) in [
        (MOCKSERVER_CONFIG, 1, Values::new()),
        (MOCKSERVER, 2, mockserver_values),
        (PLUGIN, 2, plugin_values),
    ] {
        descriptor.workloads.insert(
            name.to_string(),
            WorkloadDescriptor::new(name)
                .with_source(WorkloadSource::local(charts_root.join(name)))
                .with_values(values)
                .with_priority(priority),
        );
    }
    add_networks(&mut descriptor, charts_root, networks);
    descriptor
}

pub fn with_replicas(mut values: Values, replicas: u32) -> Values {
    values.insert("replicas".into(), replicas.into());
    values
}

/// Set `<component>.image.version`, keeping the rest of the values.
pub fn with_image_version(mut values: Values, component: &str, version: &str) -> Values {
    set_path(&mut values, &[component, "image", "version"], version);
    values
}
