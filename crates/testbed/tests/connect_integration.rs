//! Connection, exec and fault-injection tests against the in-memory cluster.

use std::sync::Arc;
use std::time::Duration;

use testbed::*;
use testbed_core::mock::MockCluster;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("testbed=debug")
        .try_init();
}

fn workload(name: &str, priority: i32) -> WorkloadDescriptor {
    WorkloadDescriptor::new(name)
        .with_source(WorkloadSource::local(format!("charts/{name}")))
        .with_priority(priority)
}

fn replicas(n: u32) -> Values {
    testbed::presets::with_replicas(Values::new(), n)
}

async fn deployed(mock: &Arc<MockCluster>, workloads: Vec<WorkloadDescriptor>) -> Environment {
    let mut descriptor = EnvironmentDescriptor::new("plugin");
    for w in workloads {
        descriptor.add_workload(w).unwrap();
    }
    let env = Environment::new(descriptor, Collaborators::from_cluster(mock.clone()));
    env.init(Some("plugin-test")).await.unwrap();
    env.deploy_all().await.unwrap();
    env
}

#[tokio::test]
async fn test_urls_cover_every_instance_in_ordinal_order() {
    init_tracing();
    let mock = Arc::new(MockCluster::new().with_workload("plugin-node", [("node", [("access", 6688)])]));
    let env = deployed(
        &mock,
        vec![workload("plugin", 2)
            .with_release_name("plugin-node")
            .with_values(replicas(2))],
    )
    .await;
    env.connect("plugin").await.unwrap();

    let conns = env.connections("plugin").unwrap();
    assert_eq!(
        conns.ids().collect::<Vec<_>>(),
        vec!["plugin-node_0_node", "plugin-node_1_node"]
    );
    assert_eq!(
        conns.local_urls_by_port("access", Scheme::Http).unwrap(),
        vec!["http://127.0.0.1:40000", "http://127.0.0.1:40001"]
    );
    assert_eq!(
        conns.remote_urls_by_port("access", Scheme::Http).unwrap(),
        vec![
            "http://plugin-node-0.plugin-test:6688",
            "http://plugin-node-1.plugin-test:6688"
        ]
    );
    assert_eq!(conns.remote_port("plugin-node_1_node", "access").unwrap(), 6688);

    let err = conns.local_urls_by_port("p2p", Scheme::Tcp).unwrap_err();
    assert!(matches!(err, EnvError::PortNotFound { ref port, .. } if port == "p2p"));
}

#[tokio::test]
async fn test_connect_all_isolates_failures() {
    let mock = Arc::new(
        MockCluster::new()
            .with_workload("geth", [("geth", [("http-rpc", 8544), ("ws-rpc", 8546)])])
            .with_workload("mockserver", [("mockserver", [("serviceport", 1080)])]),
    );
    let env = deployed(&mock, vec![workload("geth", 1), workload("mockserver", 1)]).await;
    mock.fail_tunnels("mockserver-0");

    let err = env.connect_all().await.unwrap_err();
    let EnvError::PartialFailure(report) = err else {
        panic!("expected partial failure, got {err}");
    };
    assert_eq!(report.succeeded, vec!["geth".to_string()]);
    assert!(report.failed.contains_key("mockserver"));

    assert_eq!(env.connections("geth").unwrap().len(), 1);
    assert!(env.connections("mockserver").unwrap().is_empty());
    assert_eq!(mock.open_tunnels().len(), 2);
}

#[tokio::test]
async fn test_losing_one_workload_leaves_others_untouched() {
    let mock = Arc::new(
        MockCluster::new()
            .with_workload("geth", [("geth", [("http-rpc", 8544)])])
            .with_workload("mockserver", [("mockserver", [("serviceport", 1080)])]),
    );
    let env = deployed(
        &mock,
        vec![workload("geth", 1).with_values(replicas(2)), workload("mockserver", 1)],
    )
    .await;
    env.connect_all().await.unwrap();
    let before = env
        .connections("geth")
        .unwrap()
        .local_urls_by_port("http-rpc", Scheme::Http)
        .unwrap();
    assert_eq!(before.len(), 2);

    mock.take_down("mockserver");
    env.connect_all().await.unwrap();

    assert!(env.connections("mockserver").unwrap().is_empty());
    assert_eq!(
        env.connections("geth")
            .unwrap()
            .local_urls_by_port("http-rpc", Scheme::Http)
            .unwrap(),
        before
    );
    assert_eq!(env.open_tunnels(), 2);
}

#[tokio::test]
async fn test_reconnect_reuses_tunnels_and_closes_stale_ones() {
    let mock = Arc::new(MockCluster::new().with_workload("geth", [("geth", [("http-rpc", 8544)])]));
    let env = deployed(&mock, vec![workload("geth", 1).with_values(replicas(2))]).await;

    env.connect("geth").await.unwrap();
    let before = mock.open_tunnels();
    env.connect("geth").await.unwrap();
    assert_eq!(mock.open_tunnels(), before);

    // Scale down: the tunnel to the removed instance goes away.
    env.set_values("geth", replicas(1)).unwrap();
    env.upgrade("geth").await.unwrap();
    env.connect("geth").await.unwrap();
    assert_eq!(mock.open_tunnels(), vec![before[0]]);
    assert_eq!(env.connections("geth").unwrap().len(), 1);
    assert_eq!(env.open_tunnels(), 1);
}

#[tokio::test]
async fn test_failed_reconnect_keeps_previous_connections() {
    let mock = Arc::new(MockCluster::new().with_workload("geth", [("geth", [("http-rpc", 8544)])]));
    let env = deployed(&mock, vec![workload("geth", 1).with_values(replicas(2))]).await;
    env.connect("geth").await.unwrap();
    let previous = env.workload("geth").unwrap().connections;
    let open = mock.open_tunnels();

    env.set_values("geth", replicas(3)).unwrap();
    env.upgrade("geth").await.unwrap();
    mock.fail_tunnels("geth-2");

    let err = env.connect("geth").await.unwrap_err();
    assert!(matches!(err, EnvError::Remote { operation: "open tunnel", .. }));
    assert_eq!(env.workload("geth").unwrap().connections, previous);
    assert_eq!(mock.open_tunnels(), open);
    assert_eq!(env.open_tunnels(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_connect_leaves_tunnels_tracked() {
    let mock = Arc::new(MockCluster::new().with_workload("geth", [("geth", [("http-rpc", 8544)])]));
    let env = deployed(&mock, vec![workload("geth", 1)]).await;
    env.connect("geth").await.unwrap();

    env.set_values("geth", replicas(3)).unwrap();
    env.upgrade("geth").await.unwrap();
    mock.delay_tunnels("geth-2", Duration::from_secs(60));

    let result = tokio::time::timeout(Duration::from_secs(5), env.connect("geth")).await;
    assert!(result.is_err());
    assert_eq!(mock.open_tunnels().len(), 2);
    assert_eq!(env.open_tunnels(), 2);

    env.disconnect().await.unwrap();
    assert!(mock.open_tunnels().is_empty());
    assert_eq!(env.open_tunnels(), 0);
}

#[tokio::test]
async fn test_disconnect_continues_past_close_failures() {
    let mock = Arc::new(
        MockCluster::new()
            .with_workload("geth", [("geth", [("http-rpc", 8544), ("ws-rpc", 8546)])])
            .with_workload("mockserver", [("mockserver", [("serviceport", 1080)])]),
    );
    let env = deployed(&mock, vec![workload("geth", 1), workload("mockserver", 1)]).await;
    env.connect_all().await.unwrap();
    assert_eq!(mock.open_tunnels().len(), 3);

    let stuck = env
        .connections("geth")
        .unwrap()
        .local_port("geth_0_geth", "ws-rpc")
        .unwrap();
    mock.fail_close(stuck);

    let err = env.disconnect().await.unwrap_err();
    let EnvError::PartialFailure(report) = err else {
        panic!("expected partial failure, got {err}");
    };
    assert_eq!(report.failed.keys().collect::<Vec<_>>(), vec!["geth/geth-0:8546"]);
    assert_eq!(report.succeeded.len(), 2);
    assert_eq!(mock.open_tunnels(), vec![stuck]);
    assert_eq!(env.open_tunnels(), 1);
    assert!(env.connections("geth").unwrap().is_empty());

    mock.clear_failures();
    env.disconnect().await.unwrap();
    assert!(mock.open_tunnels().is_empty());
    assert_eq!(env.open_tunnels(), 0);
}

#[tokio::test]
async fn test_disconnect_closes_everything_and_is_idempotent() {
    let mock = Arc::new(
        MockCluster::new()
            .with_workload("geth", [("geth", [("http-rpc", 8544)])])
            .with_workload("plugin", [("node", [("access", 6688)]), ("db", [("postgres", 5432)])]),
    );
    let env = deployed(&mock, vec![workload("geth", 1), workload("plugin", 2)]).await;
    env.connect_all().await.unwrap();
    assert_eq!(mock.open_tunnels().len(), 3);
    assert_eq!(
        env.connections("plugin")
            .unwrap()
            .local_urls_by_port("postgres", Scheme::Postgres)
            .unwrap()
            .len(),
        1
    );

    env.disconnect_workload("plugin").await.unwrap();
    assert_eq!(mock.open_tunnels().len(), 1);
    assert!(env.connections("plugin").unwrap().is_empty());

    env.disconnect().await.unwrap();
    env.disconnect().await.unwrap();
    assert!(mock.open_tunnels().is_empty());
    assert!(env.connections("geth").unwrap().is_empty());
}

#[tokio::test]
async fn test_workload_without_instances_connects_empty() {
    let mock = Arc::new(MockCluster::new().with_workload("geth", [("geth", [("http-rpc", 8544)])]));
    let env = deployed(&mock, vec![workload("geth", 1)]).await;
    mock.take_down("geth");

    env.connect("geth").await.unwrap();
    let conns = env.connections("geth").unwrap();
    assert!(conns.is_empty());
    assert!(conns.local_urls_by_port("http-rpc", Scheme::Http).unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_execute_in_pod() {
    let mock = Arc::new(
        MockCluster::new().with_workload("plugin", [("node", [("access", 6688)])]),
    );
    let env = deployed(&mock, vec![workload("plugin", 1).with_values(replicas(2))]).await;

    let output = env
        .execute_in_pod("plugin", 1, "node", &["plugin", "admin", "status"])
        .await
        .unwrap();
    assert_eq!(output.exit_code, 0);
    assert_eq!(output.stdout, "plugin admin status");
    assert!(mock
        .events()
        .contains(&"exec:plugin-1/node:plugin admin status".to_string()));

    let err = env
        .execute_in_pod("plugin", 0, "node", &["false"])
        .await
        .unwrap_err();
    assert!(matches!(err, EnvError::Remote { operation: "exec", .. }));

    let err = env
        .execute_in_pod("plugin", 4, "node", &["true"])
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    let err = env
        .execute_in_pod("plugin", 0, "db", &["true"])
        .await
        .unwrap_err();
    assert!(matches!(err, EnvError::InstanceNotFound { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_stop_all_cancels_expired_sessions_too() {
    let mock = Arc::new(MockCluster::new());
    let env = deployed(&mock, vec![workload("geth", 1)]).await;

    let short = env
        .apply_fault(FaultSpec::for_app("geth", FaultKind::PodFailure, Duration::from_secs(10)))
        .await
        .unwrap();
    let long = env
        .apply_fault(FaultSpec::for_app(
            "plugin",
            FaultKind::NetworkDelay {
                latency: Duration::from_millis(300),
            },
            Duration::from_secs(120),
        ))
        .await
        .unwrap();
    assert_eq!(env.active_faults().len(), 2);

    tokio::time::advance(Duration::from_secs(30)).await;
    let active = env.active_faults();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].handle, long);

    // The remote experiment outlives the local clock; both are deleted.
    assert_eq!(env.stop_all_faults().await.unwrap(), 2);
    let cancelled = mock.cancelled_faults();
    assert_eq!(cancelled.len(), 2);
    assert!(cancelled.contains(&short));
    assert!(cancelled.contains(&long));
    assert!(mock.active_faults().is_empty());
    assert!(env.active_faults().is_empty());
}

#[tokio::test]
async fn test_stop_all_without_sessions_is_noop() {
    let mock = Arc::new(MockCluster::new());
    let env = deployed(&mock, vec![workload("geth", 1)]).await;
    assert_eq!(env.stop_all_faults().await.unwrap(), 0);
    assert!(mock.cancelled_faults().is_empty());
}

#[tokio::test]
async fn test_stop_single_fault() {
    let mock = Arc::new(MockCluster::new());
    let env = deployed(&mock, vec![workload("geth", 1)]).await;

    let handle = env
        .apply_fault(FaultSpec::for_app("geth", FaultKind::NetworkPartition, Duration::from_secs(60)))
        .await
        .unwrap();
    assert_eq!(mock.active_faults(), vec![handle.clone()]);

    env.stop_fault(&handle).await.unwrap();
    assert!(mock.active_faults().is_empty());
    assert!(env.stop_fault(&handle).await.is_err());

    let invalid = FaultSpec::for_app("geth", FaultKind::PodKill, Duration::ZERO);
    assert!(env.apply_fault(invalid).await.unwrap_err().is_validation());
}
