// Keep-alive loops, lazy initialisation and the monitor working together.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use shardkeeper::{
    ClusterConnectionKeeper, ConnectionHandle, ConnectionKeeper, Error, HolderState,
    LazyConnection, TopologyMonitor,
};

#[tokio::test(start_paused = true)]
async fn test_keeper_ticks_survive_failures() {
    let cluster = cluster(&[7001]);
    let config = config();
    let factory = factory(&cluster, &config);
    let keeper = ConnectionKeeper::from_config(&config);

    let handle = factory.standalone("app");
    handle.connect().await.unwrap();
    keeper.add(&handle);

    cluster.fail_commands(SEED_PORT, true);
    assert!(keeper.start());

    // Two ticks fail while the node is unresponsive
    tokio::time::sleep(Duration::from_secs(90)).await;
    assert!(keeper.is_running());
    assert_eq!(cluster.pings(SEED_PORT), 0);

    cluster.fail_commands(SEED_PORT, false);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(keeper.is_running());
    assert_eq!(cluster.pings(SEED_PORT), 1);

    keeper.shutdown().await;
    assert!(!keeper.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_stopped_keeper_runs_no_more_ticks() {
    let cluster = cluster(&[7001]);
    let config = config();
    let factory = factory(&cluster, &config);
    let keeper = ConnectionKeeper::from_config(&config);
    let handle = factory.standalone("app");
    handle.connect().await.unwrap();
    keeper.add(&handle);

    keeper.start();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(cluster.pings(SEED_PORT), 1);

    assert!(keeper.stop());
    assert!(!keeper.stop());
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(cluster.pings(SEED_PORT), 1);
}

#[tokio::test]
async fn test_cluster_keeper_follows_monitor_snapshots() {
    let cluster = cluster(&[7001, 7002]);
    let config = config();
    let factory = factory(&cluster, &config);
    let monitor = TopologyMonitor::from_config(factory.clone(), &config);
    let keeper = ClusterConnectionKeeper::new(factory.clone(), &config);
    let _attached = keeper.attach(&monitor);

    let handle = factory.cluster("app");
    handle.connect().await.unwrap();
    keeper.add(&handle);

    monitor.poll_once().await.unwrap();
    let outcome = keeper.refresh_once().await;
    assert_eq!(outcome.succeeded, 2);
    assert_eq!(keeper.refresh_keys().len(), 2);

    set_masters(&cluster, &[7001, 7002, 7003]);
    monitor.poll_once().await.unwrap();
    let outcome = keeper.refresh_once().await;

    assert_eq!(outcome.succeeded, 3);
    assert_eq!(cluster.writes(7003), 1);
    assert_eq!(cluster.deletes(7003), 1);
    assert_eq!(cluster.key_count(7003), 0);
}

#[tokio::test]
async fn test_cluster_keeper_logs_and_continues_on_failing_master() {
    let cluster = cluster(&[7001, 7002, 7003]);
    let config = config();
    let factory = factory(&cluster, &config);
    let keeper = ClusterConnectionKeeper::new(factory.clone(), &config);
    let handle = factory.cluster("app");
    handle.connect().await.unwrap();
    keeper.add(&handle);

    cluster.fail_commands(7002, true);
    let outcome = keeper.refresh_once().await;

    assert_eq!(outcome.succeeded, 2);
    assert_eq!(outcome.failed, 1);
    assert_eq!(cluster.writes(7001), 1);
    assert_eq!(cluster.writes(7003), 1);
}

#[tokio::test(start_paused = true)]
async fn test_lazy_connection_registers_with_keeper() {
    let cluster = cluster(&[7001]);
    let config = config();
    let factory = factory(&cluster, &config);
    let keeper = Arc::new(ConnectionKeeper::from_config(&config));

    let lazy = {
        let setup_keeper = keeper.clone();
        let dispose_keeper = keeper.clone();
        LazyConnection::new(
            "app",
            move || {
                let handle = factory.standalone("app");
                async move { Ok::<_, Error>(handle) }
            },
            move |handle: ConnectionHandle| {
                let keeper = setup_keeper.clone();
                async move {
                    handle.connect().await?;
                    keeper.add(&handle);
                    Ok::<(), Error>(())
                }
            },
        )
        .with_config(&config)
        .with_dispose(move |handle: ConnectionHandle| {
            let keeper = dispose_keeper.clone();
            async move {
                keeper.remove(&handle);
                handle.disconnect().await
            }
        })
    };

    let handle = lazy.get_connection().await.unwrap();
    assert_eq!(keeper.tracked(), 1);
    assert_eq!(keeper.refresh_once().await.succeeded, 1);

    lazy.reset_connection().await.unwrap();
    assert_eq!(lazy.state(), HolderState::Uninitialized);
    assert_eq!(keeper.tracked(), 0);
    assert!(matches!(handle.ping().await, Err(Error::Closed(_))));

    let fresh = lazy.get_connection().await.unwrap();
    assert_ne!(fresh, handle);
    assert_eq!(keeper.tracked(), 1);
}
