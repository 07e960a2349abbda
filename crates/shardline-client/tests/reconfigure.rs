//! Live reconfiguration and rollback

mod common;

use bytes::Bytes;
use common::{init_tracing, test_config, SimTransport};
use shardline_client::{Bootstrap, ClientError, ClusterManager, NodeId, Operation, RoutingPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[tokio::test(start_paused = true)]
async fn test_swap_and_rollback_versions() -> anyhow::Result<()> {
    init_tracing();
    let sim = SimTransport::cluster(3, 6, 2);
    let client = ClusterManager::new(test_config(), Bootstrap::new(sim.seeds()), sim.clone())?;
    client.refresh_now().await?;
    assert_eq!(client.config().version, 1);

    let mut next = test_config();
    next.routing = RoutingPolicy::LeastConnections;
    assert_eq!(client.reconfigure(next).await?, 2);
    assert_eq!(client.config().routing, RoutingPolicy::LeastConnections);

    // Invalid configuration is rejected and leaves the current one in place
    let mut broken = test_config();
    broken.pool.max_connections = 0;
    let err = client.reconfigure(broken).await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidConfig(_)));
    assert_eq!(client.config().version, 2);

    assert_eq!(client.rollback().await?, 1);
    assert_eq!(client.config().routing, RoutingPolicy::RoundRobin);
    assert!(matches!(
        client.rollback().await,
        Err(ClientError::NothingToRollBack)
    ));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_operation_keeps_its_snapshot() {
    init_tracing();
    let sim = SimTransport::cluster(1, 4, 1);
    let client = Arc::new(
        ClusterManager::new(test_config(), Bootstrap::new(sim.seeds()), sim.clone()).unwrap(),
    );
    client.refresh_now().await.unwrap();
    sim.set_execute_delay(Duration::from_millis(100));

    let in_flight = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .execute(b"user:1", Operation::new("get", Bytes::new()))
                .await
        })
    };
    sleep(Duration::from_millis(1)).await;

    let mut strict = test_config();
    strict.retry.request_timeout = Duration::from_millis(10);
    client.reconfigure(strict).await.unwrap();

    // Started under a 10s request timeout, so it completes
    assert_eq!(in_flight.await.unwrap().unwrap(), Bytes::from("node-1"));

    // New operations see the 10ms timeout
    let err = client
        .execute(b"user:1", Operation::new("get", Bytes::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Timeout { node, .. } if node == NodeId(1)));
}

#[tokio::test(start_paused = true)]
async fn test_queued_operation_keeps_its_pool_limit() {
    init_tracing();
    let sim = SimTransport::cluster(1, 4, 1);
    let mut narrow = test_config();
    narrow.pool.min_idle = 0;
    narrow.pool.max_connections = 1;
    let client = Arc::new(
        ClusterManager::new(narrow.clone(), Bootstrap::new(sim.seeds()), sim.clone()).unwrap(),
    );
    client.refresh_now().await.unwrap();
    sim.set_execute_delay(Duration::from_millis(100));

    let spawn_ops = |n: usize| -> Vec<_> {
        (0..n)
            .map(|i| {
                let client = Arc::clone(&client);
                tokio::spawn(async move {
                    client
                        .execute(format!("k{}", i).as_bytes(), Operation::new("get", Bytes::new()))
                        .await
                })
            })
            .collect()
    };

    let queued = spawn_ops(2);
    sleep(Duration::from_millis(1)).await;
    let stats = client.pool_stats(NodeId(1)).unwrap();
    assert_eq!((stats.active, stats.waiters), (1, 1));

    let mut wide = narrow;
    wide.pool.max_connections = 4;
    client.reconfigure(wide).await.unwrap();

    // The waiter started under max_connections = 1 and is not given a new slot
    let stats = client.pool_stats(NodeId(1)).unwrap();
    assert_eq!((stats.active, stats.waiters), (1, 1));
    for op in queued {
        assert_eq!(op.await.unwrap().unwrap(), Bytes::from("node-1"));
    }
    assert_eq!(sim.connects(), 1);

    // Operations started after the swap see the new limit
    let fresh = spawn_ops(4);
    sleep(Duration::from_millis(1)).await;
    assert_eq!(client.pool_stats(NodeId(1)).unwrap().active, 4);
    for op in fresh {
        op.await.unwrap().unwrap();
    }
    assert_eq!(sim.connects(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_pool_maintenance_follows_new_limits() {
    init_tracing();
    let sim = SimTransport::cluster(2, 4, 1);
    let client =
        ClusterManager::new(test_config(), Bootstrap::new(sim.seeds()), sim.clone()).unwrap();
    client.refresh_now().await.unwrap();

    let mut warm = test_config();
    warm.pool.min_idle = 4;
    client.reconfigure(warm).await.unwrap();
    for id in 1..=2 {
        assert_eq!(client.pool_stats(NodeId(id)).unwrap().idle, 4);
    }
    assert_eq!(sim.connects(), 8);
}
