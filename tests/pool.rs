mod support;

use std::time::Duration;

use tokio::time::timeout;

use redrive::{Command, ConnectionConfig, DriverError, Pool, PoolConfig, RespValue};
use support::MockNode;

fn pool_config(max_size: usize, max_waiting: usize) -> PoolConfig {
    PoolConfig {
        max_size,
        max_waiting,
        idle_timeout: Duration::from_secs(60),
        sweep_interval: Duration::from_secs(60),
    }
}

#[tokio::test]
async fn test_waiter_queue_backpressure() {
    let node = MockNode::start().await;
    let pool = Pool::new(
        ConnectionConfig::new(node.server_addr()),
        pool_config(1, 1),
    );

    // Take the single slot.
    let held = pool.acquire().await.unwrap();

    // Second caller fits in the waiter queue.
    let waiting = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiting.is_finished(), "waiter should be suspended");

    // Third caller exceeds max_waiting and fails synchronously.
    match pool.acquire().await {
        Err(DriverError::PoolFull) => {}
        other => panic!("expected PoolFull, got {:?}", other.map(|_| "connection")),
    }

    // Releasing the held connection hands it to the queued waiter.
    drop(held);
    let handed_over = timeout(Duration::from_secs(2), waiting)
        .await
        .expect("waiter should be served")
        .unwrap();
    assert!(handed_over.is_ok());
}

#[tokio::test]
async fn test_released_connection_is_reused() {
    let node = MockNode::start().await;
    let pool = Pool::new(
        ConnectionConfig::new(node.server_addr()),
        pool_config(4, 4),
    );

    let mut conn = pool.acquire().await.unwrap();
    let reply = conn.send(Command::new("PING")).await.unwrap();
    assert_eq!(reply, RespValue::Simple("PONG".to_string()));
    drop(conn);

    assert_eq!(pool.idle_count(), 1);
    assert_eq!(pool.live_count(), 1);

    let _again = pool.acquire().await.unwrap();
    // Reused, not redialed.
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(pool.live_count(), 1);
}

#[tokio::test]
async fn test_session_mutating_command_taints_the_connection() {
    let node = MockNode::start().await;
    let pool = Pool::new(
        ConnectionConfig::new(node.server_addr()),
        pool_config(4, 4),
    );

    let mut conn = pool.acquire().await.unwrap();
    conn.send(Command::new("SELECT").arg("2")).await.unwrap();
    drop(conn);

    // The tainted connection was evicted, not returned for reuse.
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(pool.live_count(), 0);
}

#[tokio::test]
async fn test_dead_connection_is_not_returned() {
    let node = MockNode::start().await;
    let pool = Pool::new(
        ConnectionConfig::new(node.server_addr()),
        pool_config(4, 4),
    );

    let mut conn = pool.acquire().await.unwrap();
    let _ = conn.send(Command::new("CRASH")).await;
    // Give the connection task a beat to observe the hangup.
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(conn);

    assert_eq!(pool.idle_count(), 0);
    assert_eq!(pool.live_count(), 0);
}

#[tokio::test]
async fn test_idle_sweep_recycles_old_connections() {
    let node = MockNode::start().await;
    let pool = Pool::new(
        ConnectionConfig::new(node.server_addr()),
        PoolConfig {
            max_size: 4,
            max_waiting: 4,
            idle_timeout: Duration::from_millis(100),
            sweep_interval: Duration::from_millis(50),
        },
    );

    drop(pool.acquire().await.unwrap());
    assert_eq!(pool.idle_count(), 1);

    // The periodic sweep, not an acquire, retires the idle connection.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(pool.live_count(), 0);
}

#[tokio::test]
async fn test_closed_pool_rejects_acquire_and_fails_waiters() {
    let node = MockNode::start().await;
    let pool = Pool::new(
        ConnectionConfig::new(node.server_addr()),
        pool_config(1, 4),
    );

    let held = pool.acquire().await.unwrap();
    let waiting = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    pool.close();

    let waiter_result = timeout(Duration::from_secs(2), waiting)
        .await
        .expect("waiter should resolve")
        .unwrap();
    assert!(waiter_result.is_err());
    assert!(pool.acquire().await.is_err());

    drop(held);
}
