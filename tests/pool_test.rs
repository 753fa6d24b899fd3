//! Integration tests for the connection pool.
//!
//! Tests verify that:
//! - Non-blocking pools fail fast when exhausted, blocking pools hand off
//! - Acquire timeouts surface as timeout errors
//! - Idle caching, max_usage recycling and the idle cap behave as configured
//! - Warm-up materializes the configured minimum
//! - Session setup statements run once per physical connection

use std::time::Duration;

use dbkit::{ConnectionPool, DbConfig, DbError, PoolOptions};
use tempfile::NamedTempFile;

fn temp_db_path() -> String {
    NamedTempFile::new()
        .unwrap()
        .into_temp_path()
        .keep()
        .unwrap()
        .to_str()
        .unwrap()
        .to_string()
}

fn pool_with(options: PoolOptions) -> ConnectionPool {
    let config = DbConfig::sqlite(&temp_db_path()).with_options(options);
    ConnectionPool::new(config).unwrap()
}

// =============================================================================
// Capacity
// =============================================================================

#[tokio::test]
async fn test_non_blocking_exhaustion_fails_fast() {
    let pool = pool_with(PoolOptions {
        max_connections: Some(1),
        blocking: Some(false),
        ..Default::default()
    });

    let guard = pool.acquire().await.unwrap();
    let err = pool.acquire().await.unwrap_err();
    assert!(
        matches!(err, DbError::PoolExhausted { max_connections: 1 }),
        "expected PoolExhausted, got {err:?}"
    );
    guard.release().await;

    // A slot freed up, so the next acquire succeeds.
    let guard = pool.acquire().await.unwrap();
    guard.release().await;
}

#[tokio::test]
async fn test_blocking_acquire_waits_for_release() {
    let pool = pool_with(PoolOptions {
        max_connections: Some(1),
        ..Default::default()
    });

    let guard = pool.acquire().await.unwrap();
    let waiter_pool = pool.clone();
    let waiter = tokio::spawn(async move {
        let guard = waiter_pool.acquire().await.unwrap();
        guard.release().await;
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished(), "waiter must block while the pool is full");

    guard.release().await;
    waiter.await.unwrap();
}

#[tokio::test]
async fn test_blocking_acquire_times_out() {
    let pool = pool_with(PoolOptions {
        max_connections: Some(1),
        acquire_timeout_secs: Some(1),
        ..Default::default()
    });

    let guard = pool.acquire().await.unwrap();
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, DbError::Timeout { .. }), "got {err:?}");
    guard.release().await;
}

#[tokio::test]
async fn test_concurrent_guards_are_distinct_connections() {
    let pool = pool_with(PoolOptions {
        max_connections: Some(2),
        ..Default::default()
    });

    let mut first = pool.acquire().await.unwrap();
    let mut second = pool.acquire().await.unwrap();
    let status = pool.status();
    assert_eq!(status.in_use, 2);
    assert!(status.idle + status.in_use <= status.max_connections as usize);

    // Both guards are live and independently usable.
    let (a, b) = tokio::join!(
        first.fetch_all("SELECT 1 AS one", &[]),
        second.fetch_all("SELECT 2 AS two", &[])
    );
    assert_eq!(a.unwrap()[0]["one"].as_i64(), Some(1));
    assert_eq!(b.unwrap()[0]["two"].as_i64(), Some(2));

    first.release().await;
    second.release().await;
}

#[tokio::test]
async fn test_pool_invariant_under_load() {
    let pool = pool_with(PoolOptions {
        max_connections: Some(3),
        ..Default::default()
    });

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..5 {
                let mut guard = pool.acquire().await.unwrap();
                guard.fetch_all("SELECT 1", &[]).await.unwrap();
                guard.release().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let status = pool.status();
    assert_eq!(status.in_use, 0);
    assert!(status.idle + status.in_use <= status.max_connections as usize);
}

// =============================================================================
// Reuse and Recycling
// =============================================================================

#[tokio::test]
async fn test_released_connection_is_reused() {
    let pool = pool_with(PoolOptions {
        max_connections: Some(2),
        ..Default::default()
    });

    let guard = pool.acquire().await.unwrap();
    guard.release().await;
    assert_eq!(pool.status().idle, 1);

    let guard = pool.acquire().await.unwrap();
    assert_eq!(pool.status().idle, 0, "acquire must pop the idle connection");
    guard.release().await;
    assert_eq!(pool.status().idle, 1);
}

#[tokio::test]
async fn test_max_usage_recycles_connections() {
    let pool = pool_with(PoolOptions {
        max_connections: Some(1),
        max_usage: Some(2),
        ..Default::default()
    });

    let guard = pool.acquire().await.unwrap();
    guard.release().await;
    assert_eq!(pool.status().idle, 1, "first checkout parks the connection");

    let guard = pool.acquire().await.unwrap();
    guard.release().await;
    assert_eq!(
        pool.status().idle,
        0,
        "second checkout reaches max_usage and closes it"
    );

    // The pool opens a fresh connection afterwards.
    let mut guard = pool.acquire().await.unwrap();
    guard.fetch_all("SELECT 1", &[]).await.unwrap();
    guard.release().await;
}

#[tokio::test]
async fn test_idle_cap_closes_overflow() {
    let pool = pool_with(PoolOptions {
        max_connections: Some(3),
        max_cached: Some(1),
        ..Default::default()
    });

    let first = pool.acquire().await.unwrap();
    let second = pool.acquire().await.unwrap();
    first.release().await;
    second.release().await;

    assert_eq!(pool.status().idle, 1, "idle stack is capped at max_cached");
}

#[tokio::test]
async fn test_dropped_guard_returns_connection() {
    let pool = pool_with(PoolOptions {
        max_connections: Some(1),
        ..Default::default()
    });

    {
        let _guard = pool.acquire().await.unwrap();
    }

    // The drop path releases via a spawned task; a blocking acquire waits
    // for it, so this would time out if the slot leaked.
    let guard = pool.acquire().await.unwrap();
    guard.release().await;
    let status = pool.status();
    assert_eq!(status.in_use, 0);
    assert_eq!(status.idle, 1);
}

// =============================================================================
// Warm-Up and Session Setup
// =============================================================================

#[tokio::test]
async fn test_warm_up_fills_minimum() {
    let pool = pool_with(PoolOptions {
        max_connections: Some(5),
        min_cached: Some(3),
        ..Default::default()
    });

    pool.warm_up().await.unwrap();
    let status = pool.status();
    assert_eq!(status.idle, 3);
    assert_eq!(status.in_use, 0);
}

#[tokio::test]
async fn test_warm_up_is_idempotent() {
    let pool = pool_with(PoolOptions {
        max_connections: Some(5),
        min_cached: Some(2),
        ..Default::default()
    });

    pool.warm_up().await.unwrap();
    pool.warm_up().await.unwrap();
    assert_eq!(pool.status().idle, 2);
}

#[tokio::test]
async fn test_set_session_runs_on_new_connections() {
    let pool = pool_with(PoolOptions {
        max_connections: Some(1),
        set_session: vec!["PRAGMA user_version = 7".to_string()],
        ..Default::default()
    });

    let mut guard = pool.acquire().await.unwrap();
    let rows = guard.fetch_all("PRAGMA user_version", &[]).await.unwrap();
    guard.release().await;
    assert_eq!(rows[0]["user_version"].as_i64(), Some(7));
}

#[tokio::test]
async fn test_broken_session_statement_fails_acquire() {
    let pool = pool_with(PoolOptions {
        max_connections: Some(1),
        set_session: vec!["NOT VALID SQL".to_string()],
        ..Default::default()
    });

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, DbError::Connection { .. }), "got {err:?}");
    let status = pool.status();
    assert_eq!(status.idle + status.in_use, 0, "failed open must not leak a slot");
}
