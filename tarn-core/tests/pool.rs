//! Pool behavior: sizing, waiters, timeouts, validation, reaping.

mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use support::{stub_connector, StubConnection, StubState};
use tarn_core::{Connection, Error, ErrorKind, Pool, PoolOptions};

fn options() -> PoolOptions {
    PoolOptions::new()
        .min_size(0)
        .max_size(2)
        .acquire_timeout(Duration::from_millis(1_000))
        .idle_timeout(Duration::ZERO)
        .max_waiting_clients(10)
        .validate_on_acquire(false)
}

fn pool_with(state: &Arc<StubState>, options: PoolOptions) -> Pool<StubConnection> {
    Pool::new(options, stub_connector(Arc::clone(state))).unwrap()
}

#[tokio::test]
async fn acquire_release_acquire_does_not_grow_the_pool() {
    let state = Arc::new(StubState::default());
    let pool = pool_with(&state, options());

    let conn = pool.acquire().await.unwrap();
    let first_id = conn.id().to_string();
    conn.release().await;

    let conn = pool.acquire().await.unwrap();
    assert_eq!(conn.id().to_string(), first_id);
    conn.release().await;

    assert_eq!(state.created.load(Ordering::SeqCst), 1);
    let stats = pool.stats().await;
    assert_eq!(stats.size, 1);
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.acquired, 2);
    assert_eq!(stats.released, 2);
}

#[tokio::test]
async fn max_size_one_serializes_concurrent_acquires() {
    let state = Arc::new(StubState::default());
    let pool = pool_with(&state, options().max_size(1));

    let held = pool.acquire().await.unwrap();

    let contender = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let conn = pool.acquire().await.unwrap();
            let id = conn.id().to_string();
            conn.release().await;
            id
        })
    };

    // the contender must park rather than create a second connection
    tokio::task::yield_now().await;
    assert_eq!(state.created.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().await.waiting, 1);

    let held_id = held.id().to_string();
    held.release().await;

    assert_eq!(contender.await.unwrap(), held_id);
    assert_eq!(state.created.load(Ordering::SeqCst), 1);
}

// Config {min 0, max 1, acquire timeout 50ms, max waiting 1}: A acquires,
// B parks and times out, released A is handed to C with no growth.
#[tokio::test(start_paused = true)]
async fn waiter_times_out_and_release_hands_off_without_growth() {
    let state = Arc::new(StubState::default());
    let pool = pool_with(
        &state,
        options()
            .max_size(1)
            .acquire_timeout(Duration::from_millis(50))
            .max_waiting_clients(1),
    );

    let conn_a = pool.acquire().await.unwrap();
    let id_a = conn_a.id().to_string();

    let waiter_b = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.map(|c| c.id().to_string()) })
    };

    tokio::time::sleep(Duration::from_millis(60)).await;
    let error = waiter_b.await.unwrap().unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Timeout);
    assert!(matches!(error, Error::PoolTimedOut { .. }));

    conn_a.release().await;

    let conn_c = pool.acquire().await.unwrap();
    assert_eq!(conn_c.id().to_string(), id_a);
    conn_c.release().await;

    // exactly zero extra connections were created
    assert_eq!(state.created.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().await.acquire_timeouts, 1);
}

#[tokio::test]
async fn full_wait_queue_fails_fast_with_exhausted() {
    let state = Arc::new(StubState::default());
    let pool = pool_with(&state, options().max_size(1).max_waiting_clients(0));

    let _held = pool.acquire().await.unwrap();

    let error = pool.acquire().await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::PoolExhausted);
    assert!(error.is_recoverable());
    assert_eq!(pool.stats().await.exhaustions, 1);
}

#[tokio::test]
async fn waiters_are_served_in_fifo_order() {
    let state = Arc::new(StubState::default());
    let pool = pool_with(&state, options().max_size(1));

    let held = pool.acquire().await.unwrap();

    let order = Arc::new(std::sync::Mutex::new(Vec::<&'static str>::new()));
    let mut waiters = Vec::new();
    for name in ["first", "second", "third"] {
        let pool = pool.clone();
        let order = Arc::clone(&order);
        waiters.push(tokio::spawn(async move {
            let conn = pool.acquire().await.unwrap();
            order.lock().unwrap().push(name);
            conn.release().await;
        }));
        // park them in a known order
        tokio::task::yield_now().await;
    }

    assert_eq!(pool.stats().await.waiting, 3);
    held.release().await;

    for waiter in waiters {
        waiter.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), ["first", "second", "third"]);
    assert_eq!(state.created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_validation_discards_and_replaces_the_connection() {
    let state = Arc::new(StubState::default());
    let pool = pool_with(&state, options().validate_on_acquire(true));

    let conn = pool.acquire().await.unwrap();
    let first_id = conn.id().to_string();
    conn.release().await;

    state.fail_ping_for(&first_id);

    let conn = pool.acquire().await.unwrap();
    assert_ne!(conn.id().to_string(), first_id);
    conn.release().await;

    assert_eq!(state.created.load(Ordering::SeqCst), 2);
    let stats = pool.stats().await;
    assert_eq!(stats.validation_failures, 1);
    assert_eq!(stats.size, 1);

    // the discarded connection is closed in the background
    tokio::task::yield_now().await;
    assert_eq!(state.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn closed_connections_are_never_re_pooled() {
    let state = Arc::new(StubState::default());
    let pool = pool_with(&state, options());

    let conn = pool.acquire().await.unwrap();
    conn.open_flag().store(false, Ordering::SeqCst);
    conn.release().await;

    assert_eq!(state.closed.load(Ordering::SeqCst), 1);
    let stats = pool.stats().await;
    assert_eq!(stats.size, 0);
    assert_eq!(stats.idle, 0);

    let conn = pool.acquire().await.unwrap();
    assert_eq!(state.created.load(Ordering::SeqCst), 2);
    conn.release().await;
}

#[tokio::test]
async fn close_rejects_waiters_and_closes_idle_connections() {
    let state = Arc::new(StubState::default());
    let pool = pool_with(&state, options().max_size(1));

    let held = pool.acquire().await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
    };
    tokio::task::yield_now().await;

    pool.close().await;

    let error = waiter.await.unwrap().unwrap_err();
    assert!(matches!(error, Error::PoolClosed));

    // a checked-out connection is closed when it comes back
    held.release().await;
    assert_eq!(state.closed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().await.size, 0);

    let error = pool.acquire().await.unwrap_err();
    assert!(matches!(error, Error::PoolClosed));

    // counters remain for inspection
    assert_eq!(pool.stats().await.acquired, 1);
}

#[tokio::test(start_paused = true)]
async fn idle_reaper_trims_oldest_down_to_min_size() {
    let state = Arc::new(StubState::default());
    let pool = pool_with(
        &state,
        options()
            .min_size(1)
            .max_size(5)
            .idle_timeout(Duration::from_millis(100)),
    );

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    let c = pool.acquire().await.unwrap();
    a.release().await;
    b.release().await;
    c.release().await;
    assert_eq!(pool.stats().await.idle, 3);

    tokio::time::sleep(Duration::from_millis(400)).await;

    let stats = pool.stats().await;
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.size, 1);
    assert_eq!(stats.reaped, 2);
    assert_eq!(state.closed.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn fixed_size_pool_never_reaps_below_min() {
    let state = Arc::new(StubState::default());
    let pool = Pool::open(
        options()
            .min_size(2)
            .max_size(2)
            .idle_timeout(Duration::from_millis(50)),
        stub_connector(Arc::clone(&state)),
    )
    .await
    .unwrap();

    assert_eq!(pool.stats().await.idle, 2);

    tokio::time::sleep(Duration::from_millis(500)).await;

    let stats = pool.stats().await;
    assert_eq!(stats.idle, 2);
    assert_eq!(stats.reaped, 0);
    assert_eq!(state.closed.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn zero_acquire_timeout_fails_any_parked_acquire() {
    let state = Arc::new(StubState::default());
    let pool = pool_with(
        &state,
        options()
            .max_size(1)
            .acquire_timeout(Duration::ZERO)
            .max_waiting_clients(5),
    );

    // served synchronously: fine even with a zero timeout
    let held = pool.acquire().await.unwrap();

    let error = pool.acquire().await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Timeout);

    held.release().await;
    let conn = pool.acquire().await.unwrap();
    conn.release().await;
}

#[tokio::test]
async fn connector_failure_surfaces_as_recoverable_acquisition() {
    let state = Arc::new(StubState::default());
    state.connect_failures.store(1, Ordering::SeqCst);
    let pool = pool_with(&state, options());

    let error = pool.acquire().await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Acquisition);
    assert!(error.is_recoverable());

    // the reserved capacity was returned
    let conn = pool.acquire().await.unwrap();
    conn.release().await;
    assert_eq!(pool.stats().await.size, 1);
}

#[tokio::test]
async fn query_helper_acquires_executes_and_releases() {
    let state = Arc::new(StubState::default());
    let pool = pool_with(&state, options());

    let rows = pool.query("SELECT 1").await.unwrap();
    assert_eq!(rows.row_count, 1);
    assert_eq!(rows.rows[0]["sql"], serde_json::json!("SELECT 1"));

    let stats = pool.stats().await;
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.acquired, 1);
    assert_eq!(stats.released, 1);
}

#[tokio::test]
async fn query_abortable_honors_a_pre_cancelled_token() {
    let state = Arc::new(StubState::default());
    let pool = pool_with(&state, options());

    let token = tarn_core::CancellationToken::new();
    token.cancel();

    let error = pool.query_abortable("SELECT 1", &token).await.unwrap_err();
    assert!(matches!(error, Error::Aborted));
    assert_eq!(state.created.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn query_abortable_honors_cancellation_in_flight() {
    let state = Arc::new(StubState::default());
    state.execute_delay_ms.store(500, Ordering::SeqCst);
    let pool = pool_with(&state, options());

    let token = tarn_core::CancellationToken::new();
    let cancel = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        })
    };

    let error = pool.query_abortable("SELECT 1", &token).await.unwrap_err();
    assert!(matches!(error, Error::Aborted));
    cancel.await.unwrap();
}

#[tokio::test]
async fn send_abortable_without_streamer_is_a_configuration_error() {
    let state = Arc::new(StubState::default());
    let pool = pool_with(&state, options());

    let token = tarn_core::CancellationToken::new();
    let error = pool
        .send_abortable("SELECT 1", &token, true)
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Init);

    // the non-streaming path still works
    let result = pool.send_abortable("SELECT 1", &token, false).await.unwrap();
    assert!(matches!(result, tarn_core::Either::Left(_)));
}
