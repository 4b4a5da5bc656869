//! Shared pool state and the acquire/release machinery.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use futures_channel::oneshot;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::pool::{Connector, PoolConnection, PoolOptions, PoolStats, Streamer};

pub(super) struct Live<C> {
    pub(super) raw: C,
    #[allow(dead_code)]
    pub(super) created: Instant,
}

impl<C> Live<C> {
    pub(super) fn new(raw: C) -> Self {
        Live {
            raw,
            created: Instant::now(),
        }
    }
}

struct Idle<C> {
    live: Live<C>,
    since: Instant,
}

struct Waiter<C> {
    id: u64,
    tx: oneshot::Sender<Live<C>>,
}

struct PoolState<C> {
    /// Connections currently owned by the pool or checked out of it.
    size: u32,
    /// Open connections parked in the pool. Pushed and popped at the back;
    /// the front is the longest-idle entry and is what the reaper closes.
    idle: Vec<Idle<C>>,
    waiters: VecDeque<Waiter<C>>,
    next_waiter_id: u64,
}

impl<C> PoolState<C> {
    /// Drop waiters whose receiving side has already given up.
    fn prune_waiters(&mut self) {
        self.waiters.retain(|waiter| !waiter.tx.is_canceled());
    }
}

#[derive(Default)]
pub(super) struct Counters {
    pub(super) created: AtomicU64,
    pub(super) acquired: AtomicU64,
    pub(super) released: AtomicU64,
    pub(super) reaped: AtomicU64,
    pub(super) acquire_timeouts: AtomicU64,
    pub(super) validation_failures: AtomicU64,
    pub(super) exhaustions: AtomicU64,
}

pub(super) struct PoolInner<C: Connection> {
    pub(super) options: PoolOptions,
    pub(super) connector: Connector<C>,
    pub(super) streamer: Option<Streamer>,
    state: Mutex<PoolState<C>>,
    closed: AtomicBool,
    pub(super) counters: Counters,
    reaper: StdMutex<Option<JoinHandle<()>>>,
}

enum Plan<C> {
    Idle(Live<C>, Duration),
    Connect,
    Wait(oneshot::Receiver<Live<C>>, u64),
}

impl<C: Connection> PoolInner<C> {
    pub(super) fn new(
        options: PoolOptions,
        connector: Connector<C>,
        streamer: Option<Streamer>,
    ) -> Arc<Self> {
        let inner = Arc::new(PoolInner {
            options,
            connector,
            streamer,
            state: Mutex::new(PoolState {
                size: 0,
                idle: Vec::new(),
                waiters: VecDeque::new(),
                next_waiter_id: 0,
            }),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
            reaper: StdMutex::new(None),
        });

        inner.spawn_reaper();
        inner
    }

    pub(super) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(super) async fn acquire(self: &Arc<Self>) -> Result<PoolConnection<C>> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        loop {
            let plan = {
                let mut state = self.state.lock().await;
                if self.is_closed() {
                    return Err(Error::PoolClosed);
                }
                state.prune_waiters();

                if let Some(idle) = state.idle.pop() {
                    Plan::Idle(idle.live, idle.since.elapsed())
                } else if state.size < self.options.max_size {
                    // reserve capacity now; connect outside the lock
                    state.size += 1;
                    Plan::Connect
                } else if state.waiters.len() >= self.options.max_waiting_clients {
                    self.counters.exhaustions.fetch_add(1, Ordering::Relaxed);
                    return Err(Error::PoolExhausted {
                        max_waiting: self.options.max_waiting_clients,
                    });
                } else {
                    let (tx, rx) = oneshot::channel();
                    let id = state.next_waiter_id;
                    state.next_waiter_id += 1;
                    state.waiters.push_back(Waiter { id, tx });
                    Plan::Wait(rx, id)
                }
            };

            match plan {
                Plan::Idle(live, idle_for) => {
                    let needs_validation = self.options.validate_on_acquire
                        && idle_for >= self.options.validation_interval;

                    if !needs_validation {
                        return Ok(self.attach(live));
                    }

                    // the round-trip runs outside the critical section; a
                    // failing connection is discarded and we start over
                    match self.validate(live).await {
                        Some(live) => return Ok(self.attach(live)),
                        None => continue,
                    }
                }

                Plan::Connect => match (self.connector)().await {
                    Ok(raw) => {
                        self.counters.created.fetch_add(1, Ordering::Relaxed);
                        return Ok(self.attach(Live::new(raw)));
                    }
                    Err(error) => {
                        self.state.lock().await.size -= 1;
                        log::warn!("error establishing a pooled connection: {error}");
                        return Err(Error::acquire_with(
                            "establishing a new connection failed",
                            error,
                        ));
                    }
                },

                Plan::Wait(mut rx, waiter_id) => {
                    match tokio::time::timeout(self.options.acquire_timeout, &mut rx).await {
                        Ok(Ok(live)) => return Ok(self.attach(live)),
                        // the sender half only disappears when the pool closes
                        Ok(Err(_)) => return Err(Error::PoolClosed),
                        Err(_) => {
                            let mut state = self.state.lock().await;
                            state.waiters.retain(|waiter| waiter.id != waiter_id);

                            // a release racing the alarm may have handed us a
                            // connection already; it must not fall on the floor
                            if let Ok(Some(live)) = rx.try_recv() {
                                drop(state);
                                return Ok(self.attach(live));
                            }
                            drop(state);

                            self.counters.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                            return Err(Error::PoolTimedOut {
                                timeout: self.options.acquire_timeout,
                            });
                        }
                    }
                }
            }
        }
    }

    async fn validate(&self, mut live: Live<C>) -> Option<Live<C>> {
        let healthy = live.raw.ping().await.is_ok() && live.raw.is_open();
        if healthy {
            return Some(live);
        }

        self.counters
            .validation_failures
            .fetch_add(1, Ordering::Relaxed);
        log::info!(
            "connection {} failed validation on acquire; discarding",
            live.raw.id()
        );

        self.state.lock().await.size -= 1;
        spawn_close(live.raw);
        None
    }

    fn attach(self: &Arc<Self>, live: Live<C>) -> PoolConnection<C> {
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        PoolConnection::new(live, Arc::clone(self))
    }

    /// Return a connection to the pool: hand it to the first live waiter,
    /// or park it. Closed connections are removed instead of re-pooled.
    pub(super) async fn release(self: Arc<Self>, live: Live<C>) {
        self.counters.released.fetch_add(1, Ordering::Relaxed);

        if self.is_closed() || !live.raw.is_open() {
            self.state.lock().await.size -= 1;
            let _ = live.raw.close().await;
            return;
        }

        let mut state = self.state.lock().await;
        let mut live = live;

        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.tx.send(live) {
                Ok(()) => return,
                // that waiter timed out in the meantime; try the next
                Err(returned) => live = returned,
            }
        }

        state.idle.push(Idle {
            live,
            since: Instant::now(),
        });
    }

    /// Remove a checked-out connection from the pool and close it.
    pub(super) async fn discard(self: Arc<Self>, live: Live<C>) -> Result<()> {
        self.state.lock().await.size -= 1;
        live.raw.close().await
    }

    /// Open connections up to `min_size`, best effort.
    pub(super) async fn prime(self: &Arc<Self>) {
        loop {
            {
                let state = self.state.lock().await;
                if self.is_closed() || state.size >= self.options.min_size {
                    return;
                }
            }

            match (self.connector)().await {
                Ok(raw) => {
                    self.counters.created.fetch_add(1, Ordering::Relaxed);
                    let mut state = self.state.lock().await;
                    if state.size >= self.options.min_size {
                        drop(state);
                        spawn_close(raw);
                        return;
                    }
                    state.size += 1;
                    state.idle.push(Idle {
                        live: Live::new(raw),
                        since: Instant::now(),
                    });
                }
                Err(error) => {
                    log::warn!("error opening a minimum pool connection: {error}");
                    return;
                }
            }
        }
    }

    pub(super) async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(handle) = self.reaper.lock().expect("reaper handle poisoned").take() {
            handle.abort();
        }

        let (idle, waiters) = {
            let mut state = self.state.lock().await;
            state.size -= state.idle.len() as u32;
            let idle: Vec<Idle<C>> = state.idle.drain(..).collect();
            let waiters: Vec<Waiter<C>> = state.waiters.drain(..).collect();
            (idle, waiters)
        };

        // dropping the senders rejects every parked acquire with PoolClosed
        drop(waiters);

        futures_util::future::join_all(idle.into_iter().map(|idle| idle.live.raw.close())).await;
    }

    pub(super) async fn stats(&self) -> PoolStats {
        let (size, idle, waiting) = {
            let state = self.state.lock().await;
            (state.size, state.idle.len(), state.waiters.len())
        };

        PoolStats {
            size,
            idle,
            waiting,
            created: self.counters.created.load(Ordering::Relaxed),
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            reaped: self.counters.reaped.load(Ordering::Relaxed),
            acquire_timeouts: self.counters.acquire_timeouts.load(Ordering::Relaxed),
            validation_failures: self.counters.validation_failures.load(Ordering::Relaxed),
            exhaustions: self.counters.exhaustions.load(Ordering::Relaxed),
        }
    }

    /// Close the longest-idle connections above `min_size` whose idle time
    /// has passed `idle_timeout`.
    async fn reap(&self) {
        let reapable = {
            let mut state = self.state.lock().await;
            let min = self.options.min_size as usize;
            let mut reapable = Vec::new();

            while state.idle.len() > min {
                let expired = state
                    .idle
                    .first()
                    .map_or(false, |idle| idle.since.elapsed() >= self.options.idle_timeout);
                if !expired {
                    break;
                }
                reapable.push(state.idle.remove(0));
            }

            state.size -= reapable.len() as u32;
            reapable
        };

        if reapable.is_empty() {
            return;
        }

        self.counters
            .reaped
            .fetch_add(reapable.len() as u64, Ordering::Relaxed);
        log::debug!("reaping {} idle connection(s)", reapable.len());

        futures_util::future::join_all(reapable.into_iter().map(|idle| idle.live.raw.close()))
            .await;
    }

    fn spawn_reaper(self: &Arc<Self>) {
        if self.options.idle_timeout.is_zero() {
            return;
        }

        // without a runtime there is nothing to reap on; the pool still
        // works, it just never trims below use
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let period = (self.options.idle_timeout / 2).max(Duration::from_millis(1));
        let weak: Weak<Self> = Arc::downgrade(self);

        let handle = runtime.spawn(async move {
            loop {
                tokio::time::sleep(period).await;

                let Some(pool) = weak.upgrade() else {
                    return;
                };
                if pool.is_closed() {
                    return;
                }
                pool.reap().await;
            }
        });

        *self.reaper.lock().expect("reaper handle poisoned") = Some(handle);
    }
}

/// Close a connection without blocking the caller.
fn spawn_close<C: Connection>(raw: C) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            let _ = raw.close().await;
        });
    }
}
