//! Elastic worker pool.
//!
//! The pool maintains between `min` and `max` live workers, hands out
//! exclusive leases through [`WorkerPool::acquire`], and keeps a FIFO
//! wait-queue so the oldest waiter is satisfied first. Crashed workers are
//! detected through the client exit channel and replaced; spawn failures
//! back off exponentially and eventually leave the pool running degraded
//! rather than halting.

use crate::client::{ClientOptions, RpcClient};
use crate::error::WorkerError;
use crate::Result;
use async_trait::async_trait;
use chatmux_core::config::WorkerConfig;
use chatmux_core::types::WorkerState;
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

/// Creates connected worker clients for the pool.
///
/// The production implementation spawns processes; tests substitute an
/// in-memory transport.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Launch a worker identified by `id`. The id is reported on `exit_tx`
    /// if the worker dies unexpectedly.
    async fn launch(&self, id: &str, exit_tx: mpsc::UnboundedSender<String>)
        -> Result<RpcClient>;
}

/// Launcher that spawns real worker processes.
pub struct ProcessLauncher {
    config: WorkerConfig,
}

impl ProcessLauncher {
    /// Create a launcher for the configured worker command.
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        id: &str,
        exit_tx: mpsc::UnboundedSender<String>,
    ) -> Result<RpcClient> {
        RpcClient::spawn(
            id,
            &self.config,
            ClientOptions::from_config(&self.config),
            Some(exit_tx),
        )
    }
}

/// Exclusive access to one worker, valid until released back to the pool.
#[derive(Clone)]
pub struct WorkerLease {
    /// Worker id, used for release and health reporting.
    pub worker_id: String,

    /// Client bound to the worker.
    pub client: Arc<RpcClient>,
}

impl fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerLease")
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

/// Pool counters for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub starting: usize,
    pub ready: usize,
    pub busy: usize,
    pub waiting: usize,
    pub capacity: usize,
    pub degraded: bool,
}

struct WorkerSlot {
    /// `None` while the slot is starting, before the launch completes.
    client: Option<Arc<RpcClient>>,
    state: WorkerState,
    last_activity: Instant,
    ping_failures: u32,
}

impl WorkerSlot {
    fn starting() -> Self {
        Self {
            client: None,
            state: WorkerState::Starting,
            last_activity: Instant::now(),
            ping_failures: 0,
        }
    }
}

#[derive(Default)]
struct PoolState {
    workers: HashMap<String, WorkerSlot>,
    waiters: VecDeque<oneshot::Sender<WorkerLease>>,
    next_id: u64,
    degraded: bool,
    shutdown: bool,
}

impl PoolState {
    fn take_ready(&mut self) -> Option<WorkerLease> {
        let id = self
            .workers
            .iter()
            .find(|(_, slot)| slot.state == WorkerState::Ready && slot.client.is_some())
            .map(|(id, _)| id.clone())?;
        let slot = self.workers.get_mut(&id)?;
        let client = slot.client.clone()?;
        slot.state = WorkerState::Busy;
        slot.last_activity = Instant::now();
        Some(WorkerLease {
            worker_id: id,
            client,
        })
    }

    /// Occupancy including slots still starting.
    fn live_or_spawning(&self) -> usize {
        self.workers.len()
    }

    fn next_worker_id(&mut self) -> String {
        self.next_id += 1;
        format!("rpc-{}", self.next_id)
    }
}

/// Hand a lease to the oldest waiter still listening.
fn offer_to_waiter(
    waiters: &mut VecDeque<oneshot::Sender<WorkerLease>>,
    mut lease: WorkerLease,
) -> bool {
    while let Some(tx) = waiters.pop_front() {
        match tx.send(lease) {
            Ok(()) => return true,
            // waiter timed out and closed its receiver; try the next one
            Err(returned) => lease = returned,
        }
    }
    false
}

struct PoolInner {
    config: WorkerConfig,
    launcher: Arc<dyn WorkerLauncher>,
    state: Mutex<PoolState>,
    exit_tx: mpsc::UnboundedSender<String>,
}

/// The worker pool handle. Cheap to clone.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create a pool. Workers are not spawned until [`WorkerPool::start`].
    pub fn new(config: WorkerConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PoolInner {
            config,
            launcher,
            state: Mutex::new(PoolState::default()),
            exit_tx,
        });

        tokio::spawn(exit_watcher(Arc::downgrade(&inner), exit_rx));
        tokio::spawn(maintenance_loop(Arc::downgrade(&inner)));

        Self { inner }
    }

    /// Pre-warm the minimum number of workers.
    ///
    /// A worker that fails to launch here is retried in the background with
    /// backoff; startup itself never fails on spawn errors.
    pub async fn start(&self) {
        for _ in 0..self.inner.config.min {
            let id = {
                let mut state = self.inner.state.lock().await;
                let id = state.next_worker_id();
                state.workers.insert(id.clone(), WorkerSlot::starting());
                id
            };
            match self
                .inner
                .launcher
                .launch(&id, self.inner.exit_tx.clone())
                .await
            {
                Ok(client) => install_worker(&self.inner, &id, Arc::new(client)).await,
                Err(e) => {
                    warn!(worker = %id, "initial worker spawn failed: {}", e);
                    spawn_worker(self.inner.clone(), id);
                }
            }
        }
    }

    /// Acquire a ready worker, waiting up to `timeout`.
    ///
    /// Scale-up is attempted when no worker is ready and the pool is below
    /// `max`. Fails with `PoolExhausted` when the timeout elapses.
    pub async fn acquire(&self, timeout: Duration) -> Result<WorkerLease> {
        let mut rx = {
            let mut state = self.inner.state.lock().await;
            if state.shutdown {
                return Err(WorkerError::ClientClosed);
            }
            if let Some(lease) = state.take_ready() {
                return Ok(lease);
            }
            if state.live_or_spawning() < self.inner.config.max {
                let id = state.next_worker_id();
                state.workers.insert(id.clone(), WorkerSlot::starting());
                spawn_worker(self.inner.clone(), id);
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(lease)) => Ok(lease),
            Ok(Err(_)) => Err(WorkerError::ClientClosed),
            Err(_) => {
                // a release may still land on this channel after the
                // deadline; close it and keep any lease that slipped in
                rx.close();
                match rx.try_recv() {
                    Ok(lease) => Ok(lease),
                    Err(_) => Err(WorkerError::PoolExhausted(timeout)),
                }
            }
        }
    }

    /// Return a worker to the pool.
    ///
    /// A healthy worker goes to the oldest live waiter, or back to ready.
    /// A worker marked unhealthy while leased is terminated and replaced.
    pub async fn release(&self, worker_id: &str) {
        let retire = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            match state.workers.get(worker_id).map(|slot| slot.state) {
                None => return,
                Some(WorkerState::Unhealthy) | Some(WorkerState::Terminating) => true,
                Some(_) => {
                    let Some(slot) = state.workers.get_mut(worker_id) else {
                        return;
                    };
                    let Some(client) = slot.client.clone() else {
                        return;
                    };
                    slot.last_activity = Instant::now();
                    let lease = WorkerLease {
                        worker_id: worker_id.to_string(),
                        client,
                    };
                    let handed_over = offer_to_waiter(&mut state.waiters, lease);
                    slot.state = if handed_over {
                        WorkerState::Busy
                    } else {
                        WorkerState::Ready
                    };
                    false
                }
            }
        };

        if retire {
            debug!(worker = worker_id, "releasing unhealthy worker for replacement");
            retire_worker(&self.inner, worker_id).await;
        }
    }

    /// Take a worker out of service.
    ///
    /// An idle worker is terminated immediately; a leased one is flagged and
    /// replaced when its lease is released. Respawn is triggered while the
    /// pool is below `min`.
    pub async fn mark_unhealthy(&self, worker_id: &str, reason: &str) {
        mark_unhealthy_inner(&self.inner, worker_id, reason).await
    }

    /// Current pool counters.
    pub async fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock().await;
        let count = |wanted: WorkerState| {
            state
                .workers
                .values()
                .filter(|slot| slot.state == wanted)
                .count()
        };
        PoolStats {
            total: state.workers.len(),
            starting: count(WorkerState::Starting),
            ready: count(WorkerState::Ready),
            busy: count(WorkerState::Busy),
            waiting: state.waiters.len(),
            capacity: self.inner.config.max,
            degraded: state.degraded,
        }
    }

    /// Stop all workers and cancel pending acquires.
    pub async fn shutdown(&self) {
        let (waiters, clients) = {
            let mut state = self.inner.state.lock().await;
            state.shutdown = true;
            let waiters = std::mem::take(&mut state.waiters);
            let clients: Vec<_> = state
                .workers
                .drain()
                .filter_map(|(_, slot)| slot.client)
                .collect();
            (waiters, clients)
        };

        // pending acquires resolve with ClientClosed
        drop(waiters);

        for client in clients {
            client.close().await;
        }
        info!("worker pool shut down");
    }
}

async fn mark_unhealthy_inner(inner: &Arc<PoolInner>, worker_id: &str, reason: &str) {
    warn!(worker = worker_id, reason, "worker marked unhealthy");
    let retire = {
        let mut state = inner.state.lock().await;
        match state.workers.get_mut(worker_id) {
            None => false,
            Some(slot) if slot.state == WorkerState::Busy => {
                // replaced when the lease comes back
                slot.state = WorkerState::Unhealthy;
                false
            }
            Some(slot) => {
                slot.state = WorkerState::Unhealthy;
                true
            }
        }
    };

    if retire {
        retire_worker(inner, worker_id).await;
    }
}

/// Tear one worker down: mark the slot terminating, close the client off
/// the lock, then drop the slot and respawn if the pool fell below `min`.
async fn retire_worker(inner: &Arc<PoolInner>, worker_id: &str) {
    let client = {
        let mut state = inner.state.lock().await;
        match state.workers.get_mut(worker_id) {
            Some(slot) => {
                slot.state = WorkerState::Terminating;
                slot.client.take()
            }
            None => return,
        }
    };

    if let Some(client) = client {
        client.close().await;
    }
    inner.state.lock().await.workers.remove(worker_id);
    ensure_min(inner).await;
}

async fn install_worker(inner: &Arc<PoolInner>, id: &str, client: Arc<RpcClient>) {
    let mut guard = inner.state.lock().await;
    if guard.shutdown || !guard.workers.contains_key(id) {
        // the slot was retired while the launch was in flight
        drop(guard);
        client.close().await;
        return;
    }
    let state = &mut *guard;
    state.degraded = false;
    let lease = WorkerLease {
        worker_id: id.to_string(),
        client: client.clone(),
    };
    let worker_state = if offer_to_waiter(&mut state.waiters, lease) {
        WorkerState::Busy
    } else {
        WorkerState::Ready
    };
    if let Some(slot) = state.workers.get_mut(id) {
        slot.client = Some(client);
        slot.state = worker_state;
        slot.last_activity = Instant::now();
        slot.ping_failures = 0;
    }
    info!(worker = %id, "worker ready");
}

/// Launch the worker for an existing starting slot, retrying with
/// exponential backoff. Giving up removes the slot and flags the pool
/// degraded.
fn spawn_worker(inner: Arc<PoolInner>, id: String) {
    tokio::spawn(async move {
        let mut attempt: u32 = 0;
        loop {
            {
                let state = inner.state.lock().await;
                if state.shutdown || !state.workers.contains_key(&id) {
                    return;
                }
            }
            match inner.launcher.launch(&id, inner.exit_tx.clone()).await {
                Ok(client) => {
                    install_worker(&inner, &id, Arc::new(client)).await;
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= inner.config.max_spawn_attempts {
                        error!(
                            "giving up on worker spawn after {} attempts: {}",
                            attempt, e
                        );
                        let mut state = inner.state.lock().await;
                        state.workers.remove(&id);
                        state.degraded = true;
                        return;
                    }
                    let backoff = spawn_backoff(inner.config.spawn_backoff_ms, attempt);
                    warn!(
                        "worker spawn failed (attempt {}): {}, retrying in {:?}",
                        attempt, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    });
}

fn spawn_backoff(base_ms: u64, attempt: u32) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << (attempt - 1).min(8));
    let jitter = rand::thread_rng().gen_range(0..=exp / 2);
    Duration::from_millis(exp + jitter)
}

/// Respawn workers while the pool is below its minimum size.
async fn ensure_min(inner: &Arc<PoolInner>) {
    let ids = {
        let mut state = inner.state.lock().await;
        if state.shutdown {
            return;
        }
        let deficit = inner.config.min.saturating_sub(state.live_or_spawning());
        let mut ids = Vec::with_capacity(deficit);
        for _ in 0..deficit {
            let id = state.next_worker_id();
            state.workers.insert(id.clone(), WorkerSlot::starting());
            ids.push(id);
        }
        ids
    };
    for id in ids {
        spawn_worker(inner.clone(), id);
    }
}

/// Removes crashed workers as their clients report process exit.
async fn exit_watcher(weak: Weak<PoolInner>, mut exit_rx: mpsc::UnboundedReceiver<String>) {
    while let Some(worker_id) = exit_rx.recv().await {
        let Some(inner) = weak.upgrade() else { return };
        let removed = {
            inner
                .state
                .lock()
                .await
                .workers
                .remove(&worker_id)
                .is_some()
        };
        if removed {
            warn!(worker = %worker_id, "worker process exited unexpectedly");
            ensure_min(&inner).await;
        }
    }
}

/// Periodic upkeep: respawn below min, ping idle workers.
async fn maintenance_loop(weak: Weak<PoolInner>) {
    let interval = match weak.upgrade() {
        Some(inner) => inner.config.health_check_interval(),
        None => return,
    };
    if interval.is_zero() {
        return;
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // immediate first tick

    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else { return };
        if inner.state.lock().await.shutdown {
            return;
        }
        ensure_min(&inner).await;
        run_health_checks(&inner).await;
    }
}

async fn run_health_checks(inner: &Arc<PoolInner>) {
    let targets: Vec<(String, Arc<RpcClient>)> = inner
        .state
        .lock()
        .await
        .workers
        .iter()
        .filter(|(_, slot)| slot.state == WorkerState::Ready)
        .filter_map(|(id, slot)| slot.client.clone().map(|client| (id.clone(), client)))
        .collect();

    for (id, client) in targets {
        match client.ping().await {
            Ok(_) => {
                if let Some(slot) = inner.state.lock().await.workers.get_mut(&id) {
                    slot.ping_failures = 0;
                    slot.last_activity = Instant::now();
                }
            }
            Err(e) => {
                debug!(worker = %id, "health ping failed: {}", e);
                let failures = inner
                    .state
                    .lock()
                    .await
                    .workers
                    .get_mut(&id)
                    .map(|slot| {
                        slot.ping_failures += 1;
                        slot.ping_failures
                    });
                if matches!(failures, Some(f) if f >= inner.config.health_check_failures) {
                    mark_unhealthy_inner(inner, &id, "failed consecutive health checks").await;
                }
            }
        }
    }
}
