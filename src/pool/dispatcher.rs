//! Request dispatch: find or start a worker for a problem and forward a proof to it.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;

use super::handle::WorkerHandle;
use super::registry::{Checkout, Registry, SlotReservation, WorkerInfo, WorkerLease};
use super::spawn::WorkerLauncher;
use super::transport::WorkerTransport;
use crate::check::{CheckResult, ProblemId, Score};
use crate::error::{CoqpoolError, Result};

/// Longest budget a single request may ask for.
pub const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of live workers (including ones being started).
    pub capacity: usize,
    /// Address workers are told to listen on.
    pub host: IpAddr,
    /// Upper bound on each wait for a free slot before re-checking.
    pub retry_interval: Duration,
    /// How long a new worker may take to open its endpoint before it is
    /// considered broken.
    pub startup_timeout: Duration,
    /// Interval between readiness probes of a starting worker.
    pub probe_interval: Duration,
    /// SIGTERM grace period before a worker is killed.
    pub stop_grace: Duration,
    /// Tear down a worker whose verification call timed out.
    pub recycle_on_timeout: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            retry_interval: Duration::from_millis(100),
            startup_timeout: Duration::from_secs(300), // loading a large project can be slow
            probe_interval: Duration::from_millis(200),
            stop_grace: Duration::from_secs(5),
            recycle_on_timeout: true,
        }
    }
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    verified: AtomicU64,
    rejected: AtomicU64,
    errors: AtomicU64,
    spawned: AtomicU64,
    evicted: AtomicU64,
    recycled_unhealthy: AtomicU64,
    recycled_timeout: AtomicU64,
}

/// Pool statistics.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PoolStats {
    pub capacity: usize,
    /// Workers currently registered.
    pub live: usize,
    /// Workers currently serving a request.
    pub busy: usize,
    /// Slots held by workers that are still being launched.
    pub reserved: usize,
    pub requests: u64,
    pub verified: u64,
    pub rejected: u64,
    pub errors: u64,
    pub spawned: u64,
    pub evicted: u64,
    pub recycled_unhealthy: u64,
    pub recycled_timeout: u64,
    pub workers: Vec<WorkerInfo>,
}

/// Bounded pool of per-problem verification workers.
///
/// Cheap to share behind an `Arc`; every method takes `&self` and blocks the
/// calling thread.
pub struct WorkerPool {
    config: PoolConfig,
    registry: Registry,
    launcher: Arc<dyn WorkerLauncher>,
    transport: Arc<dyn WorkerTransport>,
    counters: Counters,
    shut_down: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        launcher: Arc<dyn WorkerLauncher>,
        transport: Arc<dyn WorkerTransport>,
    ) -> Self {
        let registry = Registry::new(config.capacity, config.retry_interval);
        info!(
            capacity = config.capacity,
            retry_interval_ms = config.retry_interval.as_millis() as u64,
            startup_timeout_secs = config.startup_timeout.as_secs(),
            recycle_on_timeout = config.recycle_on_timeout,
            "Worker pool created"
        );
        Self {
            config,
            registry,
            launcher,
            transport,
            counters: Counters::default(),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Check `proof` against `problem`, spending at most `timeout` in total
    /// (capped at [`MAX_REQUEST_TIMEOUT`]).
    ///
    /// Never fails: every problem on the way (no free slot in time, worker
    /// crash, RPC timeout) becomes a [`Score::Error`] result with one message.
    #[instrument(skip_all, fields(problem = %problem))]
    pub fn check_proof(&self, problem: &ProblemId, proof: &str, timeout: Duration) -> CheckResult {
        let start = Instant::now();
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        let deadline = start + timeout.min(MAX_REQUEST_TIMEOUT);

        let result = match self.dispatch(problem, proof, deadline) {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, elapsed_ms = start.elapsed().as_millis() as u64, "Proof check failed");
                CheckResult::error(e.to_string())
            }
        };

        let counter = match result.score {
            Score::Verified => &self.counters.verified,
            Score::Rejected => &self.counters.rejected,
            Score::Error => &self.counters.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        debug!(
            score = i8::from(result.score),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Proof check finished"
        );
        result
    }

    fn dispatch(&self, problem: &ProblemId, proof: &str, deadline: Instant) -> Result<CheckResult> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(CoqpoolError::Worker("pool is shutting down".to_string()));
        }

        let lease = self.acquire(problem, deadline)?;
        let lease = self.wait_ready(lease, deadline)?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CoqpoolError::Timeout(format!(
                "no time left to check proof for {}",
                problem
            )));
        }

        match self.transport.check_proof(lease.address(), proof, remaining) {
            Ok(result) => Ok(result),
            Err(e @ CoqpoolError::Timeout(_)) => {
                if self.config.recycle_on_timeout {
                    self.counters.recycled_timeout.fetch_add(1, Ordering::Relaxed);
                    self.retire(lease, "verification timed out");
                }
                Err(e)
            }
            Err(e) => {
                if !lease.is_healthy() {
                    self.counters.recycled_unhealthy.fetch_add(1, Ordering::Relaxed);
                    self.retire(lease, "worker died during verification");
                }
                Err(e)
            }
        }
    }

    /// Get a live worker for `problem`, starting one if needed.
    fn acquire(&self, problem: &ProblemId, deadline: Instant) -> Result<WorkerLease> {
        loop {
            let lease = match self.registry.checkout(problem, deadline)? {
                Checkout::Existing(lease) => lease,
                // Fresh workers are vetted by `wait_ready`.
                Checkout::Create(slot) => return self.spawn_worker(problem, slot),
                Checkout::Evict { victim, slot } => {
                    self.evict(victim);
                    return self.spawn_worker(problem, slot);
                }
            };

            if lease.is_healthy() {
                debug!(worker_id = lease.id(), last_used = lease.last_used(), "Reusing worker");
                return Ok(lease);
            }

            self.counters.recycled_unhealthy.fetch_add(1, Ordering::Relaxed);
            self.retire(lease, "worker process is not running");
        }
    }

    fn spawn_worker(&self, problem: &ProblemId, slot: SlotReservation) -> Result<WorkerLease> {
        let port = portpicker::pick_unused_port().ok_or(CoqpoolError::NoFreePort)?;
        let address = SocketAddr::new(self.config.host, port);
        let process = self.launcher.launch(problem, address)?;
        let handle = Arc::new(WorkerHandle::new_acquired(problem.clone(), address, process));
        self.counters.spawned.fetch_add(1, Ordering::Relaxed);
        info!(
            worker_id = handle.id(),
            %address,
            pid = ?handle.pid(),
            "Spawned worker"
        );
        slot.commit(handle)
    }

    /// Stop an evicted worker. It has already been removed from the registry.
    fn evict(&self, victim: WorkerLease) {
        self.counters.evicted.fetch_add(1, Ordering::Relaxed);
        info!(
            victim = %victim.problem(),
            worker_id = victim.id(),
            last_used = victim.last_used(),
            "Evicting idle worker"
        );
        self.stop(&victim);
    }

    /// Remove a held worker from the registry and stop it.
    fn retire(&self, lease: WorkerLease, reason: &str) {
        let exit = lease.exit_reason();
        warn!(
            worker_id = lease.id(),
            worker_problem = %lease.problem(),
            reason,
            exit = ?exit,
            "Retiring worker"
        );
        self.registry.remove(&lease);
        self.stop(&lease);
    }

    fn stop(&self, handle: &WorkerHandle) {
        if let Err(e) = handle.terminate(self.config.stop_grace) {
            warn!(worker_id = handle.id(), error = %e, "Failed to stop worker");
        }
    }

    /// Wait until the worker's endpoint accepts connections.
    ///
    /// A worker that exits or misses its own startup deadline is torn down. A
    /// worker that is merely slower than this request's deadline is released
    /// still starting, so a later request can pick it up.
    fn wait_ready(&self, lease: WorkerLease, deadline: Instant) -> Result<WorkerLease> {
        if lease.is_ready() {
            return Ok(lease);
        }

        loop {
            if self.transport.probe(lease.address()) {
                lease.mark_ready();
                info!(
                    worker_id = lease.id(),
                    elapsed_ms = lease.spawned_at().elapsed().as_millis() as u64,
                    "Worker ready"
                );
                return Ok(lease);
            }

            if !lease.is_healthy() {
                let reason = lease
                    .exit_reason()
                    .map_or_else(|| "unknown reason".to_string(), |r| r.description());
                let problem = lease.problem().clone();
                self.counters.recycled_unhealthy.fetch_add(1, Ordering::Relaxed);
                self.retire(lease, "worker exited during startup");
                return Err(CoqpoolError::Worker(format!(
                    "worker for {} exited during startup: {}",
                    problem, reason
                )));
            }

            let now = Instant::now();
            if now.duration_since(lease.spawned_at()) >= self.config.startup_timeout {
                self.retire(lease, "worker startup timed out");
                return Err(CoqpoolError::WorkerStartupTimeout(self.config.startup_timeout));
            }
            if now >= deadline {
                return Err(CoqpoolError::Timeout(format!(
                    "worker for {} was still starting when the request deadline passed",
                    lease.problem()
                )));
            }

            std::thread::sleep(self.config.probe_interval.min(deadline - now));
        }
    }

    pub fn stats(&self) -> PoolStats {
        let snapshot = self.registry.snapshot();
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        PoolStats {
            capacity: snapshot.capacity,
            live: snapshot.live,
            busy: snapshot.busy,
            reserved: snapshot.reserved,
            requests: load(&self.counters.requests),
            verified: load(&self.counters.verified),
            rejected: load(&self.counters.rejected),
            errors: load(&self.counters.errors),
            spawned: load(&self.counters.spawned),
            evicted: load(&self.counters.evicted),
            recycled_unhealthy: load(&self.counters.recycled_unhealthy),
            recycled_timeout: load(&self.counters.recycled_timeout),
            workers: snapshot.workers,
        }
    }

    /// Stop every worker, waiting for in-flight requests to finish with theirs.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let workers = self.registry.drain();
        info!(count = workers.len(), "Stopping workers");
        for handle in workers {
            handle.acquire_blocking();
            self.stop(&handle);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
