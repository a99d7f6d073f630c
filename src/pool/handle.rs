//! Worker handles and the LRU sequence counter.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::proc::WorkerProcess;
use super::signals::TerminationReason;
use crate::check::ProblemId;
use crate::error::Result;

/// Poll interval for [`WorkerHandle::acquire_blocking`].
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Process-wide usage sequence. Only used for relative recency comparison.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Worker ids for logging.
static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Increment the process-wide sequence counter and return the new value.
pub fn next_sequence() -> u64 {
    SEQUENCE.fetch_add(1, Ordering::SeqCst) + 1
}

/// One verification worker process bound to a single problem.
///
/// The `busy` flag is the worker's exclusive-use lock: whoever sets it owns
/// the worker until they clear it again.
pub struct WorkerHandle {
    id: u64,
    problem: ProblemId,
    address: SocketAddr,
    process: Mutex<Box<dyn WorkerProcess>>,
    busy: AtomicBool,
    last_used: AtomicU64,
    /// Set once the worker's endpoint has accepted a connection.
    ready: AtomicBool,
    spawned_at: Instant,
}

impl WorkerHandle {
    /// Create a handle for a freshly spawned worker, already acquired by the
    /// caller that spawned it.
    pub fn new_acquired(
        problem: ProblemId,
        address: SocketAddr,
        process: Box<dyn WorkerProcess>,
    ) -> Self {
        Self {
            id: NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed),
            problem,
            address,
            process: Mutex::new(process),
            busy: AtomicBool::new(true),
            last_used: AtomicU64::new(next_sequence()),
            ready: AtomicBool::new(false),
            spawned_at: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn problem(&self) -> &ProblemId {
        &self.problem
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn spawned_at(&self) -> Instant {
        self.spawned_at
    }

    pub fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn pid(&self) -> Option<u32> {
        self.process().pid()
    }

    /// Non-blocking attempt to take the busy lock.
    pub fn try_acquire(&self) -> bool {
        let acquired = self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if acquired {
            self.last_used.store(next_sequence(), Ordering::SeqCst);
        }
        acquired
    }

    /// Block until the busy lock is held. Only used for teardown.
    pub fn acquire_blocking(&self) {
        while !self.try_acquire() {
            std::thread::sleep(ACQUIRE_POLL_INTERVAL);
        }
    }

    /// Clear the busy lock and bump `last_used`.
    ///
    /// Only the registry's lease guard calls this, exactly once per acquire.
    pub(super) fn release(&self) {
        self.last_used.store(next_sequence(), Ordering::SeqCst);
        let was_busy = self.busy.swap(false, Ordering::SeqCst);
        debug_assert!(was_busy, "worker {} released twice", self.id);
        if !was_busy {
            tracing::error!(worker_id = self.id, problem = %self.problem, "Worker released twice");
        }
    }

    /// Whether the backing process is still running.
    pub fn is_healthy(&self) -> bool {
        self.process().is_running()
    }

    pub fn exit_reason(&self) -> Option<TerminationReason> {
        self.process().exit_reason()
    }

    /// Stop the backing process. The caller must hold the busy lock.
    pub fn terminate(&self, grace: Duration) -> Result<()> {
        debug_assert!(self.is_busy(), "terminating worker {} without holding it", self.id);
        self.process().stop(grace)
    }

    fn process(&self) -> MutexGuard<'_, Box<dyn WorkerProcess>> {
        self.process.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("problem", &self.problem)
            .field("address", &self.address)
            .field("busy", &self.is_busy())
            .field("last_used", &self.last_used())
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory stand-in for a worker process.

    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    /// Shared view of a fake process, kept by tests to kill or inspect it.
    #[derive(Clone)]
    pub struct FakeProcessState {
        alive: Arc<AtomicBool>,
        live: Arc<AtomicUsize>,
        pub stops: Arc<AtomicUsize>,
    }

    impl FakeProcessState {
        /// Make the process exit, as if it had crashed.
        pub fn kill(&self) {
            if self.alive.swap(false, Ordering::SeqCst) {
                self.live.fetch_sub(1, Ordering::SeqCst);
            }
        }

        pub fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    pub struct FakeProcess {
        state: FakeProcessState,
    }

    impl FakeProcess {
        /// A running fake process, counted in `live` until it stops, dies or is dropped.
        pub fn start(live: Arc<AtomicUsize>) -> (Self, FakeProcessState) {
            live.fetch_add(1, Ordering::SeqCst);
            let state = FakeProcessState {
                alive: Arc::new(AtomicBool::new(true)),
                live,
                stops: Arc::new(AtomicUsize::new(0)),
            };
            (
                Self {
                    state: state.clone(),
                },
                state,
            )
        }
    }

    impl WorkerProcess for FakeProcess {
        fn pid(&self) -> Option<u32> {
            None
        }

        fn is_running(&mut self) -> bool {
            self.state.is_alive()
        }

        fn exit_reason(&mut self) -> Option<TerminationReason> {
            (!self.is_running()).then_some(TerminationReason::Exited(1))
        }

        fn stop(&mut self, _grace: Duration) -> Result<()> {
            self.state.stops.fetch_add(1, Ordering::SeqCst);
            self.state.kill();
            Ok(())
        }
    }

    impl Drop for FakeProcess {
        fn drop(&mut self) {
            self.state.kill();
        }
    }

    pub fn fake_handle(problem: ProblemId, live: &Arc<AtomicUsize>) -> (WorkerHandle, FakeProcessState) {
        let (process, state) = FakeProcess::start(live.clone());
        let address: SocketAddr = "127.0.0.1:9".parse().expect("valid address");
        (
            WorkerHandle::new_acquired(problem, address, Box::new(process)),
            state,
        )
    }
}
