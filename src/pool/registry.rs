//! The pool registry: which workers exist, for which problem, and who holds them.
//!
//! Every decision that changes the set of workers is made and applied under a
//! single mutex, so two requests can never claim the same free slot or evict
//! the same victim. The lock is never held across process or network I/O:
//! callers get back a [`Checkout`] and do the slow work (spawning, stopping)
//! after the lock is dropped.
//!
//! Ownership is expressed with two RAII guards:
//!
//! - [`WorkerLease`]: the caller holds a worker's busy lock. Dropping the lease
//!   releases it and wakes capacity waiters.
//! - [`SlotReservation`]: the caller may insert one new worker. Dropping it
//!   without committing gives the slot back.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use utoipa::ToSchema;

use super::handle::WorkerHandle;
use crate::check::ProblemId;
use crate::error::{CoqpoolError, Result};

/// Outcome of an admission decision, computed under the registry lock.
#[derive(Debug)]
pub enum Admission {
    /// Below capacity; a new worker may be created.
    Space,
    /// At capacity and every worker is busy.
    NoSpace,
    /// At capacity, but this idle worker (the least recently used one) can go.
    SpaceAfterRemoval(Arc<WorkerHandle>),
}

/// What the caller should do next to get a worker for its problem.
#[derive(Debug)]
pub enum Checkout {
    /// An idle worker for the problem, already acquired.
    Existing(WorkerLease),
    /// No idle worker; a slot has been reserved for a new one.
    Create(SlotReservation),
    /// The pool was full. `victim` has been removed from the registry and must
    /// be stopped before the new worker is started in `slot`.
    Evict {
        victim: WorkerLease,
        slot: SlotReservation,
    },
}

#[derive(Default)]
struct RegistryState {
    workers: HashMap<ProblemId, Vec<Arc<WorkerHandle>>>,
    /// Slots handed out to callers that are still starting their worker.
    reserved: usize,
}

impl RegistryState {
    fn handle_count(&self) -> usize {
        self.workers.values().map(Vec::len).sum()
    }

    fn occupied(&self) -> usize {
        self.handle_count() + self.reserved
    }

    /// First worker for `problem` whose busy lock can be taken.
    fn lookup_available(&self, problem: &ProblemId) -> Option<Arc<WorkerHandle>> {
        self.workers
            .get(problem)?
            .iter()
            .find(|handle| handle.try_acquire())
            .cloned()
    }

    fn insert(&mut self, capacity: usize, handle: Arc<WorkerHandle>) -> Result<()> {
        let occupied = self.occupied();
        debug_assert!(
            occupied < capacity,
            "inserting worker into full registry ({} of {})",
            occupied,
            capacity
        );
        if occupied >= capacity {
            return Err(CoqpoolError::PoolInvariant(format!(
                "insert of worker {} for {} would exceed capacity {} ({} occupied)",
                handle.id(),
                handle.problem(),
                capacity,
                occupied
            )));
        }
        self.workers
            .entry(handle.problem().clone())
            .or_default()
            .push(handle);
        Ok(())
    }

    /// Remove exactly this handle. Returns whether it was present.
    fn remove_one(&mut self, handle: &Arc<WorkerHandle>) -> bool {
        let Some(list) = self.workers.get_mut(handle.problem()) else {
            return false;
        };
        let before = list.len();
        list.retain(|h| !Arc::ptr_eq(h, handle));
        let removed = list.len() != before;
        if list.is_empty() {
            self.workers.remove(handle.problem());
        }
        removed
    }

    fn classify(&self, capacity: usize) -> Admission {
        if self.occupied() < capacity {
            return Admission::Space;
        }
        self.workers
            .values()
            .flatten()
            .filter(|handle| !handle.is_busy())
            .min_by_key(|handle| handle.last_used())
            .map_or(Admission::NoSpace, |victim| {
                Admission::SpaceAfterRemoval(victim.clone())
            })
    }
}

struct Inner {
    state: Mutex<RegistryState>,
    /// Signalled whenever a worker is released or a slot is freed.
    released: Condvar,
    capacity: usize,
    retry_interval: Duration,
}

/// Bounded registry of workers keyed by problem.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    pub fn new(capacity: usize, retry_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(RegistryState::default()),
                released: Condvar::new(),
                capacity,
                retry_interval,
            }),
        }
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get an idle worker for `problem`, or permission to create one.
    ///
    /// Blocks on the release condition while the pool is full of busy
    /// workers, waking at least every retry interval, and gives up with
    /// [`CoqpoolError::CapacityTimeout`] once `deadline` has passed.
    pub fn checkout(&self, problem: &ProblemId, deadline: Instant) -> Result<Checkout> {
        let started = Instant::now();
        let mut state = self.lock();
        loop {
            if let Some(handle) = state.lookup_available(problem) {
                return Ok(Checkout::Existing(WorkerLease::new(self.clone(), handle)));
            }

            match state.classify(self.inner.capacity) {
                Admission::Space => {
                    state.reserved += 1;
                    return Ok(Checkout::Create(SlotReservation::new(self.clone())));
                }
                Admission::SpaceAfterRemoval(victim) => {
                    // Idle workers are only acquired under this lock, so this
                    // cannot race with another request.
                    if !victim.try_acquire() {
                        continue;
                    }
                    state.remove_one(&victim);
                    state.reserved += 1;
                    return Ok(Checkout::Evict {
                        victim: WorkerLease::new(self.clone(), victim),
                        slot: SlotReservation::new(self.clone()),
                    });
                }
                Admission::NoSpace => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(CoqpoolError::CapacityTimeout(started.elapsed()));
                    }
                    let wait = self.inner.retry_interval.min(deadline - now);
                    state = match self.inner.released.wait_timeout(state, wait) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
            }
        }
    }

    /// Remove a held worker so nobody else can pick it up.
    ///
    /// The lease stays valid: the caller is expected to stop the worker and
    /// then drop the lease.
    pub fn remove(&self, lease: &WorkerLease) -> bool {
        let removed = self.lock().remove_one(&lease.handle);
        self.inner.released.notify_all();
        removed
    }

    /// Take every worker out of the registry. Used on shutdown.
    pub fn drain(&self) -> Vec<Arc<WorkerHandle>> {
        let drained: Vec<_> = self
            .lock()
            .workers
            .drain()
            .flat_map(|(_, handles)| handles)
            .collect();
        self.inner.released.notify_all();
        drained
    }

    /// Point-in-time view of the registry for stats and logging.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let (handles, reserved) = {
            let state = self.lock();
            let handles: Vec<_> = state.workers.values().flatten().cloned().collect();
            (handles, state.reserved)
        };

        let mut workers: Vec<WorkerInfo> = handles
            .iter()
            .map(|handle| WorkerInfo {
                id: handle.id(),
                problem: handle.problem().clone(),
                address: handle.address().to_string(),
                pid: handle.pid(),
                busy: handle.is_busy(),
                ready: handle.is_ready(),
                last_used: handle.last_used(),
            })
            .collect();
        workers.sort_by_key(|w| w.id);

        RegistrySnapshot {
            capacity: self.inner.capacity,
            live: workers.len(),
            busy: workers.iter().filter(|w| w.busy).count(),
            reserved,
            workers,
        }
    }
}

/// Registry contents at one instant.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub capacity: usize,
    pub live: usize,
    pub busy: usize,
    pub reserved: usize,
    pub workers: Vec<WorkerInfo>,
}

/// One registered worker, as reported by `/stats`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct WorkerInfo {
    pub id: u64,
    pub problem: ProblemId,
    pub address: String,
    pub pid: Option<u32>,
    pub busy: bool,
    pub ready: bool,
    pub last_used: u64,
}

/// Exclusive use of one worker. Released on drop.
pub struct WorkerLease {
    registry: Registry,
    handle: Arc<WorkerHandle>,
}

impl WorkerLease {
    fn new(registry: Registry, handle: Arc<WorkerHandle>) -> Self {
        debug_assert!(handle.is_busy());
        Self { registry, handle }
    }
}

impl Deref for WorkerLease {
    type Target = WorkerHandle;

    fn deref(&self) -> &WorkerHandle {
        &self.handle
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        let _state = self.registry.lock();
        self.handle.release();
        self.registry.inner.released.notify_all();
    }
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("WorkerLease").field(&self.handle).finish()
    }
}

/// Permission to insert one new worker.
pub struct SlotReservation {
    registry: Registry,
    consumed: bool,
}

impl SlotReservation {
    fn new(registry: Registry) -> Self {
        Self {
            registry,
            consumed: false,
        }
    }

    /// Insert a freshly created, already acquired worker into the reserved
    /// slot and hand back its lease.
    pub fn commit(mut self, handle: Arc<WorkerHandle>) -> Result<WorkerLease> {
        debug_assert!(handle.is_busy(), "committed worker must be held");
        self.consumed = true;
        let registry = self.registry.clone();
        let mut state = registry.lock();
        state.reserved -= 1;
        let inserted = state.insert(registry.inner.capacity, handle.clone());
        drop(state);
        registry.inner.released.notify_all();
        inserted?;
        Ok(WorkerLease::new(registry, handle))
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if !self.consumed {
            self.registry.lock().reserved -= 1;
            self.registry.inner.released.notify_all();
        }
    }
}

impl std::fmt::Debug for SlotReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotReservation")
            .field("consumed", &self.consumed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::handle::testing::fake_handle;
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry(capacity: usize) -> Registry {
        Registry::new(capacity, Duration::from_millis(10))
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(50)
    }

    /// Check out `problem` expecting a fresh slot and fill it.
    fn create(registry: &Registry, problem: &ProblemId, live: &Arc<AtomicUsize>) -> WorkerLease {
        match registry.checkout(problem, soon()).unwrap() {
            Checkout::Create(slot) => {
                let (handle, _) = fake_handle(problem.clone(), live);
                slot.commit(Arc::new(handle)).unwrap()
            }
            other => panic!("expected a new slot, got {:?}", other),
        }
    }

    fn assert_invariants(registry: &Registry) {
        let state = registry.lock();
        assert!(
            state.occupied() <= registry.capacity(),
            "{} handles + {} reserved exceeds capacity {}",
            state.handle_count(),
            state.reserved,
            registry.capacity()
        );
        assert!(state.workers.values().all(|list| !list.is_empty()));
    }

    #[test]
    fn test_reuses_idle_worker() {
        let live = Arc::new(AtomicUsize::new(0));
        let registry = registry(2);
        let problem = ProblemId::new("test", 0);

        let lease = create(&registry, &problem, &live);
        let id = lease.id();
        drop(lease);

        match registry.checkout(&problem, soon()).unwrap() {
            Checkout::Existing(lease) => assert_eq!(lease.id(), id),
            other => panic!("expected reuse, got {:?}", other),
        }
    }

    #[test]
    fn test_busy_worker_is_not_shared() {
        let live = Arc::new(AtomicUsize::new(0));
        let registry = registry(2);
        let problem = ProblemId::new("test", 0);

        let _held = create(&registry, &problem, &live);
        // Same problem, but the only worker is busy: a second one is created.
        assert!(matches!(
            registry.checkout(&problem, soon()).unwrap(),
            Checkout::Create(_)
        ));
    }

    #[test]
    fn test_evicts_least_recently_used_idle_worker() {
        let live = Arc::new(AtomicUsize::new(0));
        let registry = registry(2);
        let a = ProblemId::new("test", 0);
        let b = ProblemId::new("test", 1);
        let c = ProblemId::new("test", 2);

        let lease_a = create(&registry, &a, &live);
        let lease_b = create(&registry, &b, &live);
        let id_a = lease_a.id();
        drop(lease_a);
        drop(lease_b);

        match registry.checkout(&c, soon()).unwrap() {
            Checkout::Evict { victim, slot } => {
                assert_eq!(victim.id(), id_a);
                assert_eq!(registry.snapshot().live, 1);
                assert_eq!(registry.snapshot().reserved, 1);
                drop(victim);
                drop(slot);
            }
            other => panic!("expected eviction, got {:?}", other),
        }
        assert_eq!(registry.snapshot().reserved, 0);
        assert_invariants(&registry);
    }

    #[test]
    fn test_eviction_never_picks_busy_worker() {
        let live = Arc::new(AtomicUsize::new(0));
        let registry = registry(2);
        let a = ProblemId::new("test", 0);
        let b = ProblemId::new("test", 1);

        // a is older but held; b is newer and idle.
        let held_a = create(&registry, &a, &live);
        drop(create(&registry, &b, &live));

        match registry.checkout(&ProblemId::new("test", 2), soon()).unwrap() {
            Checkout::Evict { victim, .. } => {
                assert_eq!(victim.problem(), &b);
                assert_ne!(victim.id(), held_a.id());
            }
            other => panic!("expected eviction, got {:?}", other),
        }
    }

    #[test]
    fn test_full_of_busy_workers_times_out() {
        let live = Arc::new(AtomicUsize::new(0));
        let registry = registry(1);
        let _held = create(&registry, &ProblemId::new("test", 0), &live);

        let start = Instant::now();
        let err = registry
            .checkout(&ProblemId::new("test", 1), Instant::now() + Duration::from_millis(60))
            .unwrap_err();
        assert!(matches!(err, CoqpoolError::CapacityTimeout(_)));
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let live = Arc::new(AtomicUsize::new(0));
        let registry = Registry::new(1, Duration::from_secs(10));
        let problem = ProblemId::new("test", 0);
        let held = create(&registry, &problem, &live);
        let id = held.id();

        let waiter = {
            let registry = registry.clone();
            let problem = problem.clone();
            std::thread::spawn(move || {
                let start = Instant::now();
                let checkout = registry
                    .checkout(&problem, Instant::now() + Duration::from_secs(10))
                    .unwrap();
                (checkout, start.elapsed())
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        drop(held);

        let (checkout, waited) = waiter.join().unwrap();
        match checkout {
            Checkout::Existing(lease) => assert_eq!(lease.id(), id),
            other => panic!("expected reuse, got {:?}", other),
        }
        // Woken by the release, not by the 10 s retry interval.
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn test_reservation_counts_against_capacity() {
        let registry = registry(1);
        let slot = match registry.checkout(&ProblemId::new("test", 0), soon()).unwrap() {
            Checkout::Create(slot) => slot,
            other => panic!("expected a new slot, got {:?}", other),
        };

        // The slot is taken even though no worker exists yet.
        let err = registry
            .checkout(&ProblemId::new("test", 1), Instant::now())
            .unwrap_err();
        assert!(matches!(err, CoqpoolError::CapacityTimeout(_)));

        drop(slot);
        assert!(matches!(
            registry.checkout(&ProblemId::new("test", 1), soon()).unwrap(),
            Checkout::Create(_)
        ));
    }

    #[test]
    fn test_remove_deletes_empty_key() {
        let live = Arc::new(AtomicUsize::new(0));
        let registry = registry(2);
        let problem = ProblemId::new("test", 0);
        let lease = create(&registry, &problem, &live);

        assert!(registry.remove(&lease));
        assert!(!registry.remove(&lease));
        drop(lease);

        assert!(registry.lock().workers.is_empty());
        assert_eq!(registry.snapshot().live, 0);
    }

    #[test]
    fn test_insert_over_capacity_is_an_error() {
        let live = Arc::new(AtomicUsize::new(0));
        let mut state = RegistryState::default();
        let (first, _) = fake_handle(ProblemId::new("test", 0), &live);
        state.insert(1, Arc::new(first)).unwrap();

        let (second, _) = fake_handle(ProblemId::new("test", 1), &live);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            state.insert(1, Arc::new(second))
        }));
        // Debug builds trip the assertion, release builds return the error.
        match result {
            Err(_) => {}
            Ok(inserted) => assert!(matches!(inserted, Err(CoqpoolError::PoolInvariant(_)))),
        }
    }

    #[test]
    fn test_drain_empties_registry() {
        let live = Arc::new(AtomicUsize::new(0));
        let registry = registry(3);
        drop(create(&registry, &ProblemId::new("test", 0), &live));
        drop(create(&registry, &ProblemId::new("test", 1), &live));

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(registry.snapshot().live, 0);
    }

    #[test]
    fn test_snapshot_reports_busy_workers() {
        let live = Arc::new(AtomicUsize::new(0));
        let registry = registry(3);
        let _held = create(&registry, &ProblemId::new("test", 0), &live);
        drop(create(&registry, &ProblemId::new("test", 1), &live));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.capacity, 3);
        assert_eq!(snapshot.live, 2);
        assert_eq!(snapshot.busy, 1);
        assert_eq!(snapshot.reserved, 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Checkout(u64),
        Release(usize),
        Retire(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0u64..5).prop_map(Op::Checkout),
            2 => any::<usize>().prop_map(Op::Release),
            1 => any::<usize>().prop_map(Op::Retire),
        ]
    }

    proptest! {
        #[test]
        fn prop_registry_invariants_hold(
            capacity in 1usize..4,
            ops in prop::collection::vec(op_strategy(), 1..60),
        ) {
            let live = Arc::new(AtomicUsize::new(0));
            let registry = Registry::new(capacity, Duration::from_millis(1));
            let mut held: Vec<WorkerLease> = Vec::new();

            for op in ops {
                match op {
                    Op::Checkout(idx) => {
                        let problem = ProblemId::new("prop", idx);
                        match registry.checkout(&problem, Instant::now()) {
                            Ok(Checkout::Existing(lease)) => {
                                prop_assert_eq!(lease.problem(), &problem);
                                held.push(lease);
                            }
                            Ok(Checkout::Create(slot)) => {
                                let (handle, _) = fake_handle(problem, &live);
                                held.push(slot.commit(Arc::new(handle)).unwrap());
                            }
                            Ok(Checkout::Evict { victim, slot }) => {
                                prop_assert!(held.iter().all(|l| l.id() != victim.id()));
                                victim.terminate(Duration::ZERO).unwrap();
                                drop(victim);
                                let (handle, _) = fake_handle(problem, &live);
                                held.push(slot.commit(Arc::new(handle)).unwrap());
                            }
                            Err(CoqpoolError::CapacityTimeout(_)) => {
                                prop_assert_eq!(held.len(), capacity);
                            }
                            Err(e) => return Err(TestCaseError::fail(e.to_string())),
                        }
                    }
                    Op::Release(i) if !held.is_empty() => {
                        drop(held.swap_remove(i % held.len()));
                    }
                    Op::Retire(i) if !held.is_empty() => {
                        let lease = held.swap_remove(i % held.len());
                        prop_assert!(registry.remove(&lease));
                        lease.terminate(Duration::ZERO).unwrap();
                    }
                    _ => {}
                }

                assert_invariants(&registry);
                let snapshot = registry.snapshot();
                prop_assert_eq!(snapshot.busy, held.len());
                prop_assert_eq!(snapshot.reserved, 0);
                prop_assert_eq!(live.load(Ordering::SeqCst), snapshot.live);
            }
        }
    }
}
