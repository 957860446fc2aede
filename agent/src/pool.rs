//! Bounded pool of activation engine handles.
//!
//! Handles are tied to the identity that was live when they were created. The
//! pool tracks this with a generation counter: [`HandlePool::invalidate_all`]
//! bumps it, and any handle from an older generation is destroyed instead of
//! being handed out again, including handles that were still being created or
//! were checked out at the time.

use std::{
    collections::VecDeque,
    ops::{Deref, DerefMut},
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, info};

use crate::engines::{ActivationHandle, ActivationService, EngineError};

pub const DEFAULT_POOL_SIZE: usize = 2;
pub const DEFAULT_RELEASE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Handle pool is shut down")]
    Closed,

    #[error("Failed to create activation handle: {0}")]
    Create(#[source] EngineError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of idle handles kept around.
    pub size: usize,

    /// How long a release waits for room in the idle set before destroying
    /// the handle.
    pub release_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
            release_timeout: DEFAULT_RELEASE_TIMEOUT,
        }
    }
}

struct Slot {
    handle: Box<dyn ActivationHandle>,
    generation: u64,
    serial: u64,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<Slot>,
    generation: u64,
    /// Checked-out (or being created) handles of the current generation.
    outstanding: usize,
    next_serial: u64,
    closed: bool,
}

pub struct HandlePool {
    service: Arc<dyn ActivationService>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    changed: Condvar,
}

impl HandlePool {
    pub fn new(service: Arc<dyn ActivationService>, config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            service,
            config: PoolConfig {
                size: config.size.max(1),
                ..config
            },
            state: Mutex::new(PoolState::default()),
            changed: Condvar::new(),
        })
    }

    pub fn config(&self) -> PoolConfig {
        self.config
    }

    /// Check out a handle.
    ///
    /// An idle handle is returned right away. With none idle, the caller waits
    /// up to `timeout` for one to be released, but only while `size` handles
    /// are checked out; otherwise, or once the timeout passes, a fresh handle
    /// is created.
    pub fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<PooledHandle, PoolError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        loop {
            if state.closed {
                return Err(PoolError::Closed);
            }

            if let Some(slot) = state.idle.pop_front() {
                state.outstanding += 1;
                debug!(serial = slot.serial, "reusing idle handle");
                return Ok(self.guard(slot));
            }

            if state.outstanding < self.config.size {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(?timeout, "no handle released in time, creating one");
                break;
            }

            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|err| err.into_inner().0);
        }

        loop {
            let generation = state.generation;
            state.outstanding += 1;
            drop(state);

            let created = self.service.create_handle();

            state = self.lock();
            let handle = match created {
                Ok(handle) => handle,
                Err(e) => {
                    if state.generation == generation {
                        state.outstanding = state.outstanding.saturating_sub(1);
                    }
                    drop(state);
                    self.changed.notify_all();
                    return Err(PoolError::Create(e));
                }
            };

            if state.closed {
                drop(state);
                handle.release();
                return Err(PoolError::Closed);
            }

            if state.generation != generation {
                // The live identity changed while this handle was loading.
                drop(state);
                debug!("discarding handle created under a stale identity");
                handle.release();
                state = self.lock();
                continue;
            }

            let serial = state.next_serial;
            state.next_serial += 1;
            if serial == 0 {
                info!("activation handle pool initialized");
            }
            debug!(serial, generation, "created handle");

            return Ok(self.guard(Slot {
                handle,
                generation,
                serial,
            }));
        }
    }

    /// Destroy every idle handle and mark every checked-out one as stale.
    /// Returns how many idle handles were destroyed.
    pub fn invalidate_all(&self) -> usize {
        let mut state = self.lock();
        state.generation += 1;
        let stale: Vec<Slot> = state.idle.drain(..).collect();
        let outstanding = std::mem::take(&mut state.outstanding);
        let generation = state.generation;
        drop(state);
        self.changed.notify_all();

        debug!(
            destroyed = stale.len(),
            outstanding,
            generation,
            "invalidated handle pool"
        );
        let destroyed = stale.len();
        for slot in stale {
            slot.handle.release();
        }
        destroyed
    }

    /// Destroy every idle handle and refuse further acquires. Handles still
    /// checked out are destroyed when they come back. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        let first = !state.closed;
        state.closed = true;
        state.generation += 1;
        state.outstanding = 0;
        let idle: Vec<Slot> = state.idle.drain(..).collect();
        drop(state);
        self.changed.notify_all();

        if first {
            info!(destroyed = idle.len(), "shutting down handle pool");
        }
        for slot in idle {
            slot.handle.release();
        }
    }

    pub fn idle_count(&self) -> usize {
        self.lock().idle.len()
    }

    pub fn outstanding_count(&self) -> usize {
        self.lock().outstanding
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn release(&self, slot: Slot) {
        let mut state = self.lock();

        if state.closed || slot.generation != state.generation {
            drop(state);
            debug!(serial = slot.serial, "destroying stale handle");
            slot.handle.release();
            return;
        }

        state.outstanding = state.outstanding.saturating_sub(1);
        self.changed.notify_all();

        let deadline = Instant::now() + self.config.release_timeout;
        while state.idle.len() >= self.config.size
            && !state.closed
            && state.generation == slot.generation
        {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|err| err.into_inner().0);
        }

        if state.idle.len() < self.config.size
            && !state.closed
            && state.generation == slot.generation
        {
            state.idle.push_back(slot);
            drop(state);
            self.changed.notify_all();
            return;
        }

        drop(state);
        debug!(serial = slot.serial, "idle set full, destroying handle");
        slot.handle.release();
    }

    fn guard(self: &Arc<Self>, slot: Slot) -> PooledHandle {
        PooledHandle {
            pool: Arc::clone(self),
            slot: Some(slot),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }
}

impl Drop for HandlePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A checked-out handle. Goes back to its pool when dropped, whichever way
/// the holder's scope ends.
pub struct PooledHandle {
    pool: Arc<HandlePool>,
    slot: Option<Slot>,
}

impl PooledHandle {
    /// Pool-unique number of the underlying handle.
    pub fn serial(&self) -> u64 {
        self.slot().serial
    }

    pub fn generation(&self) -> u64 {
        self.slot().generation
    }

    /// Return the handle to the pool now.
    pub fn release(self) {}

    fn slot(&self) -> &Slot {
        self.slot.as_ref().expect("slot is present until drop")
    }
}

impl Deref for PooledHandle {
    type Target = dyn ActivationHandle;

    fn deref(&self) -> &Self::Target {
        &*self.slot().handle
    }
}

impl DerefMut for PooledHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self
            .slot
            .as_mut()
            .expect("slot is present until drop")
            .handle
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.release(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc,
        },
        thread,
    };

    use super::*;
    use crate::engines::ActivationReply;

    #[derive(Default)]
    struct Counters {
        created: AtomicUsize,
        released: AtomicUsize,
    }

    struct FakeHandle(Arc<Counters>);

    impl ActivationHandle for FakeHandle {
        fn activate(&mut self, _: &str, _: &str) -> Result<ActivationReply, EngineError> {
            Ok(ActivationReply {
                status: 1,
                message: "ok".into(),
            })
        }

        fn version(&mut self) -> Result<String, EngineError> {
            Ok("1.0".into())
        }

        fn machine_code(&mut self) -> Result<String, EngineError> {
            Ok("MC".into())
        }

        fn cursor_position(&mut self) -> Result<(i32, i32), EngineError> {
            Ok((0, 0))
        }

        fn release(self: Box<Self>) {
            self.0.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeService {
        counters: Arc<Counters>,
        fail: bool,
        /// When set, the first creation reports that it started and then
        /// blocks until told to finish.
        gate: Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>,
    }

    impl ActivationService for FakeService {
        fn create_handle(&self) -> Result<Box<dyn ActivationHandle>, EngineError> {
            if self.fail {
                return Err(EngineError::Unavailable("engine not loaded".into()));
            }
            if let Some((started, finish)) = self.gate.lock().unwrap().take() {
                started.send(()).unwrap();
                finish.recv().unwrap();
            }
            self.counters.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeHandle(self.counters.clone())))
        }
    }

    fn pool_with(service: FakeService, size: usize) -> (Arc<HandlePool>, Arc<Counters>) {
        let counters = service.counters.clone();
        let pool = HandlePool::new(
            Arc::new(service),
            PoolConfig {
                size,
                release_timeout: Duration::from_millis(10),
            },
        );
        (pool, counters)
    }

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn test_released_handle_is_reused() {
        let (pool, counters) = pool_with(FakeService::default(), 2);

        let first = pool.acquire(SHORT).unwrap();
        let serial = first.serial();
        first.release();
        assert_eq!(pool.idle_count(), 1);

        let second = pool.acquire(SHORT).unwrap();
        assert_eq!(second.serial(), serial);
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handle_is_usable_through_guard() {
        let (pool, _) = pool_with(FakeService::default(), 1);
        let mut handle = pool.acquire(SHORT).unwrap();

        assert!(handle.activate("LIC", "").unwrap().is_success());
        assert_eq!(handle.machine_code().unwrap(), "MC");
    }

    #[test]
    fn test_idle_set_never_exceeds_pool_size() {
        let (pool, counters) = pool_with(FakeService::default(), 2);

        let handles: Vec<_> = (0..4).map(|_| pool.acquire(SHORT).unwrap()).collect();
        assert_eq!(counters.created.load(Ordering::SeqCst), 4);
        assert_eq!(pool.outstanding_count(), 4);

        drop(handles);
        assert_eq!(pool.outstanding_count(), 0);
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(counters.released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_exhausted_pool_falls_back_to_creation() {
        let (pool, counters) = pool_with(FakeService::default(), 1);
        let held = pool.acquire(SHORT).unwrap();

        let started = Instant::now();
        let extra = pool.acquire(SHORT).unwrap();

        assert!(started.elapsed() >= SHORT);
        assert_ne!(extra.serial(), held.serial());
        assert_eq!(counters.created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_waiter_gets_released_handle() {
        let (pool, counters) = pool_with(FakeService::default(), 1);
        let held = pool.acquire(SHORT).unwrap();
        let serial = held.serial();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire(Duration::from_secs(5)).unwrap().serial())
        };

        thread::sleep(Duration::from_millis(50));
        held.release();

        assert_eq!(waiter.join().unwrap(), serial);
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalidate_destroys_idle_handles() {
        let (pool, counters) = pool_with(FakeService::default(), 2);
        let first = pool.acquire(SHORT).unwrap();
        let stale_serial = first.serial();
        first.release();
        assert_eq!(pool.idle_count(), 1);

        assert_eq!(pool.invalidate_all(), 1);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(counters.released.load(Ordering::SeqCst), 1);

        let fresh = pool.acquire(SHORT).unwrap();
        assert_ne!(fresh.serial(), stale_serial);
        assert_eq!(counters.created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_outstanding_handle_is_destroyed_after_invalidate() {
        let (pool, counters) = pool_with(FakeService::default(), 2);
        let held = pool.acquire(SHORT).unwrap();

        pool.invalidate_all();
        held.release();

        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.outstanding_count(), 0);
        assert_eq!(counters.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handle_created_during_invalidate_is_discarded() {
        let (started_tx, started_rx) = mpsc::channel();
        let (finish_tx, finish_rx) = mpsc::channel();
        let service = FakeService {
            gate: Mutex::new(Some((started_tx, finish_rx))),
            ..Default::default()
        };
        let (pool, counters) = pool_with(service, 2);

        let acquirer = {
            let pool = pool.clone();
            thread::spawn(move || {
                let handle = pool.acquire(SHORT).unwrap();
                (handle.serial(), handle.generation())
            })
        };

        started_rx.recv().unwrap();
        pool.invalidate_all();
        finish_tx.send(()).unwrap();

        let (serial, generation) = acquirer.join().unwrap();
        assert_eq!(generation, pool.generation());
        assert_eq!(serial, 0);
        // One handle discarded at insert time, one handed out.
        assert_eq!(counters.created.load(Ordering::SeqCst), 2);
        assert!(counters.released.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_creation_failure_is_reported() {
        let service = FakeService {
            fail: true,
            ..Default::default()
        };
        let (pool, _) = pool_with(service, 2);

        let err = pool.acquire(SHORT).err().unwrap();
        assert!(matches!(err, PoolError::Create(EngineError::Unavailable(_))));
        assert_eq!(pool.outstanding_count(), 0);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (pool, counters) = pool_with(FakeService::default(), 2);
        pool.acquire(SHORT).unwrap().release();
        let held = pool.acquire(SHORT).unwrap();
        let other = pool.acquire(SHORT).unwrap();
        other.release();

        pool.shutdown();
        pool.shutdown();
        assert!(pool.is_closed());
        assert!(matches!(pool.acquire(SHORT), Err(PoolError::Closed)));

        held.release();
        assert_eq!(
            counters.released.load(Ordering::SeqCst),
            counters.created.load(Ordering::SeqCst)
        );
    }
}
