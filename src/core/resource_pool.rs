//! Bounded pool of stateful render sessions.
//!
//! Sessions are expensive (each one is a browser), so the pool keeps at most
//! `pool_size` of them alive, hands idle ones out after a cheap health probe,
//! and retires them once they have served `handle_lifetime` jobs.
//!
//! Uses a single `parking_lot::Mutex` around the free list and live count,
//! and a `parking_lot::Condvar` to wake waiters whenever a session is
//! returned or a slot is freed. Factory calls never run under the lock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::core::{EngineError, PoolError, SessionFactory};
use crate::util::clock::now_ms;

/// Capacity and lifetime limits for a pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    /// Maximum concurrently live sessions (idle + checked out).
    pub pool_size: usize,
    /// Jobs a session may serve before it is retired on release.
    pub handle_lifetime: u32,
}

impl PoolLimits {
    /// Validate limit values.
    ///
    /// # Errors
    ///
    /// Returns a message naming the offending field.
    pub fn validate(&self) -> Result<(), String> {
        if self.pool_size == 0 {
            return Err("pool_size must be greater than 0".into());
        }
        if self.handle_lifetime == 0 {
            return Err("handle_lifetime must be greater than 0".into());
        }
        Ok(())
    }
}

/// A session checked out of the pool.
///
/// Owned by exactly one worker at a time; give it back with
/// [`ResourcePool::release`] or [`ResourcePool::retire`].
#[derive(Debug)]
pub struct PooledHandle<S> {
    id: u64,
    created_at_ms: u128,
    use_count: u32,
    healthy: bool,
    session: S,
}

impl<S> PooledHandle<S> {
    /// Pool-unique identifier, starting at 1.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Creation time in milliseconds since epoch.
    #[must_use]
    pub const fn created_at_ms(&self) -> u128 {
        self.created_at_ms
    }

    /// Number of checkouts including the current one.
    #[must_use]
    pub const fn use_count(&self) -> u32 {
        self.use_count
    }

    /// Result of the last health probe.
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Mutable access to the wrapped session.
    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Sessions alive right now (idle + checked out).
    pub live: usize,
    /// Sessions sitting in the free list.
    pub idle: usize,
    /// Highest `live` value ever observed.
    pub peak_live: usize,
    /// Sessions created over the pool's lifetime.
    pub created: u64,
    /// Sessions destroyed for any reason.
    pub retired: u64,
    /// Sessions destroyed because their health probe failed.
    pub probe_failures: u64,
    /// Acquires that gave up with [`PoolError::Busy`].
    pub busy_timeouts: u64,
}

struct PoolState<S> {
    idle: VecDeque<PooledHandle<S>>,
    live: usize,
    shutdown: bool,
}

#[derive(Default)]
struct PoolCounters {
    created: AtomicU64,
    retired: AtomicU64,
    probe_failures: AtomicU64,
    busy_timeouts: AtomicU64,
    peak_live: AtomicUsize,
}

/// Bounded session pool with health probing and lifetime retirement.
pub struct ResourcePool<F: SessionFactory> {
    factory: Arc<F>,
    limits: PoolLimits,
    state: Mutex<PoolState<F::Session>>,
    /// Signaled when a session is returned or a slot frees up.
    available: Condvar,
    next_id: AtomicU64,
    counters: PoolCounters,
}

impl<F: SessionFactory> ResourcePool<F> {
    /// Create an empty pool. Sessions are created lazily or via [`Self::warm_up`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] if the limits are invalid.
    pub fn new(factory: Arc<F>, limits: PoolLimits) -> Result<Self, EngineError> {
        limits.validate().map_err(EngineError::InvalidConfig)?;
        Ok(Self {
            factory,
            limits,
            state: Mutex::new(PoolState {
                idle: VecDeque::with_capacity(limits.pool_size),
                live: 0,
                shutdown: false,
            }),
            available: Condvar::new(),
            next_id: AtomicU64::new(1),
            counters: PoolCounters::default(),
        })
    }

    /// Configured limits.
    #[must_use]
    pub const fn limits(&self) -> PoolLimits {
        self.limits
    }

    /// Pre-create up to `count` idle sessions.
    ///
    /// Returns how many were created.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoHandles`] when `count > 0` and not a single
    /// session could be created; that is the one engine-fatal condition.
    pub fn warm_up(&self, count: usize) -> Result<usize, EngineError> {
        let target = count.min(self.limits.pool_size);
        let mut created = 0;
        let mut last_err = String::new();
        for _ in 0..target {
            if !self.reserve_slot() {
                break;
            }
            match self.spawn_handle() {
                Ok(handle) => {
                    self.state.lock().idle.push_back(handle);
                    self.available.notify_one();
                    created += 1;
                }
                Err(e) => {
                    self.free_slot();
                    tracing::warn!(error = %e, "warm-up session creation failed");
                    last_err = e;
                }
            }
        }
        if target > 0 && created == 0 {
            return Err(EngineError::NoHandles(last_err));
        }
        tracing::info!(created, pool_size = self.limits.pool_size, "session pool warmed up");
        Ok(created)
    }

    /// Check out a session, waiting up to `timeout` for one to free up.
    ///
    /// Idle sessions are probed first; a failed probe destroys the session,
    /// frees its slot, and the loop tries again (usually creating a
    /// replacement straight away).
    ///
    /// # Errors
    ///
    /// - [`PoolError::Busy`] when nothing became available in time
    /// - [`PoolError::Shutdown`] once [`Self::shutdown`] has run
    /// - [`PoolError::Create`] when a new session could not be launched
    pub fn acquire(&self, timeout: Duration) -> Result<PooledHandle<F::Session>, PoolError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return Err(PoolError::Shutdown);
            }

            if let Some(mut handle) = state.idle.pop_front() {
                drop(state);
                if self.factory.probe(&mut handle.session) {
                    handle.healthy = true;
                    handle.use_count += 1;
                    tracing::debug!(handle_id = handle.id, uses = handle.use_count, "session checked out");
                    return Ok(handle);
                }
                handle.healthy = false;
                self.counters.probe_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(handle_id = handle.id, "session failed health probe, replacing");
                self.destroy(handle);
                state = self.state.lock();
                continue;
            }

            if state.live < self.limits.pool_size {
                state.live += 1;
                self.counters.peak_live.fetch_max(state.live, Ordering::Relaxed);
                drop(state);
                return match self.spawn_handle() {
                    Ok(mut handle) => {
                        handle.use_count = 1;
                        Ok(handle)
                    }
                    Err(e) => {
                        self.free_slot();
                        Err(PoolError::Create(e))
                    }
                };
            }

            if Instant::now() >= deadline {
                self.counters.busy_timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(PoolError::Busy);
            }
            // Spurious wakeups and timeouts both fall through to a re-check.
            let _ = self.available.wait_until(&mut state, deadline);
        }
    }

    /// Return a session after a job.
    ///
    /// Sessions at their lifetime ceiling, or whose reset hook fails, are
    /// retired instead of going back to the free list.
    pub fn release(&self, mut handle: PooledHandle<F::Session>) {
        if handle.use_count >= self.limits.handle_lifetime {
            tracing::debug!(handle_id = handle.id, uses = handle.use_count, "session reached lifetime, retiring");
            self.destroy(handle);
            return;
        }
        if !self.factory.reset(&mut handle.session) {
            tracing::warn!(handle_id = handle.id, "session reset failed, retiring");
            self.destroy(handle);
            return;
        }
        let mut state = self.state.lock();
        if state.shutdown {
            drop(state);
            self.destroy(handle);
            return;
        }
        state.idle.push_back(handle);
        drop(state);
        self.available.notify_one();
    }

    /// Destroy a session a worker no longer trusts and free its slot.
    ///
    /// Consumes the handle, so retiring the same session twice cannot happen.
    pub fn retire(&self, handle: PooledHandle<F::Session>) {
        tracing::info!(handle_id = handle.id, uses = handle.use_count, "session retired by worker");
        self.destroy(handle);
    }

    /// Destroy every idle session and refuse further acquires.
    ///
    /// Sessions still checked out are destroyed when they are released.
    pub fn shutdown(&self) {
        let drained: Vec<_> = {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.idle.drain(..).collect()
        };
        let count = drained.len();
        for handle in drained {
            self.destroy(handle);
        }
        self.available.notify_all();
        tracing::info!(
            destroyed = count,
            created = self.counters.created.load(Ordering::Relaxed),
            "session pool shut down"
        );
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            live: state.live,
            idle: state.idle.len(),
            peak_live: self.counters.peak_live.load(Ordering::Relaxed),
            created: self.counters.created.load(Ordering::Relaxed),
            retired: self.counters.retired.load(Ordering::Relaxed),
            probe_failures: self.counters.probe_failures.load(Ordering::Relaxed),
            busy_timeouts: self.counters.busy_timeouts.load(Ordering::Relaxed),
        }
    }

    fn reserve_slot(&self) -> bool {
        let mut state = self.state.lock();
        if state.shutdown || state.live >= self.limits.pool_size {
            return false;
        }
        state.live += 1;
        self.counters.peak_live.fetch_max(state.live, Ordering::Relaxed);
        true
    }

    fn free_slot(&self) {
        let mut state = self.state.lock();
        state.live = state.live.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }

    /// Launch a session for an already-reserved slot.
    fn spawn_handle(&self) -> Result<PooledHandle<F::Session>, String> {
        let session = self.factory.create()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        tracing::info!(handle_id = id, "created render session");
        Ok(PooledHandle {
            id,
            created_at_ms: now_ms(),
            use_count: 0,
            healthy: true,
            session,
        })
    }

    fn destroy(&self, handle: PooledHandle<F::Session>) {
        self.factory.destroy(handle.session);
        self.counters.retired.fetch_add(1, Ordering::Relaxed);
        self.free_slot();
    }
}

impl<F: SessionFactory> Drop for ResourcePool<F> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[derive(Default)]
    struct FakeFactory {
        created: AtomicU64,
        destroyed: AtomicU64,
        fail_create: AtomicBool,
        fail_probe: AtomicBool,
    }

    impl SessionFactory for FakeFactory {
        type Session = u64;

        fn create(&self) -> Result<u64, String> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err("no browser".into());
            }
            Ok(self.created.fetch_add(1, Ordering::SeqCst) + 1)
        }

        fn probe(&self, _session: &mut u64) -> bool {
            !self.fail_probe.load(Ordering::SeqCst)
        }

        fn destroy(&self, _session: u64) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(size: usize, lifetime: u32) -> (Arc<FakeFactory>, ResourcePool<FakeFactory>) {
        let factory = Arc::new(FakeFactory::default());
        let pool = ResourcePool::new(
            Arc::clone(&factory),
            PoolLimits {
                pool_size: size,
                handle_lifetime: lifetime,
            },
        )
        .unwrap();
        (factory, pool)
    }

    #[test]
    fn test_reuses_idle_session() {
        let (factory, pool) = pool(2, 10);
        let h = pool.acquire(Duration::from_millis(10)).unwrap();
        let id = h.id();
        pool.release(h);
        let h = pool.acquire(Duration::from_millis(10)).unwrap();
        assert_eq!(h.id(), id);
        assert_eq!(h.use_count(), 2);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_busy_when_exhausted() {
        let (_factory, pool) = pool(1, 10);
        let _held = pool.acquire(Duration::from_millis(10)).unwrap();
        let start = Instant::now();
        let err = pool.acquire(Duration::from_millis(30)).unwrap_err();
        assert_eq!(err, PoolError::Busy);
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(pool.stats().busy_timeouts, 1);
    }

    #[test]
    fn test_waiter_woken_by_release() {
        let (_factory, pool) = pool(1, 10);
        let pool = Arc::new(pool);
        let held = pool.acquire(Duration::from_millis(10)).unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire(Duration::from_secs(5)).map(|h| h.id()))
        };
        thread::sleep(Duration::from_millis(20));
        let id = held.id();
        pool.release(held);
        assert_eq!(waiter.join().unwrap().unwrap(), id);
    }

    #[test]
    fn test_lifetime_retirement() {
        let (factory, pool) = pool(1, 2);
        let h = pool.acquire(Duration::from_millis(10)).unwrap();
        pool.release(h);
        let h = pool.acquire(Duration::from_millis(10)).unwrap();
        assert_eq!(h.use_count(), 2);
        pool.release(h);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().live, 0);

        let h = pool.acquire(Duration::from_millis(10)).unwrap();
        assert_eq!(h.use_count(), 1);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_probe_failure_frees_slot() {
        let (factory, pool) = pool(1, 10);
        let h = pool.acquire(Duration::from_millis(10)).unwrap();
        pool.release(h);
        factory.fail_probe.store(true, Ordering::SeqCst);
        // The idle session fails its probe, a fresh one is created in the same call.
        let h = pool.acquire(Duration::from_millis(10)).unwrap();
        assert_eq!(h.id(), 2);
        let stats = pool.stats();
        assert_eq!(stats.probe_failures, 1);
        assert_eq!(stats.live, 1);
        assert!(stats.peak_live <= 1);
    }

    #[test]
    fn test_retire_frees_slot() {
        let (factory, pool) = pool(1, 10);
        let h = pool.acquire(Duration::from_millis(10)).unwrap();
        pool.retire(h);
        assert_eq!(pool.stats().live, 0);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        assert!(pool.acquire(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_warm_up_fails_without_any_session() {
        let (factory, pool) = pool(3, 10);
        factory.fail_create.store(true, Ordering::SeqCst);
        assert!(matches!(pool.warm_up(2), Err(EngineError::NoHandles(_))));
        assert_eq!(pool.stats().live, 0);
    }

    #[test]
    fn test_shutdown_destroys_idle_and_late_releases() {
        let (factory, pool) = pool(2, 10);
        assert_eq!(pool.warm_up(1).unwrap(), 1);
        let a = pool.acquire(Duration::from_millis(10)).unwrap();
        let b = pool.acquire(Duration::from_millis(10)).unwrap();
        pool.release(a);
        pool.shutdown();
        assert_eq!(pool.acquire(Duration::from_millis(10)).unwrap_err(), PoolError::Shutdown);
        pool.release(b);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().live, 0);
    }
}
