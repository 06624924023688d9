//! Integration tests for the session pool.
//!
//! These tests validate:
//! - A session failing its probe is replaced without the pool overshooting
//! - `live` never exceeds `poolSize` under concurrent acquire/release
//! - No session is used more than `handleLifetime` times
//! - Shutdown wakes blocked acquirers

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::FakeFactory;
use prometheus_harvest::core::{PoolError, PoolLimits, ResourcePool};

const WAIT: Duration = Duration::from_millis(200);

fn limits(pool_size: usize, handle_lifetime: u32) -> PoolLimits {
    PoolLimits {
        pool_size,
        handle_lifetime,
    }
}

#[test]
fn test_sick_session_is_replaced_after_failed_probe() {
    let factory = Arc::new(FakeFactory::with_sick_session(3, 2));
    let pool = ResourcePool::new(Arc::clone(&factory), limits(3, 100)).unwrap();
    assert_eq!(pool.warm_up(3).unwrap(), 3);

    let mut used_ids = Vec::new();
    for _ in 0..4 {
        let mut batch = Vec::new();
        for _ in 0..3 {
            let mut handle = pool.acquire(WAIT).unwrap();
            handle.session_mut().uses += 1;
            used_ids.push(handle.session_mut().id);
            batch.push(handle);
        }
        assert!(pool.stats().live <= 3);
        for handle in batch {
            pool.release(handle);
        }
    }

    let stats = pool.stats();
    assert_eq!(stats.probe_failures, 1);
    assert_eq!(stats.created, 4);
    assert_eq!(stats.peak_live, 3);
    assert_eq!(stats.live, 3);
    assert_eq!(used_ids.iter().filter(|id| **id == 3).count(), 2);
    assert!(used_ids.contains(&4));
    assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_live_never_exceeds_pool_size_under_contention() {
    let factory = Arc::new(FakeFactory::new());
    let pool = Arc::new(ResourcePool::new(Arc::clone(&factory), limits(3, 4)).unwrap());
    let checked_out = Arc::new(AtomicUsize::new(0));
    let max_checked_out = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let checked_out = Arc::clone(&checked_out);
            let max_checked_out = Arc::clone(&max_checked_out);
            thread::spawn(move || {
                let mut max_uses = 0;
                for _ in 0..50 {
                    let Ok(mut handle) = pool.acquire(Duration::from_secs(2)) else {
                        continue;
                    };
                    let now = checked_out.fetch_add(1, Ordering::SeqCst) + 1;
                    max_checked_out.fetch_max(now, Ordering::SeqCst);
                    max_uses = max_uses.max(handle.use_count());
                    handle.session_mut().uses += 1;
                    thread::sleep(Duration::from_micros(200));
                    checked_out.fetch_sub(1, Ordering::SeqCst);
                    pool.release(handle);
                }
                max_uses
            })
        })
        .collect();

    let max_uses = handles.into_iter().map(|h| h.join().unwrap()).max().unwrap();

    assert!(max_checked_out.load(Ordering::SeqCst) <= 3);
    assert!(max_uses <= 4, "a session was used {max_uses} times");
    let stats = pool.stats();
    assert!(stats.peak_live <= 3);
    assert!(stats.live <= 3);
    // 400 checkouts at most 4 each.
    assert!(stats.created >= 100);
    assert_eq!(
        stats.created - u64::try_from(stats.live).unwrap(),
        factory.destroyed.load(Ordering::SeqCst)
    );
}

#[test]
fn test_shutdown_releases_blocked_acquirer() {
    let factory = Arc::new(FakeFactory::new());
    let pool = Arc::new(ResourcePool::new(factory, limits(1, 10)).unwrap());
    let held = pool.acquire(WAIT).unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            let start = Instant::now();
            let result = pool.acquire(Duration::from_secs(5));
            (result.map(|_| ()), start.elapsed())
        })
    };
    thread::sleep(Duration::from_millis(50));
    pool.shutdown();
    let (result, waited) = waiter.join().unwrap();

    assert!(matches!(result, Err(PoolError::Shutdown)));
    assert!(waited < Duration::from_secs(5));
    pool.release(held);
    assert_eq!(pool.stats().live, 0);
}
