// ==============================================
// SINGLEFLIGHT TESTS (integration)
// ==============================================
//
// Concurrent first calls for one key must run the wrapped function once and
// hand every caller the same outcome. These need real threads released
// together through a Barrier.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use memokit::prelude::*;

const THREADS: usize = 8;

// ==============================================
// Success path
// ==============================================

mod success {
    use super::*;

    #[test]
    fn value_cache_computes_once_under_contention() {
        for _ in 0..20 {
            let runs = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&runs);
            let cache = CacheBuilder::value("slow_square")
                .build_infallible(move |x: &(u64,)| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    vec![x.0 * x.0]
                })
                .unwrap();

            let barrier = Arc::new(Barrier::new(THREADS));
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    let cache = cache.clone();
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        cache.call(&(7,)).unwrap()
                    })
                })
                .collect();

            for handle in handles {
                assert_eq!(handle.join().unwrap(), vec![49]);
            }
            assert_eq!(runs.load(Ordering::SeqCst), 1);
            assert_eq!(cache.len(), 1);
        }
    }

    #[test]
    fn resource_cache_hands_out_one_instance() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let cache = CacheBuilder::resource("pool")
            .build_infallible(move |url: &(String,)| {
                counter.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                format!("pool for {}", url.0)
            })
            .unwrap();

        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let cache = cache.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.call(&("db://main".to_string(),)).unwrap()
                })
            })
            .collect();

        let pools: Vec<Arc<String>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        for pool in &pools[1..] {
            assert!(Arc::ptr_eq(&pools[0], pool));
        }
    }

    #[test]
    fn distinct_keys_compute_in_parallel() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let cache = CacheBuilder::value("per_key")
            .build_infallible(move |x: &(usize,)| {
                counter.fetch_add(1, Ordering::SeqCst);
                x.0 + 1
            })
            .unwrap();

        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let cache = cache.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.call(&(i,)).unwrap()
                })
            })
            .collect();

        let mut results: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        results.sort_unstable();
        assert_eq!(results, (1..=THREADS).collect::<Vec<_>>());
        assert_eq!(runs.load(Ordering::SeqCst), THREADS);
    }
}

// ==============================================
// Failure path
// ==============================================
//
// A failed computation is delivered to every waiter and never cached.

mod failure {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("backend unavailable")]
    struct Unavailable;

    #[test]
    fn every_waiter_sees_the_same_error() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let cache = CacheBuilder::value("flaky")
            .build(move |_: &(u8,)| -> Result<u8, Unavailable> {
                counter.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                Err(Unavailable)
            })
            .unwrap();

        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let cache = cache.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.call(&(1,)).unwrap_err()
                })
            })
            .collect();

        let errors: Vec<CacheError> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let first = errors[0].computation().unwrap();
        assert!(first.downcast_ref::<Unavailable>().is_some());
        for err in &errors[1..] {
            let inner = err.computation().unwrap();
            assert!(Arc::ptr_eq(first.inner(), inner.inner()));
        }
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn failure_is_not_cached() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let cache = CacheBuilder::value("retry")
            .build(move |_: &(u8,)| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err("first call fails")
                } else {
                    Ok(5u8)
                }
            })
            .unwrap();

        assert!(matches!(cache.call(&(1,)), Err(CacheError::Computation(_))));
        assert_eq!(cache.call(&(1,)).unwrap(), 5);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn timeout_leaves_key_uncached() {
        let cache = CacheBuilder::value("slow")
            .config(CacheConfig::default().compute_timeout(Duration::from_millis(20)))
            .build_infallible(|x: &(u8,)| {
                thread::sleep(Duration::from_millis(80));
                x.0
            })
            .unwrap();

        let err = cache.call(&(1,)).unwrap_err();
        assert!(matches!(err, CacheError::TimedOut { .. }));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn panicking_leader_cancels_waiters() {
        let cache = CacheBuilder::value("panics")
            .build_infallible(|x: &(u8,)| -> u8 {
                thread::sleep(Duration::from_millis(40));
                panic!("constructor failed for {}", x.0)
            })
            .unwrap();

        let leader = {
            let cache = cache.clone();
            thread::spawn(move || cache.call(&(1,)))
        };
        thread::sleep(Duration::from_millis(10));
        let waiter = {
            let cache = cache.clone();
            thread::spawn(move || cache.call(&(1,)))
        };

        assert!(leader.join().is_err());
        match waiter.join() {
            Ok(result) => assert!(matches!(result, Err(CacheError::Cancelled { .. }))),
            // The waiter arrived after the flight ended and led its own call.
            Err(_) => {},
        }
        assert_eq!(cache.len(), 0);
    }
}
