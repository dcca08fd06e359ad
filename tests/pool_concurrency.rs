/// Connection Pool Concurrency Tests
///
/// Backpressure under contention, concurrent close and long-running stress.
use parking_lot::Mutex;
use rpcpool::{ConnectionPool, PoolOptions, RpcPoolError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

async fn spawn_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

fn assert_sizes_consistent(pool: &ConnectionPool) {
    let stats = pool.stats();
    let capacity = pool.options().capacity;
    assert!(
        stats.idle_conns <= stats.pool_size,
        "idle {} > pool_size {}",
        stats.idle_conns,
        stats.pool_size
    );
    assert!(
        stats.pool_size <= capacity,
        "pool_size {} > capacity {}",
        stats.pool_size,
        capacity
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn checkouts_never_exceed_capacity() {
    let addr = spawn_server().await;
    let pool = ConnectionPool::new(
        PoolOptions::new(&addr)
            .with_capacity(4)
            .with_pool_timeout(Duration::from_secs(5))
            .with_idle_check_interval(None),
    );

    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for _ in 0..32 {
        let pool = pool.clone();
        let in_flight = Arc::clone(&in_flight);
        let peak = Arc::clone(&peak);
        handles.push(tokio::spawn(async move {
            for _ in 0..5 {
                let conn = pool.get().await.unwrap();
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                pool.put(conn).unwrap();
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 4, "peak {}", peak.load(Ordering::SeqCst));
    assert_eq!(pool.available_permits(), 4);

    let stats = pool.stats();
    assert_eq!(stats.hits + stats.misses, 160);
    assert_eq!(stats.timeouts, 0);
    assert!(stats.total_conns <= 4);
    assert_sizes_consistent(&pool);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn checked_out_connections_are_never_shared() {
    let addr = spawn_server().await;
    let pool = ConnectionPool::new(
        PoolOptions::new(&addr)
            .with_capacity(3)
            .with_min_idle(2)
            .with_pool_timeout(Duration::from_secs(5))
            .with_idle_check_interval(None),
    );

    let held: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(HashSet::new()));
    let mut handles = Vec::new();

    for _ in 0..16 {
        let pool = pool.clone();
        let held = Arc::clone(&held);
        handles.push(tokio::spawn(async move {
            for cycle in 0..50 {
                let conn = pool.get().await.unwrap();
                let id = conn.id();
                assert!(held.lock().insert(id), "connection {} handed out twice", id);
                tokio::task::yield_now().await;
                assert!(held.lock().remove(&id));
                // Mix in discards so replenishment races with checkouts.
                if cycle % 7 == 0 {
                    pool.remove(conn, "recycled");
                } else {
                    pool.put(conn).unwrap();
                }
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert!(held.lock().is_empty());
    assert_eq!(pool.available_permits(), 3);
    let stats = pool.stats();
    assert_eq!(stats.hits + stats.misses, 800);
    assert_eq!(stats.timeouts, 0);
    assert_sizes_consistent(&pool);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backpressure_times_out_excess_callers() {
    let addr = spawn_server().await;
    let pool = ConnectionPool::new(
        PoolOptions::new(&addr)
            .with_capacity(2)
            .with_pool_timeout(Duration::from_millis(100))
            .with_idle_check_interval(None),
    );

    let a = pool.get().await.unwrap();
    let b = pool.get().await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move { pool.get().await.map(|_| ()) }));
    }

    for handle in handles {
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(RpcPoolError::Timeout(_))));
    }

    assert_eq!(pool.stats().timeouts, 8);
    pool.put(a).unwrap();
    pool.put(b).unwrap();
    assert_eq!(pool.stats().idle_conns, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_close_succeeds_once() {
    let addr = spawn_server().await;
    let pool = ConnectionPool::new(
        PoolOptions::new(&addr)
            .with_capacity(4)
            .with_idle_check_interval(None),
    );

    for _ in 0..3 {
        let conn = pool.get().await.unwrap();
        pool.put(conn).unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move { pool.close().await }));
    }

    let mut first = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Err(RpcPoolError::Closed) => {}
            _ => first += 1,
        }
    }

    assert_eq!(first, 1);
    assert_eq!(pool.stats().total_conns, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_during_checkouts_settles_cleanly() {
    let addr = spawn_server().await;
    let pool = ConnectionPool::new(
        PoolOptions::new(&addr)
            .with_capacity(4)
            .with_pool_timeout(Duration::from_secs(5))
            .with_idle_check_interval(None),
    );

    let mut handles = Vec::new();
    for _ in 0..16 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            loop {
                match pool.get().await {
                    Ok(conn) => {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        if pool.put(conn).is_err() {
                            return;
                        }
                    }
                    Err(RpcPoolError::Closed) => return,
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }
        }));
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.close().await.ok();

    for handle in handles {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker did not observe close")
            .unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.total_conns, 0);
    assert_eq!(stats.idle_conns, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore] // Stress test - run with --ignored
async fn stress_many_cycles_with_min_idle() {
    let addr = spawn_server().await;
    let pool = ConnectionPool::new(
        PoolOptions::new(&addr)
            .with_capacity(16)
            .with_min_idle(4)
            .with_idle_timeout(Some(Duration::from_millis(20)))
            .with_idle_check_interval(Some(Duration::from_millis(10)))
            .with_pool_timeout(Duration::from_secs(5)),
    );

    let start = Instant::now();
    let mut handles = Vec::new();
    for worker in 0..64 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..200 {
                let conn = pool.get().await.unwrap();
                if (worker + i) % 17 == 0 {
                    pool.remove(conn, "simulated protocol error");
                } else {
                    pool.put(conn).unwrap();
                }
                if i % 50 == 0 {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    let stats = pool.stats();
    println!("Stress run finished in {:?}: {:?}", start.elapsed(), stats);
    assert_eq!(stats.hits + stats.misses, 64 * 200);
    assert_eq!(pool.available_permits(), 16);
    assert_sizes_consistent(&pool);

    pool.close().await.ok();
}
