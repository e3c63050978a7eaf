//! Integration tests for component lifecycles.
//!
//! Every component must tolerate a second `close`, reject new work after
//! the first, and release its threads and connections exactly once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use vigil_concurrency::batch::BatchProcessor;
use vigil_concurrency::pipeline::Pipeline;
use vigil_concurrency::pool::{ConnectionPool, Pool, WorkerPool};
use vigil_concurrency::sync::CancellationToken;
use vigil_core::config::{BatchConfig, ConnectionPoolConfig, PipelineConfig, WorkerPoolConfig};
use vigil_core::error::{BatchError, BoxError, PipelineError, PoolError, WorkerError};
use vigil_core::traits::Connection;

struct CountedConn {
    closes: Arc<AtomicUsize>,
}

impl Connection for CountedConn {
    fn close(&mut self) -> Result<(), BoxError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_connection_pool_scenario() {
    let closes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closes);
    let pool = ConnectionPool::new(
        ConnectionPoolConfig {
            min_size: 1,
            max_size: 2,
            ..Default::default()
        },
        move || -> Result<CountedConn, BoxError> {
            Ok(CountedConn {
                closes: Arc::clone(&counter),
            })
        },
    )
    .unwrap();

    let first = pool.get().unwrap();
    let second = pool.get().unwrap();
    assert_eq!(pool.in_use(), 2);

    assert!(matches!(
        pool.get(),
        Err(PoolError::Exhausted { max_size: 2 })
    ));

    pool.put(first);
    assert_eq!(pool.in_use(), 1);

    let fourth = pool.get().unwrap();
    assert_eq!(pool.in_use(), 2);

    drop(second);
    drop(fourth);
    pool.close();
    pool.close();
    assert_eq!(closes.load(Ordering::SeqCst), 2);
}

#[test]
fn test_object_pool_close_twice() {
    let pool = Pool::<Vec<u8>>::vec_pool(32);
    pool.put(pool.get());
    pool.close();
    pool.close();
    assert_eq!(pool.available_count(), 0);
    assert!(pool.get().is_empty());
}

#[test]
fn test_worker_pool_close_twice() {
    let pool: WorkerPool<u32, String> = WorkerPool::new(WorkerPoolConfig {
        workers: 2,
        ..Default::default()
    })
    .unwrap();
    pool.submit(|_| Ok(1)).unwrap();
    assert_eq!(
        pool.results().recv_timeout(Duration::from_secs(5)).unwrap(),
        1
    );

    pool.close();
    pool.close();
    assert!(pool.is_closed());
    assert!(matches!(pool.submit(|_| Ok(2)), Err(WorkerError::Closed)));
    assert!(pool.results().recv().is_err());
}

#[test]
fn test_pipeline_close_twice() {
    let pipeline = Pipeline::new(PipelineConfig::default(), |_, x: u32| Ok::<_, ()>(x)).unwrap();
    pipeline.close();
    pipeline.close();
    assert!(matches!(pipeline.submit(1), Err(PipelineError::Closed)));
    assert!(pipeline.errors().recv().is_err());
}

#[test]
fn test_batch_processor_close_twice() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let processor = BatchProcessor::new(BatchConfig::default(), move |_, items: Vec<u32>| {
        counter.fetch_add(1, Ordering::SeqCst);
        items.into_iter().map(Ok).collect()
    });

    let ctx = CancellationToken::new();
    let promise = processor.process(&ctx, 5).unwrap();
    assert!(processor.close_and_wait(Duration::from_secs(5)));
    assert!(processor.close_and_wait(Duration::from_secs(5)));

    assert_eq!(promise.wait().unwrap(), 5);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        processor.process(&ctx, 6),
        Err(BatchError::ProcessorClosed)
    ));
}

#[test]
fn test_dropping_components_releases_resources() {
    let closes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closes);
    let pool = ConnectionPool::new(
        ConnectionPoolConfig {
            min_size: 3,
            max_size: 3,
            ..Default::default()
        },
        move || -> Result<CountedConn, BoxError> {
            Ok(CountedConn {
                closes: Arc::clone(&counter),
            })
        },
    )
    .unwrap();
    assert_eq!(pool.idle(), 3);
    drop(pool);
    assert_eq!(closes.load(Ordering::SeqCst), 3);

    let processor = BatchProcessor::new(BatchConfig::default(), |_, items: Vec<u32>| {
        items.into_iter().map(Ok).collect()
    });
    let promise = processor.process(&CancellationToken::new(), 1).unwrap();
    drop(processor);
    // Dropping closes, which still flushes the open batch
    assert_eq!(promise.wait_timeout(Duration::from_secs(5)).unwrap(), 1);
}
