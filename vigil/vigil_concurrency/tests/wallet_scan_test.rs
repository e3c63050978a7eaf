//! End-to-end composition: a pipeline of wallet addresses whose transform
//! asks a batch processor for balances, which in turn queries a fake RPC
//! node through a connection pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use vigil_concurrency::batch::BatchProcessor;
use vigil_concurrency::pipeline::Pipeline;
use vigil_concurrency::pool::ConnectionPool;
use vigil_concurrency::sync::CancellationToken;
use vigil_core::config::{BatchConfig, ConnectionPoolConfig, PipelineConfig, VigilConfig};
use vigil_core::error::{BatchError, BoxError};
use vigil_core::traits::Connection;

const WAIT: Duration = Duration::from_secs(5);

/// Fake RPC node client answering batched balance queries.
struct RpcClient {
    ledger: Arc<HashMap<String, u64>>,
    calls: Arc<AtomicUsize>,
}

impl RpcClient {
    fn balances(&self, addresses: &[String]) -> Vec<Result<u64, BoxError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        addresses
            .iter()
            .map(|address| {
                self.ledger
                    .get(address)
                    .copied()
                    .ok_or_else(|| -> BoxError {
                        format!("unknown address {}", address).into()
                    })
            })
            .collect()
    }
}

impl Connection for RpcClient {
    fn close(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}

fn ledger() -> Arc<HashMap<String, u64>> {
    Arc::new(
        (0..20)
            .map(|i| (format!("0x{:04x}", i), i * 100))
            .collect(),
    )
}

fn config() -> VigilConfig {
    VigilConfig::from_toml_str(
        r#"
        [pipeline]
        workers = 4
        input_buffer = 8

        [batch]
        max_batch_size = 5
        max_wait_time_ms = 20

        [connection_pool]
        min_size = 1
        max_size = 2
        "#,
    )
    .unwrap()
}

type Balances = BatchProcessor<String, u64>;

fn balance_processor(
    config: BatchConfig,
    pool: Arc<ConnectionPool<RpcClient>>,
) -> Arc<Balances> {
    Arc::new(BatchProcessor::new(
        config,
        move |_token, addresses: Vec<String>| match pool.get_timeout(WAIT) {
            Ok(client) => client.balances(&addresses),
            Err(e) => {
                let message = e.to_string();
                addresses
                    .iter()
                    .map(|_| Err(message.clone().into()))
                    .collect()
            }
        },
    ))
}

fn rpc_pool(
    config: ConnectionPoolConfig,
    ledger: Arc<HashMap<String, u64>>,
    calls: Arc<AtomicUsize>,
) -> Arc<ConnectionPool<RpcClient>> {
    Arc::new(
        ConnectionPool::new(config, move || -> Result<RpcClient, BoxError> {
            Ok(RpcClient {
                ledger: Arc::clone(&ledger),
                calls: Arc::clone(&calls),
            })
        })
        .unwrap(),
    )
}

#[test]
fn test_scan_wallets_through_pipeline() {
    let config = config();
    let calls = Arc::new(AtomicUsize::new(0));
    let pool = rpc_pool(config.connection_pool.clone(), ledger(), Arc::clone(&calls));
    let balances = balance_processor(config.batch.clone(), Arc::clone(&pool));

    let processor = Arc::clone(&balances);
    let pipeline = Pipeline::new(
        config.pipeline.clone(),
        move |token: &CancellationToken, address: String| {
            let promise = processor
                .process(token, address.clone())
                .map_err(|e| (address.clone(), e))?;
            promise
                .wait_timeout(WAIT)
                .map(|balance| (address.clone(), balance))
                .map_err(|e| (address, e))
        },
    )
    .unwrap();

    for i in 0..20 {
        pipeline.submit(format!("0x{:04x}", i)).unwrap();
    }
    pipeline.submit("0xdead".to_string()).unwrap();

    let results = pipeline.results();
    let mut scanned: Vec<(String, u64)> = (0..20)
        .map(|_| results.recv_timeout(WAIT).unwrap())
        .collect();
    scanned.sort();

    let (address, err) = pipeline.errors().recv_timeout(WAIT).unwrap();
    assert_eq!(address, "0xdead");
    assert!(matches!(err, BatchError::Failed(_)));
    assert_eq!(err.to_string(), "batch item failed: unknown address 0xdead");

    assert_eq!(scanned.len(), 20);
    for (i, (address, balance)) in scanned.iter().enumerate() {
        assert_eq!(address, &format!("0x{:04x}", i));
        assert_eq!(*balance, i as u64 * 100);
    }

    pipeline.close();
    assert_eq!(pipeline.processing_count(), 0);
    assert!(balances.close_and_wait(WAIT));
    pool.close();

    // 21 lookups coalesced into far fewer RPC calls
    let rpc_calls = calls.load(Ordering::SeqCst);
    assert!(rpc_calls >= 5);
    assert!(rpc_calls <= 21);
    assert_eq!(balances.stats().items_flushed, 21);
    assert!(pool.stats().created <= 2);
}

#[test]
fn test_batch_of_three_doubles_in_order() {
    let processor = BatchProcessor::new(
        BatchConfig {
            max_batch_size: 3,
            max_wait_time: Duration::from_secs(60),
        },
        |_, items: Vec<u64>| items.into_iter().map(|x| Ok(x * 2)).collect(),
    );
    let ctx = CancellationToken::new();

    let promises: Vec<_> = [1, 2, 3]
        .into_iter()
        .map(|x| processor.process(&ctx, x).unwrap())
        .collect();
    let results: Vec<u64> = promises.iter().map(|p| p.wait().unwrap()).collect();

    assert_eq!(results, vec![2, 4, 6]);
    assert!(processor.wait_idle(WAIT));
    let stats = processor.stats();
    assert_eq!(stats.batches_flushed, 1);
    assert_eq!(stats.items_flushed, 3);
}

#[test]
fn test_pool_exhaustion_reaches_promises() {
    let calls = Arc::new(AtomicUsize::new(0));
    let pool = rpc_pool(
        ConnectionPoolConfig {
            min_size: 0,
            max_size: 1,
            ..Default::default()
        },
        ledger(),
        calls,
    );
    let held = pool.get().unwrap();

    let processor = BatchProcessor::new(
        BatchConfig {
            max_batch_size: 2,
            max_wait_time: Duration::from_secs(60),
        },
        {
            let pool = Arc::clone(&pool);
            move |_, addresses: Vec<String>| match pool.get() {
                Ok(client) => client.balances(&addresses),
                Err(e) => {
                    let message = e.to_string();
                    addresses
                        .iter()
                        .map(|_| Err(message.clone().into()))
                        .collect()
                }
            }
        },
    );

    let ctx = CancellationToken::new();
    let a = processor.process(&ctx, "0x0001".to_string()).unwrap();
    let b = processor.process(&ctx, "0x0002".to_string()).unwrap();

    for promise in [a, b] {
        let err = promise.wait_timeout(WAIT).unwrap_err();
        assert_eq!(
            err.to_string(),
            "batch item failed: connection pool exhausted (max size 1)"
        );
    }
    drop(held);
}
