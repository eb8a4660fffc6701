//! Gas/Block/Tx historical query services (C9, spec §4.9).
//!
//! Thin façades atop the [`crate::rpc::pool::ClientPool`]: batched
//! historical retrieval under a bounded concurrency semaphore, block
//! sequence integrity verification, and gas price statistics over a
//! rolling window. None of these ever touch a transport directly or sit
//! on the real-time ingestion path (spec §4.9); they only ever obtain a
//! client through the pool, the same rule
//! `http-rpc-provider::endpoint_pool::EndpointPool` enforces for every
//! one of its callers, and issue calls the way
//! `newheads-evm-provider::ethereum::EthereumClient::rpc_call` does.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::amount::Amount;
use crate::error::{EngineError, QueryError};
use crate::model::{BlockHeader, Transaction, TransactionReceipt};
use crate::rpc::client::CallMsg;
use crate::rpc::pool::ClientPool;

/// Bounded concurrency for batched historical queries (spec §4.9).
#[derive(Debug, Clone, Copy)]
pub struct ServicesConfig {
    pub max_concurrency: usize,
    /// How many samples [`GasService`] keeps for its rolling statistics
    /// window.
    pub gas_price_window: usize,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            gas_price_window: 50,
        }
    }
}

/// Batched block retrieval with sequence integrity verification (spec
/// §4.9). Never holds its own transport; every call goes through the
/// pool's failover/circuit-breaker machinery.
pub struct BlockService {
    pool: Arc<ClientPool>,
    config: ServicesConfig,
}

impl BlockService {
    pub fn new(pool: Arc<ClientPool>, config: ServicesConfig) -> Self {
        Self { pool, config }
    }

    pub async fn get_block(&self, number: u64) -> Result<BlockHeader, EngineError> {
        self.pool
            .execute_with_failover(|client| async move { client.get_block_by_number(number).await })
            .await
    }

    pub async fn get_block_by_hash(&self, hash: &str) -> Result<BlockHeader, EngineError> {
        let hash = hash.to_string();
        self.pool
            .execute_with_failover(|client| {
                let hash = hash.clone();
                async move { client.get_block_by_hash(&hash).await }
            })
            .await
    }

    /// Fetch `[start, end]` inclusive under a bounded concurrency
    /// semaphore, then verify the resulting sequence is contiguous
    /// (spec §4.9: `number[i+1] = number[i]+1` and
    /// `parentHash[i+1] = hash[i]`, else [`QueryError::ChainDiscontinuity`]).
    pub async fn get_blocks_range(
        &self,
        start: u64,
        end: u64,
    ) -> Result<Vec<BlockHeader>, EngineError> {
        if end < start {
            return Ok(Vec::new());
        }
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut tasks = Vec::new();
        for number in start..=end {
            let pool = self.pool.clone();
            let permit = semaphore.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await;
                pool.execute_with_failover(|client| async move {
                    client.get_block_by_number(number).await
                })
                .await
            }));
        }

        let mut blocks = Vec::with_capacity(tasks.len());
        for task in tasks {
            let header = task
                .await
                .map_err(|e| anyhow::anyhow!("block fetch task panicked: {e}"))??;
            blocks.push(header);
        }
        blocks.sort_by_key(|h| h.number);
        verify_sequence(&blocks)?;
        Ok(blocks)
    }
}

/// Verify that `blocks`, sorted ascending by number, forms a contiguous
/// chain: each block's number is the previous one's plus one and its
/// parent hash matches the previous block's hash (spec §4.9).
fn verify_sequence(blocks: &[BlockHeader]) -> Result<(), EngineError> {
    for pair in blocks.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.number != prev.number + 1 || next.parent_hash != prev.hash {
            return Err(QueryError::ChainDiscontinuity {
                prev_number: prev.number,
                next_number: next.number,
                expected_parent: prev.hash.clone(),
                actual_parent: next.parent_hash.clone(),
            }
            .into());
        }
    }
    Ok(())
}

/// Historical transaction/receipt lookups routed through the pool (spec
/// §4.9).
pub struct TxService {
    pool: Arc<ClientPool>,
}

impl TxService {
    pub fn new(pool: Arc<ClientPool>) -> Self {
        Self { pool }
    }

    pub async fn get_transaction(
        &self,
        hash: &str,
    ) -> Result<(Option<Transaction>, bool), EngineError> {
        let hash = hash.to_string();
        self.pool
            .execute_with_failover(|client| {
                let hash = hash.clone();
                async move { client.get_transaction_by_hash(&hash).await }
            })
            .await
    }

    pub async fn get_receipt(&self, hash: &str) -> Result<TransactionReceipt, EngineError> {
        let hash_owned = hash.to_string();
        let receipt = self
            .pool
            .execute_with_failover(|client| {
                let hash = hash_owned.clone();
                async move { client.get_transaction_receipt(&hash).await }
            })
            .await?;
        receipt.ok_or_else(|| {
            QueryError::ReceiptNotFound {
                hash: hash.to_string(),
            }
            .into()
        })
    }

    pub async fn estimate_gas(&self, call: CallMsg) -> Result<u64, EngineError> {
        self.pool
            .execute_with_failover(|client| {
                let call = call.clone();
                async move { client.estimate_gas(call).await }
            })
            .await
    }
}

/// Gas price statistics over a rolling window of samples (spec §4.9).
#[derive(Debug, Clone)]
pub struct GasPriceStats {
    pub min: Amount,
    pub max: Amount,
    pub mean: Amount,
    pub median: Amount,
    pub sample_count: usize,
}

/// Samples `eth_gasPrice` through the pool and keeps a bounded rolling
/// window for min/max/mean/median statistics (spec §4.9).
pub struct GasService {
    pool: Arc<ClientPool>,
    window: Mutex<VecDeque<Amount>>,
    window_size: usize,
}

impl GasService {
    pub fn new(pool: Arc<ClientPool>, config: ServicesConfig) -> Self {
        Self {
            pool,
            window: Mutex::new(VecDeque::with_capacity(config.gas_price_window)),
            window_size: config.gas_price_window.max(1),
        }
    }

    /// Fetch the current gas price through the pool and push it onto the
    /// rolling window, evicting the oldest sample if full.
    pub async fn sample_now(&self) -> Result<Amount, EngineError> {
        let price = self
            .pool
            .execute_with_failover(|client| async move { client.get_gas_price().await })
            .await?;
        let mut window = self.window.lock();
        if window.len() >= self.window_size {
            window.pop_front();
        }
        window.push_back(price.clone());
        Ok(price)
    }

    /// Statistics over whatever samples are currently in the window.
    /// `None` when no samples have been collected yet.
    pub fn stats(&self) -> Option<GasPriceStats> {
        let window = self.window.lock();
        if window.is_empty() {
            return None;
        }
        let mut sorted: Vec<Amount> = window.iter().cloned().collect();
        sorted.sort_by(|a, b| a.cmp_amount(b));

        let min = sorted.first().cloned().expect("non-empty");
        let max = sorted.last().cloned().expect("non-empty");
        let median = sorted[sorted.len() / 2].clone();

        let sum = sorted
            .iter()
            .fold(Amount::zero(), |acc, v| acc.add(v));
        let mean = sum.div_usize(sorted.len());

        Some(GasPriceStats {
            min,
            max,
            mean,
            median,
            sample_count: sorted.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::client::{EndpointConfig, TransportKind};
    use crate::rpc::pool::PoolConfig;

    fn empty_pool() -> Arc<ClientPool> {
        Arc::new(
            ClientPool::new(
                vec![EndpointConfig::new("http://unused.invalid", TransportKind::Http)],
                PoolConfig::default(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn verify_sequence_accepts_contiguous_chain() {
        let blocks = vec![
            BlockHeader {
                number: 1,
                hash: "0xa".to_string(),
                parent_hash: "0x0".to_string(),
                timestamp: 0,
                miner: None,
                difficulty: None,
                gas_limit: None,
                gas_used: None,
                base_fee_per_gas: None,
                extra_data: None,
            },
            BlockHeader {
                number: 2,
                hash: "0xb".to_string(),
                parent_hash: "0xa".to_string(),
                timestamp: 1,
                miner: None,
                difficulty: None,
                gas_limit: None,
                gas_used: None,
                base_fee_per_gas: None,
                extra_data: None,
            },
        ];
        assert!(verify_sequence(&blocks).is_ok());
    }

    #[test]
    fn verify_sequence_rejects_discontinuity() {
        let blocks = vec![
            BlockHeader {
                number: 1,
                hash: "0xa".to_string(),
                parent_hash: "0x0".to_string(),
                timestamp: 0,
                miner: None,
                difficulty: None,
                gas_limit: None,
                gas_used: None,
                base_fee_per_gas: None,
                extra_data: None,
            },
            BlockHeader {
                number: 2,
                hash: "0xb".to_string(),
                parent_hash: "0xwrong".to_string(),
                timestamp: 1,
                miner: None,
                difficulty: None,
                gas_limit: None,
                gas_used: None,
                base_fee_per_gas: None,
                extra_data: None,
            },
        ];
        let result = verify_sequence(&blocks);
        assert!(matches!(
            result,
            Err(EngineError::Query(QueryError::ChainDiscontinuity { .. }))
        ));
    }

    #[test]
    fn gas_stats_empty_window_is_none() {
        let gas = GasService::new(empty_pool(), ServicesConfig::default());
        assert!(gas.stats().is_none());
    }

    #[tokio::test]
    async fn get_blocks_range_empty_when_end_before_start() {
        let service = BlockService::new(empty_pool(), ServicesConfig::default());
        let blocks = service.get_blocks_range(10, 5).await.unwrap();
        assert!(blocks.is_empty());
    }
}
