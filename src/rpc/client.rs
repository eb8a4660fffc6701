//! Single-endpoint RPC client (C1, spec §4.1).
//!
//! Wraps one [`EndpointConfig`] and its live HTTP JSON-RPC transport.
//! Grounded on `newheads-evm-provider::ethereum::EthereumClient` for the
//! `rpc_call`/chain-id-validation shape, and on
//! `http-rpc-provider::endpoint_pool::EndpointPool::make_request`'s
//! linear-backoff idiom (`Duration::from_millis(100 * attempt)`), reused
//! here as the retry-delay formula spec §4.1 calls for.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::amount::Amount;
use crate::error::{EngineError, TransportError};
use crate::jsonrpc::RequestIdGenerator;
use crate::model::{
    BlockHeader, RawBlockHeader, RawTransaction, RawTransactionReceipt, Transaction,
    TransactionReceipt,
};

/// The transport an endpoint is reachable over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Http,
    WebSocket,
    Ipc,
}

/// Immutable endpoint descriptor, created from configuration (spec §3).
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub url: String,
    pub transport: TransportKind,
    pub timeout: Duration,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub max_concurrency: usize,
    pub priority: u32,
    pub declared_chain_id: Option<String>,
}

impl EndpointConfig {
    pub fn new(url: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            url: url.into(),
            transport,
            timeout: Duration::from_secs(10),
            retry_count: 3,
            retry_delay: Duration::from_millis(200),
            max_concurrency: 16,
            priority: 0,
            declared_chain_id: None,
        }
    }

    /// Reject configuration that can't produce a working [`RpcClient`]
    /// (spec §A.3), mirroring `newheads_evm_provider::config::ProviderConfig::validate`.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.url.is_empty() {
            return Err(EngineError::ConfigInvalid {
                reason: "endpoint url must not be empty".to_string(),
            });
        }
        if self.timeout.is_zero() {
            return Err(EngineError::ConfigInvalid {
                reason: format!("endpoint {}: timeout must be greater than zero", self.url),
            });
        }
        if self.max_concurrency == 0 {
            return Err(EngineError::ConfigInvalid {
                reason: format!("endpoint {}: max_concurrency must be greater than zero", self.url),
            });
        }
        Ok(())
    }
}

/// Snapshot of a client's observability counters (spec §3, §A.5).
#[derive(Debug, Clone)]
pub struct ClientStats {
    pub healthy: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub request_count: u64,
    pub error_count: u64,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_observed_block: Option<u64>,
}

/// Call message for `eth_estimateGas`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CallMsg {
    pub from: Option<String>,
    pub to: Option<String>,
    pub value: Option<String>,
    pub data: Option<String>,
}

/// A single RPC endpoint with its own transport, retry wrapper, and
/// health/error counters. Owned exclusively by the [`crate::rpc::pool::ClientPool`].
pub struct RpcClient {
    endpoint: EndpointConfig,
    http: reqwest::Client,
    healthy: AtomicBool,
    connected_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    request_count: AtomicU64,
    error_count: AtomicU64,
    request_ids: RequestIdGenerator,
    last_check_at: RwLock<Option<DateTime<Utc>>>,
    last_observed_block: AtomicU64,
    has_observed_block: AtomicBool,
}

impl RpcClient {
    pub fn new(endpoint: EndpointConfig) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .timeout(endpoint.timeout)
            .build()
            .map_err(anyhow::Error::from)?;
        Ok(Self {
            endpoint,
            http,
            healthy: AtomicBool::new(false),
            connected_at: RwLock::new(None),
            last_error: RwLock::new(None),
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            request_ids: RequestIdGenerator::new(),
            last_check_at: RwLock::new(None),
            last_observed_block: AtomicU64::new(0),
            has_observed_block: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }

    /// Validate the endpoint: fetch chain id (comparing against any
    /// declared id), then fetch the latest block number. Only on full
    /// success is the client marked healthy (spec §4.1).
    pub async fn connect(&self) -> Result<(), EngineError> {
        let chain_id: String = self.rpc_call_raw("eth_chainId", json!([])).await?;
        if let Some(declared) = &self.endpoint.declared_chain_id {
            if declared != &chain_id {
                let err = TransportError::ChainMismatch {
                    url: self.endpoint.url.clone(),
                    expected: declared.clone(),
                    actual: chain_id,
                };
                self.set_unhealthy(err.to_string());
                return Err(err.into());
            }
        }
        let _latest: String = self.rpc_call_raw("eth_blockNumber", json!([])).await?;
        self.healthy.store(true, Ordering::SeqCst);
        *self.connected_at.write() = Some(Utc::now());
        *self.last_error.write() = None;
        Ok(())
    }

    pub async fn close(&self) {
        self.healthy.store(false, Ordering::SeqCst);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            healthy: self.is_healthy(),
            connected_at: *self.connected_at.read(),
            last_error: self.last_error.read().clone(),
            request_count: self.request_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            last_check_at: *self.last_check_at.read(),
            last_observed_block: self
                .has_observed_block
                .load(Ordering::Relaxed)
                .then(|| self.last_observed_block.load(Ordering::Relaxed)),
        }
    }

    /// Record the outcome of a [`crate::rpc::health::HealthChecker`] probe
    /// (spec §4.3): on success, mark healthy, clear the last error, and
    /// remember the observed block number; on failure, mark unhealthy and
    /// record the error. Always stamps `last_check_at`.
    pub fn record_health_probe(&self, result: Result<u64, String>) {
        *self.last_check_at.write() = Some(Utc::now());
        match result {
            Ok(block_number) => {
                self.healthy.store(true, Ordering::SeqCst);
                *self.last_error.write() = None;
                self.last_observed_block.store(block_number, Ordering::Relaxed);
                self.has_observed_block.store(true, Ordering::Relaxed);
            }
            Err(message) => {
                self.healthy.store(false, Ordering::SeqCst);
                *self.last_error.write() = Some(message);
            }
        }
    }

    /// Error rate used by the pool's `healthy` load-balance strategy.
    pub fn error_rate(&self) -> f64 {
        let reqs = self.request_count.load(Ordering::Relaxed);
        if reqs == 0 {
            return 0.0;
        }
        self.error_count.load(Ordering::Relaxed) as f64 / reqs as f64
    }

    fn set_unhealthy(&self, error: String) {
        self.healthy.store(false, Ordering::SeqCst);
        *self.last_error.write() = Some(error);
    }

    async fn rpc_call_raw<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, EngineError> {
        let id = self.request_ids.next_id();
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.endpoint.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::WriteError {
                url: self.endpoint.url.clone(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(TransportError::ReadError {
                url: self.endpoint.url.clone(),
                message: format!("HTTP status {}", response.status()),
            }
            .into());
        }

        let envelope: crate::jsonrpc::InboundEnvelope =
            response.json().await.map_err(|e| TransportError::ReadError {
                url: self.endpoint.url.clone(),
                message: e.to_string(),
            })?;

        if let Some(err) = envelope.error {
            return Err(anyhow::anyhow!("RPC error {}: {}", err.code, err.message).into());
        }

        let result = envelope
            .result
            .ok_or_else(|| anyhow::anyhow!("RPC response for {} had no result", method))?;
        serde_json::from_value(result)
            .map_err(|e| anyhow::anyhow!("failed to decode {} result: {}", method, e).into())
    }

    /// Wraps any operation with the retry/backoff contract of spec §4.1:
    /// increment request counter, attempt, on failure increment error
    /// counter + record last error + sleep `retry_delay * (attempt+1)`,
    /// repeat up to `retry_count`, then mark unhealthy.
    pub async fn execute_with_retry<F, Fut, T>(&self, mut op: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let mut last_err: Option<EngineError> = None;
        for attempt in 0..=self.endpoint.retry_count {
            self.request_count.fetch_add(1, Ordering::Relaxed);
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    self.error_count.fetch_add(1, Ordering::Relaxed);
                    *self.last_error.write() = Some(err.to_string());
                    warn!(
                        endpoint = %self.endpoint.url,
                        attempt,
                        error = %err,
                        "rpc call failed"
                    );
                    last_err = Some(err);
                    if attempt < self.endpoint.retry_count {
                        let delay = self.endpoint.retry_delay * (attempt + 1);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        let err = last_err.expect("loop runs at least once");
        self.healthy.store(false, Ordering::SeqCst);
        Err(anyhow::anyhow!(
            "exhausted {} attempts against {}: {}",
            self.endpoint.retry_count + 1,
            self.endpoint.url,
            err
        )
        .into())
    }

    pub async fn get_latest_block(&self) -> Result<BlockHeader, EngineError> {
        let raw: RawBlockHeader = self.rpc_call_raw("eth_getBlockByNumber", json!(["latest", false])).await?;
        BlockHeader::try_from(raw).map_err(|e| anyhow::anyhow!(e).into())
    }

    pub async fn get_block_by_number(&self, number: u64) -> Result<BlockHeader, EngineError> {
        let hex = crate::amount::format_hex_u64(number);
        let raw: RawBlockHeader = self
            .rpc_call_raw("eth_getBlockByNumber", json!([hex, false]))
            .await?;
        BlockHeader::try_from(raw).map_err(|e| anyhow::anyhow!(e).into())
    }

    pub async fn get_block_by_hash(&self, hash: &str) -> Result<BlockHeader, EngineError> {
        let raw: RawBlockHeader = self
            .rpc_call_raw("eth_getBlockByHash", json!([hash, false]))
            .await?;
        BlockHeader::try_from(raw).map_err(|e| anyhow::anyhow!(e).into())
    }

    /// Returns the transaction and whether it is still pending
    /// (`block_number.is_none()`).
    pub async fn get_transaction_by_hash(
        &self,
        hash: &str,
    ) -> Result<(Option<Transaction>, bool), EngineError> {
        let value: Option<Value> = self
            .rpc_call_raw("eth_getTransactionByHash", json!([hash]))
            .await?;
        match value {
            None | Some(Value::Null) => Ok((None, false)),
            Some(v) => {
                let raw: RawTransaction = serde_json::from_value(v)
                    .map_err(|e| anyhow::anyhow!("failed to decode transaction: {}", e))?;
                let tx = Transaction::try_from(raw).map_err(anyhow::Error::from)?;
                let pending = tx.block_number.is_none();
                Ok((Some(tx), pending))
            }
        }
    }

    pub async fn get_transaction_receipt(
        &self,
        hash: &str,
    ) -> Result<Option<TransactionReceipt>, EngineError> {
        let value: Option<Value> = self
            .rpc_call_raw("eth_getTransactionReceipt", json!([hash]))
            .await?;
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(v) => {
                let raw: RawTransactionReceipt = serde_json::from_value(v)
                    .map_err(|e| anyhow::anyhow!("failed to decode receipt: {}", e))?;
                let receipt = TransactionReceipt::try_from(raw).map_err(anyhow::Error::from)?;
                Ok(Some(receipt))
            }
        }
    }

    pub async fn get_gas_price(&self) -> Result<Amount, EngineError> {
        let hex: String = self.rpc_call_raw("eth_gasPrice", json!([])).await?;
        Amount::from_hex(&hex).map_err(|e| anyhow::anyhow!(e).into())
    }

    pub async fn estimate_gas(&self, call: CallMsg) -> Result<u64, EngineError> {
        let hex: String = self
            .rpc_call_raw("eth_estimateGas", json!([call]))
            .await?;
        crate::amount::parse_hex_u64(&hex).map_err(|e| anyhow::anyhow!(e).into())
    }

    /// Subscribe to `newHeads` directly over this endpoint's own
    /// WebSocket connection. Only valid when the endpoint's transport is
    /// [`TransportKind::WebSocket`]; otherwise fails with
    /// `UnsupportedTransport` (spec §4.1). This is a direct,
    /// non-multiplexed subscription — real multiplexing across many
    /// subscriptions lives in [`crate::subscription::multiplexer`].
    pub async fn subscribe_new_head(
        &self,
        sink: mpsc::Sender<BlockHeader>,
    ) -> Result<(), EngineError> {
        if self.endpoint.transport != TransportKind::WebSocket {
            return Err(EngineError::UnsupportedTransport {
                operation: "SubscribeNewHead".to_string(),
            });
        }

        let transport = crate::transport::ws::WsTransport::new(
            crate::transport::ws::WsTransportConfig {
                url: self.endpoint.url.clone(),
                ..Default::default()
            },
        );
        transport.connect().await?;

        let id = self.request_ids.next_id();
        let request = crate::jsonrpc::RpcRequest::new(id, "eth_subscribe", json!(["newHeads"]));
        transport
            .send_message(serde_json::to_string(&request).map_err(anyhow::Error::from)?)
            .await?;

        let mut incoming = transport.subscribe_incoming();
        tokio::spawn(async move {
            while let Ok(text) = incoming.recv().await {
                let Ok(envelope) =
                    serde_json::from_str::<crate::jsonrpc::InboundEnvelope>(&text)
                else {
                    continue;
                };
                if !envelope.is_notification() {
                    continue;
                }
                let Some(params) = envelope.params else {
                    continue;
                };
                let Ok(notification) =
                    serde_json::from_value::<crate::jsonrpc::NotificationParams>(params)
                else {
                    continue;
                };
                let Ok(raw) = serde_json::from_value::<RawBlockHeader>(notification.result) else {
                    continue;
                };
                let Ok(header) = BlockHeader::try_from(raw) else {
                    continue;
                };
                debug!(block_number = header.number, "direct subscription header");
                if sink.send(header).await.is_err() {
                    break;
                }
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_sets_healthy_on_success() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(|req: &wiremock::Request| {
                let body: Value = serde_json::from_slice(&req.body).unwrap();
                let method = body["method"].as_str().unwrap();
                let result = match method {
                    "eth_chainId" => json!("0x1"),
                    "eth_blockNumber" => json!("0x10"),
                    _ => json!(null),
                };
                wiremock::ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": body["id"],
                    "result": result,
                }))
            })
            .mount(&server)
            .await;

        let mut endpoint = EndpointConfig::new(server.uri(), TransportKind::Http);
        endpoint.declared_chain_id = Some("0x1".to_string());
        let client = RpcClient::new(endpoint).unwrap();
        client.connect().await.unwrap();
        assert!(client.is_healthy());
    }

    #[tokio::test]
    async fn connect_fails_on_chain_mismatch() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(|req: &wiremock::Request| {
                let body: Value = serde_json::from_slice(&req.body).unwrap();
                wiremock::ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": body["id"],
                    "result": "0x2",
                }))
            })
            .mount(&server)
            .await;

        let mut endpoint = EndpointConfig::new(server.uri(), TransportKind::Http);
        endpoint.declared_chain_id = Some("0x1".to_string());
        let client = RpcClient::new(endpoint).unwrap();
        let result = client.connect().await;
        assert!(result.is_err());
        assert!(!client.is_healthy());
    }

    #[tokio::test]
    async fn execute_with_retry_exhausts_and_reports_attempts() {
        let endpoint = EndpointConfig {
            retry_count: 2,
            retry_delay: Duration::from_millis(1),
            ..EndpointConfig::new("http://unused.invalid", TransportKind::Http)
        };
        let client = RpcClient::new(endpoint).unwrap();
        let attempts = AtomicU64::new(0);
        let result: Result<(), EngineError> = client
            .execute_with_retry(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow::anyhow!("boom").into()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(!client.is_healthy());
    }

    #[test]
    fn endpoint_config_validate_rejects_empty_url() {
        let endpoint = EndpointConfig::new("", TransportKind::Http);
        assert!(matches!(
            endpoint.validate(),
            Err(EngineError::ConfigInvalid { .. })
        ));
    }

    #[test]
    fn endpoint_config_validate_accepts_defaults() {
        let endpoint = EndpointConfig::new("http://localhost:8545", TransportKind::Http);
        assert!(endpoint.validate().is_ok());
    }

    #[test]
    fn record_health_probe_flips_healthy_both_ways() {
        let endpoint = EndpointConfig::new("http://unused.invalid", TransportKind::Http);
        let client = RpcClient::new(endpoint).unwrap();
        client.record_health_probe(Ok(42));
        assert!(client.is_healthy());
        assert_eq!(client.stats().last_observed_block, Some(42));

        client.record_health_probe(Err("boom".to_string()));
        assert!(!client.is_healthy());
        assert_eq!(client.stats().last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn direct_subscribe_rejects_http_transport() {
        let endpoint = EndpointConfig::new("http://unused.invalid", TransportKind::Http);
        let client = RpcClient::new(endpoint).unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let result = client.subscribe_new_head(tx).await;
        assert!(matches!(result, Err(EngineError::UnsupportedTransport { .. })));
    }
}
