//! Failover across pool endpoints, and the shared circuit breaker
//! tripping once the whole pool is unhealthy. Both scenarios drive the
//! pool through [`chainstream_engine::rpc::client::RpcClient`]'s real
//! HTTP path against `wiremock` servers, the same harness used by the
//! in-crate `rpc::client` tests.

use std::time::Duration;

use chainstream_engine::error::{EngineError, PoolError};
use chainstream_engine::rpc::circuit_breaker::{CircuitBreakerConfig, CircuitState};
use chainstream_engine::rpc::client::{EndpointConfig, TransportKind};
use chainstream_engine::rpc::pool::{ClientPool, LoadBalanceStrategy, PoolConfig};
use serde_json::{json, Value};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Answers the handshake calls normally (so the client is marked
/// healthy) but fails every `eth_getBlockByNumber` call.
async fn connects_but_rejects_block_queries() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(|req: &wiremock::Request| {
            let body: Value = serde_json::from_slice(&req.body).unwrap();
            match body["method"].as_str().unwrap() {
                "eth_chainId" | "eth_blockNumber" => ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0", "id": body["id"], "result": "0x1",
                })),
                _ => ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": body["id"],
                    "error": {"code": -32000, "message": "block queries disabled"},
                })),
            }
        })
        .mount(&server)
        .await;
    server
}

async fn block_number_server(block_hex: &str) -> MockServer {
    let server = MockServer::start().await;
    let block_hex = block_hex.to_string();
    Mock::given(method("POST"))
        .respond_with(move |req: &wiremock::Request| {
            let body: Value = serde_json::from_slice(&req.body).unwrap();
            let result = match body["method"].as_str().unwrap() {
                "eth_chainId" => json!("0x1"),
                "eth_blockNumber" => json!(block_hex),
                "eth_getBlockByNumber" => json!({
                    "number": block_hex,
                    "hash": "0xhealthyblock",
                    "parentHash": "0xparent",
                    "timestamp": "0x1",
                }),
                _ => json!(null),
            };
            ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": body["id"],
                "result": result,
            }))
        })
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn fails_over_to_the_next_endpoint_after_a_query_failure() {
    let flaky = connects_but_rejects_block_queries().await;
    let healthy = block_number_server("0x64").await;

    let pool = ClientPool::new(
        vec![
            EndpointConfig::new(flaky.uri(), TransportKind::Http),
            EndpointConfig::new(healthy.uri(), TransportKind::Http),
        ],
        PoolConfig {
            strategy: LoadBalanceStrategy::RoundRobin,
            max_retries: 3,
            retry_delay: Duration::from_millis(5),
            ..Default::default()
        },
    )
    .unwrap();
    pool.connect_all().await;
    assert_eq!(pool.stats().healthy_clients, 2, "both endpoints connect fine; only queries diverge");

    let mut attempted_urls = Vec::new();
    let result = pool
        .execute_with_failover(|client| {
            attempted_urls.push(client.endpoint().url.clone());
            async move { client.get_latest_block().await }
        })
        .await;

    let header = result.expect("failover should land on the healthy endpoint");
    assert_eq!(header.number, 0x64);
    assert_eq!(attempted_urls.len(), 2, "round robin should have tried the flaky endpoint before the healthy one");
    assert_eq!(attempted_urls[0], flaky.uri());
    assert_eq!(attempted_urls[1], healthy.uri());
}

/// A server that answers `connect()`'s handshake calls normally but
/// returns a JSON-RPC error for everything else, so the client is
/// healthy while every real operation still fails.
async fn flaky_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(|req: &wiremock::Request| {
            let body: Value = serde_json::from_slice(&req.body).unwrap();
            match body["method"].as_str().unwrap() {
                "eth_chainId" => ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0", "id": body["id"], "result": "0x1",
                })),
                "eth_blockNumber" => ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0", "id": body["id"], "result": "0x1",
                })),
                _ => ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": body["id"],
                    "error": {"code": -32000, "message": "always fails"},
                })),
            }
        })
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn circuit_opens_once_failures_cross_the_threshold() {
    let a = flaky_server().await;
    let b = flaky_server().await;

    let pool = ClientPool::new(
        vec![
            EndpointConfig::new(a.uri(), TransportKind::Http),
            EndpointConfig::new(b.uri(), TransportKind::Http),
        ],
        PoolConfig {
            max_retries: 0,
            retry_delay: Duration::from_millis(1),
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 2,
                ..Default::default()
            },
            ..Default::default()
        },
    )
    .unwrap();
    pool.connect_all().await;
    assert_eq!(pool.stats().healthy_clients, 2);

    for _ in 0..2 {
        let result = pool
            .execute_with_failover(|client| async move { client.get_latest_block().await })
            .await;
        assert!(result.is_err());
    }
    assert_eq!(pool.breaker().state(), CircuitState::Open);

    let result = pool
        .execute_with_failover(|client| async move { client.get_latest_block().await })
        .await;
    match result {
        Err(EngineError::Pool(PoolError::FailoverExhausted { attempts, source })) => {
            assert_eq!(attempts, 1);
            assert!(matches!(*source, EngineError::Pool(PoolError::CircuitOpen { .. })));
        }
        other => panic!("expected a failover-exhausted circuit-open error, got {other:?}"),
    }
}
