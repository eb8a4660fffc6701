//! Connects to a WebSocket endpoint, subscribes to `newHeads`, applies a
//! couple of filter rules, and prints every block that matches one of
//! them. Run with `RUST_LOG=info cargo run --example ingest-blocks -- wss://...`.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chainstream_engine::error::EngineError;
use chainstream_engine::filter::{Condition, ConditionKind, EventFilter, FilterRule, Operator, RuleLogic};
use chainstream_engine::model::BlockEvent;
use chainstream_engine::rpc::client::{EndpointConfig, TransportKind};
use chainstream_engine::rpc::pool::{ClientPool, PoolConfig};
use chainstream_engine::subscriber::{BlockEventHandler, BlockSubscriber, BlockSubscriberConfig};
use chainstream_engine::subscription::SubscriptionMultiplexer;
use chainstream_engine::transport::ws::{WsTransport, WsTransportConfig};

struct LoggingHandler;

#[async_trait]
impl BlockEventHandler for LoggingHandler {
    async fn handle_block(&self, event: &BlockEvent) -> Result<(), EngineError> {
        println!(
            "block {} ({}) matched {} rule(s)",
            event.header.number,
            event.header.hash,
            event.matches.len()
        );
        Ok(())
    }

    async fn handle_error(&self, err: &EngineError) {
        eprintln!("block handler error: {err}");
    }

    fn name(&self) -> &str {
        "logging-handler"
    }
}

fn busy_blocks_filter() -> EventFilter {
    let filter = EventFilter::new();
    filter
        .add_rule(FilterRule {
            id: "busy-blocks".to_string(),
            name: "blocks using more than half their gas limit".to_string(),
            description: None,
            enabled: true,
            priority: 10,
            logic: RuleLogic::And,
            conditions: vec![Condition {
                kind: ConditionKind::GasUsed,
                operator: Operator::Gt,
                value: "15000000".to_string(),
            }],
        })
        .expect("rule is valid");
    filter
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    chainstream_engine::init_tracing();

    let ws_url = env::args()
        .nth(1)
        .unwrap_or_else(|| "wss://eth-mainnet.example.invalid/ws".to_string());
    let http_url = env::args()
        .nth(2)
        .unwrap_or_else(|| "https://eth-mainnet.example.invalid".to_string());

    let pool = Arc::new(ClientPool::new(
        vec![EndpointConfig::new(http_url, TransportKind::Http)],
        PoolConfig::default(),
    )?);
    pool.connect_all().await;

    let transport = WsTransport::new(WsTransportConfig {
        url: ws_url,
        ..Default::default()
    });
    transport.connect().await?;

    let multiplexer = SubscriptionMultiplexer::new(transport);
    let filter = Arc::new(busy_blocks_filter());
    let subscriber = BlockSubscriber::new(multiplexer, Some(filter), BlockSubscriberConfig::default());
    subscriber.add_handler(Arc::new(LoggingHandler));
    subscriber.start().await?;

    tokio::signal::ctrl_c().await?;
    subscriber.stop().await;

    let stats = subscriber.stats();
    println!(
        "received {} block(s), processed {}, dropped {}",
        stats.received_count, stats.processed_count, stats.dropped_count
    );

    let pool_stats = pool.stats();
    println!(
        "rpc pool: {}/{} healthy clients, {} requests, {} failed",
        pool_stats.healthy_clients, pool_stats.total_clients, pool_stats.total_requests, pool_stats.failed_requests
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}
