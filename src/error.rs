//! Error taxonomy for the ingestion and dispatch engine (spec §7).
//!
//! Each component family gets its own typed error so callers can match
//! on specific failure modes instead of string-sniffing. [`EngineError`]
//! aggregates them for code that crosses component boundaries.

use thiserror::Error;

/// Transport-layer errors (C4 WS Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to dial {url}: {source}")]
    DialFailed {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("chain id mismatch for {url}: expected {expected}, got {actual}")]
    ChainMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("handshake with {url} timed out after {timeout_secs}s")]
    HandshakeTimeout { url: String, timeout_secs: u64 },

    #[error("read error on {url}: {message}")]
    ReadError { url: String, message: String },

    #[error("write error on {url}: {message}")]
    WriteError { url: String, message: String },

    #[error("transport to {url} is not connected")]
    NotConnected { url: String },

    #[error("outgoing queue full for {url}, backpressure applied")]
    BackpressureFull { url: String },
}

/// Subscription-layer errors (C5 Subscription Multiplexer).
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("subscribe failed for kind {kind}: {message}")]
    SubscribeFailed { kind: String, message: String },

    #[error("notification for unknown server subscription id {server_id}")]
    NotifyForUnknownSubscription { server_id: String },

    #[error("unsubscribe failed for subscription {local_id}: {message}")]
    UnsubscribeFailed { local_id: u64, message: String },

    #[error("subscription {local_id} timed out waiting for confirmation")]
    SubscriptionTimeout { local_id: u64 },

    #[error("transport not connected, refusing to subscribe (kind {kind})")]
    NotConnected { kind: String },
}

/// Pool-layer errors (C2 Client Pool).
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no clients could be constructed from configured endpoints")]
    NoClientsAvailable,

    #[error("no healthy clients available out of {total} configured")]
    NoHealthyClients { total: usize },

    #[error("circuit breaker open for endpoint {endpoint}")]
    CircuitOpen { endpoint: String },

    #[error("failover exhausted after {attempts} attempts: {source}")]
    FailoverExhausted {
        attempts: u32,
        #[source]
        source: Box<EngineError>,
    },
}

/// Filter-layer errors (C6 Event Filter).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("invalid rule {rule_id}: {reason}")]
    InvalidRule { rule_id: String, reason: String },

    #[error("unknown operator {operator} for rule {rule_id}")]
    UnknownOperator { rule_id: String, operator: String },

    #[error("unknown condition kind {kind} for rule {rule_id}")]
    UnknownConditionKind { rule_id: String, kind: String },
}

/// Processing-layer errors (C7/C8 subscribers, handler fan-out).
#[derive(Debug, Clone, Error)]
pub enum ProcessingError {
    #[error("handler {handler} returned an error: {message}")]
    HandlerError { handler: String, message: String },

    #[error("processing timed out after {timeout_ms}ms for handler {handler}")]
    ProcessingTimeout { handler: String, timeout_ms: u64 },

    #[error("handler {handler} panicked: {message}")]
    HandlerPanic { handler: String, message: String },

    #[error("internal queue full, dropping event (depth {depth})")]
    QueueFull { depth: usize },
}

/// Query-layer errors (C9 historical query services).
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("chain discontinuity between block {prev_number} and {next_number}: expected parent {expected_parent}, got {actual_parent}")]
    ChainDiscontinuity {
        prev_number: u64,
        next_number: u64,
        expected_parent: String,
        actual_parent: String,
    },

    #[error("block not found: {identifier}")]
    BlockNotFound { identifier: String },

    #[error("receipt not found for transaction {hash}")]
    ReceiptNotFound { hash: String },
}

/// Top-level error aggregating every component's error taxonomy.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("unsupported transport for operation: {operation}")]
    UnsupportedTransport { operation: String },

    #[error("configuration invalid: {reason}")]
    ConfigInvalid { reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
