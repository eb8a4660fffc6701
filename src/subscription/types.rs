//! Subscription kinds and the per-subscription bookkeeping entry (spec §3, §4.5).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::model::{BlockHeader, Log, RawBlockHeader, RawLog, RawTransaction, Transaction};

/// What a subscription is asking the node to push. `Logs` carries the
/// raw filter object verbatim (spec §5 leaves log-filter shape to the
/// node's own `eth_subscribe("logs", ...)` semantics); `Syncing`'s
/// result shape is node-defined and passed through unparsed (spec §4.5).
#[derive(Debug, Clone)]
pub enum SubscriptionKind {
    NewHeads,
    NewPendingTransactionHashes,
    NewPendingTransactions,
    Logs(Value),
    Syncing,
}

impl SubscriptionKind {
    pub fn method(&self) -> &'static str {
        "eth_subscribe"
    }

    pub fn params(&self) -> Value {
        match self {
            SubscriptionKind::NewHeads => json!(["newHeads"]),
            SubscriptionKind::NewPendingTransactionHashes => {
                json!(["newPendingTransactionHashes"])
            }
            SubscriptionKind::NewPendingTransactions => json!(["newPendingTransactions"]),
            SubscriptionKind::Logs(filter) => json!(["logs", filter]),
            SubscriptionKind::Syncing => json!(["syncing"]),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SubscriptionKind::NewHeads => "newHeads",
            SubscriptionKind::NewPendingTransactionHashes => "newPendingTransactionHashes",
            SubscriptionKind::NewPendingTransactions => "newPendingTransactions",
            SubscriptionKind::Logs(_) => "logs",
            SubscriptionKind::Syncing => "syncing",
        }
    }
}

/// The typed result of one `eth_subscription` notification, parsed
/// according to its subscription's kind (spec §4.5 notification
/// handling).
#[derive(Debug, Clone)]
pub enum SubscriptionPayload {
    Header(BlockHeader),
    /// 32-byte transaction hash, hex-decoded per spec §4.5.
    PendingHash([u8; 32]),
    PendingTransaction(Transaction),
    Log(Log),
    /// Node-defined shape, passed through verbatim (spec §4.5).
    Syncing(Value),
}

/// Parse a notification's `result` according to the subscription kind
/// that produced it (spec §4.5). Malformed payloads are the caller's
/// concern to log-and-drop; this only reports the parse failure.
pub fn parse_payload(kind: &SubscriptionKind, raw: Value) -> Result<SubscriptionPayload, String> {
    match kind {
        SubscriptionKind::NewHeads => {
            let header: RawBlockHeader =
                serde_json::from_value(raw).map_err(|e| format!("bad newHeads payload: {e}"))?;
            BlockHeader::try_from(header)
                .map(SubscriptionPayload::Header)
                .map_err(|e| e.to_string())
        }
        SubscriptionKind::NewPendingTransactionHashes => {
            let hex_str = raw
                .as_str()
                .ok_or_else(|| "pending-tx-hash payload is not a string".to_string())?;
            let bytes = decode_hash(hex_str)?;
            Ok(SubscriptionPayload::PendingHash(bytes))
        }
        SubscriptionKind::NewPendingTransactions => {
            let tx: RawTransaction = serde_json::from_value(raw)
                .map_err(|e| format!("bad newPendingTransactions payload: {e}"))?;
            Transaction::try_from(tx)
                .map(SubscriptionPayload::PendingTransaction)
                .map_err(|e| e.to_string())
        }
        SubscriptionKind::Logs(_) => {
            let log: RawLog =
                serde_json::from_value(raw).map_err(|e| format!("bad logs payload: {e}"))?;
            Log::try_from(log)
                .map(SubscriptionPayload::Log)
                .map_err(|e| e.to_string())
        }
        SubscriptionKind::Syncing => Ok(SubscriptionPayload::Syncing(raw)),
    }
}

fn decode_hash(hex_str: &str) -> Result<[u8; 32], String> {
    let stripped = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    let bytes = hex::decode(stripped).map_err(|e| format!("invalid hash hex: {e}"))?;
    bytes
        .try_into()
        .map_err(|_| "pending-tx hash was not 32 bytes".to_string())
}

/// Status of a subscription through its lifecycle (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Inactive,
    Active,
    Error,
    Reconnecting,
}

/// Point-in-time snapshot of a subscription's bookkeeping, for
/// diagnostics and the scenario tests in spec §8.
#[derive(Debug, Clone)]
pub struct SubscriptionSnapshot {
    pub id: u64,
    pub status: SubscriptionStatus,
    pub created_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub error_count: u64,
    pub dropped_count: u64,
    pub last_error: Option<String>,
    pub retry_count: u32,
}

/// Bookkeeping for one live (or reconnecting) subscription. The local id
/// is stable for the subscriber's lifetime; `server_id` is rewritten on
/// every successful (re)subscribe since the node assigns a fresh one each
/// time the socket reconnects (spec §3, §4.5).
pub struct Subscription {
    pub id: u64,
    pub kind: SubscriptionKind,
    pub auto_reconnect: bool,
    pub server_id: Mutex<Option<String>>,
    pub status: Mutex<SubscriptionStatus>,
    pub created_at: DateTime<Utc>,
    pub last_message_at: Mutex<Option<DateTime<Utc>>>,
    pub message_count: AtomicU64,
    pub error_count: AtomicU64,
    pub last_error: Mutex<Option<String>>,
    pub retry_count: AtomicU32,
    /// Count of notifications dropped because the data channel was full
    /// (spec §8 property 2: "exactly one drop counter increment").
    pub dropped_count: AtomicU64,
    pub sender: mpsc::Sender<SubscriptionPayload>,
    pub error_sender: mpsc::Sender<EngineError>,
}

impl Subscription {
    pub fn snapshot(&self) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            id: self.id,
            status: *self.status.lock(),
            created_at: self.created_at,
            last_message_at: *self.last_message_at.lock(),
            message_count: self.message_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            dropped_count: self.dropped_count.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
            retry_count: self.retry_count.load(Ordering::Relaxed),
        }
    }

    pub fn record_message(&self) {
        self.message_count.fetch_add(1, Ordering::Relaxed);
        *self.last_message_at.lock() = Some(Utc::now());
    }

    pub fn record_error(&self, message: String) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(message);
    }

    pub fn record_drop(&self) {
        self.dropped_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_status(&self, status: SubscriptionStatus) {
        *self.status.lock() = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_pending_tx_hash() {
        let raw = json!("0x7465737474657374746573747465737474657374746573747465737474ffff");
        let payload = parse_payload(&SubscriptionKind::NewPendingTransactionHashes, raw).unwrap();
        assert!(matches!(payload, SubscriptionPayload::PendingHash(_)));
    }

    #[test]
    fn syncing_passes_through_verbatim() {
        let raw = json!({"startingBlock": "0x0", "currentBlock": "0x5", "highestBlock": "0xa"});
        let payload = parse_payload(&SubscriptionKind::Syncing, raw.clone()).unwrap();
        match payload {
            SubscriptionPayload::Syncing(v) => assert_eq!(v, raw),
            _ => panic!("expected Syncing payload"),
        }
    }

    #[test]
    fn rejects_malformed_newheads_payload() {
        let raw = json!({"not": "a header"});
        let result = parse_payload(&SubscriptionKind::NewHeads, raw);
        assert!(result.is_err());
    }
}
