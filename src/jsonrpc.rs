//! JSON-RPC 2.0 wire envelopes (spec §6).
//!
//! Outbound calls use [`RpcRequest`]; inbound frames are either a
//! [`RpcResponse`] (keyed by echoed `id`) or an [`RpcNotification`]
//! (subscription push, keyed by `method == "eth_subscription"`).
//! [`RequestIdGenerator`] resolves the Open Question in spec §9: the
//! source derives ids from a nanosecond timestamp, which is not
//! monotonic under clock skew, so this uses a strictly monotonic
//! counter instead.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// An outbound JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

/// An inbound JSON-RPC envelope: either a response to a request we
/// issued (has `id`, no `method`) or a subscription notification (has
/// `method == "eth_subscription"`, no `id`).
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEnvelope {
    pub jsonrpc: Option<String>,
    pub id: Option<u64>,
    pub method: Option<String>,
    pub params: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<RpcError>,
}

impl InboundEnvelope {
    /// True if this is a response to a client-issued request (confirmation
    /// or RPC-error for some `id`), per spec §4.5 confirmation handling.
    pub fn is_response(&self) -> bool {
        self.method.is_none() && self.id.is_some()
    }

    /// True if this is a server-initiated subscription notification.
    pub fn is_notification(&self) -> bool {
        self.method.as_deref() == Some("eth_subscription")
    }
}

/// Parsed `params` of an `eth_subscription` notification.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationParams {
    pub subscription: String,
    pub result: Value,
}

/// Strictly monotonic id generator, shared by anything that issues
/// JSON-RPC requests (the multiplexer for subscribe/unsubscribe, the
/// RPC client for point queries).
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    next: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let gen = RequestIdGenerator::new();
        let a = gen.next_id();
        let b = gen.next_id();
        let c = gen.next_id();
        assert!(a < b && b < c);
    }

    #[test]
    fn response_vs_notification_classification() {
        let response: InboundEnvelope = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"result":"0x1"}"#,
        )
        .unwrap();
        assert!(response.is_response());
        assert!(!response.is_notification());

        let notification: InboundEnvelope = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"eth_subscription","params":{"subscription":"0xabc","result":{}}}"#,
        )
        .unwrap();
        assert!(!notification.is_response());
        assert!(notification.is_notification());
    }
}
