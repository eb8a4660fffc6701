//! Subscription multiplexer (C5, spec §5).
//!
//! Correlates locally-assigned subscription ids with the server-assigned
//! ids returned by `eth_subscribe`, routes `eth_subscription` notifications
//! to the right local sender, and resubscribes everything after the
//! transport reconnects. Grounded on the local-id/server-id aliasing idea
//! in `ethers-rs::rpc::transports::ws::manager::SubscriptionManager`
//! (kept consistent ids across reconnects), reworked around
//! [`crate::transport::ws::WsTransport`]'s callback-based lifecycle
//! instead of a hand-rolled backend-swap loop, and `dashmap` in place of
//! mutex-guarded `BTreeMap`s since this pool is accessed from many tasks
//! concurrently.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{EngineError, SubscriptionError};
use crate::jsonrpc::{InboundEnvelope, NotificationParams, RequestIdGenerator, RpcRequest};
use crate::subscription::types::{
    parse_payload, Subscription, SubscriptionKind, SubscriptionPayload, SubscriptionSnapshot,
    SubscriptionStatus,
};
use crate::transport::ws::{ConnectionState, WsTransport};

struct Inner {
    transport: WsTransport,
    request_ids: RequestIdGenerator,
    confirmation_timeout: Duration,
    pending: DashMap<u64, oneshot::Sender<Result<String, EngineError>>>,
    subscriptions: DashMap<u64, Arc<Subscription>>,
    router: DashMap<String, u64>,
}

/// Multiplexes many logical subscriptions over one [`WsTransport`].
#[derive(Clone)]
pub struct SubscriptionMultiplexer {
    inner: Arc<Inner>,
}

impl SubscriptionMultiplexer {
    pub fn new(transport: WsTransport) -> Self {
        let inner = Arc::new(Inner {
            transport: transport.clone(),
            request_ids: RequestIdGenerator::new(),
            confirmation_timeout: Duration::from_secs(10),
            pending: DashMap::new(),
            subscriptions: DashMap::new(),
            router: DashMap::new(),
        });

        let mut incoming = transport.subscribe_incoming();
        let dispatch_inner = inner.clone();
        tokio::spawn(async move {
            while let Ok(text) = incoming.recv().await {
                Self::dispatch(&dispatch_inner, &text);
            }
        });

        let reconnect_inner = Arc::downgrade(&inner);
        transport.on_connect(move || {
            if let Some(inner) = reconnect_inner.upgrade() {
                tokio::spawn(async move {
                    Self::resubscribe_all(inner).await;
                });
            }
        });

        let disconnect_inner = Arc::downgrade(&inner);
        transport.on_disconnect(move || {
            if let Some(inner) = disconnect_inner.upgrade() {
                for entry in inner.subscriptions.iter() {
                    let sub = entry.value();
                    sub.set_status(SubscriptionStatus::Reconnecting);
                    let err = SubscriptionError::NotConnected {
                        kind: sub.kind.label().to_string(),
                    }
                    .into();
                    if sub.error_sender.try_send(err).is_err() {
                        debug!(
                            local_id = sub.id,
                            "error channel full, dropping disconnect notice"
                        );
                    }
                }
            }
        });

        Self { inner }
    }

    fn dispatch(inner: &Arc<Inner>, text: &str) {
        let Ok(envelope) = serde_json::from_str::<InboundEnvelope>(text) else {
            debug!("discarding unparseable inbound frame");
            return;
        };

        if envelope.is_response() {
            let id = envelope.id.expect("is_response guarantees id");
            if let Some((_, tx)) = inner.pending.remove(&id) {
                let result = match envelope.error {
                    Some(err) => Err(SubscriptionError::SubscribeFailed {
                        kind: "unknown".to_string(),
                        message: format!("{}: {}", err.code, err.message),
                    }
                    .into()),
                    None => match envelope.result.and_then(|v| v.as_str().map(str::to_string)) {
                        Some(server_id) => Ok(server_id),
                        None => Err(SubscriptionError::SubscribeFailed {
                            kind: "unknown".to_string(),
                            message: "response had no subscription id".to_string(),
                        }
                        .into()),
                    },
                };
                let _ = tx.send(result);
            }
            return;
        }

        if envelope.is_notification() {
            let Some(params) = envelope.params else { return };
            let Ok(notification) = serde_json::from_value::<NotificationParams>(params) else {
                return;
            };
            match inner.router.get(&notification.subscription) {
                Some(local_id) => {
                    let Some(sub) = inner.subscriptions.get(&*local_id).map(|e| e.value().clone())
                    else {
                        return;
                    };
                    match parse_payload(&sub.kind, notification.result) {
                        Ok(payload) => {
                            sub.record_message();
                            if sub.sender.try_send(payload).is_err() {
                                sub.record_drop();
                                warn!(
                                    local_id = sub.id,
                                    "subscriber lagging or closed, dropping notification"
                                );
                            }
                        }
                        Err(message) => {
                            warn!(local_id = sub.id, %message, "failed to parse notification payload");
                            sub.record_error(message);
                        }
                    }
                }
                None => {
                    debug!(
                        server_id = %notification.subscription,
                        "notification for unknown server subscription id"
                    );
                }
            }
        }
    }

    /// Register a new subscription. Fails fast with
    /// [`SubscriptionError::NotConnected`] if the transport isn't
    /// currently connected, rather than queuing (spec §9 Open Question:
    /// subscribing while disconnected is a caller error, not something
    /// to buffer).
    pub async fn subscribe(
        &self,
        kind: SubscriptionKind,
        auto_reconnect: bool,
        buffer_size: usize,
    ) -> Result<
        (
            u64,
            mpsc::Receiver<SubscriptionPayload>,
            mpsc::Receiver<EngineError>,
        ),
        EngineError,
    > {
        if self.inner.transport.state() != ConnectionState::Connected {
            return Err(SubscriptionError::NotConnected {
                kind: kind.label().to_string(),
            }
            .into());
        }

        let local_id = self.inner.request_ids.next_id();
        let server_id = self.send_subscribe(local_id, &kind).await?;

        let (tx, rx) = mpsc::channel(buffer_size);
        let (error_tx, error_rx) = mpsc::channel(64);
        let subscription = Arc::new(Subscription {
            id: local_id,
            kind,
            auto_reconnect,
            server_id: Mutex::new(Some(server_id.clone())),
            status: Mutex::new(SubscriptionStatus::Active),
            created_at: Utc::now(),
            last_message_at: Mutex::new(None),
            message_count: Default::default(),
            error_count: Default::default(),
            last_error: Mutex::new(None),
            retry_count: Default::default(),
            dropped_count: Default::default(),
            sender: tx,
            error_sender: error_tx,
        });
        self.inner.subscriptions.insert(local_id, subscription);
        self.inner.router.insert(server_id, local_id);

        Ok((local_id, rx, error_rx))
    }

    async fn send_subscribe(
        &self,
        local_id: u64,
        kind: &SubscriptionKind,
    ) -> Result<String, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(local_id, tx);

        let request = RpcRequest::new(local_id, kind.method(), kind.params());
        let payload = serde_json::to_string(&request).map_err(anyhow::Error::from)?;
        if let Err(e) = self.inner.transport.send_message(payload).await {
            self.inner.pending.remove(&local_id);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.confirmation_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.inner.pending.remove(&local_id);
                Err(SubscriptionError::SubscribeFailed {
                    kind: kind.label().to_string(),
                    message: "confirmation channel dropped".to_string(),
                }
                .into())
            }
            Err(_) => {
                self.inner.pending.remove(&local_id);
                Err(SubscriptionError::SubscriptionTimeout { local_id }.into())
            }
        }
    }

    /// Unsubscribe and drop local bookkeeping. Best-effort: the
    /// `eth_unsubscribe` call is fired and its result ignored beyond
    /// logging, since the local state is torn down either way.
    pub async fn unsubscribe(&self, local_id: u64) -> Result<(), EngineError> {
        let Some((_, subscription)) = self.inner.subscriptions.remove(&local_id) else {
            return Err(SubscriptionError::UnsubscribeFailed {
                local_id,
                message: "no such subscription".to_string(),
            }
            .into());
        };

        if let Some(server_id) = subscription.server_id.lock().clone() {
            self.inner.router.remove(&server_id);
            let id = self.inner.request_ids.next_id();
            let request = RpcRequest::new(id, "eth_unsubscribe", serde_json::json!([server_id]));
            if let Ok(payload) = serde_json::to_string(&request) {
                if let Err(e) = self.inner.transport.send_message(payload).await {
                    warn!(local_id, error = %e, "failed to send eth_unsubscribe, dropping locally anyway");
                }
            }
        }

        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    pub fn snapshot(&self, local_id: u64) -> Option<SubscriptionSnapshot> {
        self.inner
            .subscriptions
            .get(&local_id)
            .map(|e| e.value().snapshot())
    }

    /// Reissue every tracked subscription with `auto_reconnect` set
    /// against the freshly reconnected transport, in the order they were
    /// originally created, rewriting each subscription's `server_id` and
    /// the router on success. Subscriptions with `auto_reconnect = false`
    /// are left `Reconnecting` until explicitly closed (spec §4.5).
    async fn resubscribe_all(inner: Arc<Inner>) {
        let multiplexer = SubscriptionMultiplexer {
            inner: inner.clone(),
        };
        let mut entries: Vec<Arc<Subscription>> = inner
            .subscriptions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by_key(|s| s.id);

        for sub in entries {
            if !sub.auto_reconnect {
                continue;
            }
            if let Some(old_server_id) = sub.server_id.lock().take() {
                inner.router.remove(&old_server_id);
            }
            match multiplexer.send_subscribe(sub.id, &sub.kind).await {
                Ok(new_server_id) => {
                    *sub.server_id.lock() = Some(new_server_id.clone());
                    inner.router.insert(new_server_id, sub.id);
                    sub.set_status(SubscriptionStatus::Active);
                    sub.retry_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    debug!(local_id = sub.id, "resubscribed after reconnect");
                }
                Err(e) => {
                    sub.record_error(e.to_string());
                    warn!(local_id = sub.id, error = %e, "failed to resubscribe after reconnect");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ws::WsTransportConfig;

    #[tokio::test]
    async fn subscribe_fails_fast_when_not_connected() {
        let transport = WsTransport::new(WsTransportConfig {
            url: "ws://unused.invalid".to_string(),
            ..Default::default()
        });
        let mux = SubscriptionMultiplexer::new(transport);
        let result = mux.subscribe(SubscriptionKind::NewHeads, true, 256).await;
        assert!(matches!(
            result,
            Err(EngineError::Subscription(SubscriptionError::NotConnected { .. }))
        ));
    }

    #[tokio::test]
    async fn unsubscribe_unknown_id_errors() {
        let transport = WsTransport::new(WsTransportConfig {
            url: "ws://unused.invalid".to_string(),
            ..Default::default()
        });
        let mux = SubscriptionMultiplexer::new(transport);
        let result = mux.unsubscribe(999).await;
        assert!(result.is_err());
    }

    #[test]
    fn dispatch_increments_dropped_count_exactly_once_when_channel_full() {
        let transport = WsTransport::new(WsTransportConfig {
            url: "ws://unused.invalid".to_string(),
            ..Default::default()
        });
        let inner = Arc::new(Inner {
            transport,
            request_ids: RequestIdGenerator::new(),
            confirmation_timeout: Duration::from_secs(10),
            pending: DashMap::new(),
            subscriptions: DashMap::new(),
            router: DashMap::new(),
        });

        // buffer size 1, receiver held but never drained so the second
        // notification finds the channel full.
        let (tx, _rx) = mpsc::channel(1);
        let (error_tx, _error_rx) = mpsc::channel(1);
        let sub = Arc::new(Subscription {
            id: 1,
            kind: SubscriptionKind::NewHeads,
            auto_reconnect: true,
            server_id: Mutex::new(Some("0xabc".to_string())),
            status: Mutex::new(SubscriptionStatus::Active),
            created_at: Utc::now(),
            last_message_at: Mutex::new(None),
            message_count: Default::default(),
            error_count: Default::default(),
            last_error: Mutex::new(None),
            retry_count: Default::default(),
            dropped_count: Default::default(),
            sender: tx,
            error_sender: error_tx,
        });
        inner.subscriptions.insert(1, sub.clone());
        inner.router.insert("0xabc".to_string(), 1);

        let notification = |number: &str| {
            serde_json::json!({
                "jsonrpc": "2.0",
                "method": "eth_subscription",
                "params": {
                    "subscription": "0xabc",
                    "result": {
                        "number": number,
                        "hash": "0x1",
                        "parentHash": "0x0",
                        "timestamp": "0x1"
                    }
                }
            })
            .to_string()
        };

        SubscriptionMultiplexer::dispatch(&inner, &notification("0x1"));
        SubscriptionMultiplexer::dispatch(&inner, &notification("0x2"));

        assert_eq!(sub.message_count.load(std::sync::atomic::Ordering::Relaxed), 2);
        assert_eq!(sub.dropped_count.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn subscription_kind_params_shape() {
        assert_eq!(
            SubscriptionKind::NewHeads.params(),
            serde_json::json!(["newHeads"])
        );
        assert_eq!(
            SubscriptionKind::Logs(serde_json::json!({"address": "0xabc"})).params(),
            serde_json::json!(["logs", {"address": "0xabc"}])
        );
    }
}
