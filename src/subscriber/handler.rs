//! Handler registry shared by the Block and Tx Subscribers (C7, C8,
//! spec §4.7/§4.8).
//!
//! Grounded on `provider_base::ProviderBase`'s separate-mutex,
//! snapshot-then-iterate handler pattern (copy the handler list out from
//! under the lock before invoking anything), generalized here to two
//! handler traits and to panic-safe invocation via a `tokio::spawn`
//! boundary: `JoinHandle::await` surfaces a handler panic as a
//! `JoinError` instead of unwinding through the processor, which is the
//! idiomatic way to get task-level panic isolation in async Rust without
//! fighting `UnwindSafe` bounds on futures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::error::{EngineError, ProcessingError};
use crate::model::{BlockEvent, TransactionEvent};

#[async_trait]
pub trait BlockEventHandler: Send + Sync {
    async fn handle_block(&self, event: &BlockEvent) -> Result<(), EngineError>;
    async fn handle_error(&self, err: &EngineError);
    fn name(&self) -> &str;
}

#[async_trait]
pub trait TxEventHandler: Send + Sync {
    async fn handle_transaction(&self, event: &TransactionEvent) -> Result<(), EngineError>;
    async fn handle_error(&self, err: &EngineError);
    fn name(&self) -> &str;
}

/// Ordered, mutable handler list. `add`/`remove` take their own lock;
/// invocation snapshots the list first so handlers can be added or
/// removed concurrently without blocking in-flight dispatch.
pub struct HandlerRegistry<H: ?Sized> {
    handlers: Mutex<Vec<Arc<H>>>,
}

impl<H: ?Sized> HandlerRegistry<H> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, handler: Arc<H>) {
        self.handlers.lock().push(handler);
    }

    pub fn remove_by_name(&self, name: &str) -> bool
    where
        H: Named,
    {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|h| h.name() != name);
        handlers.len() != before
    }

    pub fn snapshot(&self) -> Vec<Arc<H>> {
        self.handlers.lock().clone()
    }
}

impl<H: ?Sized> Default for HandlerRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

pub trait Named {
    fn name(&self) -> &str;
}

impl Named for dyn BlockEventHandler {
    fn name(&self) -> &str {
        BlockEventHandler::name(self)
    }
}

impl Named for dyn TxEventHandler {
    fn name(&self) -> &str {
        TxEventHandler::name(self)
    }
}

/// Invoke every handler in registration order against `event`, each
/// under its own `processing_timeout` and panic boundary (spec §4.7).
/// A handler error or panic is logged, forwarded to that handler's
/// `handle_error`, and reported back to the caller as a best-effort
/// `ProcessingError` list so it can push onto the shared error channel;
/// it never stops later handlers from running.
pub async fn dispatch_block_event(
    handlers: &[Arc<dyn BlockEventHandler>],
    event: BlockEvent,
    processing_timeout: Duration,
) -> Vec<ProcessingError> {
    let mut errors = Vec::new();
    let event = Arc::new(event);
    for handler in handlers {
        let handler = handler.clone();
        let event = event.clone();
        let name = handler.name().to_string();
        let invocation = tokio::spawn(async move { handler.handle_block(&event).await });

        let outcome = match tokio::time::timeout(processing_timeout, invocation).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => {
                warn!(handler = %name, error = %e, "handler returned an error");
                Some(ProcessingError::HandlerError {
                    handler: name.clone(),
                    message: e.to_string(),
                })
            }
            Ok(Err(join_err)) if join_err.is_panic() => {
                error!(handler = %name, "handler panicked");
                Some(ProcessingError::HandlerPanic {
                    handler: name.clone(),
                    message: join_err.to_string(),
                })
            }
            Ok(Err(join_err)) => {
                warn!(handler = %name, error = %join_err, "handler task failed to join");
                Some(ProcessingError::HandlerError {
                    handler: name.clone(),
                    message: join_err.to_string(),
                })
            }
            Err(_) => {
                warn!(handler = %name, timeout_ms = processing_timeout.as_millis(), "handler timed out");
                Some(ProcessingError::ProcessingTimeout {
                    handler: name.clone(),
                    timeout_ms: processing_timeout.as_millis() as u64,
                })
            }
        };

        if let Some(processing_err) = outcome {
            // Invoke the originating handler's own HandleError immediately
            // (spec §4.7), isolated from this loop by the same
            // spawn/join panic boundary used for the initial call.
            let notify_handler = handler.clone();
            let engine_err = EngineError::Processing(processing_err.clone());
            let notify = tokio::spawn(async move { notify_handler.handle_error(&engine_err).await });
            if let Err(join_err) = notify.await {
                if join_err.is_panic() {
                    error!(handler = %handler.name(), "handler panicked inside HandleError");
                }
            }
            errors.push(processing_err);
        }
    }
    errors
}

pub async fn dispatch_tx_event(
    handlers: &[Arc<dyn TxEventHandler>],
    event: TransactionEvent,
    processing_timeout: Duration,
) -> Vec<ProcessingError> {
    let mut errors = Vec::new();
    let event = Arc::new(event);
    for handler in handlers {
        let handler = handler.clone();
        let event = event.clone();
        let name = handler.name().to_string();
        let invocation = tokio::spawn(async move { handler.handle_transaction(&event).await });

        let outcome = match tokio::time::timeout(processing_timeout, invocation).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => {
                warn!(handler = %name, error = %e, "handler returned an error");
                Some(ProcessingError::HandlerError {
                    handler: name.clone(),
                    message: e.to_string(),
                })
            }
            Ok(Err(join_err)) if join_err.is_panic() => {
                error!(handler = %name, "handler panicked");
                Some(ProcessingError::HandlerPanic {
                    handler: name.clone(),
                    message: join_err.to_string(),
                })
            }
            Ok(Err(join_err)) => {
                warn!(handler = %name, error = %join_err, "handler task failed to join");
                Some(ProcessingError::HandlerError {
                    handler: name.clone(),
                    message: join_err.to_string(),
                })
            }
            Err(_) => {
                warn!(handler = %name, timeout_ms = processing_timeout.as_millis(), "handler timed out");
                Some(ProcessingError::ProcessingTimeout {
                    handler: name.clone(),
                    timeout_ms: processing_timeout.as_millis() as u64,
                })
            }
        };

        if let Some(processing_err) = outcome {
            let notify_handler = handler.clone();
            let engine_err = EngineError::Processing(processing_err.clone());
            let notify = tokio::spawn(async move { notify_handler.handle_error(&engine_err).await });
            if let Err(join_err) = notify.await {
                if join_err.is_panic() {
                    error!(handler = %handler.name(), "handler panicked inside HandleError");
                }
            }
            errors.push(processing_err);
        }
    }
    errors
}
