//! Transaction Subscriber (C8, spec §4.8).
//!
//! Structurally mirrors [`crate::subscriber::block::BlockSubscriber`],
//! with two variants chosen by [`TxSubscriberMode`]: Mode A opens
//! `newPendingTransactionHashes` and fetches bodies through the client
//! pool (C2) via a bounded pool of fetcher tasks; Mode B opens
//! `newPendingTransactions` directly. Grounded on the same
//! `newheads-evm-provider` background-task idiom as C7, plus
//! `http-rpc-provider::endpoint_pool::EndpointPool`'s "never hold a
//! transport directly, always go through the pool" rule for the Mode A
//! fetcher tasks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::filter::EventFilter;
use crate::model::{TransactionEvent, TxEventSource};
use crate::rpc::pool::ClientPool;
use crate::subscriber::handler::{dispatch_tx_event, HandlerRegistry, TxEventHandler};
use crate::subscription::{SubscriptionKind, SubscriptionMultiplexer, SubscriptionPayload};

/// Which wire shape the subscription delivers (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxSubscriberMode {
    /// `newPendingTransactionHashes`: fetch the body via the client pool.
    HashesThenFetch,
    /// `newPendingTransactions`: the node sends the full body directly.
    FullBodies,
}

/// Configuration surface for the transaction subscriber (spec §6): same
/// fields as the block subscriber plus `fetch_full_tx`, `max_concurrency`,
/// and the mode selector.
#[derive(Debug, Clone)]
pub struct TxSubscriberConfig {
    pub mode: TxSubscriberMode,
    pub buffer_size: usize,
    pub processing_timeout: Duration,
    pub enable_filtering: bool,
    pub auto_reconnect: bool,
    pub max_retries: u32,
    pub retry_interval: Duration,
    /// Mode A only: fetch the full body (and therefore enable filtering
    /// on it) rather than dispatching hash-only events.
    pub fetch_full_tx: bool,
    /// Mode A only: bounded concurrency for the fetcher pool.
    pub max_concurrency: usize,
}

impl Default for TxSubscriberConfig {
    fn default() -> Self {
        Self {
            mode: TxSubscriberMode::HashesThenFetch,
            buffer_size: 512,
            processing_timeout: Duration::from_secs(5),
            enable_filtering: true,
            auto_reconnect: true,
            max_retries: 3,
            retry_interval: Duration::from_secs(5),
            fetch_full_tx: true,
            max_concurrency: 8,
        }
    }
}

impl TxSubscriberConfig {
    /// Reject configuration the fetcher pool and processor tasks can't
    /// act on (spec §A.3).
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.buffer_size == 0 {
            return Err(EngineError::ConfigInvalid {
                reason: "tx subscriber buffer_size must be greater than zero".to_string(),
            });
        }
        if self.processing_timeout.is_zero() {
            return Err(EngineError::ConfigInvalid {
                reason: "tx subscriber processing_timeout must be greater than zero".to_string(),
            });
        }
        if self.mode == TxSubscriberMode::HashesThenFetch && self.max_concurrency == 0 {
            return Err(EngineError::ConfigInvalid {
                reason: "tx subscriber max_concurrency must be greater than zero in HashesThenFetch mode".to_string(),
            });
        }
        Ok(())
    }
}

/// Observability snapshot (spec §A.5).
#[derive(Debug, Clone, Default)]
pub struct TxSubscriberStats {
    pub received_count: u64,
    pub fetched_count: u64,
    pub fetch_error_count: u64,
    pub filtered_count: u64,
    pub processed_count: u64,
    pub error_count: u64,
    pub dropped_count: u64,
    pub last_tx_at: Option<DateTime<Utc>>,
    pub avg_processing_ms: f64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    fetched: AtomicU64,
    fetch_errors: AtomicU64,
    filtered: AtomicU64,
    processed: AtomicU64,
    errors: AtomicU64,
    dropped: AtomicU64,
    total_processing_ms: AtomicU64,
    last_tx_at: Mutex<Option<DateTime<Utc>>>,
}

impl Counters {
    fn snapshot(&self) -> TxSubscriberStats {
        let processed = self.processed.load(Ordering::Relaxed);
        let total_ms = self.total_processing_ms.load(Ordering::Relaxed);
        TxSubscriberStats {
            received_count: self.received.load(Ordering::Relaxed),
            fetched_count: self.fetched.load(Ordering::Relaxed),
            fetch_error_count: self.fetch_errors.load(Ordering::Relaxed),
            filtered_count: self.filtered.load(Ordering::Relaxed),
            processed_count: processed,
            error_count: self.errors.load(Ordering::Relaxed),
            dropped_count: self.dropped.load(Ordering::Relaxed),
            last_tx_at: *self.last_tx_at.lock(),
            avg_processing_ms: if processed == 0 {
                0.0
            } else {
                total_ms as f64 / processed as f64
            },
        }
    }
}

/// Consumes pending-transaction hashes or bodies, optionally fetches
/// bodies via the client pool, applies the event filter (C6), and fans
/// out to registered [`TxEventHandler`]s (spec §4.8).
pub struct TxSubscriber {
    multiplexer: SubscriptionMultiplexer,
    pool: Option<Arc<ClientPool>>,
    filter: Option<Arc<EventFilter>>,
    handlers: Arc<HandlerRegistry<dyn TxEventHandler>>,
    config: TxSubscriberConfig,
    local_id: Mutex<Option<u64>>,
    counters: Arc<Counters>,
    processed_tx: broadcast::Sender<TransactionEvent>,
    stop_tx: broadcast::Sender<()>,
    stopped: Arc<AtomicBool>,
}

impl TxSubscriber {
    /// `pool` is required for [`TxSubscriberMode::HashesThenFetch`] with
    /// `fetch_full_tx = true`; it may be `None` for
    /// [`TxSubscriberMode::FullBodies`] or hash-only Mode A.
    pub fn new(
        multiplexer: SubscriptionMultiplexer,
        pool: Option<Arc<ClientPool>>,
        filter: Option<Arc<EventFilter>>,
        config: TxSubscriberConfig,
    ) -> Self {
        let (processed_tx, _) = broadcast::channel(config.buffer_size.max(16));
        let (stop_tx, _) = broadcast::channel(8);
        Self {
            multiplexer,
            pool,
            filter,
            handlers: Arc::new(HandlerRegistry::new()),
            config,
            local_id: Mutex::new(None),
            counters: Arc::new(Counters::default()),
            processed_tx,
            stop_tx,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn add_handler(&self, handler: Arc<dyn TxEventHandler>) {
        self.handlers.add(handler);
    }

    pub fn remove_handler(&self, name: &str) -> bool {
        self.handlers.remove_by_name(name)
    }

    pub fn stats(&self) -> TxSubscriberStats {
        self.counters.snapshot()
    }

    /// A broadcast feed of fully-processed events, for callers that want
    /// to observe the pipeline rather than register a handler.
    pub fn subscribe_processed(&self) -> broadcast::Receiver<TransactionEvent> {
        self.processed_tx.subscribe()
    }

    /// Open the configured subscription and spawn the subscription,
    /// event, and error processor tasks (spec §4.8). Returns once the
    /// subscription is confirmed by the node.
    pub async fn start(&self) -> Result<(), EngineError> {
        let kind = match self.config.mode {
            TxSubscriberMode::HashesThenFetch => SubscriptionKind::NewPendingTransactionHashes,
            TxSubscriberMode::FullBodies => SubscriptionKind::NewPendingTransactions,
        };
        let (local_id, data_rx, error_rx) = self
            .multiplexer
            .subscribe(kind, self.config.auto_reconnect, self.config.buffer_size)
            .await?;
        *self.local_id.lock() = Some(local_id);

        let (events_tx, mut events_rx) = mpsc::channel::<TransactionEvent>(self.config.buffer_size);
        let (shared_err_tx, mut shared_err_rx) =
            mpsc::channel::<Arc<EngineError>>(self.config.buffer_size);

        match self.config.mode {
            TxSubscriberMode::FullBodies => {
                self.spawn_full_body_processor(
                    data_rx,
                    error_rx,
                    events_tx.clone(),
                    shared_err_tx.clone(),
                );
            }
            TxSubscriberMode::HashesThenFetch => {
                self.spawn_hash_fetch_processor(
                    data_rx,
                    error_rx,
                    events_tx.clone(),
                    shared_err_tx.clone(),
                );
            }
        }

        // Event processor: internal events queue -> handlers.
        let handlers = self.handlers.clone();
        let processing_timeout = self.config.processing_timeout;
        let counters = self.counters.clone();
        let processed_tx = self.processed_tx.clone();
        let event_err_tx = shared_err_tx.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.recv() => break,
                    event = events_rx.recv() => {
                        let Some(mut event) = event else { break };
                        let started = Instant::now();
                        let snapshot = handlers.snapshot();
                        let errors = dispatch_tx_event(&snapshot, event.clone(), processing_timeout).await;
                        for err in errors {
                            counters.errors.fetch_add(1, Ordering::Relaxed);
                            let _ = event_err_tx.try_send(Arc::new(err.into()));
                        }
                        counters.processed.fetch_add(1, Ordering::Relaxed);
                        counters
                            .total_processing_ms
                            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                        event.processed = true;
                        let _ = processed_tx.send(event);
                    }
                }
            }
            debug!("tx subscriber event processor exiting");
        });
        drop(events_tx);
        drop(shared_err_tx);

        // Error processor: shared error channel -> every handler's HandleError.
        let handlers = self.handlers.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.recv() => break,
                    err = shared_err_rx.recv() => {
                        let Some(err) = err else { break };
                        for handler in handlers.snapshot() {
                            let handler = handler.clone();
                            let err = err.clone();
                            let join = tokio::spawn(async move { handler.handle_error(&err).await });
                            if let Err(join_err) = join.await {
                                if join_err.is_panic() {
                                    warn!("handler panicked inside HandleError");
                                }
                            }
                        }
                    }
                }
            }
            debug!("tx subscriber error processor exiting");
        });

        Ok(())
    }

    fn spawn_full_body_processor(
        &self,
        mut data_rx: mpsc::Receiver<SubscriptionPayload>,
        mut error_rx: mpsc::Receiver<EngineError>,
        events_tx: mpsc::Sender<TransactionEvent>,
        shared_err_tx: mpsc::Sender<Arc<EngineError>>,
    ) {
        let counters = self.counters.clone();
        let filter = self.filter.clone();
        let enable_filtering = self.config.enable_filtering;
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.recv() => break,
                    msg = data_rx.recv() => {
                        let Some(payload) = msg else { break };
                        let SubscriptionPayload::PendingTransaction(tx) = payload else { continue };
                        counters.received.fetch_add(1, Ordering::Relaxed);
                        *counters.last_tx_at.lock() = Some(Utc::now());

                        let matches = if enable_filtering {
                            filter.as_ref().map(|f| f.filter_transaction(&tx, None, None)).unwrap_or_default()
                        } else {
                            Vec::new()
                        };
                        if enable_filtering && filter.is_some() && matches.is_empty() {
                            counters.filtered.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }

                        let event = TransactionEvent {
                            hash: tx.hash.clone(),
                            body: Some(tx),
                            matches,
                            ingest_timestamp: Utc::now(),
                            source: TxEventSource::Subscription,
                            processed: false,
                            pending: true,
                        };
                        if events_tx.try_send(event).is_err() {
                            counters.dropped.fetch_add(1, Ordering::Relaxed);
                            counters.errors.fetch_add(1, Ordering::Relaxed);
                            warn!("tx subscriber internal queue full, dropping event");
                        }
                    }
                    err = error_rx.recv() => {
                        let Some(err) = err else { break };
                        counters.errors.fetch_add(1, Ordering::Relaxed);
                        let _ = shared_err_tx.try_send(Arc::new(err));
                    }
                }
            }
            debug!("tx subscriber (mode B) notification processor exiting");
        });
    }

    fn spawn_hash_fetch_processor(
        &self,
        mut data_rx: mpsc::Receiver<SubscriptionPayload>,
        mut error_rx: mpsc::Receiver<EngineError>,
        events_tx: mpsc::Sender<TransactionEvent>,
        shared_err_tx: mpsc::Sender<Arc<EngineError>>,
    ) {
        let counters = self.counters.clone();
        let filter = self.filter.clone();
        let enable_filtering = self.config.enable_filtering;
        let fetch_full_tx = self.config.fetch_full_tx;
        let pool = self.pool.clone();
        let hash_queue_size = self.config.buffer_size;
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut stop_rx = self.stop_tx.subscribe();

        // Bounded hash queue between the subscription processor and the
        // fetcher pool (spec §4.8): a full queue drops new hashes with a
        // warning rather than blocking the notification path.
        let (hash_tx, mut hash_rx) = mpsc::channel::<Vec<u8>>(hash_queue_size);

        {
            let counters = counters.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = stop_rx.recv() => break,
                        msg = data_rx.recv() => {
                            let Some(payload) = msg else { break };
                            let SubscriptionPayload::PendingHash(hash) = payload else { continue };
                            counters.received.fetch_add(1, Ordering::Relaxed);
                            if hash_tx.try_send(hash.to_vec()).is_err() {
                                counters.dropped.fetch_add(1, Ordering::Relaxed);
                                warn!("tx subscriber hash queue full, dropping hash");
                            }
                        }
                        err = error_rx.recv() => {
                            let Some(err) = err else { break };
                            counters.errors.fetch_add(1, Ordering::Relaxed);
                            let _ = shared_err_tx.try_send(Arc::new(err));
                        }
                    }
                }
                debug!("tx subscriber (mode A) notification processor exiting");
            });
        }

        if !fetch_full_tx || pool.is_none() {
            // Hash-only delivery: wrap each hash as a bodyless event
            // directly, skipping the fetcher pool entirely.
            let counters = counters.clone();
            tokio::spawn(async move {
                while let Some(hash) = hash_rx.recv().await {
                    let hash_hex = format!("0x{}", hex::encode(hash));
                    let event = TransactionEvent {
                        hash: hash_hex,
                        body: None,
                        matches: Vec::new(),
                        ingest_timestamp: Utc::now(),
                        source: TxEventSource::Fetch,
                        processed: false,
                        pending: true,
                    };
                    if events_tx.try_send(event).is_err() {
                        counters.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!("tx subscriber internal queue full, dropping event");
                    }
                }
            });
            return;
        }

        let pool = pool.expect("checked above");
        tokio::spawn(async move {
            while let Some(hash) = hash_rx.recv().await {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let pool = pool.clone();
                let events_tx = events_tx.clone();
                let filter = filter.clone();
                let counters = counters.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let hash_hex = format!("0x{}", hex::encode(&hash));
                    let result = pool
                        .execute_with_failover(|client| {
                            let hash_hex = hash_hex.clone();
                            async move { client.get_transaction_by_hash(&hash_hex).await }
                        })
                        .await;

                    match result {
                        Ok((Some(tx), pending)) => {
                            counters.fetched.fetch_add(1, Ordering::Relaxed);
                            *counters.last_tx_at.lock() = Some(Utc::now());
                            let matches = if enable_filtering {
                                filter.as_ref().map(|f| f.filter_transaction(&tx, None, None)).unwrap_or_default()
                            } else {
                                Vec::new()
                            };
                            if enable_filtering && filter.is_some() && matches.is_empty() {
                                counters.filtered.fetch_add(1, Ordering::Relaxed);
                                return;
                            }
                            let event = TransactionEvent {
                                hash: tx.hash.clone(),
                                body: Some(tx),
                                matches,
                                ingest_timestamp: Utc::now(),
                                source: TxEventSource::Fetch,
                                processed: false,
                                pending,
                            };
                            if events_tx.try_send(event).is_err() {
                                counters.dropped.fetch_add(1, Ordering::Relaxed);
                                warn!("tx subscriber internal queue full, dropping event");
                            }
                        }
                        Ok((None, _)) => {
                            debug!(hash = %hash_hex, "transaction not found on fetch, dropping");
                        }
                        Err(e) => {
                            counters.fetch_errors.fetch_add(1, Ordering::Relaxed);
                            warn!(hash = %hash_hex, error = %e, "failed to fetch pending transaction body");
                        }
                    }
                });
            }
            debug!("tx subscriber fetcher pool exiting");
        });
    }

    /// Cooperative shutdown: signal every task to stop and, best-effort,
    /// unsubscribe. Idempotent.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.stop_tx.send(());
        if let Some(local_id) = *self.local_id.lock() {
            let _ = self.multiplexer.unsubscribe(local_id).await;
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
