//! Health checker: periodic liveness probes and reconnection orchestration
//! (C3, spec §4.3).
//!
//! Grounded on the teacher's periodic-probe idiom in
//! `newheads-evm-provider::ethereum::EthereumClient::test_connection`
//! (a lightweight RPC round-trip used as the liveness signal), wired
//! into a `tokio::time::interval` sweep loop the way
//! `http-rpc-provider::endpoint_pool` does health bookkeeping, but
//! generalized to also drive a reconnection pass across the whole pool
//! rather than just reporting circuit-breaker state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{info, warn};

use crate::rpc::pool::ClientPool;

#[derive(Debug, Clone)]
pub struct HealthCheckerConfig {
    pub interval: Duration,
    pub per_check_timeout: Duration,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            per_check_timeout: Duration::from_secs(10),
        }
    }
}

/// Drives periodic `GetLatestBlock` probes against every client in a
/// pool and, when the pool falls below its configured minimum healthy
/// count, runs a reconnection pass (spec §4.3).
pub struct HealthChecker {
    pool: Arc<ClientPool>,
    config: HealthCheckerConfig,
    min_healthy_clients: usize,
    stop: Arc<Notify>,
    stopped: Arc<AtomicBool>,
}

impl HealthChecker {
    pub fn new(pool: Arc<ClientPool>, config: HealthCheckerConfig, min_healthy_clients: usize) -> Self {
        Self {
            pool,
            config,
            min_healthy_clients,
            stop: Arc::new(Notify::new()),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the sweep loop. Returns immediately; call [`Self::stop`] for
    /// a cooperative shutdown that drains within one interval plus the
    /// per-check timeout.
    pub fn start(&self) {
        let pool = self.pool.clone();
        let config = self.config.clone();
        let min_healthy = self.min_healthy_clients;
        let stop = self.stop.clone();
        let stopped = self.stopped.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::sweep(&pool, &config, min_healthy).await;
                    }
                    _ = stop.notified() => {
                        stopped.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
        });
    }

    /// Cooperative stop signal; idempotent.
    pub fn stop(&self) {
        self.stop.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Trigger an out-of-band sweep immediately, independent of the
    /// interval timer (spec §4.3 `ForceHealthCheck`).
    pub async fn force_health_check(&self) {
        Self::sweep(&self.pool, &self.config, self.min_healthy_clients).await;
    }

    async fn sweep(pool: &Arc<ClientPool>, config: &HealthCheckerConfig, min_healthy: usize) {
        for client in pool.clients() {
            let probe = tokio::time::timeout(config.per_check_timeout, client.get_latest_block());
            match probe.await {
                Ok(Ok(header)) => {
                    info!(
                        url = %client.endpoint().url,
                        block_number = header.number,
                        "health check passed"
                    );
                    client.record_health_probe(Ok(header.number));
                }
                Ok(Err(e)) => {
                    warn!(url = %client.endpoint().url, error = %e, "health check failed");
                    client.record_health_probe(Err(e.to_string()));
                }
                Err(_) => {
                    warn!(url = %client.endpoint().url, "health check timed out");
                    client.record_health_probe(Err("health check timed out".to_string()));
                }
            }
        }

        let stats = pool.stats();
        if stats.healthy_clients < min_healthy {
            warn!(
                healthy = stats.healthy_clients,
                min_healthy, "below minimum healthy clients, running reconnection pass"
            );
            Self::reconnect_unhealthy(pool).await;
        }
    }

    async fn reconnect_unhealthy(pool: &Arc<ClientPool>) {
        for client in pool.clients() {
            if client.is_healthy() {
                continue;
            }
            client.close().await;
            match client.connect().await {
                Ok(()) => info!(url = %client.endpoint().url, "reconnected"),
                Err(e) => warn!(url = %client.endpoint().url, error = %e, "reconnect attempt failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::client::{EndpointConfig, TransportKind};
    use crate::rpc::pool::PoolConfig;

    #[tokio::test]
    async fn force_health_check_runs_without_panicking() {
        let pool = Arc::new(
            ClientPool::new(
                vec![EndpointConfig::new("http://unused.invalid", TransportKind::Http)],
                PoolConfig::default(),
            )
            .unwrap(),
        );
        let checker = HealthChecker::new(pool, HealthCheckerConfig {
            interval: Duration::from_secs(60),
            per_check_timeout: Duration::from_millis(50),
        }, 1);
        checker.force_health_check().await;
    }

    #[tokio::test]
    async fn sweep_marks_a_failing_client_unhealthy() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let pool = Arc::new(
            ClientPool::new(
                vec![EndpointConfig::new(server.uri(), TransportKind::Http)],
                PoolConfig::default(),
            )
            .unwrap(),
        );
        // seed healthy = true the way a successful `connect()` would, so
        // the sweep's failure is what flips it rather than the initial
        // default.
        pool.clients()[0].record_health_probe(Ok(1));
        assert!(pool.clients()[0].is_healthy());

        let checker = HealthChecker::new(
            pool.clone(),
            HealthCheckerConfig {
                interval: Duration::from_secs(60),
                per_check_timeout: Duration::from_millis(500),
            },
            1,
        );
        checker.force_health_check().await;
        assert!(!pool.clients()[0].is_healthy());
    }

    #[tokio::test]
    async fn stop_is_cooperative_and_idempotent() {
        let pool = Arc::new(
            ClientPool::new(
                vec![EndpointConfig::new("http://unused.invalid", TransportKind::Http)],
                PoolConfig::default(),
            )
            .unwrap(),
        );
        let checker = HealthChecker::new(pool, HealthCheckerConfig::default(), 1);
        checker.start();
        checker.stop();
        checker.stop();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
