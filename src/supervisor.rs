//! Reconnect supervisor.
//!
//! Watches both protocol clients on a fixed interval and restarts whichever
//! is down, backing off exponentially between consecutive failed rounds:
//!
//! ```text
//! backoff = min(base * 2^failures, max)
//! ```
//!
//! The failure counter resets when both clients are up or when the local
//! network itself is down (nothing to retry against). Transport errors from
//! the clients are handled here and nowhere else.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{ReconnectConfig, ServerConfig};
use crate::traits::{ManagedConnection, NetworkMonitor};

/// What one supervisor round did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// Supervision is switched off.
    Disabled,
    /// The local network is down; failures were reset.
    NetworkDown,
    /// No server has been configured yet.
    NoTarget,
    /// Both clients are connected; failures were reset.
    Healthy,
    /// At least one client was down and a reconnect was attempted.
    Retried {
        /// Consecutive failed rounds including this one.
        attempt: u32,
        /// How long the round waited before reconnecting.
        backoff: Duration,
    },
}

/// Restarts dropped protocol connections.
#[derive(Debug)]
pub struct ReconnectSupervisor<A, B, N> {
    primary: Arc<A>,
    secondary: Arc<B>,
    network: Arc<N>,
    config: ReconnectConfig,
    enabled: AtomicBool,
    failures: AtomicU32,
    target: Mutex<Option<ServerConfig>>,
}

impl<A, B, N> ReconnectSupervisor<A, B, N>
where
    A: ManagedConnection,
    B: ManagedConnection,
    N: NetworkMonitor,
{
    /// Creates a supervisor over two connections.
    pub fn new(primary: Arc<A>, secondary: Arc<B>, network: Arc<N>, config: ReconnectConfig) -> Self {
        Self {
            primary,
            secondary,
            network,
            enabled: AtomicBool::new(config.enabled),
            config,
            failures: AtomicU32::new(0),
            target: Mutex::new(None),
        }
    }

    /// Turns supervision on or off.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        tracing::info!(enabled, "reconnect supervisor toggled");
    }

    /// Whether supervision is on.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Sets the server to reconnect to.
    pub fn set_target(&self, server: ServerConfig) {
        *self.target.lock().unwrap_or_else(|e| e.into_inner()) = Some(server);
    }

    /// The server reconnects go to.
    pub fn target(&self) -> Option<ServerConfig> {
        self.target
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Consecutive failed rounds.
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Backoff for a round after `failures` failed rounds.
    pub fn backoff(&self, failures: u32) -> Duration {
        let base = u64::from(self.config.base_backoff_ms);
        let max = u64::from(self.config.max_backoff_ms);
        let factor = 1u64.checked_shl(failures).unwrap_or(u64::MAX);
        Duration::from_millis(base.saturating_mul(factor).min(max))
    }

    /// Runs one supervision round.
    pub async fn tick(&self) -> TickOutcome {
        if !self.is_enabled() {
            return TickOutcome::Disabled;
        }
        if !self.network.is_network_up() {
            self.failures.store(0, Ordering::SeqCst);
            return TickOutcome::NetworkDown;
        }
        let Some(server) = self.target().filter(ServerConfig::is_configured) else {
            return TickOutcome::NoTarget;
        };
        if self.primary.is_connected() && self.secondary.is_connected() {
            if self.failures.swap(0, Ordering::SeqCst) > 0 {
                tracing::info!("all connections restored");
            }
            return TickOutcome::Healthy;
        }

        let failures = self.failures();
        let backoff = self.backoff(failures);
        tracing::info!(
            failures,
            backoff_ms = backoff.as_millis() as u64,
            "connection down, retrying after backoff"
        );
        tokio::time::sleep(backoff).await;

        reconnect_if_down(&*self.primary, &server).await;
        reconnect_if_down(&*self.secondary, &server).await;

        let attempt = self.failures.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        TickOutcome::Retried { attempt, backoff }
    }

    /// Ticks forever on the configured check interval.
    pub async fn run(self: Arc<Self>) {
        let period = Duration::from_millis(u64::from(self.config.check_interval_ms.max(1)));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let outcome = self.tick().await;
            tracing::trace!(?outcome, "supervisor tick");
        }
    }
}

async fn reconnect_if_down<C: ManagedConnection>(conn: &C, server: &ServerConfig) {
    if conn.is_connected() {
        return;
    }
    match conn.reconnect(server).await {
        Ok(()) => tracing::info!(connection = conn.name(), host = %server.host, "reconnected"),
        Err(e) => tracing::warn!(connection = conn.name(), error = %e, "reconnect failed"),
    }
}
