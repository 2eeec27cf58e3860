use std::{sync::Arc, time::Instant};

use {
    chatrelay_agents::LlmProvider, chatrelay_config::ChatRelayConfig,
    chatrelay_sessions::SessionStore,
};

use crate::relay::{RelayOptions, RelayRegistry};

// ── Gateway state ────────────────────────────────────────────────────────────

/// Shared gateway runtime state, wrapped in Arc for use across async tasks.
pub struct GatewayState {
    /// Open per-session hand-off channels.
    pub relay: Arc<RelayRegistry>,
    /// Conversation logs, keyed by session id.
    pub sessions: SessionStore,
    /// Produces the streamed text for each request.
    pub provider: Arc<dyn LlmProvider>,
    pub config: ChatRelayConfig,
    /// Server version string.
    pub version: String,
    pub started_at: Instant,
}

impl GatewayState {
    pub fn new(config: ChatRelayConfig, provider: Arc<dyn LlmProvider>) -> Arc<Self> {
        let relay = RelayRegistry::new(RelayOptions::from(&config.relay));
        Self::with_relay(config, provider, relay)
    }

    /// Build state around an existing registry (tests use short heartbeats).
    pub fn with_relay(
        config: ChatRelayConfig,
        provider: Arc<dyn LlmProvider>,
        relay: Arc<RelayRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            relay,
            sessions: SessionStore::new(),
            provider,
            config,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Instant::now(),
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
