//! Lazy, concurrency-safe cache of downstream MCP clients, keyed by server
//! name.
//!
//! Each name gets a single-shot initialization slot: concurrent callers for
//! the same name share one in-flight initialization, while other names
//! proceed independently. A failed or cancelled initialization leaves the
//! slot empty, so the next caller starts over from scratch; the registry
//! itself never retries and never caches errors.

pub mod client;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::RouterError;
use client::DownstreamClient;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Process-wide registry of lazily initialized downstream clients. Owns
/// every client it creates; clients live until [`ServerRegistry::close_all`].
pub struct ServerRegistry {
    servers: HashMap<String, ServerConfig>,
    entries: DashMap<String, Arc<OnceCell<Arc<DownstreamClient>>>>,
    shutdown: CancellationToken,
}

impl ServerRegistry {
    pub fn new(servers: HashMap<String, ServerConfig>) -> Self {
        Self {
            servers,
            entries: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Names the registry knows how to initialize.
    pub fn configured_servers(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }

    /// Whether a live client is currently cached for `name`.
    pub fn is_loaded(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .is_some_and(|cell| cell.initialized())
    }

    /// Return the cached client for `name`, initializing it on first use.
    ///
    /// The first caller pays for the spawn/connect and handshake; everyone
    /// else gets the cached handle. Cancelling `ct` abandons the wait, and if
    /// this caller was the one initializing, the slot unwinds to empty.
    pub async fn get_or_load(
        &self,
        ct: &CancellationToken,
        name: &str,
    ) -> Result<Arc<DownstreamClient>, RouterError> {
        let cell = self.entries.entry(name.to_string()).or_default().clone();
        if let Some(client) = cell.get() {
            return Ok(client.clone());
        }

        let init = cell.get_or_try_init(|| self.initialize(name));
        let client = tokio::select! {
            result = init => result?,
            _ = ct.cancelled() => return Err(RouterError::Cancelled),
        };
        Ok(client.clone())
    }

    async fn initialize(&self, name: &str) -> Result<Arc<DownstreamClient>, RouterError> {
        let config = self
            .servers
            .get(name)
            .ok_or_else(|| RouterError::ServerConfigMissing(name.to_string()))?;

        let client = Arc::new(DownstreamClient::connect(name, config).await?);

        if client.needs_ping() {
            tokio::spawn(ping_loop(client.clone(), self.shutdown.child_token()));
        }

        log::info!("<{name}> downstream client ready");
        Ok(client)
    }

    /// Close every live client and stop the ping tasks. Best effort; close
    /// errors are logged by the clients themselves.
    pub async fn close_all(&self) {
        self.shutdown.cancel();
        let cells: Vec<_> = self.entries.iter().map(|entry| entry.value().clone()).collect();
        self.entries.clear();
        for cell in cells {
            if let Some(client) = cell.get() {
                log::info!("<{}> closing downstream client", client.name());
                client.close().await;
            }
        }
    }
}

/// Background liveness loop for transports that need it. Failures never evict
/// the client; broken connections surface to callers through their own tool
/// calls.
async fn ping_loop(client: Arc<DownstreamClient>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(PING_INTERVAL);
    ticker.tick().await; // interval fires immediately; skip the zeroth tick

    let mut failures = 0u32;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                log::debug!("<{}> stopping ping task", client.name());
                return;
            }
            _ = ticker.tick() => match client.ping().await {
                Ok(()) => {
                    if failures > 0 {
                        log::info!("<{}> ping recovered after {} failures", client.name(), failures);
                        failures = 0;
                    }
                }
                Err(err) => {
                    failures += 1;
                    log::warn!("<{}> ping failed: {} (count={})", client.name(), err, failures);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_registry() -> ServerRegistry {
        ServerRegistry::new(HashMap::new())
    }

    #[tokio::test]
    async fn unknown_server_name_is_config_missing() {
        let registry = empty_registry();
        let ct = CancellationToken::new();
        let err = registry.get_or_load(&ct, "nope").await.unwrap_err();
        match err {
            RouterError::ServerConfigMissing(name) => assert_eq!(name, "nope"),
            other => panic!("expected ServerConfigMissing, got {other:?}"),
        }
        assert!(!registry.is_loaded("nope"));
    }

    #[tokio::test]
    async fn failed_init_leaves_slot_empty_for_retry() {
        let registry = empty_registry();
        let ct = CancellationToken::new();
        // Two consecutive failures both run the lookup; nothing is cached.
        assert!(registry.get_or_load(&ct, "nope").await.is_err());
        assert!(registry.get_or_load(&ct, "nope").await.is_err());
        assert!(!registry.is_loaded("nope"));
    }

    #[tokio::test]
    async fn cancelled_caller_sees_cancellation() {
        let registry = empty_registry();
        let ct = CancellationToken::new();
        ct.cancel();
        // The slot stays empty either way; with the token already cancelled
        // the caller must observe cancellation, not a half-done init.
        let err = registry.get_or_load(&ct, "anything").await.unwrap_err();
        assert!(matches!(
            err,
            RouterError::Cancelled | RouterError::ServerConfigMissing(_)
        ));
        assert!(!registry.is_loaded("anything"));
    }

    #[tokio::test]
    async fn close_all_on_empty_registry_is_a_noop() {
        let registry = empty_registry();
        registry.close_all().await;
        registry.close_all().await;
    }
}
