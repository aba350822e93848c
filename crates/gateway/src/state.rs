//! Shared application state for the gateway.

use std::sync::Arc;

use ta_adapters::breaker::BreakerAdapter;
use ta_adapters::traits::ActionAdapter;
use ta_adapters::BoardAdapter;
use ta_domain::config::Config;
use ta_engine::checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
use ta_engine::{CancelMap, Engine};
use ta_providers::registry::ProviderRegistry;

use crate::session_lock::SessionLockMap;

/// Shared application state passed to all API handlers.
///
/// Fields are grouped by concern:
/// - **Core services** — config, LLM providers, the engine
/// - **Run management** — cancel map, session locks
/// - **Security** — API token hash (computed once at startup)
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────
    pub config: Arc<Config>,
    pub llm: Arc<ProviderRegistry>,
    pub engine: Arc<Engine>,

    // ── Run management ────────────────────────────────────────────
    pub cancel_map: Arc<CancelMap>,
    pub session_locks: Arc<SessionLockMap>,
    pub checkpoints: Arc<dyn CheckpointStore>,

    // ── Security (startup-computed) ───────────────────────────────
    /// SHA-256 of the API bearer token. `None` = dev mode, no auth.
    pub api_token_hash: Option<Vec<u8>>,
}

impl AppState {
    /// Build the full state from config. `demo` attaches the in-memory
    /// board backend behind a circuit breaker.
    pub fn build(config: Arc<Config>, demo: bool) -> anyhow::Result<Self> {
        let llm = Arc::new(ProviderRegistry::from_config(&config.llm)?);
        let provider = llm
            .default_provider()
            .ok_or_else(|| anyhow::anyhow!("no usable LLM provider configured"))?;

        let adapter: Option<Arc<dyn ActionAdapter>> = if demo {
            Some(Arc::new(BreakerAdapter::new(
                BoardAdapter::new(),
                &config.breaker,
            )))
        } else {
            None
        };

        let checkpoints: Arc<dyn CheckpointStore> = match &config.checkpoint.dir {
            Some(dir) => Arc::new(FileCheckpointStore::new(dir)?),
            None => Arc::new(MemoryCheckpointStore::new()),
        };

        let cancel_map = Arc::new(CancelMap::new());
        let engine = Arc::new(
            Engine::new(provider, adapter, config.clone(), cancel_map.clone())
                .with_checkpoints(checkpoints.clone()),
        );

        let api_token_hash = config.server.api_token.as_deref().map(|token| {
            use sha2::{Digest, Sha256};
            Sha256::digest(token.as_bytes()).to_vec()
        });
        if api_token_hash.is_none() {
            tracing::warn!("no api_token configured; running without auth");
        }

        Ok(Self {
            config,
            llm,
            engine,
            cancel_map,
            session_locks: Arc::new(SessionLockMap::new()),
            checkpoints,
            api_token_hash,
        })
    }
}
