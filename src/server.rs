//! WebSocket collaboration server.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (doc_id) ── SharedText ── BroadcastHub
//! Client B ──┘         │
//!                      ├── Storage (operation rows, snapshots,
//!                      │            sessions, offline queues)
//!                      │
//!           ┌──────────┼───────────┐
//!           ▼          ▼           ▼
//!        Client A   Client B    Client C
//! ```
//!
//! One task per accepted socket (see [`crate::session`]); rooms serialize
//! their own mutations, so rooms for different documents proceed fully in
//! parallel. A periodic sweep checkpoints every active room.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 8

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

use crate::auth::TokenVerifier;
use crate::presence::palette_color;
use crate::registry::RoomRegistry;
use crate::session;
use crate::storage::Storage;

/// Server configuration. Defaults match the recognized environment
/// options; see [`ServerConfig::from_env`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Op-buffer size that triggers a checkpoint
    pub snapshot_op_threshold: usize,
    /// Periodic checkpoint cadence for active rooms
    pub snapshot_interval: Duration,
    /// Client ping cadence (advertised to clients)
    pub heartbeat_interval: Duration,
    /// Stale-session cutoff
    pub heartbeat_timeout: Duration,
    /// Maximum time from connect to a successful `join_room`
    pub join_deadline: Duration,
    /// Client cursor-emit minimum interval (advertised to clients)
    pub cursor_throttle: Duration,
    /// Permitted cross-origin for the transport handshake (None = any)
    pub client_origin: Option<String>,
    /// Storage backend location, for deployments that open it from config
    pub database_url: Option<String>,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            snapshot_op_threshold: 100,
            snapshot_interval: Duration::from_millis(60_000),
            heartbeat_interval: Duration::from_millis(30_000),
            heartbeat_timeout: Duration::from_millis(90_000),
            join_deadline: Duration::from_millis(10_000),
            cursor_throttle: Duration::from_millis(100),
            client_origin: None,
            database_url: None,
            broadcast_capacity: 256,
        }
    }
}

impl ServerConfig {
    /// Build a configuration from the recognized environment options,
    /// falling back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_str("BIND_ADDR").unwrap_or(defaults.bind_addr),
            snapshot_op_threshold: env_parse("SNAPSHOT_OP_THRESHOLD")
                .unwrap_or(defaults.snapshot_op_threshold),
            snapshot_interval: env_ms("SNAPSHOT_INTERVAL_MS").unwrap_or(defaults.snapshot_interval),
            heartbeat_interval: env_ms("HEARTBEAT_INTERVAL_MS")
                .unwrap_or(defaults.heartbeat_interval),
            heartbeat_timeout: env_ms("HEARTBEAT_TIMEOUT_MS").unwrap_or(defaults.heartbeat_timeout),
            join_deadline: env_ms("JOIN_DEADLINE_MS").unwrap_or(defaults.join_deadline),
            cursor_throttle: env_ms("CURSOR_THROTTLE_MS").unwrap_or(defaults.cursor_throttle),
            client_origin: env_str("CLIENT_ORIGIN"),
            database_url: env_str("DATABASE_URL"),
            broadcast_capacity: defaults.broadcast_capacity,
        }
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_str(key)?.parse().ok()
}

fn env_ms(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

/// Server-wide statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// Shared state handed to every connection task.
pub(crate) struct ServerContext {
    pub(crate) config: ServerConfig,
    pub(crate) registry: RoomRegistry,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) verifier: Arc<dyn TokenVerifier>,
    pub(crate) stats: RwLock<ServerStats>,
    color_seq: AtomicUsize,
}

impl ServerContext {
    pub(crate) fn new(
        config: ServerConfig,
        storage: Arc<dyn Storage>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        let registry = RoomRegistry::new(
            storage.clone(),
            config.snapshot_op_threshold,
            config.broadcast_capacity,
        );
        Self {
            config,
            registry,
            storage,
            verifier,
            stats: RwLock::new(ServerStats::default()),
            color_seq: AtomicUsize::new(0),
        }
    }

    /// Next color from the fixed palette, round-robin across all joins.
    pub(crate) fn next_color(&self) -> String {
        palette_color(self.color_seq.fetch_add(1, Ordering::Relaxed)).to_string()
    }
}

/// The collaboration server.
pub struct CollabServer {
    ctx: Arc<ServerContext>,
}

impl CollabServer {
    pub fn new(
        config: ServerConfig,
        storage: Arc<dyn Storage>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        Self { ctx: Arc::new(ServerContext::new(config, storage, verifier)) }
    }

    /// Accept connections until the listener fails. Call from an async
    /// runtime; spawns one task per connection plus the checkpoint sweep.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.ctx.config.bind_addr).await?;
        log::info!("collab server listening on {}", self.ctx.config.bind_addr);

        // Periodic checkpoint of active rooms
        let sweep_ctx = self.ctx.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(sweep_ctx.config.snapshot_interval);
            tick.tick().await; // first tick fires immediately; skip it
            loop {
                tick.tick().await;
                let swept = sweep_ctx.registry.checkpoint_all().await;
                if swept > 0 {
                    log::debug!("periodic checkpoint swept {swept} rooms");
                }
            }
        });

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = session::handle_connection(stream, addr, ctx).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Checkpoint every live room and drop them (graceful shutdown).
    pub async fn shutdown(&self) {
        self.ctx.registry.shutdown().await;
        log::info!("collab server shut down");
    }

    pub async fn stats(&self) -> ServerStats {
        self.ctx.stats.read().await.clone()
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.ctx.registry
    }

    pub fn bind_addr(&self) -> &str {
        &self.ctx.config.bind_addr
    }
}
