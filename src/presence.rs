//! Cursor and presence tracking for room members.
//!
//! The server stamps each cursor event with the owning session's identity
//! and fans it out to the other members; clients keep a [`CursorTracker`]
//! of remote cursors for rendering. Cursor emission is throttled on the
//! client side; the server re-emits at whatever rate it receives.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::{ClientId, CursorPayload, UserId};

/// Fixed palette cursors are assigned from, round-robin per join.
pub const CURSOR_PALETTE: [&str; 8] = [
    "#e06c75", "#61afef", "#98c379", "#c678dd", "#e5c07b", "#56b6c2", "#d19a66", "#abb2bf",
];

/// Color for the n-th admitted session.
pub fn palette_color(seq: usize) -> &'static str {
    CURSOR_PALETTE[seq % CURSOR_PALETTE.len()]
}

/// A member's cursor within the shared text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    /// Character offset
    pub position: u32,
    /// Selected range `(anchor, head)`, if any
    pub selection: Option<(u32, u32)>,
}

/// A remote peer's cursor as tracked by a client.
#[derive(Debug, Clone)]
pub struct RemoteCursor {
    pub client_id: ClientId,
    pub user_id: Option<UserId>,
    pub name: Option<String>,
    pub color: Option<String>,
    pub cursor: CursorState,
    last_update: Instant,
}

impl RemoteCursor {
    pub fn time_since_update(&self) -> Duration {
        self.last_update.elapsed()
    }
}

/// Tracks remote cursors for one document, last-writer-wins per client.
///
/// Peers that stop emitting are pruned after `idle_timeout`; a clean
/// `user_left` removes them immediately.
pub struct CursorTracker {
    cursors: HashMap<ClientId, RemoteCursor>,
    idle_timeout: Duration,
}

impl CursorTracker {
    pub fn new(idle_timeout: Duration) -> Self {
        Self { cursors: HashMap::new(), idle_timeout }
    }

    /// Record a cursor event from a remote peer.
    pub fn apply(&mut self, client_id: &str, payload: &CursorPayload) {
        let cursor = CursorState { position: payload.position, selection: payload.selection };
        match self.cursors.get_mut(client_id) {
            Some(remote) => {
                remote.cursor = cursor;
                remote.last_update = Instant::now();
                // Identity fields only ever refine; the server stamps them
                if payload.user_id.is_some() {
                    remote.user_id = payload.user_id;
                }
                if payload.color.is_some() {
                    remote.color = payload.color.clone();
                }
                if payload.name.is_some() {
                    remote.name = payload.name.clone();
                }
            }
            None => {
                self.cursors.insert(
                    client_id.to_string(),
                    RemoteCursor {
                        client_id: client_id.to_string(),
                        user_id: payload.user_id,
                        name: payload.name.clone(),
                        color: payload.color.clone(),
                        cursor,
                        last_update: Instant::now(),
                    },
                );
            }
        }
    }

    /// Drop a peer's cursor (clean leave).
    pub fn remove(&mut self, client_id: &str) -> Option<RemoteCursor> {
        self.cursors.remove(client_id)
    }

    /// Drop cursors that have gone silent. Returns the pruned client ids.
    pub fn prune_idle(&mut self) -> Vec<ClientId> {
        let timeout = self.idle_timeout;
        let stale: Vec<ClientId> = self
            .cursors
            .values()
            .filter(|c| c.time_since_update() > timeout)
            .map(|c| c.client_id.clone())
            .collect();
        for id in &stale {
            self.cursors.remove(id);
        }
        stale
    }

    pub fn get(&self, client_id: &str) -> Option<&RemoteCursor> {
        self.cursors.get(client_id)
    }

    pub fn cursors(&self) -> impl Iterator<Item = &RemoteCursor> {
        self.cursors.values()
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

/// Client-side cursor emission limiter (default minimum interval 100 ms).
///
/// The first emission is always allowed; afterwards emissions inside the
/// interval are suppressed and the caller keeps its latest state local.
pub struct CursorThrottle {
    min_interval: Duration,
    last_emit: Option<Instant>,
}

impl CursorThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval, last_emit: None }
    }

    /// Whether an emission is allowed now; records the emission if so.
    pub fn should_emit(&mut self) -> bool {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}
