//! Per-bucket authority mode: storage vs. attached agent as ground truth.
//!
//! A bucket defaults to [`AuthorityMode::StorageAuthoritative`] (the
//! persisted file wins). When a privileged automated agent attaches, the
//! bucket flips to agent-authoritative: the agent's own mutations are
//! persisted immediately so a concurrent storage reader never observes a
//! stale file, while ordinary subscribers keep the normal debounce. When
//! the agent detaches, every loaded document under the bucket is force
//! flushed so storage reflects the last agent-confirmed state before any
//! storage-authoritative consumer reads it.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::document::AuthorityMode;
use crate::protocol::ConnectionId;

/// Tracks which buckets have an agent attached and on which channel.
#[derive(Default)]
pub struct AuthorityController {
    agents: RwLock<HashMap<String, ConnectionId>>,
}

impl AuthorityController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an agent to a bucket. Idempotent: re-registering the same
    /// bucket replaces the agent channel without other effect.
    pub fn register_agent(&self, bucket: &str, conn: ConnectionId) {
        let mut agents = self.agents.write().expect("authority lock poisoned");
        let previous = agents.insert(bucket.to_string(), conn);
        match previous {
            Some(old) if old != conn => {
                log::info!("Agent for bucket {bucket} replaced ({old} -> {conn})");
            }
            Some(_) => {}
            None => log::info!("Agent registered for bucket {bucket}, now agent-authoritative"),
        }
    }

    /// Detach a bucket's agent. Returns true when an agent was attached.
    /// The caller must force flush the bucket's documents afterwards.
    pub fn unregister_agent(&self, bucket: &str) -> bool {
        let removed = self
            .agents
            .write()
            .expect("authority lock poisoned")
            .remove(bucket)
            .is_some();
        if removed {
            log::info!("Agent unregistered for bucket {bucket}, back to storage-authoritative");
        }
        removed
    }

    pub fn mode(&self, bucket: &str) -> AuthorityMode {
        if self
            .agents
            .read()
            .expect("authority lock poisoned")
            .contains_key(bucket)
        {
            AuthorityMode::AgentAuthoritative
        } else {
            AuthorityMode::StorageAuthoritative
        }
    }

    /// The agent's private channel for a bucket, if one is attached.
    pub fn agent(&self, bucket: &str) -> Option<ConnectionId> {
        self.agents
            .read()
            .expect("authority lock poisoned")
            .get(bucket)
            .copied()
    }

    /// Buckets for which `conn` is the registered agent. Used on disconnect
    /// to tear down every registration the connection held.
    pub fn buckets_for(&self, conn: ConnectionId) -> Vec<String> {
        self.agents
            .read()
            .expect("authority lock poisoned")
            .iter()
            .filter(|(_, c)| **c == conn)
            .map(|(b, _)| b.clone())
            .collect()
    }
}
