//! Engine: accepts mutations, sequences them, fans out the results.
//!
//! Two inbound protocols feed one canonical pipeline:
//!
//! - revision-transform submits carry an [`Operation`] against a base
//!   revision; the engine transforms it over the operations accepted since
//!   that revision and applies the result.
//! - merge updates carry an opaque CRDT blob; the engine merges it into the
//!   document's structured state and derives the canonical operation from
//!   the resulting text change.
//!
//! Either way exactly one revision is assigned per accepted mutation and the
//! accepted form is fanned out to every other subscriber of the document's
//! group. Errors caused by one connection's message go back to that
//! connection alone; the document and its other subscribers are unaffected.

use std::sync::Arc;

use yrs::updates::decoder::Decode;
use yrs::Transact;

use crate::authority::AuthorityController;
use crate::broadcast::Transport;
use crate::document::{state_text, DocPhase, DocumentId, UpdateOrigin};
use crate::lifecycle::{DocumentRegistry, EngineConfig};
use crate::ot::{diff_operation, Operation, OtError};
use crate::protocol::{ClientFrame, ConnectionId, ProtocolError, ServerEvent};

/// Engine-level failures. Message-scoped: each maps to an error event for
/// the originating connection, never to a document-wide failure.
#[derive(Debug)]
pub enum EngineError {
    /// The document was deleted moments ago and is inside its suppression
    /// window.
    SuppressedDocument(DocumentId),
    /// A frame's embedded id fields disagree with the id it arrived under.
    DocumentIdMismatch {
        expected: DocumentId,
        actual: DocumentId,
    },
    /// The base revision predates the retained history; the client must
    /// resync from full state.
    StaleRevision { base: u64, oldest_retained: u64 },
    /// The base revision is ahead of the document; the client is
    /// desynchronized and must resync from full state.
    FutureRevision { base: u64, current: u64 },
    /// The operation failed to transform or apply.
    OperationRejected(OtError),
    /// A merge update blob failed to decode or integrate.
    MalformedUpdate(String),
    /// A storage call failed or timed out.
    PersistenceFailure(String),
    /// A payload failed to encode or decode.
    Protocol(ProtocolError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SuppressedDocument(id) => {
                write!(f, "Document {id} was recently deleted; recreation suppressed")
            }
            Self::DocumentIdMismatch { expected, actual } => {
                write!(f, "Frame addressed to {actual} arrived under {expected}")
            }
            Self::StaleRevision {
                base,
                oldest_retained,
            } => write!(
                f,
                "Base revision {base} predates retained history (oldest: {oldest_retained}); resync required"
            ),
            Self::FutureRevision { base, current } => write!(
                f,
                "Base revision {base} is ahead of document revision {current}; resync required"
            ),
            Self::OperationRejected(e) => write!(f, "Operation rejected: {e}"),
            Self::MalformedUpdate(e) => write!(f, "Malformed state update: {e}"),
            Self::PersistenceFailure(e) => write!(f, "Persistence failure: {e}"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<OtError> for EngineError {
    fn from(e: OtError) -> Self {
        Self::OperationRejected(e)
    }
}

impl From<ProtocolError> for EngineError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// Result of merging a state update.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// Whether the merge changed the document text. A re-delivered update
    /// merges idempotently and reports `false`.
    pub changed: bool,
    /// The document went from empty to non-empty: the signal embedders use
    /// to treat the merge as a file creation.
    pub became_nonempty: bool,
    /// Document revision after the merge.
    pub revision: u64,
}

/// The synchronization engine.
///
/// Owns no I/O: storage goes through the registry's adapter, delivery goes
/// through the injected [`Transport`]. One instance serves every document.
pub struct SyncEngine {
    registry: Arc<DocumentRegistry>,
    transport: Arc<dyn Transport>,
    authority: Arc<AuthorityController>,
}

impl SyncEngine {
    pub fn new(
        registry: Arc<DocumentRegistry>,
        transport: Arc<dyn Transport>,
        authority: Arc<AuthorityController>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            transport,
            authority,
        })
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    pub fn authority(&self) -> &Arc<AuthorityController> {
        &self.authority
    }

    fn config(&self) -> &EngineConfig {
        self.registry.config()
    }

    /// Attach a connection to a document: load it, join its group, and send
    /// the full state so the subscriber starts from a known revision.
    pub async fn subscribe(
        &self,
        id: &DocumentId,
        conn: ConnectionId,
    ) -> Result<u64, EngineError> {
        let entry = self.registry.acquire(id, Some(conn)).await?;
        self.transport.join_group(conn, &id.group());

        let (content, revision) = {
            let doc = entry.doc.lock().await;
            (doc.content.clone(), doc.revision)
        };
        let payload = ServerEvent::document_state(id, &content, revision).encode()?;
        self.transport.send_to(conn, payload);
        log::debug!("Connection {conn} subscribed to {id} at revision {revision}");
        Ok(revision)
    }

    /// Detach a connection from a document.
    pub async fn unsubscribe(&self, id: &DocumentId, conn: ConnectionId) {
        self.transport.leave_group(conn, &id.group());
        self.registry.release(id, conn).await;
    }

    /// Tear down everything a connection held: subscriptions and any agent
    /// registrations (which force a flush of their buckets).
    pub async fn disconnect(&self, conn: ConnectionId) {
        for entry in self.registry.entries().await {
            self.transport.leave_group(conn, &entry.id.group());
            self.registry.release(&entry.id, conn).await;
        }
        for bucket in self.authority.buckets_for(conn) {
            self.unregister_agent(&bucket).await;
        }
    }

    /// Accept one revision-transform submit.
    ///
    /// Returns the accepted (transformed) operation and the revision it
    /// produced. The accepted form is broadcast to every other subscriber.
    pub async fn submit_operation(
        &self,
        id: &DocumentId,
        conn: ConnectionId,
        base_revision: u64,
        operation: Operation,
        author: uuid::Uuid,
    ) -> Result<(Operation, u64), EngineError> {
        let agent = self.authority.agent(id.bucket());

        let mut entry;
        let (accepted, revision, agent_subscribed) = loop {
            entry = self.registry.acquire(id, None).await?;
            let mut doc = entry.doc.lock().await;
            if doc.phase == DocPhase::Evicted {
                // Evicted between lookup and lock; acquire a fresh entry.
                continue;
            }
            if base_revision > doc.revision {
                return Err(EngineError::FutureRevision {
                    base: base_revision,
                    current: doc.revision,
                });
            }
            if base_revision < doc.history_base() {
                return Err(EngineError::StaleRevision {
                    base: base_revision,
                    oldest_retained: doc.history_base(),
                });
            }

            // Transform over everything accepted since the client's base.
            // The earlier-accepted operation is always the first argument,
            // which fixes the insert tie-break deterministically.
            let skip = (base_revision - doc.history_base()) as usize;
            let mut op = operation.clone();
            for accepted in doc.history.iter().skip(skip) {
                op = Operation::transform(accepted, &op)?.1;
            }

            if op.is_noop() {
                // Nothing left after transformation; no revision is spent.
                return Ok((op, doc.revision));
            }

            doc.apply_accepted(&op)?;
            doc.push_history(op.clone(), self.config().history_limit);
            doc.schedule_save(self.config().debounce, self.config().force_save_interval);

            let agent_subscribed = agent.map(|a| doc.subscribers.contains(&a)).unwrap_or(true);
            break (op, doc.revision, agent_subscribed);
        };

        let payload = ServerEvent::remote_operation(id, &accepted, author, revision).encode()?;
        self.transport
            .broadcast(&id.group(), Some(conn), payload.clone());

        // An attached agent that is not an ordinary subscriber still sees
        // every accepted mutation for its bucket.
        if let Some(agent) = agent {
            if agent != conn && !agent_subscribed {
                self.transport.send_to(agent, payload);
            }
        }

        // Agent writes bypass the debounce: the agent is authoritative and
        // its writes must be durable before it acts on them.
        if agent == Some(conn) {
            let _ = self.registry.flush_entry(&entry).await;
        }

        log::debug!("Accepted operation on {id} at revision {revision}");
        Ok((accepted, revision))
    }

    /// Merge one opaque state update into a document.
    ///
    /// The update integrates into the structured state; the canonical text
    /// change is derived from the before/after texts and assigned a revision
    /// like any other accepted mutation. Re-delivered updates merge to the
    /// same state, derive an empty change, and spend no revision.
    pub async fn apply_update(
        &self,
        id: &DocumentId,
        origin: UpdateOrigin,
        update: &[u8],
    ) -> Result<MergeOutcome, EngineError> {
        let agent = self.authority.agent(id.bucket());

        let mut entry;
        let (outcome, derived, agent_subscribed) = loop {
            let decoded = yrs::Update::decode_v1(update)
                .map_err(|e| EngineError::MalformedUpdate(e.to_string()))?;
            entry = self.registry.acquire(id, None).await?;
            let mut doc = entry.doc.lock().await;
            if doc.phase == DocPhase::Evicted {
                // Evicted between lookup and lock; acquire a fresh entry.
                continue;
            }
            let before = doc.content.clone();
            {
                let mut txn = doc.state.transact_mut();
                txn.apply_update(decoded)
                    .map_err(|e| EngineError::MalformedUpdate(e.to_string()))?;
            }
            let after = state_text(&doc.state);
            let agent_subscribed = agent.map(|a| doc.subscribers.contains(&a)).unwrap_or(true);
            if after == before {
                break (
                    MergeOutcome {
                        changed: false,
                        became_nonempty: false,
                        revision: doc.revision,
                    },
                    None,
                    agent_subscribed,
                );
            }
            let became_nonempty = before.is_empty() && !after.is_empty();
            let op = diff_operation(&before, &after);
            doc.content = after;
            doc.revision += 1;
            doc.push_history(op.clone(), self.config().history_limit);
            doc.schedule_save(self.config().debounce, self.config().force_save_interval);
            break (
                MergeOutcome {
                    changed: true,
                    became_nonempty,
                    revision: doc.revision,
                },
                Some(op),
                agent_subscribed,
            );
        };

        if let Some(op) = derived {
            // Merge-protocol peers replay the blob; revision-transform peers
            // get the derived operation. Both exclude the originator.
            let group = id.group();
            let state_payload =
                ServerEvent::state_update(id, update, origin.is_agent(), outcome.revision)
                    .encode()?;
            self.transport
                .broadcast(&group, Some(origin.connection()), state_payload);
            let op_payload =
                ServerEvent::remote_operation(id, &op, origin.connection(), outcome.revision)
                    .encode()?;
            self.transport
                .broadcast(&group, Some(origin.connection()), op_payload.clone());

            // Same forwarding rule as submits: a non-subscribing agent still
            // sees the accepted change for its bucket.
            if let Some(agent) = agent {
                if agent != origin.connection() && !agent_subscribed {
                    self.transport.send_to(agent, op_payload);
                }
            }

            if origin.is_agent() {
                let _ = self.registry.flush_entry(&entry).await;
            }
            log::debug!("Merged update into {id} at revision {}", outcome.revision);
        }
        Ok(outcome)
    }

    /// Decode and dispatch one inbound frame.
    ///
    /// All failures are reported to the originating connection only. An
    /// out-of-order base revision additionally triggers a full-state resync.
    pub async fn handle_frame(&self, conn: ConnectionId, expected: &DocumentId, payload: &[u8]) {
        let frame = match ClientFrame::decode(payload) {
            Ok(frame) => frame,
            Err(e) => {
                self.send_error(conn, &EngineError::from(e).to_string());
                return;
            }
        };

        let actual = frame.document_id();
        if actual != *expected {
            let err = EngineError::DocumentIdMismatch {
                expected: expected.clone(),
                actual,
            };
            log::warn!("{err} (connection {conn})");
            self.send_error(conn, &err.to_string());
            return;
        }

        let result = match frame {
            ClientFrame::Submit {
                base_revision,
                operation,
                author,
                ..
            } => self
                .submit_operation(expected, conn, base_revision, operation, author)
                .await
                .map(|_| ()),
            ClientFrame::Update {
                update, from_agent, ..
            } => {
                // The agent flag is only honored for the bucket's actual
                // agent connection.
                let origin = if from_agent
                    && self.authority.agent(expected.bucket()) == Some(conn)
                {
                    UpdateOrigin::Agent(conn)
                } else {
                    UpdateOrigin::Subscriber(conn)
                };
                self.apply_update(expected, origin, &update).await.map(|_| ())
            }
        };

        if let Err(e) = result {
            match &e {
                // A message for a just-deleted document is dropped, not
                // answered; the sender raced the deletion.
                EngineError::SuppressedDocument(id) => {
                    log::debug!("Dropped frame for suppressed document {id}");
                }
                // Either out-of-order direction means the client lost track
                // of the revision stream; push full state before the error.
                EngineError::StaleRevision { .. } | EngineError::FutureRevision { .. } => {
                    self.resync(conn, expected).await;
                    self.send_error(conn, &e.to_string());
                }
                _ => self.send_error(conn, &e.to_string()),
            }
        }
    }

    /// Send the current full state to one connection.
    async fn resync(&self, conn: ConnectionId, id: &DocumentId) {
        if let Some(entry) = self.registry.get(id).await {
            let (content, revision) = {
                let doc = entry.doc.lock().await;
                (doc.content.clone(), doc.revision)
            };
            if let Ok(payload) = ServerEvent::document_state(id, &content, revision).encode() {
                self.transport.send_to(conn, payload);
            }
        }
    }

    fn send_error(&self, conn: ConnectionId, message: &str) {
        if let Ok(payload) = ServerEvent::error(message).encode() {
            self.transport.send_to(conn, payload);
        }
    }

    /// Register `conn` as the authoritative agent for `bucket`.
    pub fn register_agent(&self, bucket: &str, conn: ConnectionId) {
        self.authority.register_agent(bucket, conn);
    }

    /// Drop a bucket's agent registration and flush every loaded document
    /// under it, so storage reflects everything the agent saw.
    pub async fn unregister_agent(&self, bucket: &str) -> bool {
        let removed = self.authority.unregister_agent(bucket);
        if removed {
            self.registry.flush_bucket(bucket).await;
        }
        removed
    }
}
