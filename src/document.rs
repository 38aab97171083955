//! Document identity and in-memory synchronization state.
//!
//! A [`Document`] is one unit of synchronization: the authoritative text,
//! a monotonically increasing revision counter, a bounded history of applied
//! operations for transform-on-conflict, and a mirrored `yrs` state used for
//! structured persistence and CRDT merge.
//!
//! The mirrored state is kept convergent with `content` after every accepted
//! mutation, so persistence and reconciliation always observe a single
//! document truth.

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{GetString, ReadTxn, StateVector, Text, Transact, WriteTxn};

use crate::ot::{Operation, OpSeg, OtError};
use crate::protocol::ConnectionId;

/// Fixed namespace for deterministic document id derivation.
const ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x7a, 0x1e, 0x4c, 0x90, 0x5b, 0x2d, 0x4f, 0x08, 0x9c, 0x31, 0xd6, 0x4e, 0x82, 0x0a, 0x5f,
    0x17,
]);

/// Name of the text root inside the mirrored yrs state.
const TEXT_ROOT: &str = "content";

/// Deterministic key for one synchronized file.
///
/// Two ids are equal iff (environment, bucket, path) are equal. The id also
/// names the broadcast group, so the environment tag is mandatory: without
/// it, two deployments sharing a transport would bleed events into each
/// other's sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId {
    environment: String,
    bucket: String,
    path: String,
}

impl DocumentId {
    pub fn new(
        environment: impl Into<String>,
        bucket: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            environment: environment.into(),
            bucket: bucket.into(),
            path: path.into(),
        }
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Compact deterministic UUID (v5) over the id fields.
    ///
    /// Fields are joined with a unit separator so ("a:b", "c") and
    /// ("a", "b:c") cannot collide.
    pub fn uuid(&self) -> Uuid {
        let mut name = Vec::with_capacity(
            self.environment.len() + self.bucket.len() + self.path.len() + 2,
        );
        name.extend_from_slice(self.environment.as_bytes());
        name.push(0x1f);
        name.extend_from_slice(self.bucket.as_bytes());
        name.push(0x1f);
        name.extend_from_slice(self.path.as_bytes());
        Uuid::new_v5(&ID_NAMESPACE, &name)
    }

    /// Broadcast group name for this document.
    pub fn group(&self) -> String {
        format!("doc:{}:{}:{}", self.environment, self.bucket, self.path)
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.environment, self.bucket, self.path)
    }
}

/// Which side is ground truth for a bucket's files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthorityMode {
    /// Persisted storage is authoritative (no agent attached).
    #[default]
    StorageAuthoritative,
    /// An external agent is attached and authoritative.
    AgentAuthoritative,
}

/// Lifecycle phase of an in-memory document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocPhase {
    /// At least one subscriber is attached.
    Active,
    /// Zero subscribers; evicted when `until` passes unless re-acquired.
    GracePeriod { until: Instant },
    /// Removed from the registry; entry is dead.
    Evicted,
}

/// Origin tag for a merge-based update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Ordinary subscriber connection.
    Subscriber(ConnectionId),
    /// The bucket's privileged agent.
    Agent(ConnectionId),
}

impl UpdateOrigin {
    pub fn connection(&self) -> ConnectionId {
        match self {
            UpdateOrigin::Subscriber(c) | UpdateOrigin::Agent(c) => *c,
        }
    }

    pub fn is_agent(&self) -> bool {
        matches!(self, UpdateOrigin::Agent(_))
    }
}

/// One in-memory unit of synchronization.
pub struct Document {
    pub id: DocumentId,
    /// Authoritative text. Operation indices count scalar values.
    pub content: String,
    /// Incremented by exactly 1 per accepted mutation; never reused.
    pub revision: u64,
    /// Applied operations since the oldest retained revision. `history[i]`
    /// moved the document from revision `history_base() + i` to `+ i + 1`.
    pub history: VecDeque<Operation>,
    /// Mirrored structured state (single text root), kept convergent with
    /// `content`.
    pub state: yrs::Doc,
    /// Connections currently attached via the transport boundary.
    pub subscribers: HashSet<ConnectionId>,
    pub phase: DocPhase,

    pub dirty: bool,
    pub pending_save_deadline: Option<Instant>,
    pub force_save_deadline: Option<Instant>,
    pub last_saved_at: Instant,
    pub updates_since_snapshot: u32,
    /// State vector at the last successful save; incremental saves encode a
    /// diff against it.
    pub last_saved_state_vector: Option<Vec<u8>>,
}

impl Document {
    /// New empty document at revision 0.
    pub fn new(id: DocumentId) -> Self {
        Self::from_parts(id, String::new(), yrs::Doc::new())
    }

    /// Build from reconciled content and structured state.
    pub fn from_parts(id: DocumentId, content: String, state: yrs::Doc) -> Self {
        Self {
            id,
            content,
            revision: 0,
            history: VecDeque::new(),
            state,
            subscribers: HashSet::new(),
            phase: DocPhase::Active,
            dirty: false,
            pending_save_deadline: None,
            force_save_deadline: None,
            last_saved_at: Instant::now(),
            updates_since_snapshot: 0,
            last_saved_state_vector: None,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Revision of the oldest operation still retained in history.
    pub fn history_base(&self) -> u64 {
        self.revision - self.history.len() as u64
    }

    /// Record an accepted operation, bounding history to `limit`.
    pub fn push_history(&mut self, op: Operation, limit: usize) {
        self.history.push_back(op);
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }

    /// Apply an accepted operation to both the text and the mirrored state.
    ///
    /// The operation must already be transformed against any newer history;
    /// this only validates the base length.
    pub fn apply_accepted(&mut self, op: &Operation) -> Result<(), OtError> {
        let new_content = op.apply(&self.content)?;
        mirror_operation(&self.state, &self.content, op);
        self.content = new_content;
        self.revision += 1;
        Ok(())
    }

    /// Arm the save deadlines after a mutation. The debounce deadline is
    /// replaced on every call; the forced deadline is armed once and holds
    /// until the next successful flush, bounding data loss under continuous
    /// mutation.
    pub fn schedule_save(&mut self, debounce: Duration, force_interval: Duration) {
        let now = Instant::now();
        self.dirty = true;
        self.pending_save_deadline = Some(now + debounce);
        if self.force_save_deadline.is_none() {
            self.force_save_deadline = Some(now + force_interval);
        }
        self.updates_since_snapshot += 1;
    }

    /// Clear save bookkeeping after a successful flush.
    pub fn note_saved(&mut self, wrote_snapshot: bool) {
        self.dirty = false;
        self.pending_save_deadline = None;
        self.force_save_deadline = None;
        self.last_saved_at = Instant::now();
        if wrote_snapshot {
            self.updates_since_snapshot = 0;
        }
        self.last_saved_state_vector = Some(state_vector(&self.state));
    }

    /// Earliest armed save deadline, if any.
    pub fn save_deadline(&self) -> Option<Instant> {
        match (self.pending_save_deadline, self.force_save_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Full structured state as a yrs v1 update blob.
    pub fn encode_full_state(&self) -> Vec<u8> {
        let txn = self.state.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Incremental state since the last save, or the full state when no
    /// save has happened yet.
    pub fn encode_state_since_last_save(&self) -> Vec<u8> {
        match &self.last_saved_state_vector {
            Some(sv_bytes) => match StateVector::decode_v1(sv_bytes) {
                Ok(sv) => {
                    let txn = self.state.transact();
                    txn.encode_diff_v1(&sv)
                }
                Err(_) => self.encode_full_state(),
            },
            None => self.encode_full_state(),
        }
    }
}

/// Derived text of a structured state.
pub fn state_text(state: &yrs::Doc) -> String {
    let txn = state.transact();
    txn.get_text(TEXT_ROOT)
        .map(|t| t.get_string(&txn))
        .unwrap_or_default()
}

/// Synthesize a fresh structured state from plain text.
pub fn state_from_text(text: &str) -> yrs::Doc {
    let doc = yrs::Doc::new();
    if !text.is_empty() {
        let mut txn = doc.transact_mut();
        let root = txn.get_or_insert_text(TEXT_ROOT);
        root.insert(&mut txn, 0, text);
    }
    doc
}

/// Decode a persisted state blob into a structured state.
pub fn state_from_blob(blob: &[u8]) -> Result<yrs::Doc, String> {
    let doc = yrs::Doc::new();
    let update = yrs::Update::decode_v1(blob).map_err(|e| e.to_string())?;
    {
        let mut txn = doc.transact_mut();
        txn.apply_update(update).map_err(|e| e.to_string())?;
    }
    Ok(doc)
}

/// Encoded state vector of a structured state.
pub fn state_vector(state: &yrs::Doc) -> Vec<u8> {
    let txn = state.transact();
    txn.state_vector().encode_v1()
}

/// Replay an operation into the mirrored yrs text.
///
/// `before` is the text prior to the operation; yrs text indices are byte
/// offsets, so segment positions (scalar values) are converted as the walk
/// advances.
fn mirror_operation(state: &yrs::Doc, before: &str, op: &Operation) {
    let mut txn = state.transact_mut();
    let root = txn.get_or_insert_text(TEXT_ROOT);

    let mut current = before.to_string();
    let mut byte_pos = 0usize;
    for seg in op.segments() {
        match seg {
            OpSeg::Retain(n) => {
                byte_pos += byte_len_of_chars(&current[byte_pos..], *n);
            }
            OpSeg::Insert(text) => {
                root.insert(&mut txn, byte_pos as u32, text);
                current.insert_str(byte_pos, text);
                byte_pos += text.len();
            }
            OpSeg::Delete(n) => {
                let byte_len = byte_len_of_chars(&current[byte_pos..], *n);
                root.remove_range(&mut txn, byte_pos as u32, byte_len as u32);
                current.replace_range(byte_pos..byte_pos + byte_len, "");
            }
        }
    }
}

/// Byte length of the first `n` scalar values of `s`.
fn byte_len_of_chars(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}
