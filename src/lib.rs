//! # tandem-sync — Collaborative document synchronization engine
//!
//! Keeps a set of text documents convergent across concurrent editors and
//! durable against blob storage. Transport-agnostic: embedders bridge any
//! wire protocol to the [`broadcast::Transport`] boundary and feed inbound
//! frames to the [`engine::SyncEngine`].
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ClientFrame    ┌─────────────┐
//! │ Subscriber │ ◄──────────────► │ SyncEngine  │
//! │ (per conn) │   ServerEvent    │ (sequencer) │
//! └────────────┘                  └──────┬──────┘
//!                                        │
//!                         ┌──────────────┼──────────────┐
//!                         ▼              ▼              ▼
//!                  ┌────────────┐ ┌────────────┐ ┌────────────┐
//!                  │ Transport  │ │ Document   │ │ Authority  │
//!                  │ (fan-out)  │ │ Registry   │ │ Controller │
//!                  └────────────┘ └──────┬─────┘ └────────────┘
//!                                        │ debounced saves,
//!                                        │ grace eviction
//!                                        ▼
//!                                 ┌────────────┐
//!                                 │ BlobStore  │
//!                                 │ (rocksdb)  │
//!                                 └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`ot`] — retain/insert/delete operations: apply, compose, transform
//! - [`document`] — document identity, in-memory document, mirrored state
//! - [`protocol`] — bincode wire payloads crossing the transport boundary
//! - [`broadcast`] — group fan-out boundary and in-process implementation
//! - [`engine`] — mutation acceptance, sequencing, and fan-out
//! - [`lifecycle`] — registry, cold-load reconciliation, saves, eviction
//! - [`authority`] — per-bucket agent registration and authority mode
//! - [`storage`] — persistence adapter contract and backends

pub mod authority;
pub mod broadcast;
pub mod document;
pub mod engine;
pub mod lifecycle;
pub mod ot;
pub mod protocol;
pub mod storage;

pub use authority::AuthorityController;
pub use broadcast::{ChannelTransport, Transport, TransportStats};
pub use document::{AuthorityMode, DocPhase, Document, DocumentId, UpdateOrigin};
pub use engine::{EngineError, MergeOutcome, SyncEngine};
pub use lifecycle::{DocEntry, DocumentRegistry, EngineConfig};
pub use ot::{diff_operation, OpSeg, Operation, OtError};
pub use protocol::{ClientFrame, ConnectionId, ProtocolError, ServerEvent};
pub use storage::{BlobStore, MemoryAdapter, PersistenceAdapter, StoreConfig, StoreError};
