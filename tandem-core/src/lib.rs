//! # tandem-core — Structural IDs, Document interfaces and reversible capture
//!
//! ## Architecture
//!
//! ```text
//!  editor ──► Document transaction ──┬──► OpCapture (tracked origins only)
//!                                    │      └─ CaptureLog ─► OpStore
//!                                    │
//!                                    └──► update hook ──► tandem-collab transport
//! ```
//!
//! ## Modules
//!
//! - [`id`] — `StructuralId`, `SpanSet`, `StateVector`
//! - [`origin`] — transaction origin tags and their persisted codec
//! - [`doc`] — Document traits, the reference `MemoryDoc`, the `yrs` adapter
//! - [`capture`] — `OpCapture`: coalescing, non-LIFO reversal, keep marks, persistence
//! - [`clock`] — millisecond clocks
//! - [`registry`] — teardown auditing
//! - [`error`] — error types

pub mod capture;
pub mod clock;
pub mod doc;
pub mod error;
pub mod id;
pub mod origin;
pub mod registry;

pub use capture::{
    CaptureConfig, CapturedOp, EntryId, LogMark, MemoryOpStore, OpCapture, OpCaptureBuilder,
    OpStore, StoreKey,
};
pub use doc::{
    ItemView, MemoryDoc, StructuralDocument, StructuralTxn, Subscription, SyncDocument,
    TransactionEvent, YrsDoc,
};
pub use error::{CaptureError, DocError, StoreError};
pub use id::{PeerId, Span, SpanSet, StateVector, StructuralId};
pub use origin::{BincodeOriginCodec, OriginCodec, OriginTag};
pub use registry::{ObservableRegistry, RegistryGuard, TeardownError};
