//! The Document collaborator, seen through the two interfaces this crate
//! consumes.
//!
//! ```text
//!                ┌────────────────────┐
//!   OpCapture ──►│ StructuralDocument │  transactions, hooks, keep marks,
//!                └─────────┬──────────┘  split / follow-redone / redo
//!                          │
//!                    ┌─────┴─────┐
//!                    │ MemoryDoc │ (reference CRDT)      YrsDoc (yrs)
//!                    └─────┬─────┘                          │
//!                          │                                │
//!                ┌─────────┴──────────┐                     │
//! SyncTransport ►│    SyncDocument    │◄────────────────────┘
//!                └────────────────────┘  state vector, diffs, update hook
//! ```
//!
//! OpCapture and the transport never talk to each other; both hang off
//! the Document's hooks.

pub mod memory;
pub mod yrs_doc;

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::DocError;
use crate::id::{PeerId, Span, SpanSet, StateVector, StructuralId};
use crate::origin::OriginTag;

pub use memory::{MemoryDoc, MemoryTxn};
pub use yrs_doc::YrsDoc;

/// Read-only view of one item inside a structural transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemView {
    /// ID of the first unit of the item.
    pub id: StructuralId,
    /// Number of units the item spans.
    pub len: u64,
    /// Name of the root type (subtree) the item lives in.
    pub root: String,
    pub deleted: bool,
    /// Where the content was re-materialised by an earlier reversal.
    pub redone: Option<StructuralId>,
}

impl ItemView {
    pub fn span(&self) -> Span {
        Span::new(self.id.clock, self.len)
    }
}

/// Summary handed to after-transaction hooks.
#[derive(Debug, Clone)]
pub struct TransactionEvent {
    pub origin: OriginTag,
    /// Per-peer clocks before the transaction.
    pub before: StateVector,
    /// Per-peer clocks after the transaction.
    pub after: StateVector,
    /// IDs deleted by the transaction.
    pub deletions: SpanSet,
    /// Root types touched by the transaction.
    pub changed_roots: BTreeSet<String>,
}

impl TransactionEvent {
    /// IDs created by the transaction.
    pub fn insertions(&self) -> SpanSet {
        SpanSet::between(&self.before, &self.after)
    }
}

pub type TransactionHandler = Arc<dyn Fn(&TransactionEvent) + Send + Sync>;

/// Called with an encoded diff and the origin of the transaction that
/// produced it.
pub type UpdateHandler = Arc<dyn Fn(&[u8], &OriginTag) + Send + Sync>;

/// Structural primitives available inside one Document transaction.
pub trait StructuralTxn {
    fn origin(&self) -> &OriginTag;

    /// Items covering `span` of `peer`, split so none extends past either
    /// edge. Ranges the Document does not know are skipped.
    fn items_in_span(&mut self, peer: PeerId, span: Span) -> Vec<ItemView>;

    /// The item starting exactly at `id`, splitting its container if needed.
    fn item_at(&mut self, id: StructuralId) -> Option<ItemView>;

    /// Follow redo links from `id` to where its content lives now.
    /// Returns the current item and the clock offset of `id` inside it.
    fn follow_redone(&mut self, id: StructuralId) -> Option<(ItemView, u64)>;

    /// Delete every unit in `span` of `peer`. Returns the number of units
    /// that were live before the call.
    fn delete_span(&mut self, peer: PeerId, span: Span) -> u64;

    /// Re-materialise the deleted item starting at `id` as new content.
    /// Returns the ID of the live copy.
    fn redo_item(&mut self, id: StructuralId) -> Option<StructuralId>;
}

/// Interface consumed by `OpCapture`.
pub trait StructuralDocument: Send + Sync + 'static {
    /// Run `f` as one atomic transaction tagged with `origin`.
    fn transact_structural(&self, origin: OriginTag, f: &mut dyn FnMut(&mut dyn StructuralTxn));

    /// Register a hook fired after every commit that changed something.
    /// Hooks run after the Document's internal lock is released.
    fn on_after_transaction(&self, handler: TransactionHandler) -> Subscription;

    /// Exclude (or re-admit) `ids` from garbage collection.
    fn set_kept(&self, ids: &SpanSet, kept: bool);

    /// The subset of `ids` whose items live under one of the `scope` roots.
    fn filter_scope(&self, ids: &SpanSet, scope: &[String]) -> SpanSet;

    /// Next expected clock of every peer the Document has seen.
    fn known_clocks(&self) -> StateVector;
}

/// Interface consumed by the sync transport.
pub trait SyncDocument: Send + Sync + 'static {
    /// Encoded state vector (sync step 1 payload).
    fn state_vector(&self) -> Vec<u8>;

    /// Everything the holder of `state_vector` is missing (step 2 payload).
    fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocError>;

    /// The whole document as one diff.
    fn encode_state(&self) -> Result<Vec<u8>, DocError>;

    /// Apply a remote diff as one transaction tagged with `origin`.
    fn apply_diff(&self, diff: &[u8], origin: OriginTag) -> Result<(), DocError>;

    /// Register a hook receiving the encoded diff of every commit.
    fn on_update(&self, handler: UpdateHandler) -> Subscription;
}

/// Keeps a hook registered; unregisters it on drop.
#[must_use = "dropping a Subscription unregisters the hook"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Unregister now instead of at drop.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Handler list shared between a Document and the subscriptions it hands out.
pub(crate) struct Observers<H> {
    inner: Arc<Mutex<ObserverList<H>>>,
}

struct ObserverList<H> {
    next_id: u64,
    handlers: Vec<(u64, H)>,
}

impl<H: Clone + Send + Sync + 'static> Observers<H> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ObserverList {
                next_id: 0,
                handlers: Vec::new(),
            })),
        }
    }

    pub(crate) fn subscribe(&self, handler: H) -> Subscription {
        let id = {
            let mut list = self.inner.lock();
            let id = list.next_id;
            list.next_id += 1;
            list.handlers.push((id, handler));
            id
        };
        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().handlers.retain(|(hid, _)| *hid != id);
            }
        })
    }

    /// Clone of the current handlers, so callers can invoke them unlocked.
    pub(crate) fn snapshot(&self) -> Vec<H> {
        self.inner.lock().handlers.iter().map(|(_, h)| h.clone()).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().handlers.is_empty()
    }
}
