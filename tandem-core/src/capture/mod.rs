//! Reversible operation capture.
//!
//! ```text
//!  Document commit ──► after-transaction hook ──► OpCapture::on_transaction
//!                                                   │  origin tracked? scope touched?
//!                                                   ▼
//!                               ┌───────────── CaptureLog ─────────────┐
//!                               │ [op#0] [op#1] [op#2 ◄─ coalescing]   │
//!                               │ KeepTable: tombstone → refcount      │──► Document::set_kept
//!                               └──────────────────────────────────────┘
//!                                                   │ append / update / remove
//!                                                   ▼
//!                                          PersistQueue ──► OpStore
//! ```
//!
//! `reverse` undoes any subset of entries in one Document transaction:
//! the deletions of each entry are redone, then the content it inserted
//! (followed through redo links) is deleted. Entries are processed newest
//! first and need not be contiguous or the latest ones.
//!
//! Lock order is always log, then Document. The log lock is never held
//! across a Document transaction, because the after-transaction hook
//! takes it.

mod entry;
mod keep;
mod store;

pub use entry::{CapturedOp, EntryId, LogMark};
pub use store::{MemoryOpStore, OpStore, StoreKey};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::doc::{ItemView, StructuralDocument, StructuralTxn, Subscription, TransactionEvent};
use crate::error::CaptureError;
use crate::id::{SpanSet, StateVector, StructuralId};
use crate::origin::{BincodeOriginCodec, OriginCodec, OriginTag};
use crate::registry::{ObservableRegistry, RegistryGuard};
use keep::KeepTable;
use store::PersistQueue;

/// Decides whether reversal may touch an item. Returning `false` leaves
/// the item as it is.
pub type DeleteFilter = Arc<dyn Fn(&ItemView) -> bool + Send + Sync>;

/// What to capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Root types whose edits are captured and may be reversed.
    pub scope: Vec<String>,
    /// Only transactions with one of these origins are captured.
    pub tracked_origins: HashSet<OriginTag>,
    /// Same-origin commits closer together than this merge into one entry.
    /// Zero disables coalescing.
    pub capture_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            scope: Vec::new(),
            tracked_origins: HashSet::from([OriginTag::Local]),
            capture_timeout: Duration::ZERO,
        }
    }
}

impl CaptureConfig {
    pub fn new<I, S>(scope: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scope: scope.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_tracked_origin(mut self, origin: OriginTag) -> Self {
        self.tracked_origins.insert(origin);
        self
    }

    pub fn with_capture_timeout(mut self, timeout: Duration) -> Self {
        self.capture_timeout = timeout;
        self
    }
}

struct CaptureLog {
    /// Oldest first.
    entries: Vec<CapturedOp>,
    keeps: KeepTable,
    tracked: HashSet<OriginTag>,
    next_id: u64,
    seq: u64,
    /// Millis of the last capture; `None` forbids coalescing the next one.
    last_change: Option<u64>,
    destroyed: bool,
}

impl CaptureLog {
    fn new(tracked: HashSet<OriginTag>) -> Self {
        Self {
            entries: Vec::new(),
            keeps: KeepTable::new(),
            tracked,
            next_id: 0,
            seq: 0,
            last_change: None,
            destroyed: false,
        }
    }

    fn take_where(&mut self, mut pred: impl FnMut(&CapturedOp) -> bool) -> Vec<CapturedOp> {
        let (taken, rest): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.entries).into_iter().partition(|e| pred(e));
        self.entries = rest;
        if !taken.is_empty() {
            self.last_change = None;
        }
        taken
    }
}

struct Inner<D> {
    doc: Weak<D>,
    scope: Vec<String>,
    timeout_ms: u64,
    log: Mutex<CaptureLog>,
    suppressed: AtomicBool,
    delete_filter: Option<DeleteFilter>,
    clock: Arc<dyn Clock>,
    codec: Arc<dyn OriginCodec>,
    persist: Option<PersistQueue>,
}

impl<D: StructuralDocument> Inner<D> {
    fn on_transaction(&self, event: &TransactionEvent) {
        if self.suppressed.load(Ordering::SeqCst) || event.origin == OriginTag::Reversal {
            return;
        }
        if !event.changed_roots.iter().any(|root| self.scope.contains(root)) {
            return;
        }
        let Some(doc) = self.doc.upgrade() else {
            return;
        };
        let insertions = event.insertions();
        let now = self.clock.now_millis();

        let mut guard = self.log.lock();
        let log = &mut *guard;
        if log.destroyed || !log.tracked.contains(&event.origin) {
            return;
        }
        let scoped_deletions = doc.filter_scope(&event.deletions, &self.scope);
        log.seq += 1;
        let seq = log.seq;
        let coalesce = log
            .last_change
            .is_some_and(|last| now.saturating_sub(last) < self.timeout_ms)
            && log.entries.last().is_some_and(|last| last.origin == event.origin);
        log.last_change = Some(now);

        let newly_kept = if coalesce {
            let Some(entry) = log.entries.last_mut() else {
                return;
            };
            entry.insertions.merge(&insertions);
            entry.deletions.merge(&event.deletions);
            entry.timestamp = now;
            entry.seq = seq;
            let fresh = scoped_deletions.difference(&entry.kept);
            entry.kept.merge(&fresh);
            log.keeps.acquire(&fresh)
        } else {
            let id = EntryId(log.next_id);
            log.next_id += 1;
            let newly = log.keeps.acquire(&scoped_deletions);
            log.entries.push(CapturedOp {
                id,
                insertions,
                deletions: event.deletions.clone(),
                origin: event.origin.clone(),
                timestamp: now,
                meta: Default::default(),
                seq,
                kept: scoped_deletions,
                retired: SpanSet::new(),
                storage_key: None,
            });
            newly
        };
        if !newly_kept.is_empty() {
            doc.set_kept(&newly_kept, true);
        }

        let Some(entry) = log.entries.last() else {
            return;
        };
        log::debug!(
            "{} {} ({} inserted, {} deleted, origin {})",
            if coalesce { "Coalesced into" } else { "Captured" },
            entry.id,
            entry.insertions.len(),
            entry.deletions.len(),
            entry.origin
        );
        if let Some(persist) = &self.persist {
            match entry.encode(&*self.codec) {
                Ok(bytes) if coalesce => persist.update(entry.id, bytes),
                Ok(bytes) => persist.append(entry.id, bytes),
                Err(e) => log::error!("Failed to encode {} for persistence: {e}", entry.id),
            }
        }
    }

    /// Content inserted by `reversed` is gone for good: remaining entries
    /// that deleted part of it must not redo that part.
    fn retire(&self, log: &mut CaptureLog, reversed: &[CapturedOp]) {
        let mut inserted = SpanSet::new();
        for entry in reversed {
            inserted.merge(&entry.insertions);
        }
        for entry in log.entries.iter_mut() {
            let gone = entry
                .deletions
                .intersection(&inserted)
                .difference(&entry.retired);
            if gone.is_empty() {
                continue;
            }
            entry.retired.merge(&gone);
            log::debug!("{} retired {} deleted units", entry.id, gone.len());
            if let Some(persist) = &self.persist {
                match entry.encode(&*self.codec) {
                    Ok(bytes) => persist.update(entry.id, bytes),
                    Err(e) => log::error!("Failed to encode {} for persistence: {e}", entry.id),
                }
            }
        }
    }

    /// Drop the keep references held by `removed`.
    fn release(&self, log: &mut CaptureLog, removed: &[CapturedOp]) {
        let mut freed = SpanSet::new();
        for entry in removed {
            freed.merge(&log.keeps.release(&entry.kept));
        }
        if freed.is_empty() {
            return;
        }
        if let Some(doc) = self.doc.upgrade() {
            doc.set_kept(&freed, false);
        }
    }

    fn forget(&self, removed: &[CapturedOp]) {
        if let Some(persist) = &self.persist {
            persist.remove(removed.iter().map(|e| e.id).collect());
        }
    }

    fn snapshot(&self, entry: &CapturedOp) -> CapturedOp {
        let mut entry = entry.clone();
        if let Some(persist) = &self.persist {
            entry.storage_key = persist.key(entry.id);
        }
        entry
    }
}

/// Sets the suppress flag for its lifetime.
struct SuppressGuard<'a>(&'a AtomicBool);

impl<'a> SuppressGuard<'a> {
    fn engage(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for SuppressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Parts {
    delete_filter: Option<DeleteFilter>,
    clock: Arc<dyn Clock>,
    codec: Arc<dyn OriginCodec>,
    registry: Option<ObservableRegistry>,
}

impl Default for Parts {
    fn default() -> Self {
        Self {
            delete_filter: None,
            clock: Arc::new(SystemClock),
            codec: Arc::new(BincodeOriginCodec),
            registry: None,
        }
    }
}

/// Configures collaborators of an `OpCapture` before it attaches.
pub struct OpCaptureBuilder<D: StructuralDocument> {
    doc: Arc<D>,
    config: CaptureConfig,
    parts: Parts,
    store: Option<Arc<dyn OpStore>>,
}

impl<D: StructuralDocument> OpCaptureBuilder<D> {
    pub fn with_delete_filter(
        mut self,
        filter: impl Fn(&ItemView) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.parts.delete_filter = Some(Arc::new(filter));
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.parts.clock = clock;
        self
    }

    pub fn with_origin_codec(mut self, codec: Arc<dyn OriginCodec>) -> Self {
        self.parts.codec = codec;
        self
    }

    /// Persist entries to `store`. Requires a tokio runtime at `build()`.
    pub fn with_store(mut self, store: Arc<dyn OpStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_registry(mut self, registry: &ObservableRegistry) -> Self {
        self.parts.registry = Some(registry.clone());
        self
    }

    pub fn build(self) -> Result<OpCapture<D>, CaptureError> {
        let persist = self.store.map(PersistQueue::spawn).transpose()?;
        Ok(OpCapture::attach(self.doc, self.config, self.parts, persist))
    }
}

/// Log of reversible entries recorded from one Document.
pub struct OpCapture<D: StructuralDocument> {
    doc: Arc<D>,
    inner: Arc<Inner<D>>,
    subscription: Mutex<Option<Subscription>>,
    registration: Mutex<Option<RegistryGuard>>,
}

impl<D: StructuralDocument> OpCapture<D> {
    /// Attach with default collaborators and no persistence.
    pub fn new(doc: Arc<D>, config: CaptureConfig) -> Self {
        Self::attach(doc, config, Parts::default(), None)
    }

    pub fn builder(doc: Arc<D>, config: CaptureConfig) -> OpCaptureBuilder<D> {
        OpCaptureBuilder {
            doc,
            config,
            parts: Parts::default(),
            store: None,
        }
    }

    fn attach(
        doc: Arc<D>,
        config: CaptureConfig,
        parts: Parts,
        persist: Option<PersistQueue>,
    ) -> Self {
        let inner = Arc::new(Inner {
            doc: Arc::downgrade(&doc),
            scope: config.scope,
            timeout_ms: config.capture_timeout.as_millis() as u64,
            log: Mutex::new(CaptureLog::new(config.tracked_origins)),
            suppressed: AtomicBool::new(false),
            delete_filter: parts.delete_filter,
            clock: parts.clock,
            codec: parts.codec,
            persist,
        });
        let hook = inner.clone();
        let subscription = doc.on_after_transaction(Arc::new(move |event: &TransactionEvent| {
            hook.on_transaction(event)
        }));
        let registration = parts.registry.map(|r| r.register("op-capture"));
        log::debug!("OpCapture attached to scope {:?}", inner.scope);
        Self {
            doc,
            inner,
            subscription: Mutex::new(Some(subscription)),
            registration: Mutex::new(registration),
        }
    }

    /// Current position in the log.
    pub fn mark(&self) -> LogMark {
        LogMark(self.inner.log.lock().seq)
    }

    /// Entries created or extended after `mark`.
    pub fn since(&self, mark: LogMark) -> Vec<CapturedOp> {
        self.collect(|e| e.seq > mark.0)
    }

    pub fn by_origin(&self, origin: &OriginTag) -> Vec<CapturedOp> {
        self.collect(|e| &e.origin == origin)
    }

    pub fn since_by_origin(&self, mark: LogMark, origin: &OriginTag) -> Vec<CapturedOp> {
        self.collect(|e| e.seq > mark.0 && &e.origin == origin)
    }

    /// Every entry, oldest first.
    pub fn entries(&self) -> Vec<CapturedOp> {
        self.collect(|_| true)
    }

    pub fn entry(&self, id: EntryId) -> Option<CapturedOp> {
        self.collect(|e| e.id == id).into_iter().next()
    }

    pub fn len(&self) -> usize {
        self.inner.log.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn collect(&self, mut pred: impl FnMut(&CapturedOp) -> bool) -> Vec<CapturedOp> {
        let log = self.inner.log.lock();
        log.entries
            .iter()
            .filter(|e| pred(e))
            .map(|e| self.inner.snapshot(e))
            .collect()
    }

    /// The next capture starts a new entry even inside the timeout.
    pub fn stop_capturing(&self) {
        self.inner.log.lock().last_change = None;
    }

    pub fn add_tracked_origin(&self, origin: OriginTag) {
        self.inner.log.lock().tracked.insert(origin);
    }

    pub fn remove_tracked_origin(&self, origin: &OriginTag) -> bool {
        self.inner.log.lock().tracked.remove(origin)
    }

    pub fn tracked_origins(&self) -> HashSet<OriginTag> {
        self.inner.log.lock().tracked.clone()
    }

    /// Attach caller metadata to an entry. Returns `false` if the entry is
    /// not in the log.
    pub fn set_meta(
        &self,
        id: EntryId,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<bool, CaptureError> {
        let mut log = self.inner.log.lock();
        if log.destroyed {
            return Err(CaptureError::Destroyed);
        }
        let Some(entry) = log.entries.iter_mut().find(|e| e.id == id) else {
            return Ok(false);
        };
        entry.meta.insert(key.into(), value.into());
        if let Some(persist) = &self.inner.persist {
            persist.update(id, entry.encode(&*self.inner.codec)?);
        }
        Ok(true)
    }

    /// Undo `ids` in one Document transaction, newest first. Unknown IDs
    /// are skipped. Returns how many entries were reversed.
    pub fn reverse(&self, ids: &[EntryId]) -> Result<usize, CaptureError> {
        let wanted: HashSet<EntryId> = ids.iter().copied().collect();
        let mut targets = {
            let mut log = self.inner.log.lock();
            if log.destroyed {
                return Err(CaptureError::Destroyed);
            }
            log.take_where(|e| wanted.contains(&e.id))
        };
        if targets.len() < wanted.len() {
            log::debug!(
                "Skipping {} entries not in the log",
                wanted.len() - targets.len()
            );
        }
        if targets.is_empty() {
            return Ok(0);
        }
        targets.reverse();

        {
            let _suppress = SuppressGuard::engage(&self.inner.suppressed);
            let scope = &self.inner.scope;
            let filter = self.inner.delete_filter.as_ref();
            self.doc
                .transact_structural(OriginTag::Reversal, &mut |txn: &mut dyn StructuralTxn| {
                    for entry in &targets {
                        reverse_entry(txn, entry, scope, filter);
                    }
                });
        }

        {
            let mut log = self.inner.log.lock();
            self.inner.retire(&mut log, &targets);
            self.inner.release(&mut log, &targets);
        }
        self.inner.forget(&targets);
        log::debug!("Reversed {} entries", targets.len());
        Ok(targets.len())
    }

    /// Remove entries without touching Document content. Returns how many
    /// were in the log.
    pub fn drop(&self, ids: &[EntryId]) -> Result<usize, CaptureError> {
        let wanted: HashSet<EntryId> = ids.iter().copied().collect();
        self.remove_where(|e| wanted.contains(&e.id))
    }

    /// Drop every entry last extended before `timestamp` (millis).
    pub fn drop_before(&self, timestamp: u64) -> Result<usize, CaptureError> {
        self.remove_where(|e| e.timestamp < timestamp)
    }

    /// Drop every entry and wipe the store.
    pub fn clear(&self) -> Result<usize, CaptureError> {
        let removed = {
            let mut log = self.inner.log.lock();
            if log.destroyed {
                return Err(CaptureError::Destroyed);
            }
            let removed = log.take_where(|_| true);
            self.inner.release(&mut log, &removed);
            removed
        };
        if let Some(persist) = &self.inner.persist {
            persist.clear();
        }
        Ok(removed.len())
    }

    fn remove_where(
        &self,
        pred: impl FnMut(&CapturedOp) -> bool,
    ) -> Result<usize, CaptureError> {
        let removed = {
            let mut log = self.inner.log.lock();
            if log.destroyed {
                return Err(CaptureError::Destroyed);
            }
            let removed = log.take_where(pred);
            self.inner.release(&mut log, &removed);
            removed
        };
        self.inner.forget(&removed);
        if !removed.is_empty() {
            log::debug!("Dropped {} entries", removed.len());
        }
        Ok(removed.len())
    }

    /// Encode the whole log. Keep marks are not part of the encoding.
    pub fn serialize(&self) -> Result<Vec<u8>, CaptureError> {
        let log = self.inner.log.lock();
        let records = log
            .entries
            .iter()
            .map(|e| e.encode(&*self.inner.codec))
            .collect::<Result<Vec<_>, _>>()?;
        bincode::serde::encode_to_vec(&records, bincode::config::standard())
            .map_err(|e| CaptureError::Codec(e.to_string()))
    }

    /// Append the entries of a `serialize()` blob to the log and re-apply
    /// their keep marks. Malformed entries are skipped. Returns how many
    /// entries were restored.
    pub fn restore(&self, bytes: &[u8]) -> Result<usize, CaptureError> {
        let (records, _): (Vec<Vec<u8>>, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| CaptureError::MalformedEntry(e.to_string()))?;
        self.restore_records(records.into_iter().map(|r| (None, r)))
    }

    /// Rebuild the log from the configured store.
    pub async fn restore_from_store(&self) -> Result<usize, CaptureError> {
        let persist = self.inner.persist.as_ref().ok_or(CaptureError::NoStore)?;
        let records = persist.store().load_all().await?;
        self.restore_records(records.into_iter().map(|(key, r)| (Some(key), r)))
    }

    fn restore_records(
        &self,
        records: impl Iterator<Item = (Option<StoreKey>, Vec<u8>)>,
    ) -> Result<usize, CaptureError> {
        let mut guard = self.inner.log.lock();
        let log = &mut *guard;
        if log.destroyed {
            return Err(CaptureError::Destroyed);
        }
        let known = self.doc.known_clocks();
        let mut restored = 0;
        let mut newly_kept = SpanSet::new();
        for (key, bytes) in records {
            let id = EntryId(log.next_id);
            let mut entry =
                match CapturedOp::decode(&bytes, &*self.inner.codec, id, log.seq + 1) {
                    Ok(entry) => entry,
                    Err(e) => {
                        log::warn!("Skipping malformed persisted entry: {e}");
                        continue;
                    }
                };
            log.next_id += 1;
            log.seq += 1;
            let present = within_clocks(&entry.deletions, &known);
            let unknown = entry.deletions.len() - present.len();
            if unknown > 0 {
                log::warn!(
                    "{} deletes {unknown} units the Document has not seen; not keeping them",
                    entry.id
                );
            }
            entry.kept = self.doc.filter_scope(&present, &self.inner.scope);
            newly_kept.merge(&log.keeps.acquire(&entry.kept));
            if let (Some(key), Some(persist)) = (key, &self.inner.persist) {
                persist.adopt(id, key);
            }
            log.entries.push(entry);
            restored += 1;
        }
        log.last_change = None;
        if !newly_kept.is_empty() {
            self.doc.set_kept(&newly_kept, true);
        }
        log::debug!("Restored {restored} entries");
        Ok(restored)
    }

    /// Wait for every queued persistence write to land.
    pub async fn flush(&self) -> Result<(), CaptureError> {
        match &self.inner.persist {
            Some(persist) => persist.flush().await,
            None => Ok(()),
        }
    }

    /// Detach from the Document and release every keep mark. The durable
    /// store is left intact for a later `restore_from_store`. A second call
    /// fails.
    pub fn destroy(&self) -> Result<(), CaptureError> {
        if self.teardown() {
            Ok(())
        } else {
            Err(CaptureError::Destroyed)
        }
    }

    fn teardown(&self) -> bool {
        let freed = {
            let mut log = self.inner.log.lock();
            if log.destroyed {
                return false;
            }
            log.destroyed = true;
            log.entries.clear();
            log.keeps.drain()
        };
        if !freed.is_empty() {
            self.doc.set_kept(&freed, false);
        }
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.cancel();
        }
        self.registration.lock().take();
        log::debug!("OpCapture destroyed");
        true
    }
}

impl<D: StructuralDocument> Drop for OpCapture<D> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// The part of `ids` below each peer's next expected clock.
fn within_clocks(ids: &SpanSet, clocks: &StateVector) -> SpanSet {
    let mut out = SpanSet::new();
    for (peer, span) in ids.iter() {
        let end = span.end().min(clocks.get(peer));
        if end > span.start {
            out.insert(peer, span.start, end - span.start);
        }
    }
    out
}

/// Queue and apply the inverse of one entry inside the reversal
/// transaction: redo its deletions, then delete what it inserted.
fn reverse_entry(
    txn: &mut dyn StructuralTxn,
    entry: &CapturedOp,
    scope: &[String],
    filter: Option<&DeleteFilter>,
) {
    let allowed = |view: &ItemView| filter.map_or(true, |f| f(view));

    let mut to_delete = Vec::new();
    for (peer, span) in entry.insertions.iter() {
        for view in txn.items_in_span(peer, span) {
            let end = view.id.clock + view.len;
            let mut clock = view.id.clock;
            while clock < end {
                let Some((current, diff)) = txn.follow_redone(StructuralId::new(peer, clock))
                else {
                    break;
                };
                let take = (current.len - diff).min(end - clock);
                if !current.deleted && scope.contains(&current.root) {
                    to_delete.push(ItemView {
                        id: current.id.offset(diff),
                        len: take,
                        root: current.root,
                        deleted: false,
                        redone: None,
                    });
                }
                clock += take;
            }
        }
    }

    let mut to_redo = Vec::new();
    for (peer, span) in entry.deletions.iter() {
        for view in txn.items_in_span(peer, span) {
            let own = entry.insertions.intersects(peer, view.id.clock, view.len);
            let gone = entry.retired.intersects(peer, view.id.clock, view.len);
            if scope.contains(&view.root) && !own && !gone && allowed(&view) {
                to_redo.push(view.id);
            }
        }
    }

    for id in to_redo {
        if txn.redo_item(id).is_none() {
            log::debug!("Nothing to redo at {id}");
        }
    }
    to_delete.sort_by(|a, b| b.id.cmp(&a.id));
    for view in to_delete {
        if allowed(&view) {
            txn.delete_span(view.id.peer, view.span());
        }
    }
}
