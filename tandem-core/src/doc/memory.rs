//! In-process sequence CRDT used as the reference Document.
//!
//! Content is a set of named root texts. Each root is a list of items in
//! document order:
//!
//! ```text
//! root "body":  [7:0 "he"] [9:0 "X" ✝] [7:2 "llo"] [7:5 "!" → 7:9]
//!                  │            │ tombstone   │            └ redone link
//!                  └ id (peer:clock), spans one unit per char
//! ```
//!
//! Items carry their left/right origins and are placed with YATA conflict
//! resolution, so replicas converge regardless of delivery order. Deleted
//! items stay as tombstones until `gc()` drops their content, which it
//! never does for IDs marked kept.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use super::{
    ItemView, Observers, StructuralDocument, StructuralTxn, Subscription, SyncDocument,
    TransactionEvent, TransactionHandler, UpdateHandler,
};
use crate::error::DocError;
use crate::id::{PeerId, Span, SpanSet, StateVector, StructuralId};
use crate::origin::OriginTag;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Content {
    Text(Vec<char>),
    /// Garbage-collected tombstone; only the length survives.
    Collected(u64),
}

impl Content {
    fn len(&self) -> u64 {
        match self {
            Content::Text(chars) => chars.len() as u64,
            Content::Collected(len) => *len,
        }
    }

    fn split_off(&mut self, at: u64) -> Content {
        match self {
            Content::Text(chars) => Content::Text(chars.split_off(at as usize)),
            Content::Collected(len) => {
                let right = *len - at;
                *len = at;
                Content::Collected(right)
            }
        }
    }

    fn to_record(&self, skip: u64) -> Option<String> {
        match self {
            Content::Text(chars) => Some(chars.iter().skip(skip as usize).collect()),
            Content::Collected(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Item {
    id: StructuralId,
    content: Content,
    origin_left: Option<StructuralId>,
    origin_right: Option<StructuralId>,
    deleted: bool,
    redone: Option<StructuralId>,
}

impl Item {
    fn len(&self) -> u64 {
        self.content.len()
    }

    fn last_id(&self) -> StructuralId {
        self.id.offset(self.len() - 1)
    }

    fn contains(&self, id: StructuralId) -> bool {
        id.peer == self.id.peer && id.clock >= self.id.clock && id.clock < self.id.clock + self.len()
    }
}

/// Wire form of an item inside an encoded diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ItemRecord {
    id: StructuralId,
    root: String,
    origin_left: Option<StructuralId>,
    origin_right: Option<StructuralId>,
    len: u64,
    content: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DiffPayload {
    items: Vec<ItemRecord>,
    deletes: SpanSet,
}

/// Split `items[idx]` so that its first `offset` units stay at `idx`.
fn split_in(items: &mut Vec<Item>, idx: usize, offset: u64) {
    let item = &mut items[idx];
    if offset == 0 || offset >= item.len() {
        return;
    }
    let right = Item {
        id: item.id.offset(offset),
        content: item.content.split_off(offset),
        origin_left: Some(item.id.offset(offset - 1)),
        origin_right: item.origin_right,
        deleted: item.deleted,
        redone: item.redone.map(|r| r.offset(offset)),
    };
    items.insert(idx + 1, right);
}

/// ID of the item in `items` containing `id`.
fn item_start(items: &[Item], id: StructuralId) -> Option<StructuralId> {
    items.iter().find(|it| it.contains(id)).map(|it| it.id)
}

#[derive(Debug, Default)]
struct DocState {
    roots: BTreeMap<String, Vec<Item>>,
    clocks: StateVector,
    /// Every deleted ID, sent with each diff.
    deleted: SpanSet,
    kept: SpanSet,
    /// Remote items whose origins have not arrived yet.
    pending: Vec<ItemRecord>,
    pending_deletes: SpanSet,
}

impl DocState {
    fn locate(&self, id: StructuralId) -> Option<(String, usize)> {
        if id.clock >= self.clocks.get(id.peer) {
            return None;
        }
        self.roots.iter().find_map(|(root, items)| {
            items
                .iter()
                .position(|it| it.contains(id))
                .map(|idx| (root.clone(), idx))
        })
    }

    fn view(&self, root: &str, idx: usize) -> ItemView {
        let item = &self.roots[root][idx];
        ItemView {
            id: item.id,
            len: item.len(),
            root: root.to_string(),
            deleted: item.deleted,
            redone: item.redone,
        }
    }

    /// Split so that an item starts at `id`.
    fn clean_start(&mut self, id: StructuralId) -> Option<(String, usize)> {
        let (root, idx) = self.locate(id)?;
        let items = self.roots.get_mut(&root)?;
        let offset = id.clock - items[idx].id.clock;
        if offset == 0 {
            return Some((root, idx));
        }
        split_in(items, idx, offset);
        Some((root, idx + 1))
    }

    /// Split so that an item ends at `id`.
    fn clean_end(&mut self, id: StructuralId) -> Option<(String, usize)> {
        let (root, idx) = self.locate(id)?;
        let items = self.roots.get_mut(&root)?;
        let offset = id.clock - items[idx].id.clock + 1;
        split_in(items, idx, offset);
        Some((root, idx))
    }

    fn items_in_span(&mut self, peer: PeerId, span: Span) -> Vec<ItemView> {
        let end = span.end().min(self.clocks.get(peer));
        let mut clock = span.start;
        let mut views = Vec::new();
        while clock < end {
            let Some((root, idx)) = self.clean_start(StructuralId::new(peer, clock)) else {
                break;
            };
            let item_end = {
                let item = &self.roots[&root][idx];
                item.id.clock + item.len()
            };
            if item_end > end {
                self.clean_end(StructuralId::new(peer, end - 1));
            }
            let view = self.view(&root, idx);
            clock = view.id.clock + view.len;
            views.push(view);
        }
        views
    }

    fn follow_redone(&mut self, id: StructuralId) -> Option<(ItemView, u64)> {
        let mut next = id;
        let mut diff = 0;
        loop {
            if diff > 0 {
                next = next.offset(diff);
            }
            let (root, idx) = self.locate(next)?;
            let item = &self.roots[&root][idx];
            diff = next.clock - item.id.clock;
            match item.redone {
                Some(redone) => next = redone,
                None => return Some((self.view(&root, idx), diff)),
            }
        }
    }

    /// Mark `span` deleted; returns the newly deleted ranges with their roots.
    fn delete_range(&mut self, peer: PeerId, span: Span) -> Vec<(String, Span)> {
        let mut newly = Vec::new();
        for view in self.items_in_span(peer, span) {
            if view.deleted {
                continue;
            }
            let Some((root, idx)) = self.locate(view.id) else {
                continue;
            };
            if let Some(items) = self.roots.get_mut(&root) {
                items[idx].deleted = true;
            }
            self.deleted.insert(peer, view.id.clock, view.len);
            newly.push((root, view.span()));
        }
        newly
    }

    fn redo_item(&mut self, client: PeerId, id: StructuralId) -> Option<(String, StructuralId)> {
        let (root, idx) = self.clean_start(id)?;
        let item = self.roots[&root][idx].clone();
        if item.redone.is_some() {
            let (current, diff) = self.follow_redone(id)?;
            if !current.deleted {
                return Some((current.root, current.id.offset(diff)));
            }
            return self.redo_item(client, current.id.offset(diff));
        }
        if !item.deleted {
            return Some((root, item.id));
        }
        let Content::Text(chars) = &item.content else {
            log::warn!("Cannot redo {}: content was garbage-collected", item.id);
            return None;
        };
        let len = chars.len() as u64;
        let start = self.clocks.advance(client, len);
        let new_id = StructuralId::new(client, start);
        let items = self.roots.get_mut(&root)?;
        let origin_right = items.get(idx + 1).map(|it| it.id);
        items.insert(
            idx + 1,
            Item {
                id: new_id,
                content: Content::Text(chars.clone()),
                origin_left: Some(item.last_id()),
                origin_right,
                deleted: false,
                redone: None,
            },
        );
        items[idx].redone = Some(new_id);
        Some((root, new_id))
    }

    fn insert_local(&mut self, client: PeerId, root: &str, index: usize, text: &str) {
        let chars: Vec<char> = text.chars().collect();
        if chars.is_empty() {
            return;
        }
        let items = self.roots.entry(root.to_string()).or_default();
        let mut remaining = index as u64;
        let mut pos = 0;
        while pos < items.len() && remaining > 0 {
            if !items[pos].deleted {
                let len = items[pos].len();
                if remaining < len {
                    split_in(items, pos, remaining);
                    pos += 1;
                    break;
                }
                remaining -= len;
            }
            pos += 1;
        }
        let origin_left = pos.checked_sub(1).map(|p| items[p].last_id());
        let origin_right = items.get(pos).map(|it| it.id);
        let start = self.clocks.advance(client, chars.len() as u64);
        items.insert(
            pos,
            Item {
                id: StructuralId::new(client, start),
                content: Content::Text(chars),
                origin_left,
                origin_right,
                deleted: false,
                redone: None,
            },
        );
    }

    fn delete_local(&mut self, root: &str, index: usize, len: usize) -> SpanSet {
        let mut deleted = SpanSet::new();
        let Some(items) = self.roots.get_mut(root) else {
            return deleted;
        };
        let mut skip = index as u64;
        let mut left = len as u64;
        let mut pos = 0;
        while pos < items.len() && left > 0 {
            if items[pos].deleted {
                pos += 1;
                continue;
            }
            let item_len = items[pos].len();
            if skip > 0 {
                if skip >= item_len {
                    skip -= item_len;
                } else {
                    split_in(items, pos, skip);
                    skip = 0;
                }
                pos += 1;
                continue;
            }
            if left < item_len {
                split_in(items, pos, left);
            }
            let item = &mut items[pos];
            item.deleted = true;
            deleted.insert(item.id.peer, item.id.clock, item.len());
            left -= item.len();
            pos += 1;
        }
        self.deleted.merge(&deleted);
        deleted
    }

    /// Integrate one remote item. `Err` hands the record back when its
    /// dependencies are missing.
    fn integrate(&mut self, mut rec: ItemRecord) -> Result<bool, ItemRecord> {
        let next = self.clocks.get(rec.id.peer);
        if rec.id.clock + rec.len <= next {
            return Ok(false);
        }
        if rec.id.clock > next {
            return Err(rec);
        }
        if rec.id.clock < next {
            let skip = next - rec.id.clock;
            rec.origin_left = Some(rec.id.offset(skip - 1));
            rec.id = rec.id.offset(skip);
            rec.len -= skip;
            rec.content = rec.content.map(|c| c.chars().skip(skip as usize).collect());
        }
        for dep in [rec.origin_left, rec.origin_right].into_iter().flatten() {
            if dep.clock >= self.clocks.get(dep.peer) {
                return Err(rec);
            }
        }
        if let Some(left) = rec.origin_left {
            self.clean_end(left);
        }
        if let Some(right) = rec.origin_right {
            self.clean_start(right);
        }

        let items = self.roots.entry(rec.root.clone()).or_default();
        let left_idx = rec
            .origin_left
            .and_then(|l| items.iter().position(|it| it.last_id() == l));
        let right_idx = rec
            .origin_right
            .and_then(|r| items.iter().position(|it| it.id == r));

        let mut left = left_idx;
        let mut o = left.map_or(0, |l| l + 1);
        let mut before_origin = HashSet::new();
        let mut conflicting = HashSet::new();
        while o < items.len() && Some(o) != right_idx {
            let other = &items[o];
            before_origin.insert(other.id);
            conflicting.insert(other.id);
            if other.origin_left == rec.origin_left {
                if other.id.peer < rec.id.peer {
                    left = Some(o);
                    conflicting.clear();
                } else if other.origin_right == rec.origin_right {
                    break;
                }
            } else if let Some(origin) = other
                .origin_left
                .and_then(|ol| item_start(items, ol))
                .filter(|start| before_origin.contains(start))
            {
                if !conflicting.contains(&origin) {
                    left = Some(o);
                    conflicting.clear();
                }
            } else {
                break;
            }
            o += 1;
        }

        let content = match rec.content {
            Some(text) => Content::Text(text.chars().collect()),
            None => Content::Collected(rec.len),
        };
        let pos = left.map_or(0, |l| l + 1);
        items.insert(
            pos,
            Item {
                id: rec.id,
                content,
                origin_left: rec.origin_left,
                origin_right: rec.origin_right,
                deleted: false,
                redone: None,
            },
        );
        self.clocks.set(rec.id.peer, rec.id.clock + rec.len);
        Ok(true)
    }

    fn apply(&mut self, payload: DiffPayload) -> (BTreeSet<String>, SpanSet) {
        let mut changed = BTreeSet::new();
        let mut queue = std::mem::take(&mut self.pending);
        queue.extend(payload.items);
        loop {
            queue.sort_by_key(|r| (r.id.peer, r.id.clock));
            let mut progressed = false;
            let mut stuck = Vec::new();
            for rec in queue {
                let root = rec.root.clone();
                match self.integrate(rec) {
                    Ok(inserted) => {
                        progressed = true;
                        if inserted {
                            changed.insert(root);
                        }
                    }
                    Err(rec) => stuck.push(rec),
                }
            }
            queue = stuck;
            if queue.is_empty() || !progressed {
                break;
            }
        }
        if !queue.is_empty() {
            log::debug!("{} remote items waiting for missing origins", queue.len());
        }
        self.pending = queue;

        let mut deletes = std::mem::take(&mut self.pending_deletes);
        deletes.merge(&payload.deletes);
        let mut newly = SpanSet::new();
        for (peer, span) in deletes.iter() {
            let known = self.clocks.get(peer);
            let known_end = span.end().min(known);
            if span.start < known_end {
                for (root, range) in
                    self.delete_range(peer, Span::new(span.start, known_end - span.start))
                {
                    newly.insert(peer, range.start, range.len);
                    changed.insert(root);
                }
            }
            if span.end() > known {
                let start = span.start.max(known);
                self.pending_deletes.insert(peer, start, span.end() - start);
            }
        }
        (changed, newly)
    }

    fn encode_diff(&self, since: &StateVector, deletes: SpanSet) -> Result<Vec<u8>, DocError> {
        let mut items = Vec::new();
        for (root, list) in &self.roots {
            for item in list {
                let known = since.get(item.id.peer);
                let end = item.id.clock + item.len();
                if end <= known {
                    continue;
                }
                let skip = known.saturating_sub(item.id.clock);
                items.push(ItemRecord {
                    id: item.id.offset(skip),
                    root: root.clone(),
                    origin_left: if skip > 0 {
                        Some(item.id.offset(skip - 1))
                    } else {
                        item.origin_left
                    },
                    origin_right: item.origin_right,
                    len: item.len() - skip,
                    content: item.content.to_record(skip),
                });
            }
        }
        items.sort_by_key(|r| (r.id.peer, r.id.clock));
        bincode::serde::encode_to_vec(DiffPayload { items, deletes }, bincode::config::standard())
            .map_err(|e| DocError::Update(e.to_string()))
    }

    fn text(&self, root: &str) -> String {
        self.roots
            .get(root)
            .map(|items| {
                items
                    .iter()
                    .filter(|it| !it.deleted)
                    .filter_map(|it| match &it.content {
                        Content::Text(chars) => Some(chars.iter().collect::<String>()),
                        Content::Collected(_) => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A mutable view of the document for the duration of one transaction.
pub struct MemoryTxn<'a> {
    state: &'a mut DocState,
    client: PeerId,
    origin: OriginTag,
    deletions: SpanSet,
    changed: BTreeSet<String>,
}

impl MemoryTxn<'_> {
    /// Insert `text` before the `index`-th visible character of `root`.
    pub fn insert(&mut self, root: &str, index: usize, text: &str) {
        if text.is_empty() {
            return;
        }
        self.state.insert_local(self.client, root, index, text);
        self.changed.insert(root.to_string());
    }

    /// Delete `len` visible characters of `root` starting at `index`.
    pub fn remove_range(&mut self, root: &str, index: usize, len: usize) {
        let deleted = self.state.delete_local(root, index, len);
        if !deleted.is_empty() {
            self.deletions.merge(&deleted);
            self.changed.insert(root.to_string());
        }
    }

    pub fn text(&self, root: &str) -> String {
        self.state.text(root)
    }

    /// Visible character count of `root`.
    pub fn len(&self, root: &str) -> usize {
        self.state.text(root).chars().count()
    }
}

impl StructuralTxn for MemoryTxn<'_> {
    fn origin(&self) -> &OriginTag {
        &self.origin
    }

    fn items_in_span(&mut self, peer: PeerId, span: Span) -> Vec<ItemView> {
        self.state.items_in_span(peer, span)
    }

    fn item_at(&mut self, id: StructuralId) -> Option<ItemView> {
        let (root, idx) = self.state.clean_start(id)?;
        Some(self.state.view(&root, idx))
    }

    fn follow_redone(&mut self, id: StructuralId) -> Option<(ItemView, u64)> {
        self.state.follow_redone(id)
    }

    fn delete_span(&mut self, peer: PeerId, span: Span) -> u64 {
        let mut count = 0;
        for (root, range) in self.state.delete_range(peer, span) {
            self.deletions.insert(peer, range.start, range.len);
            self.changed.insert(root);
            count += range.len;
        }
        count
    }

    fn redo_item(&mut self, id: StructuralId) -> Option<StructuralId> {
        let (root, new_id) = self.state.redo_item(self.client, id)?;
        self.changed.insert(root);
        Some(new_id)
    }
}

/// Reference Document: named root texts over a YATA sequence CRDT.
pub struct MemoryDoc {
    client_id: PeerId,
    state: Mutex<DocState>,
    after_transaction: Observers<TransactionHandler>,
    updates: Observers<UpdateHandler>,
}

impl MemoryDoc {
    pub fn new(client_id: PeerId) -> Self {
        Self {
            client_id,
            state: Mutex::new(DocState::default()),
            after_transaction: Observers::new(),
            updates: Observers::new(),
        }
    }

    pub fn client_id(&self) -> PeerId {
        self.client_id
    }

    /// Run `f` as one transaction. Must not be called from inside `f`.
    pub fn transact<R>(&self, origin: OriginTag, f: impl FnOnce(&mut MemoryTxn<'_>) -> R) -> R {
        let (result, committed) = {
            let mut state = self.state.lock();
            let before = state.clocks.clone();
            let mut txn = MemoryTxn {
                state: &mut *state,
                client: self.client_id,
                origin,
                deletions: SpanSet::new(),
                changed: BTreeSet::new(),
            };
            let result = f(&mut txn);
            let MemoryTxn {
                origin,
                deletions,
                changed,
                ..
            } = txn;
            (result, self.commit(&state, origin, before, deletions, changed))
        };
        if let Some((event, update)) = committed {
            self.dispatch(&event, update.as_deref());
        }
        result
    }

    fn commit(
        &self,
        state: &DocState,
        origin: OriginTag,
        before: StateVector,
        deletions: SpanSet,
        changed_roots: BTreeSet<String>,
    ) -> Option<(TransactionEvent, Option<Vec<u8>>)> {
        if changed_roots.is_empty() && deletions.is_empty() && before == state.clocks {
            return None;
        }
        let update = if self.updates.is_empty() {
            None
        } else {
            match state.encode_diff(&before, deletions.clone()) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    log::error!("Failed to encode transaction update: {e}");
                    None
                }
            }
        };
        let event = TransactionEvent {
            origin,
            before,
            after: state.clocks.clone(),
            deletions,
            changed_roots,
        };
        Some((event, update))
    }

    fn dispatch(&self, event: &TransactionEvent, update: Option<&[u8]>) {
        for handler in self.after_transaction.snapshot() {
            handler(event);
        }
        if let Some(update) = update {
            for handler in self.updates.snapshot() {
                handler(update, &event.origin);
            }
        }
    }

    /// Visible text of `root`.
    pub fn text(&self, root: &str) -> String {
        self.state.lock().text(root)
    }

    /// Full state as a diff against the empty state vector.
    pub fn encode_state(&self) -> Result<Vec<u8>, DocError> {
        let state = self.state.lock();
        state.encode_diff(&StateVector::new(), state.deleted.clone())
    }

    pub fn clocks(&self) -> StateVector {
        self.state.lock().clocks.clone()
    }

    /// Whether the garbage collector may drop the content of `id`.
    pub fn is_collectable(&self, id: StructuralId) -> bool {
        let state = self.state.lock();
        let Some((root, idx)) = state.locate(id) else {
            return false;
        };
        state.roots[&root][idx].deleted && !state.kept.contains(id)
    }

    /// Drop the content of every deleted item with no kept IDs.
    /// Returns the number of units collected.
    pub fn gc(&self) -> u64 {
        let mut state = self.state.lock();
        let DocState { roots, kept, .. } = &mut *state;
        let mut collected = 0;
        for item in roots.values_mut().flat_map(|items| items.iter_mut()) {
            if !item.deleted || matches!(item.content, Content::Collected(_)) {
                continue;
            }
            if kept.intersects(item.id.peer, item.id.clock, item.len()) {
                continue;
            }
            collected += item.len();
            item.content = Content::Collected(item.len());
        }
        if collected > 0 {
            log::debug!("Collected {collected} deleted units");
        }
        collected
    }
}

impl StructuralDocument for MemoryDoc {
    fn transact_structural(&self, origin: OriginTag, f: &mut dyn FnMut(&mut dyn StructuralTxn)) {
        self.transact(origin, |txn| f(txn));
    }

    fn on_after_transaction(&self, handler: TransactionHandler) -> Subscription {
        self.after_transaction.subscribe(handler)
    }

    fn set_kept(&self, ids: &SpanSet, kept: bool) {
        let mut state = self.state.lock();
        if kept {
            state.kept.merge(ids);
        } else {
            state.kept = state.kept.difference(ids);
        }
    }

    fn filter_scope(&self, ids: &SpanSet, scope: &[String]) -> SpanSet {
        let state = self.state.lock();
        let mut out = SpanSet::new();
        for root in scope {
            let Some(items) = state.roots.get(root) else {
                continue;
            };
            for item in items {
                let item_end = item.id.clock + item.len();
                for span in ids.spans(item.id.peer) {
                    let start = span.start.max(item.id.clock);
                    let end = span.end().min(item_end);
                    if start < end {
                        out.insert(item.id.peer, start, end - start);
                    }
                }
            }
        }
        out
    }

    fn known_clocks(&self) -> StateVector {
        self.clocks()
    }
}

impl SyncDocument for MemoryDoc {
    fn state_vector(&self) -> Vec<u8> {
        let clocks = self.clocks();
        bincode::serde::encode_to_vec(&clocks, bincode::config::standard()).unwrap_or_default()
    }

    fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocError> {
        let (since, _): (StateVector, _) =
            bincode::serde::decode_from_slice(state_vector, bincode::config::standard())
                .map_err(|e| DocError::StateVector(e.to_string()))?;
        let state = self.state.lock();
        state.encode_diff(&since, state.deleted.clone())
    }

    fn encode_state(&self) -> Result<Vec<u8>, DocError> {
        MemoryDoc::encode_state(self)
    }

    fn apply_diff(&self, diff: &[u8], origin: OriginTag) -> Result<(), DocError> {
        let (payload, _): (DiffPayload, _) =
            bincode::serde::decode_from_slice(diff, bincode::config::standard())
                .map_err(|e| DocError::Update(e.to_string()))?;
        let committed = {
            let mut state = self.state.lock();
            let before = state.clocks.clone();
            let (changed, deletions) = state.apply(payload);
            self.commit(&state, origin, before, deletions, changed)
        };
        if let Some((event, update)) = committed {
            self.dispatch(&event, update.as_deref());
        }
        Ok(())
    }

    fn on_update(&self, handler: UpdateHandler) -> Subscription {
        self.updates.subscribe(handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn sync_pair(a: &MemoryDoc, b: &MemoryDoc) {
        let diff = a.diff_since(&b.state_vector()).unwrap();
        b.apply_diff(&diff, OriginTag::Remote).unwrap();
        let diff = b.diff_since(&a.state_vector()).unwrap();
        a.apply_diff(&diff, OriginTag::Remote).unwrap();
    }

    #[test]
    fn test_local_insert_and_delete() {
        let doc = MemoryDoc::new(1);
        doc.transact(OriginTag::Local, |txn| {
            txn.insert("body", 0, "hello");
            txn.insert("body", 5, " world");
            txn.insert("body", 5, ",");
        });
        assert_eq!(doc.text("body"), "hello, world");

        doc.transact(OriginTag::Local, |txn| txn.remove_range("body", 0, 7));
        assert_eq!(doc.text("body"), "world");
    }

    #[test]
    fn test_transaction_event_reports_insertions_and_deletions() {
        let doc = MemoryDoc::new(3);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _sub = doc.on_after_transaction(Arc::new(move |event: &TransactionEvent| {
            sink.lock().push(event.clone());
        }));

        doc.transact(OriginTag::Local, |txn| txn.insert("body", 0, "abc"));
        doc.transact(OriginTag::named("cli"), |txn| txn.remove_range("body", 1, 1));
        // No-op transactions emit nothing.
        doc.transact(OriginTag::Local, |_| {});

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].insertions().spans(3), &[Span::new(0, 3)]);
        assert!(events[0].changed_roots.contains("body"));
        assert_eq!(events[1].origin, OriginTag::named("cli"));
        assert!(events[1].deletions.contains(StructuralId::new(3, 1)));
        assert!(events[1].insertions().is_empty());
    }

    #[test]
    fn test_sync_converges_concurrent_inserts() {
        let a = MemoryDoc::new(1);
        let b = MemoryDoc::new(2);
        a.transact(OriginTag::Local, |txn| txn.insert("t", 0, "ac"));
        sync_pair(&a, &b);

        a.transact(OriginTag::Local, |txn| txn.insert("t", 1, "X"));
        b.transact(OriginTag::Local, |txn| txn.insert("t", 1, "Y"));
        sync_pair(&a, &b);

        assert_eq!(a.text("t"), b.text("t"));
        // Lower peer id wins the left slot.
        assert_eq!(a.text("t"), "aXYc");
    }

    #[test]
    fn test_sync_converges_with_deletes() {
        let a = MemoryDoc::new(10);
        let b = MemoryDoc::new(20);
        a.transact(OriginTag::Local, |txn| txn.insert("t", 0, "hello world"));
        sync_pair(&a, &b);

        a.transact(OriginTag::Local, |txn| txn.remove_range("t", 0, 6));
        b.transact(OriginTag::Local, |txn| txn.insert("t", 11, "!"));
        sync_pair(&a, &b);

        assert_eq!(a.text("t"), "world!");
        assert_eq!(b.text("t"), "world!");
    }

    #[test]
    fn test_out_of_order_diffs_wait_for_dependencies() {
        let a = MemoryDoc::new(1);
        let b = MemoryDoc::new(2);
        let sv0 = b.state_vector();
        a.transact(OriginTag::Local, |txn| txn.insert("t", 0, "ab"));
        let first = a.diff_since(&sv0).unwrap();
        let sv1 = {
            let c = MemoryDoc::new(9);
            c.apply_diff(&first, OriginTag::Remote).unwrap();
            c.state_vector()
        };
        a.transact(OriginTag::Local, |txn| txn.insert("t", 1, "-"));
        let second = a.diff_since(&sv1).unwrap();

        b.apply_diff(&second, OriginTag::Remote).unwrap();
        assert_eq!(b.text("t"), "");
        b.apply_diff(&first, OriginTag::Remote).unwrap();
        assert_eq!(b.text("t"), "a-b");
    }

    #[test]
    fn test_apply_diff_is_idempotent() {
        let a = MemoryDoc::new(1);
        let b = MemoryDoc::new(2);
        a.transact(OriginTag::Local, |txn| txn.insert("t", 0, "same"));
        let diff = a.encode_state().unwrap();
        b.apply_diff(&diff, OriginTag::Remote).unwrap();
        b.apply_diff(&diff, OriginTag::Remote).unwrap();
        assert_eq!(b.text("t"), "same");
    }

    #[test]
    fn test_update_hook_carries_transaction_diff() {
        let a = MemoryDoc::new(1);
        let b = Arc::new(MemoryDoc::new(2));
        let target = b.clone();
        let _sub = a.on_update(Arc::new(move |update: &[u8], origin: &OriginTag| {
            assert_eq!(origin, &OriginTag::Local);
            target.apply_diff(update, OriginTag::Remote).unwrap();
        }));
        a.transact(OriginTag::Local, |txn| txn.insert("t", 0, "live"));
        a.transact(OriginTag::Local, |txn| txn.remove_range("t", 0, 1));
        assert_eq!(b.text("t"), "ive");
    }

    #[test]
    fn test_split_preserves_ids() {
        let doc = MemoryDoc::new(5);
        doc.transact(OriginTag::Local, |txn| txn.insert("t", 0, "abcd"));
        doc.transact(OriginTag::Local, |txn| {
            let views = txn.items_in_span(5, Span::new(1, 2));
            assert_eq!(views.len(), 1);
            assert_eq!(views[0].id, StructuralId::new(5, 1));
            assert_eq!(views[0].len, 2);
        });
        assert_eq!(doc.text("t"), "abcd");
    }

    #[test]
    fn test_redo_and_follow_redone() {
        let doc = MemoryDoc::new(1);
        doc.transact(OriginTag::Local, |txn| txn.insert("t", 0, "abc"));
        doc.transact(OriginTag::Local, |txn| txn.remove_range("t", 0, 3));
        let redone = doc.transact(OriginTag::Reversal, |txn| txn.redo_item(StructuralId::new(1, 0)));
        assert_eq!(redone, Some(StructuralId::new(1, 3)));
        assert_eq!(doc.text("t"), "abc");

        doc.transact(OriginTag::Local, |txn| {
            let (view, diff) = txn.follow_redone(StructuralId::new(1, 2)).unwrap();
            assert_eq!(view.id, StructuralId::new(1, 3));
            assert_eq!(diff, 2);
        });
    }

    #[test]
    fn test_gc_respects_kept_ids() {
        let doc = MemoryDoc::new(1);
        doc.transact(OriginTag::Local, |txn| txn.insert("t", 0, "abcd"));
        doc.transact(OriginTag::Local, |txn| txn.remove_range("t", 0, 4));

        let mut kept = SpanSet::new();
        kept.insert(1, 1, 1);
        doc.set_kept(&kept, true);
        assert!(doc.is_collectable(StructuralId::new(1, 0)));
        assert!(!doc.is_collectable(StructuralId::new(1, 1)));
        assert_eq!(doc.gc(), 0);

        doc.set_kept(&kept, false);
        assert!(doc.is_collectable(StructuralId::new(1, 1)));
        assert_eq!(doc.gc(), 4);
    }

    #[test]
    fn test_filter_scope() {
        let doc = MemoryDoc::new(1);
        doc.transact(OriginTag::Local, |txn| {
            txn.insert("a", 0, "xx");
            txn.insert("b", 0, "yy");
        });
        let mut ids = SpanSet::new();
        ids.insert(1, 0, 4);
        let scoped = doc.filter_scope(&ids, &["b".to_string()]);
        assert_eq!(scoped.spans(1), &[Span::new(2, 2)]);
    }

    #[test]
    fn test_malformed_diff_is_rejected() {
        let doc = MemoryDoc::new(1);
        assert!(doc.apply_diff(&[0xFF, 0x01], OriginTag::Remote).is_err());
        assert!(doc.diff_since(&[0xFF, 0xFF, 0xFF]).is_err());
    }
}
