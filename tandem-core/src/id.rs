//! Structural identifiers and range-compressed ID sets.
//!
//! ```text
//! SpanSet
//!   peer 7 ─► [ (0, 5) (9, 2) ]      sorted, disjoint, never adjacent
//!   peer 9 ─► [ (3, 1) ]
//! ```
//!
//! A `SpanSet` names every structural ID touched by an operation without
//! enumerating them. It doubles as the delete set of a transaction and as
//! the insertion set computed from two state vectors.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a replica (Yjs "client id").
pub type PeerId = u64;

/// `(peer, clock)` pair naming one unit of CRDT content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StructuralId {
    pub peer: PeerId,
    pub clock: u64,
}

impl StructuralId {
    pub const fn new(peer: PeerId, clock: u64) -> Self {
        Self { peer, clock }
    }

    /// The ID `offset` units further along the same peer's clock.
    pub const fn offset(&self, offset: u64) -> Self {
        Self {
            peer: self.peer,
            clock: self.clock + offset,
        }
    }
}

impl fmt::Display for StructuralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.peer, self.clock)
    }
}

/// A half-open clock range `[start, start + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: u64,
    pub len: u64,
}

impl Span {
    pub const fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    pub const fn end(&self) -> u64 {
        self.start + self.len
    }

    pub const fn contains(&self, clock: u64) -> bool {
        clock >= self.start && clock < self.end()
    }
}

/// Per-peer sorted list of disjoint clock ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanSet {
    spans: BTreeMap<PeerId, Vec<Span>>,
}

impl SpanSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insertions between two clock states: everything `after` knows that
    /// `before` does not.
    pub fn between(before: &StateVector, after: &StateVector) -> Self {
        let mut set = Self::new();
        for (&peer, &end) in after.iter() {
            let start = before.get(peer);
            if end > start {
                set.insert(peer, start, end - start);
            }
        }
        set
    }

    /// Rebuild from raw ranges, normalising order and overlaps.
    pub fn from_ranges<I>(ranges: I) -> Self
    where
        I: IntoIterator<Item = (PeerId, Span)>,
    {
        let mut set = Self::new();
        for (peer, span) in ranges {
            set.insert(peer, span.start, span.len);
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Total number of IDs covered.
    pub fn len(&self) -> u64 {
        self.spans
            .values()
            .flat_map(|spans| spans.iter())
            .map(|s| s.len)
            .sum()
    }

    /// Add `[start, start + len)` for `peer`, coalescing with neighbours.
    pub fn insert(&mut self, peer: PeerId, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let spans = self.spans.entry(peer).or_default();
        let mut merged = Span::new(start, len);
        // First span that touches or follows `merged`; adjacent spans merge too.
        let first = spans.partition_point(|s| s.end() < merged.start);
        let mut last = first;
        while last < spans.len() && spans[last].start <= merged.end() {
            let lo = spans[last].start.min(merged.start);
            let hi = spans[last].end().max(merged.end());
            merged = Span::new(lo, hi - lo);
            last += 1;
        }
        spans.splice(first..last, std::iter::once(merged));
    }

    pub fn insert_id(&mut self, id: StructuralId) {
        self.insert(id.peer, id.clock, 1);
    }

    /// Remove `[start, start + len)` for `peer`, splitting spans as needed.
    pub fn remove(&mut self, peer: PeerId, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let Some(spans) = self.spans.get_mut(&peer) else {
            return;
        };
        let end = start + len;
        let mut kept = Vec::with_capacity(spans.len() + 1);
        for span in spans.iter() {
            if span.end() <= start || span.start >= end {
                kept.push(*span);
                continue;
            }
            if span.start < start {
                kept.push(Span::new(span.start, start - span.start));
            }
            if span.end() > end {
                kept.push(Span::new(end, span.end() - end));
            }
        }
        if kept.is_empty() {
            self.spans.remove(&peer);
        } else {
            *spans = kept;
        }
    }

    /// Union `other` into `self`.
    pub fn merge(&mut self, other: &SpanSet) {
        for (peer, span) in other.iter() {
            self.insert(peer, span.start, span.len);
        }
    }

    /// IDs in `self` that are not in `other`.
    pub fn difference(&self, other: &SpanSet) -> SpanSet {
        let mut out = self.clone();
        for (peer, span) in other.iter() {
            out.remove(peer, span.start, span.len);
        }
        out
    }

    /// IDs present in both `self` and `other`.
    pub fn intersection(&self, other: &SpanSet) -> SpanSet {
        let mut out = SpanSet::new();
        for (peer, span) in other.iter() {
            let spans = self.spans(peer);
            let first = spans.partition_point(|s| s.end() <= span.start);
            for s in spans[first..].iter().take_while(|s| s.start < span.end()) {
                let lo = s.start.max(span.start);
                let hi = s.end().min(span.end());
                out.insert(peer, lo, hi - lo);
            }
        }
        out
    }

    pub fn contains(&self, id: StructuralId) -> bool {
        let Some(spans) = self.spans.get(&id.peer) else {
            return false;
        };
        let idx = spans.partition_point(|s| s.end() <= id.clock);
        spans.get(idx).is_some_and(|s| s.contains(id.clock))
    }

    /// Whether any ID of `[start, start + len)` for `peer` is in the set.
    pub fn intersects(&self, peer: PeerId, start: u64, len: u64) -> bool {
        let Some(spans) = self.spans.get(&peer) else {
            return false;
        };
        let end = start + len;
        let idx = spans.partition_point(|s| s.end() <= start);
        spans.get(idx).is_some_and(|s| s.start < end)
    }

    pub fn spans(&self, peer: PeerId) -> &[Span] {
        self.spans.get(&peer).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.spans.keys().copied()
    }

    /// Every `(peer, span)` in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (PeerId, Span)> + '_ {
        self.spans
            .iter()
            .flat_map(|(&peer, spans)| spans.iter().map(move |s| (peer, *s)))
    }

    /// Every individual ID. Use sparingly on large sets.
    pub fn ids(&self) -> impl Iterator<Item = StructuralId> + '_ {
        self.iter().flat_map(|(peer, span)| {
            (span.start..span.end()).map(move |clock| StructuralId::new(peer, clock))
        })
    }
}

/// Next expected clock per peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector {
    clocks: BTreeMap<PeerId, u64>,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer: PeerId) -> u64 {
        self.clocks.get(&peer).copied().unwrap_or(0)
    }

    pub fn set(&mut self, peer: PeerId, clock: u64) {
        self.clocks.insert(peer, clock);
    }

    /// Advance `peer` by `len` and return the first clock of the new range.
    pub fn advance(&mut self, peer: PeerId, len: u64) -> u64 {
        let entry = self.clocks.entry(peer).or_insert(0);
        let start = *entry;
        *entry += len;
        start
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &u64)> {
        self.clocks.iter()
    }
}
