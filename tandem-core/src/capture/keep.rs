//! Reference-counted keep marks.
//!
//! Several log entries may reference the same tombstone. The Document only
//! hears about a range when its count leaves or returns to zero.
//!
//! ```text
//! peer 7 ─► 0..4 ×1 │ 4..6 ×2 │ 6..9 ×1      disjoint, keyed by start
//! ```
//!
//! Counts are held per clock range, so cost follows the number of ranges
//! touched, never the number of units they cover.

use std::collections::{BTreeMap, HashMap};

use crate::id::{PeerId, SpanSet};
#[cfg(test)]
use crate::id::StructuralId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    end: u64,
    count: u32,
}

/// Disjoint counted ranges of one peer.
type Segments = BTreeMap<u64, Segment>;

#[derive(Debug, Default)]
pub(crate) struct KeepTable {
    peers: HashMap<PeerId, Segments>,
}

impl KeepTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Take one reference on every ID of `ids`. Returns the IDs that were
    /// not kept before.
    pub(crate) fn acquire(&mut self, ids: &SpanSet) -> SpanSet {
        let mut fresh = SpanSet::new();
        for (peer, span) in ids.iter() {
            let segments = self.peers.entry(peer).or_default();
            let (start, end) = (span.start, span.end());
            split_at(segments, start);
            split_at(segments, end);

            let inside: Vec<u64> = segments.range(start..end).map(|(&s, _)| s).collect();
            let mut cursor = start;
            for seg_start in inside {
                if seg_start > cursor {
                    segments.insert(cursor, Segment { end: seg_start, count: 1 });
                    fresh.insert(peer, cursor, seg_start - cursor);
                }
                let Some(seg) = segments.get_mut(&seg_start) else {
                    continue;
                };
                seg.count += 1;
                cursor = seg.end;
            }
            if cursor < end {
                segments.insert(cursor, Segment { end, count: 1 });
                fresh.insert(peer, cursor, end - cursor);
            }
            coalesce(segments, start, end);
        }
        fresh
    }

    /// Drop one reference on every ID of `ids`. Returns the IDs that are
    /// no longer kept by anyone.
    pub(crate) fn release(&mut self, ids: &SpanSet) -> SpanSet {
        let mut freed = SpanSet::new();
        for (peer, span) in ids.iter() {
            let Some(segments) = self.peers.get_mut(&peer) else {
                continue;
            };
            let (start, end) = (span.start, span.end());
            split_at(segments, start);
            split_at(segments, end);

            let inside: Vec<u64> = segments.range(start..end).map(|(&s, _)| s).collect();
            for seg_start in inside {
                let Some(seg) = segments.get_mut(&seg_start) else {
                    continue;
                };
                seg.count -= 1;
                if seg.count == 0 {
                    let seg_end = seg.end;
                    segments.remove(&seg_start);
                    freed.insert(peer, seg_start, seg_end - seg_start);
                }
            }
            coalesce(segments, start, end);
            if segments.is_empty() {
                self.peers.remove(&peer);
            }
        }
        freed
    }

    /// Release everything at once.
    pub(crate) fn drain(&mut self) -> SpanSet {
        let mut all = SpanSet::new();
        for (peer, segments) in self.peers.drain() {
            for (start, seg) in segments {
                all.insert(peer, start, seg.end - start);
            }
        }
        all
    }

    #[cfg(test)]
    pub(crate) fn count(&self, id: StructuralId) -> u32 {
        self.peers
            .get(&id.peer)
            .and_then(|segments| segments.range(..=id.clock).next_back())
            .filter(|(_, seg)| seg.end > id.clock)
            .map_or(0, |(_, seg)| seg.count)
    }

    /// Number of kept units.
    #[cfg(test)]
    pub(crate) fn len(&self) -> u64 {
        self.peers
            .values()
            .flat_map(|segments| segments.iter())
            .map(|(start, seg)| seg.end - start)
            .sum()
    }

    /// Number of stored ranges.
    #[cfg(test)]
    fn segment_count(&self) -> usize {
        self.peers.values().map(BTreeMap::len).sum()
    }
}

/// Split the segment straddling `at` so that a segment boundary lies there.
fn split_at(segments: &mut Segments, at: u64) {
    let Some((&start, &seg)) = segments.range(..at).next_back() else {
        return;
    };
    if seg.end > at {
        segments.insert(start, Segment { end: at, count: seg.count });
        segments.insert(at, Segment { end: seg.end, count: seg.count });
    }
}

/// Merge touching segments with equal counts around `[start, end]`.
fn coalesce(segments: &mut Segments, start: u64, end: u64) {
    let from = segments
        .range(..start)
        .next_back()
        .map_or(start, |(&s, _)| s);
    let keys: Vec<u64> = segments.range(from..=end).map(|(&s, _)| s).collect();
    let mut iter = keys.into_iter();
    let Some(mut current) = iter.next() else {
        return;
    };
    for next in iter {
        let (Some(&a), Some(&b)) = (segments.get(&current), segments.get(&next)) else {
            continue;
        };
        if a.end == next && a.count == b.count {
            segments.remove(&next);
            segments.insert(current, Segment { end: b.end, count: a.count });
        } else {
            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Span;

    #[test]
    fn test_transitions_only_at_zero() {
        let mut table = KeepTable::new();
        let mut a = SpanSet::new();
        a.insert(1, 0, 4);
        let mut b = SpanSet::new();
        b.insert(1, 2, 4);

        assert_eq!(table.acquire(&a).spans(1), &[Span::new(0, 4)]);
        assert_eq!(table.acquire(&b).spans(1), &[Span::new(4, 2)]);
        assert_eq!(table.count(StructuralId::new(1, 3)), 2);
        assert_eq!(table.count(StructuralId::new(1, 5)), 1);
        assert_eq!(table.count(StructuralId::new(1, 6)), 0);

        assert_eq!(table.release(&a).spans(1), &[Span::new(0, 2)]);
        assert_eq!(table.release(&b).spans(1), &[Span::new(2, 4)]);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let mut table = KeepTable::new();
        let mut ids = SpanSet::new();
        ids.insert(9, 0, 3);
        assert!(table.release(&ids).is_empty());
        table.acquire(&ids);
        assert_eq!(table.drain().len(), 3);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_acquire_fills_gaps_between_kept_ranges() {
        let mut table = KeepTable::new();
        let mut outer = SpanSet::new();
        outer.insert(1, 0, 2);
        outer.insert(1, 5, 2);
        table.acquire(&outer);

        let mut wide = SpanSet::new();
        wide.insert(1, 0, 10);
        let fresh = table.acquire(&wide);
        assert_eq!(fresh.spans(1), &[Span::new(2, 3), Span::new(7, 3)]);
        assert_eq!(table.count(StructuralId::new(1, 6)), 2);
        assert_eq!(table.count(StructuralId::new(1, 3)), 1);

        let freed = table.release(&wide);
        assert_eq!(freed.spans(1), &[Span::new(2, 3), Span::new(7, 3)]);
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn test_huge_ranges_stay_compact() {
        let mut table = KeepTable::new();
        let mut ids = SpanSet::new();
        ids.insert(3, 0, 1 << 40);
        assert_eq!(table.acquire(&ids).len(), 1 << 40);
        assert_eq!(table.acquire(&ids).len(), 0);
        assert_eq!(table.segment_count(), 1);
        assert_eq!(table.count(StructuralId::new(3, (1 << 40) - 1)), 2);

        assert!(table.release(&ids).is_empty());
        assert_eq!(table.release(&ids).len(), 1 << 40);
        assert_eq!(table.segment_count(), 0);
    }
}
