//! Log entries and their persisted form.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::store::StoreKey;
use crate::error::CaptureError;
use crate::id::{PeerId, SpanSet};
use crate::origin::{OriginCodec, OriginTag};

/// Stable handle to one log entry. Never reused within an `OpCapture`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// A position in the log, returned by `OpCapture::mark`.
///
/// Entries created or extended after the mark are "since" it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogMark(pub(crate) u64);

/// One reversible log entry.
#[derive(Debug, Clone)]
pub struct CapturedOp {
    pub(crate) id: EntryId,
    pub(crate) insertions: SpanSet,
    pub(crate) deletions: SpanSet,
    pub(crate) origin: OriginTag,
    /// Millis of the most recent commit folded into this entry.
    pub(crate) timestamp: u64,
    pub(crate) meta: BTreeMap<String, String>,
    /// Capture sequence number of the last commit folded in.
    pub(crate) seq: u64,
    /// Deletions this entry holds keep marks for (the in-scope subset).
    pub(crate) kept: SpanSet,
    /// Deletions of content whose insertion was reversed since. Never redone.
    pub(crate) retired: SpanSet,
    pub(crate) storage_key: Option<StoreKey>,
}

impl CapturedOp {
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Content created by this entry.
    pub fn insertions(&self) -> &SpanSet {
        &self.insertions
    }

    /// Content removed by this entry.
    pub fn deletions(&self) -> &SpanSet {
        &self.deletions
    }

    pub fn origin(&self) -> &OriginTag {
        &self.origin
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn meta(&self) -> &BTreeMap<String, String> {
        &self.meta
    }

    /// Deleted content this entry will not bring back, because the entry
    /// that inserted it was reversed.
    pub fn retired(&self) -> &SpanSet {
        &self.retired
    }

    /// Key of the durable record, once its append has landed.
    pub fn storage_key(&self) -> Option<StoreKey> {
        self.storage_key
    }

    pub(crate) fn encode(&self, codec: &dyn OriginCodec) -> Result<Vec<u8>, CaptureError> {
        let persisted = PersistedOp {
            insertions: ranges(&self.insertions),
            deletions: ranges(&self.deletions),
            origin: codec.encode(&self.origin)?,
            timestamp: self.timestamp,
            meta: self.meta.clone(),
            retired: ranges(&self.retired),
        };
        bincode::serde::encode_to_vec(&persisted, bincode::config::standard())
            .map_err(|e| CaptureError::Codec(e.to_string()))
    }

    /// Rebuild an entry from `encode` output. The caller assigns identity
    /// and keep marks.
    pub(crate) fn decode(
        bytes: &[u8],
        codec: &dyn OriginCodec,
        id: EntryId,
        seq: u64,
    ) -> Result<Self, CaptureError> {
        let (persisted, _): (PersistedOp, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| CaptureError::MalformedEntry(e.to_string()))?;
        Ok(Self {
            id,
            insertions: span_set(&persisted.insertions)?,
            deletions: span_set(&persisted.deletions)?,
            origin: codec.decode(&persisted.origin)?,
            timestamp: persisted.timestamp,
            meta: persisted.meta,
            seq,
            kept: SpanSet::new(),
            retired: span_set(&persisted.retired)?,
            storage_key: None,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedOp {
    /// Sorted `(peer, start, len)` ranges.
    insertions: Vec<(PeerId, u64, u64)>,
    deletions: Vec<(PeerId, u64, u64)>,
    origin: Vec<u8>,
    timestamp: u64,
    meta: BTreeMap<String, String>,
    retired: Vec<(PeerId, u64, u64)>,
}

fn ranges(set: &SpanSet) -> Vec<(PeerId, u64, u64)> {
    set.iter().map(|(peer, s)| (peer, s.start, s.len)).collect()
}

fn span_set(ranges: &[(PeerId, u64, u64)]) -> Result<SpanSet, CaptureError> {
    let mut set = SpanSet::new();
    for &(peer, start, len) in ranges {
        if len == 0 || start.checked_add(len).is_none() {
            return Err(CaptureError::MalformedEntry(format!(
                "invalid range {peer}:{start}+{len}"
            )));
        }
        set.insert(peer, start, len);
    }
    Ok(set)
}
