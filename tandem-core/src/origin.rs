//! Transaction origin tags and their persisted encoding.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CaptureError;

/// Who or what produced a transaction.
///
/// Compared by value, so tags survive persistence and process restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OriginTag {
    /// Edits made by the local user through an editor binding.
    Local,
    /// Diffs applied from a sync transport.
    Remote,
    /// Replays issued by `OpCapture::reverse`. Never captured.
    Reversal,
    /// Housekeeping writes (migrations, normalisation).
    System,
    /// Caller-defined tag.
    Named(String),
}

impl OriginTag {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }
}

impl fmt::Display for OriginTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
            Self::Reversal => write!(f, "reversal"),
            Self::System => write!(f, "system"),
            Self::Named(name) => write!(f, "named:{name}"),
        }
    }
}

/// Lossless encoding of origin tags inside persisted log entries.
pub trait OriginCodec: Send + Sync {
    fn encode(&self, origin: &OriginTag) -> Result<Vec<u8>, CaptureError>;
    fn decode(&self, bytes: &[u8]) -> Result<OriginTag, CaptureError>;
}

/// Default codec: bincode over the serde representation.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeOriginCodec;

impl OriginCodec for BincodeOriginCodec {
    fn encode(&self, origin: &OriginTag) -> Result<Vec<u8>, CaptureError> {
        bincode::serde::encode_to_vec(origin, bincode::config::standard())
            .map_err(|e| CaptureError::Codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<OriginTag, CaptureError> {
        let (origin, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CaptureError::Codec(e.to_string()))?;
        Ok(origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bincode_codec_preserves_named_tags() {
        let codec = BincodeOriginCodec;
        for origin in [
            OriginTag::Local,
            OriginTag::System,
            OriginTag::named("import:markdown"),
        ] {
            let bytes = codec.encode(&origin).unwrap();
            assert_eq!(codec.decode(&bytes).unwrap(), origin);
        }
    }

    #[test]
    fn test_codec_rejects_garbage() {
        assert!(BincodeOriginCodec.decode(&[0xFF, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(OriginTag::named("cli").to_string(), "named:cli");
        assert_eq!(OriginTag::Local.to_string(), "local");
    }
}
