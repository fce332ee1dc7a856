//! Binary protocol spoken with the relay and over the local hub.
//!
//! Every frame starts with a varuint message type. Integers are LEB128
//! varuints (lib0 compatible), byte strings are length-prefixed.
//!
//! ```text
//! ┌──────────┬──────────────────────────────────────────────────────┐
//! │ 0 sync   │ varuint sub (0 step1 │ 1 step2 │ 2 update), varbytes │
//! │ 1 aware  │ varbytes awareness update                            │
//! │ 2 auth   │ varuint 0 (permission denied), varstring reason      │
//! │ 3 query  │ (empty)                                              │
//! │ 4 event  │ varbytes CBOR event envelope                         │
//! │ 5 sub    │ varuint n, n × varstring event type                  │
//! │ 6 unsub  │ varuint n, n × varstring event type                  │
//! └──────────┴──────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Longest varuint accepted for a `u64`.
const MAX_VARUINT_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unexpected end of frame")]
    UnexpectedEnd,
    #[error("varuint does not fit in 64 bits")]
    VarintOverflow,
    #[error("length prefix {0} exceeds the frame")]
    LengthOverflow(u64),
    #[error("unknown message type {0}")]
    UnknownMessageType(u64),
    #[error("unknown sync message type {0}")]
    UnknownSyncType(u64),
    #[error("unknown auth message type {0}")]
    UnknownAuthType(u64),
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    #[error("malformed awareness update: {0}")]
    MalformedAwareness(String),
    #[error("{0} trailing byte(s) after message")]
    TrailingData(usize),
}

// ───────────────────────────────────────────────────────────────────
// Primitive codec
// ───────────────────────────────────────────────────────────────────

/// Growable output buffer with lib0-style writers.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn write_var_uint(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.buf.push((value as u8 & 0x7F) | 0x80);
            value >>= 7;
        }
        self.buf.push(value as u8);
    }

    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_var_uint(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_var_string(&mut self, s: &str) {
        self.write_var_bytes(s.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over one received frame.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_var_uint(&mut self) -> Result<u64, ProtocolError> {
        let mut value = 0u64;
        for i in 0..MAX_VARUINT_LEN {
            let byte = *self.buf.get(self.pos).ok_or(ProtocolError::UnexpectedEnd)?;
            self.pos += 1;
            let bits = u64::from(byte & 0x7F);
            let shift = 7 * i as u32;
            // The tenth byte may only carry the top bit of a u64.
            if i == MAX_VARUINT_LEN - 1 && bits > 1 {
                return Err(ProtocolError::VarintOverflow);
            }
            value |= bits << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ProtocolError::VarintOverflow)
    }

    pub fn read_var_bytes(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.read_var_uint()?;
        if len > self.remaining() as u64 {
            return Err(ProtocolError::LengthOverflow(len));
        }
        let start = self.pos;
        self.pos += len as usize;
        Ok(&self.buf[start..self.pos])
    }

    pub fn read_var_string(&mut self) -> Result<&'a str, ProtocolError> {
        let bytes = self.read_var_bytes()?;
        std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Fail if anything is left unread.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(ProtocolError::TrailingData(n)),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Messages
// ───────────────────────────────────────────────────────────────────

/// Top-level message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Sync = 0,
    Awareness = 1,
    Auth = 2,
    QueryAwareness = 3,
    Event = 4,
    EventSubscribe = 5,
    EventUnsubscribe = 6,
}

impl TryFrom<u64> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Sync,
            1 => Self::Awareness,
            2 => Self::Auth,
            3 => Self::QueryAwareness,
            4 => Self::Event,
            5 => Self::EventSubscribe,
            6 => Self::EventUnsubscribe,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }
}

/// Document sync sub-messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Encoded state vector: "send me what I am missing".
    Step1(Vec<u8>),
    /// Diff answering a step 1.
    Step2(Vec<u8>),
    /// Incremental diff of one local transaction.
    Update(Vec<u8>),
}

impl SyncMessage {
    fn tag(&self) -> u64 {
        match self {
            Self::Step1(_) => 0,
            Self::Step2(_) => 1,
            Self::Update(_) => 2,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Self::Step1(p) | Self::Step2(p) | Self::Update(p) => p,
        }
    }
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncMessage),
    /// Encoded awareness update (see [`crate::awareness`]).
    Awareness(Vec<u8>),
    /// The relay refused access to the room.
    PermissionDenied { reason: String },
    QueryAwareness,
    /// CBOR-encoded [`crate::event::EventMessage`].
    Event(Vec<u8>),
    EventSubscribe(Vec<String>),
    EventUnsubscribe(Vec<String>),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Sync(_) => MessageType::Sync,
            Self::Awareness(_) => MessageType::Awareness,
            Self::PermissionDenied { .. } => MessageType::Auth,
            Self::QueryAwareness => MessageType::QueryAwareness,
            Self::Event(_) => MessageType::Event,
            Self::EventSubscribe(_) => MessageType::EventSubscribe,
            Self::EventUnsubscribe(_) => MessageType::EventUnsubscribe,
        }
    }

    /// Serialize to one wire frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(16);
        enc.write_var_uint(self.message_type() as u64);
        match self {
            Self::Sync(sync) => {
                enc.write_var_uint(sync.tag());
                enc.write_var_bytes(sync.payload());
            }
            Self::Awareness(update) | Self::Event(update) => enc.write_var_bytes(update),
            Self::PermissionDenied { reason } => {
                enc.write_var_uint(0);
                enc.write_var_string(reason);
            }
            Self::QueryAwareness => {}
            Self::EventSubscribe(types) | Self::EventUnsubscribe(types) => {
                enc.write_var_uint(types.len() as u64);
                for t in types {
                    enc.write_var_string(t);
                }
            }
        }
        enc.into_inner()
    }

    /// Parse one wire frame.
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let mut dec = Decoder::new(frame);
        let msg = match MessageType::try_from(dec.read_var_uint()?)? {
            MessageType::Sync => {
                let sub = dec.read_var_uint()?;
                let payload = dec.read_var_bytes()?.to_vec();
                Self::Sync(match sub {
                    0 => SyncMessage::Step1(payload),
                    1 => SyncMessage::Step2(payload),
                    2 => SyncMessage::Update(payload),
                    other => return Err(ProtocolError::UnknownSyncType(other)),
                })
            }
            MessageType::Awareness => Self::Awareness(dec.read_var_bytes()?.to_vec()),
            MessageType::Auth => match dec.read_var_uint()? {
                0 => Self::PermissionDenied {
                    reason: dec.read_var_string()?.to_owned(),
                },
                other => return Err(ProtocolError::UnknownAuthType(other)),
            },
            MessageType::QueryAwareness => Self::QueryAwareness,
            MessageType::Event => Self::Event(dec.read_var_bytes()?.to_vec()),
            MessageType::EventSubscribe => Self::EventSubscribe(read_type_list(&mut dec)?),
            MessageType::EventUnsubscribe => Self::EventUnsubscribe(read_type_list(&mut dec)?),
        };
        dec.finish()?;
        Ok(msg)
    }
}

fn read_type_list(dec: &mut Decoder<'_>) -> Result<Vec<String>, ProtocolError> {
    let n = dec.read_var_uint()?;
    // Every entry needs at least its length byte.
    if n > dec.remaining() as u64 {
        return Err(ProtocolError::LengthOverflow(n));
    }
    (0..n)
        .map(|_| dec.read_var_string().map(str::to_owned))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varuint_known_encodings() {
        let cases: [(u64, &[u8]); 5] = [
            (0, &[0x00]),
            (127, &[0x7F]),
            (128, &[0x80, 0x01]),
            (300, &[0xAC, 0x02]),
            (u64::MAX, &[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
        ];
        for (value, bytes) in cases {
            let mut enc = Encoder::new();
            enc.write_var_uint(value);
            assert_eq!(enc.into_inner(), bytes, "encoding {value}");
            assert_eq!(Decoder::new(bytes).read_var_uint().unwrap(), value);
        }
    }

    #[test]
    fn test_varuint_overflow_rejected() {
        let too_long = [0xFF; 11];
        assert_eq!(
            Decoder::new(&too_long).read_var_uint(),
            Err(ProtocolError::VarintOverflow)
        );
        let too_wide = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x02];
        assert_eq!(
            Decoder::new(&too_wide).read_var_uint(),
            Err(ProtocolError::VarintOverflow)
        );
        assert_eq!(
            Decoder::new(&[0x80]).read_var_uint(),
            Err(ProtocolError::UnexpectedEnd)
        );
    }

    #[test]
    fn test_sync_step1_layout() {
        let frame = Message::Sync(SyncMessage::Step1(vec![7, 8])).encode();
        assert_eq!(frame, vec![0, 0, 2, 7, 8]);
        assert_eq!(
            Message::decode(&frame).unwrap(),
            Message::Sync(SyncMessage::Step1(vec![7, 8]))
        );
    }

    #[test]
    fn test_auth_layout() {
        let frame = Message::PermissionDenied {
            reason: "no".into(),
        }
        .encode();
        assert_eq!(frame, vec![2, 0, 2, b'n', b'o']);
    }

    #[test]
    fn test_subscribe_list() {
        let msg = Message::EventSubscribe(vec!["comment".into(), "mention".into()]);
        let frame = msg.encode();
        assert_eq!(&frame[..3], &[5, 2, 7]);
        assert_eq!(Message::decode(&frame).unwrap(), msg);

        let empty = Message::EventUnsubscribe(Vec::new());
        assert_eq!(empty.encode(), vec![6, 0]);
    }

    #[test]
    fn test_large_sync_payload() {
        let diff = vec![42u8; 65536];
        let frame = Message::Sync(SyncMessage::Update(diff.clone())).encode();
        // type + sub + 3-byte length
        assert_eq!(frame.len(), 65536 + 5);
        match Message::decode(&frame).unwrap() {
            Message::Sync(SyncMessage::Update(p)) => assert_eq!(p, diff),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(
            Message::decode(&[9]),
            Err(ProtocolError::UnknownMessageType(9))
        );
        assert_eq!(
            Message::decode(&[0, 3, 0]),
            Err(ProtocolError::UnknownSyncType(3))
        );
        assert_eq!(
            Message::decode(&[2, 1, 0]),
            Err(ProtocolError::UnknownAuthType(1))
        );
        assert_eq!(
            Message::decode(&[1, 5, 1]),
            Err(ProtocolError::LengthOverflow(5))
        );
        assert_eq!(
            Message::decode(&[5, 1, 2, 0xC3, 0x28]),
            Err(ProtocolError::InvalidUtf8)
        );
        assert_eq!(Message::decode(&[3, 0]), Err(ProtocolError::TrailingData(1)));
        assert_eq!(Message::decode(&[]), Err(ProtocolError::UnexpectedEnd));
    }

    #[test]
    fn test_type_list_count_bounded_by_frame() {
        assert_eq!(
            Message::decode(&[5, 0xFF, 0xFF, 0x03]),
            Err(ProtocolError::LengthOverflow(65535))
        );
    }
}
