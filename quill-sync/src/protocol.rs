//! Binary wire protocol for document synchronization.
//!
//! Frame layout (lib0-style varint encoding, byte-compatible with the
//! y-protocols family so stock Yjs clients can pair with this server):
//! ```text
//! ┌──────────────────┬───────────────────────────────┐
//! │ messageType      │ payload                       │
//! │ varint (0|1)     │ type-specific                 │
//! └──────────────────┴───────────────────────────────┘
//! ```
//! messageType 0 = sync, 1 = awareness.
//!
//! Sync payload: `varint(tag)` + `varbytes`, where tag 0 carries a state
//! vector (SyncStep1), tag 1 a diff (SyncStep2) and tag 2 an incremental
//! update. Awareness payload: a single `varbytes` holding an awareness
//! update (see [`crate::awareness`]).
//!
//! Unknown message types and decode failures are reported as errors; the
//! connection layer logs and drops such frames without closing the socket.

/// Top-level message type: document sync.
pub const MSG_SYNC: u64 = 0;
/// Top-level message type: awareness (ephemeral presence).
pub const MSG_AWARENESS: u64 = 1;

/// Sync sub-message: state vector announcement, inviting a minimal diff.
pub const SYNC_STEP1: u64 = 0;
/// Sync sub-message: diff computed against a previously received state vector.
pub const SYNC_STEP2: u64 = 1;
/// Sync sub-message: incremental update.
pub const SYNC_UPDATE: u64 = 2;

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// State vector handshake (sync tag 0).
    SyncStep1(Vec<u8>),
    /// Diff response (sync tag 1).
    SyncStep2(Vec<u8>),
    /// Incremental document update (sync tag 2).
    Update(Vec<u8>),
    /// Awareness update payload.
    Awareness(Vec<u8>),
}

impl Frame {
    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        match self {
            Frame::SyncStep1(sv) => {
                enc.write_var_u64(MSG_SYNC);
                enc.write_var_u64(SYNC_STEP1);
                enc.write_var_buf(sv);
            }
            Frame::SyncStep2(diff) => {
                enc.write_var_u64(MSG_SYNC);
                enc.write_var_u64(SYNC_STEP2);
                enc.write_var_buf(diff);
            }
            Frame::Update(update) => {
                enc.write_var_u64(MSG_SYNC);
                enc.write_var_u64(SYNC_UPDATE);
                enc.write_var_buf(update);
            }
            Frame::Awareness(update) => {
                enc.write_var_u64(MSG_AWARENESS);
                enc.write_var_buf(update);
            }
        }
        enc.into_bytes()
    }

    /// Parse a frame from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut dec = Decoder::new(bytes);
        let msg_type = dec.read_var_u64()?;
        match msg_type {
            MSG_SYNC => {
                let tag = dec.read_var_u64()?;
                let payload = dec.read_var_buf()?.to_vec();
                match tag {
                    SYNC_STEP1 => Ok(Frame::SyncStep1(payload)),
                    SYNC_STEP2 => Ok(Frame::SyncStep2(payload)),
                    SYNC_UPDATE => Ok(Frame::Update(payload)),
                    other => Err(ProtocolError::UnknownSyncTag(other)),
                }
            }
            MSG_AWARENESS => {
                let payload = dec.read_var_buf()?.to_vec();
                Ok(Frame::Awareness(payload))
            }
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::SyncStep1(_) => "sync-step1",
            Frame::SyncStep2(_) => "sync-step2",
            Frame::Update(_) => "update",
            Frame::Awareness(_) => "awareness",
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Input ended before the value was complete.
    UnexpectedEof,
    /// Varint longer than 64 bits.
    VarIntOverflow,
    /// Declared payload length exceeds the remaining input.
    LengthOutOfBounds(usize),
    /// Leading varint does not name a known message type.
    UnknownMessageType(u64),
    /// Sync sub-message tag is not step1/step2/update.
    UnknownSyncTag(u64),
    /// A varstring payload was not valid UTF-8.
    InvalidUtf8,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of input"),
            Self::VarIntOverflow => write!(f, "varint exceeds 64 bits"),
            Self::LengthOutOfBounds(n) => write!(f, "declared length {n} out of bounds"),
            Self::UnknownMessageType(t) => write!(f, "unknown message type {t}"),
            Self::UnknownSyncTag(t) => write!(f, "unknown sync tag {t}"),
            Self::InvalidUtf8 => write!(f, "invalid utf-8 in string payload"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Append-only wire encoder (lib0 varint rules).
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self { buf: Vec::with_capacity(64) }
    }

    /// LEB128 unsigned varint: 7 bits per byte, high bit = continuation.
    pub fn write_var_u64(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    /// Varint length prefix followed by the raw bytes.
    pub fn write_var_buf(&mut self, bytes: &[u8]) {
        self.write_var_u64(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    /// UTF-8 string as a length-prefixed buffer.
    pub fn write_var_string(&mut self, s: &str) {
        self.write_var_buf(s.as_bytes());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor-based wire decoder.
pub struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    pub fn read_var_u64(&mut self) -> Result<u64, ProtocolError> {
        let mut value: u64 = 0;
        let mut shift: u32 = 0;
        loop {
            let byte = *self.input.get(self.pos).ok_or(ProtocolError::UnexpectedEof)?;
            self.pos += 1;
            if shift >= 64 || (shift == 63 && byte > 1) {
                return Err(ProtocolError::VarIntOverflow);
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    pub fn read_var_buf(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.read_var_u64()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.input.len())
            .ok_or(ProtocolError::LengthOutOfBounds(len))?;
        let slice = &self.input[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn read_var_string(&mut self) -> Result<String, ProtocolError> {
        let bytes = self.read_var_buf()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.input.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_single_byte() {
        for v in [0u64, 1, 42, 127] {
            let mut enc = Encoder::new();
            enc.write_var_u64(v);
            let bytes = enc.into_bytes();
            assert_eq!(bytes.len(), 1);
            assert_eq!(Decoder::new(&bytes).read_var_u64().unwrap(), v);
        }
    }

    #[test]
    fn test_varint_multi_byte() {
        for v in [128u64, 300, 16_384, 1 << 21, u32::MAX as u64, u64::MAX] {
            let mut enc = Encoder::new();
            enc.write_var_u64(v);
            let bytes = enc.into_bytes();
            assert!(bytes.len() > 1);
            assert_eq!(Decoder::new(&bytes).read_var_u64().unwrap(), v);
        }
    }

    #[test]
    fn test_varint_known_encoding() {
        // 300 = 0b10101100 0b00000010 in LEB128
        let mut enc = Encoder::new();
        enc.write_var_u64(300);
        assert_eq!(enc.into_bytes(), vec![0xac, 0x02]);
    }

    #[test]
    fn test_varint_truncated() {
        // Continuation bit set but no following byte
        let mut dec = Decoder::new(&[0x80]);
        assert_eq!(dec.read_var_u64(), Err(ProtocolError::UnexpectedEof));
    }

    #[test]
    fn test_varint_overflow() {
        let bytes = [0xffu8; 11];
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_var_u64(), Err(ProtocolError::VarIntOverflow));
    }

    #[test]
    fn test_var_buf_roundtrip() {
        let mut enc = Encoder::new();
        enc.write_var_buf(&[1, 2, 3, 4]);
        enc.write_var_buf(&[]);
        let bytes = enc.into_bytes();

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_var_buf().unwrap(), &[1, 2, 3, 4]);
        assert_eq!(dec.read_var_buf().unwrap(), &[] as &[u8]);
        assert_eq!(dec.remaining(), 0);
    }

    #[test]
    fn test_var_buf_length_out_of_bounds() {
        // Declares 10 bytes but only 2 follow
        let mut dec = Decoder::new(&[10, 1, 2]);
        assert_eq!(dec.read_var_buf(), Err(ProtocolError::LengthOutOfBounds(10)));
    }

    #[test]
    fn test_var_string_roundtrip() {
        let mut enc = Encoder::new();
        enc.write_var_string("héllo");
        let bytes = enc.into_bytes();
        assert_eq!(Decoder::new(&bytes).read_var_string().unwrap(), "héllo");
    }

    #[test]
    fn test_var_string_invalid_utf8() {
        let mut dec = Decoder::new(&[2, 0xff, 0xfe]);
        assert_eq!(dec.read_var_string(), Err(ProtocolError::InvalidUtf8));
    }

    #[test]
    fn test_frame_sync_step1_roundtrip() {
        let frame = Frame::SyncStep1(vec![9, 8, 7]);
        let bytes = frame.encode();
        // Leading varints: messageType 0, tag 0
        assert_eq!(&bytes[..2], &[0, 0]);
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_frame_sync_step2_roundtrip() {
        let frame = Frame::SyncStep2(vec![1; 100]);
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn test_frame_update_roundtrip() {
        let frame = Frame::Update(vec![42; 32]);
        let bytes = frame.encode();
        assert_eq!(&bytes[..2], &[0, 2]);
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_frame_awareness_roundtrip() {
        let frame = Frame::Awareness(vec![5, 5, 5]);
        let bytes = frame.encode();
        assert_eq!(bytes[0], 1);
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_frame_unknown_message_type() {
        // messageType 7 is not assigned
        assert_eq!(
            Frame::decode(&[7, 0]),
            Err(ProtocolError::UnknownMessageType(7))
        );
    }

    #[test]
    fn test_frame_unknown_sync_tag() {
        // sync frame with tag 9, empty payload
        assert_eq!(
            Frame::decode(&[0, 9, 0]),
            Err(ProtocolError::UnknownSyncTag(9))
        );
    }

    #[test]
    fn test_frame_truncated_payload() {
        let mut bytes = Frame::Update(vec![1, 2, 3, 4]).encode();
        bytes.truncate(bytes.len() - 2);
        assert!(Frame::decode(&bytes).is_err());
    }

    #[test]
    fn test_frame_empty_input() {
        assert_eq!(Frame::decode(&[]), Err(ProtocolError::UnexpectedEof));
    }

    #[test]
    fn test_frame_overhead_small() {
        // Framing overhead for a small update should be a handful of bytes
        let frame = Frame::Update(vec![0u8; 50]);
        let bytes = frame.encode();
        assert!(bytes.len() <= 50 + 4, "overhead too large: {}", bytes.len() - 50);
    }

    #[test]
    fn test_frame_kind_names() {
        assert_eq!(Frame::SyncStep1(vec![]).kind(), "sync-step1");
        assert_eq!(Frame::Awareness(vec![]).kind(), "awareness");
    }
}
