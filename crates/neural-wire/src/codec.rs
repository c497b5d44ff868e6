//! Binary signal codec.
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! [version:1][type:1][source:32][target:32][payload_len:4][payload:payload_len]
//! ```
//!
//! The payload is compact JSON with sorted keys. An empty object is sent as a
//! zero-length payload. [`FrameDecoder`] handles byte streams where frames may
//! be split across reads or packed several to a read.
//!
//! Type tag [`CONTROL_TAG`] is reserved for hub control frames, whose payload
//! is a [`ControlMessage`].

use crate::control::ControlMessage;
use bytes::BytesMut;
use neural_types::identity::IDENTITY_LEN;
use neural_types::{CodecError, Identity, Payload, Signal, SignalType};

/// Current protocol version byte.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the fixed header: version, type, source, target, length.
pub const HEADER_LEN: usize = 1 + 1 + IDENTITY_LEN + IDENTITY_LEN + 4;

/// Maximum payload size (16 MB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Type tag of hub control frames. Never assigned to a signal type.
pub const CONTROL_TAG: u8 = 0xFF;

const TYPE_OFFSET: usize = 1;
const SOURCE_OFFSET: usize = 2;
const TARGET_OFFSET: usize = SOURCE_OFFSET + IDENTITY_LEN;
const LEN_OFFSET: usize = TARGET_OFFSET + IDENTITY_LEN;

fn encode_payload(payload: &Payload) -> Result<Vec<u8>, CodecError> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::to_vec(payload).map_err(|e| CodecError::PayloadDecode(e.to_string()))
}

fn decode_payload(bytes: &[u8]) -> Result<Payload, CodecError> {
    if bytes.is_empty() {
        return Ok(Payload::new());
    }
    serde_json::from_slice(bytes).map_err(|e| CodecError::PayloadDecode(e.to_string()))
}

fn frame(tag: u8, source: &Identity, target: &Identity, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    if payload.len() > MAX_PAYLOAD_SIZE as usize {
        return Err(CodecError::FrameTooLarge {
            size: payload.len() as u64,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.push(PROTOCOL_VERSION);
    bytes.push(tag);
    bytes.extend_from_slice(source.as_bytes());
    bytes.extend_from_slice(target.as_bytes());
    bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    bytes.extend_from_slice(payload);
    Ok(bytes)
}

/// Encode a signal into a self-delimiting frame.
pub fn encode(signal: &Signal) -> Result<Vec<u8>, CodecError> {
    let payload = encode_payload(&signal.payload)?;
    frame(signal.signal_type.tag(), &signal.source, &signal.target, &payload)
}

/// Encode a control message sent by `source`. The target is always the
/// broadcast sentinel; control frames are for the hub itself.
pub fn encode_control(source: Identity, message: &ControlMessage) -> Result<Vec<u8>, CodecError> {
    let payload = serde_json::to_vec(message).map_err(|e| CodecError::PayloadDecode(e.to_string()))?;
    frame(CONTROL_TAG, &source, &Identity::BROADCAST, &payload)
}

/// Encoded size of a signal in bytes.
pub fn encoded_len(signal: &Signal) -> Result<usize, CodecError> {
    Ok(HEADER_LEN + encode_payload(&signal.payload)?.len())
}

/// Parsed fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    signal_type: Result<SignalType, u8>,
    source: Identity,
    target: Identity,
    payload_len: u32,
}

/// Parse the fixed header. `buf` must hold at least [`HEADER_LEN`] bytes.
///
/// An unknown type tag is returned inside the header rather than as an error
/// so that callers can still skip the frame by its declared length.
fn parse_header(buf: &[u8]) -> Result<Header, CodecError> {
    let version = buf[0];
    if version != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let tag = buf[TYPE_OFFSET];
    let signal_type = SignalType::try_from(tag).map_err(|_| tag);

    let mut source = [0u8; IDENTITY_LEN];
    source.copy_from_slice(&buf[SOURCE_OFFSET..TARGET_OFFSET]);
    let mut target = [0u8; IDENTITY_LEN];
    target.copy_from_slice(&buf[TARGET_OFFSET..LEN_OFFSET]);
    let mut len = [0u8; 4];
    len.copy_from_slice(&buf[LEN_OFFSET..HEADER_LEN]);
    let payload_len = u32::from_be_bytes(len);

    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: payload_len as u64,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    Ok(Header {
        signal_type,
        source: Identity::from_bytes(source),
        target: Identity::from_bytes(target),
        payload_len,
    })
}

/// One decoded frame from a hub connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Signal(Signal),
    Control(ControlMessage),
}

impl Frame {
    /// The signal in this frame. A control frame is not a signal type.
    pub fn into_signal(self) -> Result<Signal, CodecError> {
        match self {
            Self::Signal(signal) => Ok(signal),
            Self::Control(_) => Err(CodecError::UnknownSignalType(CONTROL_TAG)),
        }
    }
}

fn finish(header: Header, payload: &[u8]) -> Result<Frame, CodecError> {
    let signal_type = match header.signal_type {
        Ok(signal_type) => signal_type,
        Err(CONTROL_TAG) => {
            let message = serde_json::from_slice(payload)
                .map_err(|e| CodecError::PayloadDecode(format!("control frame: {e}")))?;
            return Ok(Frame::Control(message));
        }
        Err(tag) => return Err(CodecError::UnknownSignalType(tag)),
    };
    Ok(Frame::Signal(Signal {
        signal_type,
        source: header.source,
        target: header.target,
        payload: decode_payload(payload)?,
    }))
}

/// Decode exactly one complete signal frame.
pub fn decode(bytes: &[u8]) -> Result<Signal, CodecError> {
    decode_frame(bytes)?.into_signal()
}

/// Decode exactly one complete frame, signal or control.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::MalformedFrame(format!(
            "{} bytes is shorter than the {HEADER_LEN}-byte header",
            bytes.len()
        )));
    }
    let header = parse_header(bytes)?;
    let available = bytes.len() - HEADER_LEN;
    if available != header.payload_len as usize {
        return Err(CodecError::TruncatedPayload {
            declared: header.payload_len,
            available,
        });
    }
    finish(header, &bytes[HEADER_LEN..])
}

/// Where a [`FrameDecoder`] is in the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    /// The next frame's header has not been parsed yet.
    AwaitHeader,
    /// Header parsed; waiting for the rest of the payload.
    AwaitPayload,
    /// A whole frame is buffered and ready to be taken.
    FrameComplete,
}

/// Incremental decoder over a byte stream.
///
/// Feed arbitrary chunks with [`push`](Self::push) and drain decoded signals
/// with [`next_frame`](Self::next_frame) until it returns `None`. Hub
/// connections use [`next_message`](Self::next_message), which also yields
/// control frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    header: Option<Header>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop all buffered bytes, e.g. after a connection reset.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.header = None;
    }

    pub fn state(&self) -> DecoderState {
        match self.header {
            None => DecoderState::AwaitHeader,
            Some(h) if self.buf.len() >= HEADER_LEN + h.payload_len as usize => {
                DecoderState::FrameComplete
            }
            Some(_) => DecoderState::AwaitPayload,
        }
    }

    /// Take the next frame if one is complete.
    ///
    /// Returns `None` when more bytes are needed. A recoverable error
    /// consumes the offending frame; after an unrecoverable one the decoder
    /// should be [`reset`](Self::reset) along with the connection.
    pub fn next_frame(&mut self) -> Option<Result<Signal, CodecError>> {
        self.next_message()
            .map(|frame| frame.and_then(Frame::into_signal))
    }

    /// Like [`next_frame`](Self::next_frame), keeping control frames.
    pub fn next_message(&mut self) -> Option<Result<Frame, CodecError>> {
        if self.header.is_none() {
            if self.buf.len() < HEADER_LEN {
                return None;
            }
            match parse_header(&self.buf[..HEADER_LEN]) {
                Ok(h) => self.header = Some(h),
                Err(e) => return Some(Err(e)),
            }
        }

        let header = self.header?;
        let frame_len = HEADER_LEN + header.payload_len as usize;
        if self.buf.len() < frame_len {
            return None;
        }

        let frame = self.buf.split_to(frame_len);
        self.header = None;
        Some(finish(header, &frame[HEADER_LEN..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neural_types::payload;
    use serde_json::json;

    fn id(name: &str) -> Identity {
        Identity::derive(name, Some(b"test-salt")).unwrap()
    }

    fn sample(signal_type: SignalType, value: serde_json::Value) -> Signal {
        Signal::new(signal_type, id("alice"), id("bob"), payload(value))
    }

    #[test]
    fn test_dopamine_scenario() {
        let signal = sample(SignalType::Dopamine, json!({"amount": 5}));
        let bytes = encode(&signal).unwrap();
        let payload_bytes = br#"{"amount":5}"#;
        assert_eq!(bytes.len(), 1 + 1 + 32 + 32 + 4 + payload_bytes.len());
        assert_eq!(&bytes[HEADER_LEN..], payload_bytes);
        assert_eq!(encoded_len(&signal).unwrap(), bytes.len());

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.signal_type, SignalType::Dopamine);
        assert_eq!(decoded.source, id("alice"));
        assert_eq!(decoded.target, id("bob"));
        assert_eq!(decoded.payload["amount"], json!(5));
        assert_eq!(decoded, signal);
    }

    #[test]
    fn test_header_layout() {
        let signal = sample(SignalType::Gaba, json!({"k": "v"}));
        let bytes = encode(&signal).unwrap();
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(bytes[1], 4);
        assert_eq!(&bytes[2..34], id("alice").as_bytes());
        assert_eq!(&bytes[34..66], id("bob").as_bytes());
        let len = u32::from_be_bytes([bytes[66], bytes[67], bytes[68], bytes[69]]);
        assert_eq!(len as usize, bytes.len() - HEADER_LEN);
    }

    #[test]
    fn test_roundtrip_every_type_and_broadcast() {
        for t in SignalType::ALL {
            let signal = Signal::broadcast(
                t,
                id("alice"),
                payload(json!({"nested": {"list": [1, 2.5, "x", null, true]}, "n": -3})),
            );
            let decoded = decode(&encode(&signal).unwrap()).unwrap();
            assert_eq!(decoded, signal);
            assert!(decoded.is_broadcast());
        }
    }

    #[test]
    fn test_roundtrip_preserves_arbitrary_floats() {
        use rand::{Rng, SeedableRng};

        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let mut checked = 0;
        while checked < 50_000 {
            let value = f64::from_bits(rng.gen::<u64>());
            if !value.is_finite() {
                continue;
            }
            let signal = sample(SignalType::Glutamate, json!({"v": value}));
            let decoded = decode(&encode(&signal).unwrap()).unwrap();
            assert_eq!(decoded.payload["v"].as_f64(), Some(value), "bits {:#018x}", value.to_bits());
            assert_eq!(decoded, signal);
            checked += 1;
        }

        for value in [f64::MIN_POSITIVE, 5e-324, f64::MAX, -0.0, 1.0715660391465826e-75] {
            let signal = sample(SignalType::Glutamate, json!({"v": value}));
            assert_eq!(decode(&encode(&signal).unwrap()).unwrap(), signal);
        }
    }

    #[test]
    fn test_empty_payload_is_zero_length() {
        let signal = Signal::new(SignalType::Serotonin, id("a"), id("b"), Payload::new());
        let bytes = encode(&signal).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(decode(&bytes).unwrap(), signal);
    }

    #[test]
    fn test_short_buffer_is_malformed() {
        let bytes = encode(&sample(SignalType::Dopamine, json!({"a": 1}))).unwrap();
        for cut in 0..HEADER_LEN {
            assert!(matches!(
                decode(&bytes[..cut]),
                Err(CodecError::MalformedFrame(_))
            ));
        }
    }

    #[test]
    fn test_truncated_prefixes_never_panic() {
        let bytes = encode(&sample(SignalType::Dopamine, json!({"text": "hello world"}))).unwrap();
        for cut in HEADER_LEN..bytes.len() {
            match decode(&bytes[..cut]) {
                Err(CodecError::TruncatedPayload { declared, available }) => {
                    assert_eq!(declared as usize, bytes.len() - HEADER_LEN);
                    assert_eq!(available, cut - HEADER_LEN);
                }
                other => panic!("expected TruncatedPayload, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode(&sample(SignalType::Dopamine, json!({"a": 1}))).unwrap();
        bytes.push(0);
        assert!(matches!(
            decode(&bytes),
            Err(CodecError::TruncatedPayload { .. })
        ));
    }

    #[test]
    fn test_unknown_type_and_version() {
        let mut bytes = encode(&sample(SignalType::Dopamine, json!({}))).unwrap();
        bytes[1] = 42;
        assert!(matches!(decode(&bytes), Err(CodecError::UnknownSignalType(42))));

        bytes[1] = 1;
        bytes[0] = 9;
        assert!(matches!(decode(&bytes), Err(CodecError::UnsupportedVersion(9))));
    }

    #[test]
    fn test_invalid_payload() {
        let mut bytes = encode(&Signal::new(SignalType::Dopamine, id("a"), id("b"), Payload::new())).unwrap();
        let body = b"[1,2]";
        bytes[LEN_OFFSET..HEADER_LEN].copy_from_slice(&(body.len() as u32).to_be_bytes());
        bytes.extend_from_slice(body);
        assert!(matches!(decode(&bytes), Err(CodecError::PayloadDecode(_))));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut bytes = encode(&sample(SignalType::Dopamine, json!({}))).unwrap();
        bytes[LEN_OFFSET..HEADER_LEN].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(decode(&bytes), Err(CodecError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_stream_byte_by_byte() {
        let signal = sample(SignalType::Glutamate, json!({"learn": [1, 2, 3]}));
        let bytes = encode(&signal).unwrap();
        let mut decoder = FrameDecoder::new();

        for (i, b) in bytes.iter().enumerate() {
            assert!(decoder.next_frame().is_none(), "frame completed early at {i}");
            decoder.push(&[*b]);
        }

        let decoded = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decoded, decode(&bytes).unwrap());
        assert_eq!(decoder.buffered(), 0);
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn test_stream_states() {
        let bytes = encode(&sample(SignalType::Dopamine, json!({"amount": 5}))).unwrap();
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.state(), DecoderState::AwaitHeader);

        decoder.push(&bytes[..HEADER_LEN + 2]);
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.state(), DecoderState::AwaitPayload);

        decoder.push(&bytes[HEADER_LEN + 2..]);
        assert_eq!(decoder.state(), DecoderState::FrameComplete);
        assert!(decoder.next_frame().unwrap().is_ok());
        assert_eq!(decoder.state(), DecoderState::AwaitHeader);
    }

    #[test]
    fn test_stream_multiple_frames_in_one_chunk() {
        let signals: Vec<Signal> = (0..5)
            .map(|i| sample(SignalType::ALL[i % 6], json!({"seq": i})))
            .collect();
        let mut chunk = Vec::new();
        for s in &signals {
            chunk.extend(encode(s).unwrap());
        }

        let mut decoder = FrameDecoder::new();
        decoder.push(&chunk);
        let mut decoded = Vec::new();
        while let Some(frame) = decoder.next_frame() {
            decoded.push(frame.unwrap());
        }
        assert_eq!(decoded, signals);
    }

    #[test]
    fn test_stream_arbitrary_split_points() {
        let a = sample(SignalType::Dopamine, json!({"a": "first"}));
        let b = sample(SignalType::Gaba, json!({}));
        let c = sample(SignalType::Serotonin, json!({"c": [true, false]}));
        let mut stream = Vec::new();
        for s in [&a, &b, &c] {
            stream.extend(encode(s).unwrap());
        }

        for chunk_size in [1, 3, 7, 69, 70, 71, 128] {
            let mut decoder = FrameDecoder::new();
            let mut out = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                decoder.push(chunk);
                while let Some(frame) = decoder.next_frame() {
                    out.push(frame.unwrap());
                }
            }
            assert_eq!(out, vec![a.clone(), b.clone(), c.clone()], "chunk size {chunk_size}");
        }
    }

    #[test]
    fn test_stream_recovers_after_unknown_type() {
        let good = sample(SignalType::Dopamine, json!({"ok": true}));
        let mut bad = encode(&sample(SignalType::Dopamine, json!({"bad": 1}))).unwrap();
        bad[1] = 200;

        let mut decoder = FrameDecoder::new();
        decoder.push(&bad);
        decoder.push(&encode(&good).unwrap());

        let err = decoder.next_frame().unwrap().unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(decoder.next_frame().unwrap().unwrap(), good);
    }

    #[test]
    fn test_stream_unrecoverable_version() {
        let mut bytes = encode(&sample(SignalType::Dopamine, json!({}))).unwrap();
        bytes[0] = 2;
        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        let err = decoder.next_frame().unwrap().unwrap_err();
        assert!(!err.is_recoverable());
        decoder.reset();
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_control_frame_roundtrip() {
        use crate::control::ControlMessage;

        let message = ControlMessage::Register {
            agent_id: "alice".into(),
            neural_hash: id("alice"),
        };
        let bytes = encode_control(id("alice"), &message).unwrap();
        assert_eq!(bytes[1], CONTROL_TAG);
        assert_eq!(&bytes[34..66], Identity::BROADCAST.as_bytes());
        assert_eq!(decode_frame(&bytes).unwrap(), Frame::Control(message));

        // Signal-only decoding treats it as an unknown type.
        assert!(matches!(
            decode(&bytes),
            Err(CodecError::UnknownSignalType(CONTROL_TAG))
        ));
    }

    #[test]
    fn test_stream_interleaves_control_and_signals() {
        use crate::control::ControlMessage;

        let left = ControlMessage::PeerLeft {
            agent_id: "bob".into(),
        };
        let signal = sample(SignalType::Dopamine, json!({"amount": 5}));
        let mut stream = encode_control(id("hub"), &left).unwrap();
        stream.extend(encode(&signal).unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.push(&stream);
        assert_eq!(decoder.next_message().unwrap().unwrap(), Frame::Control(left));
        assert_eq!(decoder.next_message().unwrap().unwrap(), Frame::Signal(signal.clone()));
        assert!(decoder.next_message().is_none());

        // The signal-only view skips the control frame as a recoverable error.
        decoder.push(&stream);
        let err = decoder.next_frame().unwrap().unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(decoder.next_frame().unwrap().unwrap(), signal);
    }

    #[test]
    fn test_malformed_control_payload_is_recoverable() {
        let mut bytes = encode_control(id("hub"), &crate::control::ControlMessage::PeerLeft {
            agent_id: "x".into(),
        })
        .unwrap();
        let body = br#"{"_ctrl":"nope"}"#;
        bytes.truncate(HEADER_LEN);
        bytes[LEN_OFFSET..HEADER_LEN].copy_from_slice(&(body.len() as u32).to_be_bytes());
        bytes.extend_from_slice(body);

        let err = decode_frame(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::PayloadDecode(_)));
        assert!(err.is_recoverable());
    }
}
