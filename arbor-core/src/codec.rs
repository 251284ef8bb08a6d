//! Bit-stable wire codec.
//!
//! Two layers:
//! - **Part layer**: a [`Message`] maps to a sequence of byte-string parts:
//!   route-stack entries, an empty delimiter, a fixed-size header, the topic,
//!   then optional structured and raw payload parts (presence is recorded in
//!   the header flags).
//! - **Frame layer**: each part rides the stream as `[flags][length][body]`
//!   with a MORE bit chaining parts of one message and a LONG bit selecting
//!   an 8-byte big-endian length. [`FrameDecoder`] reassembles fragmented
//!   input; the fast path slices complete frames without copying.
//!
//! Brokers push and pop route parts; services see the stack as opaque.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CoreError, ErrorCode, Result};
use crate::message::{flags, Credential, Message, MsgError, MsgKind, RouteStack};

/// Fixed header part length: type(1) + matchtag(4) + userid(4) + rolemask(4)
/// + flags(2).
pub const HEADER_LEN: usize = 15;

/// Upper bound on a single frame body. Anything larger is a protocol error;
/// bulk data beyond this belongs in a backing module, not the overlay.
pub const MAX_FRAME: usize = 256 * 1024 * 1024;

const FLAG_MORE: u8 = 0x01;
const FLAG_LONG: u8 = 0x02;

/// Encode a message into its wire parts.
///
/// The EOF marker encodes to zero parts.
#[must_use]
pub fn encode_parts(msg: &Message) -> Vec<Bytes> {
    if msg.is_eof() {
        return Vec::new();
    }

    let mut parts = Vec::with_capacity(msg.route_len() + 5);
    for entry in msg.route() {
        parts.push(entry.clone());
    }
    parts.push(Bytes::new()); // delimiter

    let mut wire_flags = msg.flags() & (flags::STREAMING | flags::NORESPONSE);
    let payload_part = if let Some(err) = msg.error() {
        wire_flags |= flags::ERROR | flags::PAYLOAD;
        let obj = serde_json::json!({
            "errnum": err.code.to_u32(),
            "errstr": err.text,
        });
        Some(Bytes::from(obj.to_string()))
    } else if let Some(payload) = msg.payload() {
        wire_flags |= flags::PAYLOAD;
        Some(Bytes::from(payload.to_string()))
    } else {
        None
    };
    if msg.raw().is_some() {
        wire_flags |= flags::RAW;
    }

    let mut header = BytesMut::with_capacity(HEADER_LEN);
    header.put_u8(msg.kind() as u8);
    header.put_u32(msg.matchtag());
    header.put_u32(msg.cred().userid);
    header.put_u32(msg.cred().rolemask);
    header.put_u16(wire_flags);
    parts.push(header.freeze());

    parts.push(Bytes::copy_from_slice(msg.topic().as_bytes()));

    if let Some(part) = payload_part {
        parts.push(part);
    }
    if let Some(raw) = msg.raw() {
        parts.push(raw.clone());
    }
    parts
}

/// Decode wire parts back into a message.
///
/// # Errors
///
/// Any structural defect (missing delimiter, short header, unknown type tag,
/// non-UTF-8 topic, undecodable payload) is a protocol error.
pub fn decode_parts(parts: &[Bytes]) -> Result<Message> {
    if parts.is_empty() {
        return Ok(Message::eof());
    }

    let delim = parts
        .iter()
        .position(|p| p.is_empty())
        .ok_or_else(|| CoreError::protocol("missing route delimiter"))?;
    let route: RouteStack = parts[..delim].iter().cloned().collect();
    let rest = &parts[delim + 1..];

    let header = rest
        .first()
        .ok_or_else(|| CoreError::protocol("missing header part"))?;
    if header.len() != HEADER_LEN {
        return Err(CoreError::protocol(format!(
            "header part is {} bytes, expected {HEADER_LEN}",
            header.len()
        )));
    }
    let mut hdr = header.clone();
    let kind = MsgKind::from_u8(hdr.get_u8())?;
    let matchtag = hdr.get_u32();
    let userid = hdr.get_u32();
    let rolemask = hdr.get_u32();
    let wire_flags = hdr.get_u16();

    let topic_part = rest
        .get(1)
        .ok_or_else(|| CoreError::protocol("missing topic part"))?;
    let topic = std::str::from_utf8(topic_part)
        .map_err(|_| CoreError::protocol("topic is not valid UTF-8"))?;

    let mut next = 2;
    let payload_part = if wire_flags & flags::PAYLOAD != 0 {
        let part = rest
            .get(next)
            .ok_or_else(|| CoreError::protocol("flags promise a payload part"))?;
        next += 1;
        Some(part)
    } else {
        None
    };
    let raw_part = if wire_flags & flags::RAW != 0 {
        let part = rest
            .get(next)
            .ok_or_else(|| CoreError::protocol("flags promise a raw part"))?;
        next += 1;
        Some(part)
    } else {
        None
    };
    if rest.len() != next {
        return Err(CoreError::protocol("trailing parts after message body"));
    }

    let mut msg = Message::from_wire(kind, topic)
        .with_matchtag(matchtag)
        .with_cred(Credential::new(userid, rolemask));
    msg.set_route(route);
    msg.set_flags(wire_flags & (flags::STREAMING | flags::NORESPONSE));

    if let Some(part) = payload_part {
        let value: serde_json::Value = serde_json::from_slice(part)
            .map_err(|_| CoreError::protocol("structured payload is not valid JSON"))?;
        if wire_flags & flags::ERROR != 0 {
            let errnum = value
                .get("errnum")
                .and_then(serde_json::Value::as_u64)
                .ok_or_else(|| CoreError::protocol("error payload lacks errnum"))?;
            let text = value
                .get("errstr")
                .and_then(serde_json::Value::as_str)
                .map(str::to_owned);
            msg.set_flags(msg.flags() | flags::ERROR);
            msg.set_error(MsgError {
                code: ErrorCode::from_u32(errnum as u32),
                text,
            });
        } else {
            msg = msg.with_payload(value);
        }
    }
    if let Some(part) = raw_part {
        msg = msg.with_raw(part.clone());
    }
    Ok(msg)
}

/// Append a message's frames to `buf` for stream transport.
///
/// Each part becomes one frame; all but the last carry the MORE bit.
pub fn encode_stream(msg: &Message, buf: &mut BytesMut) {
    let parts = encode_parts(msg);
    let count = parts.len();
    for (i, part) in parts.iter().enumerate() {
        let more = i + 1 < count;
        let long = part.len() > 255;
        let mut frame_flags = 0u8;
        if more {
            frame_flags |= FLAG_MORE;
        }
        if long {
            frame_flags |= FLAG_LONG;
        }
        buf.reserve(1 + if long { 8 } else { 1 } + part.len());
        buf.put_u8(frame_flags);
        if long {
            buf.put_u64(part.len() as u64);
        } else {
            buf.put_u8(part.len() as u8);
        }
        buf.extend_from_slice(part);
    }
}

/// One decoded stream frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub more: bool,
    pub payload: Bytes,
}

/// Stateful stream-frame decoder.
///
/// Feed bytes into an accumulation buffer and call [`FrameDecoder::decode`]
/// until it returns `None` (needs more data).
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending_more: Option<bool>,
    expected_len: usize,
    staging: BytesMut,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a single frame from `src`.
    ///
    /// Returns `Ok(Some(frame))` when a frame completed, `Ok(None)` when
    /// more bytes are needed.
    ///
    /// # Errors
    ///
    /// Reserved flag bits and oversized lengths are protocol errors.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        // Reassembly of a fragmented body.
        if let Some(more) = self.pending_more {
            let needed = self.expected_len - self.staging.len();
            let take = needed.min(src.len());
            self.staging.extend_from_slice(&src.split_to(take));
            if self.staging.len() < self.expected_len {
                return Ok(None);
            }
            let payload = self.staging.split().freeze();
            self.pending_more = None;
            self.expected_len = 0;
            return Ok(Some(Frame { more, payload }));
        }

        if src.len() < 2 {
            return Ok(None);
        }
        let frame_flags = src[0];
        if frame_flags & !(FLAG_MORE | FLAG_LONG) != 0 {
            return Err(CoreError::protocol("reserved frame flag bits set"));
        }
        let long = frame_flags & FLAG_LONG != 0;
        let header_len = if long { 9 } else { 2 };
        if src.len() < header_len {
            return Ok(None);
        }
        let body_len = if long {
            u64::from_be_bytes(src[1..9].try_into().expect("slice length checked")) as usize
        } else {
            src[1] as usize
        };
        if body_len > MAX_FRAME {
            return Err(CoreError::TooLarge { size: body_len, max: MAX_FRAME });
        }
        let more = frame_flags & FLAG_MORE != 0;

        // Fast path: entire frame present.
        if src.len() >= header_len + body_len {
            src.advance(header_len);
            let payload = src.split_to(body_len).freeze();
            return Ok(Some(Frame { more, payload }));
        }

        // Slow path: stash what we have and wait for the rest.
        src.advance(header_len);
        self.pending_more = Some(more);
        self.expected_len = body_len;
        self.staging.clear();
        let take = src.len().min(body_len);
        self.staging.extend_from_slice(&src.split_to(take));
        Ok(None)
    }
}

/// Accumulates frames into complete messages.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    decoder: FrameDecoder,
    parts: Vec<Bytes>,
}

impl MessageAssembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as many complete messages as `src` currently holds.
    ///
    /// # Errors
    ///
    /// Propagates frame and part decode failures.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Vec<Message>> {
        let mut out = Vec::new();
        while let Some(frame) = self.decoder.decode(src)? {
            self.parts.push(frame.payload);
            if !frame.more {
                let parts = std::mem::take(&mut self.parts);
                out.push(decode_parts(&parts)?);
            }
        }
        Ok(out)
    }
}
