//! Routing packet: the outer frame that multiplexes many agents over a
//! single transport body.
//!
//! Fixed 20-byte header per frame, little-endian:
//!
//! ```text
//! offset  size  field
//! 0       8     session_id, ASCII, NUL-padded
//! 8       1     language (0 = powershell, 1 = python)
//! 9       1     meta tag (0..=5)
//! 10      4     additional (u32, meta-specific, usually 0)
//! 14      4     payload_length (u32)
//! 18      2     reserved (0)
//! 20      N     payload (payload_length bytes)
//! ```
//!
//! A body shorter than one header is [`AgentError::ShortPacket`]. A frame
//! whose `payload_length` claims more bytes than remain in the body is
//! also `ShortPacket`. Frames concatenate; there is no trailing frame
//! count, the parser simply consumes until the body is exhausted.

use super::{Language, MetaTag};
use crate::error::{AgentError, Result};

pub const HEADER_LEN: usize = 20;
const SESSION_ID_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct RoutingFrame {
    pub session_id: String,
    pub language: Language,
    pub meta: MetaTag,
    pub additional: u32,
    pub payload: Vec<u8>,
}

pub fn encode_routing_packet(frames: &[RoutingFrame]) -> Vec<u8> {
    let mut out = Vec::new();
    for frame in frames {
        let mut session_bytes = [0u8; SESSION_ID_LEN];
        let raw = frame.session_id.as_bytes();
        let n = raw.len().min(SESSION_ID_LEN);
        session_bytes[..n].copy_from_slice(&raw[..n]);

        out.extend_from_slice(&session_bytes);
        out.push(frame.language.to_byte());
        out.push(frame.meta.to_byte());
        out.extend_from_slice(&frame.additional.to_le_bytes());
        out.extend_from_slice(&(frame.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&[0u8; 2]);
        out.extend_from_slice(&frame.payload);
    }
    out
}

pub fn decode_routing_packet(body: &[u8]) -> Result<Vec<RoutingFrame>> {
    if body.len() < HEADER_LEN {
        return Err(AgentError::ShortPacket);
    }

    let mut frames = Vec::new();
    let mut offset = 0usize;

    while offset < body.len() {
        if body.len() - offset < HEADER_LEN {
            return Err(AgentError::ShortPacket);
        }
        let header = &body[offset..offset + HEADER_LEN];

        let session_id = String::from_utf8_lossy(&header[0..SESSION_ID_LEN])
            .trim_end_matches('\0')
            .to_string();
        let language = Language::from_byte(header[8]).ok_or(AgentError::MalformedRouting)?;
        let meta = MetaTag::from_byte(header[9]).ok_or(AgentError::MalformedRouting)?;
        let additional = u32::from_le_bytes(header[10..14].try_into().unwrap());
        let payload_length = u32::from_le_bytes(header[14..18].try_into().unwrap()) as usize;

        let payload_start = offset + HEADER_LEN;
        if body.len() - payload_start < payload_length {
            return Err(AgentError::ShortPacket);
        }
        let payload = body[payload_start..payload_start + payload_length].to_vec();

        frames.push(RoutingFrame {
            session_id,
            language,
            meta,
            additional,
            payload,
        });

        offset = payload_start + payload_length;
    }

    Ok(frames)
}
