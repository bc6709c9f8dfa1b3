//! Binary framing for notifications delivered to a device's inbound listener
//!
//! Wire format (all integers are big-endian):
//!
//! ```text
//! +--------+--------+------------------+
//! | type   | length | payload          |
//! | 1 byte | 4 bytes| variable         |
//! +--------+--------+------------------+
//! ```
//!
//! Message types:
//! - 0x01: BlockManifest (requester_len:2, requester, zstd chunk manifest)
//! - 0x02: ContentAvailable (kind:1, locator_len:2, locator, publisher_len:2, publisher)
//! - 0x03: CompleteSeeding (locator_len:2, locator)
//! - 0x05: Ok (no payload)
//! - 0x06: Error (message)

use std::io::{Read, Write};

use color_eyre::Result;
use color_eyre::eyre::{bail, ensure};

use crate::model::ChangeKind;

/// Frames larger than this are refused before allocating
pub const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

/// Length of the type + length header
pub const HEADER_LEN: usize = 5;

/// Message type identifiers
pub mod msg {
    pub const BLOCK_MANIFEST: u8 = 0x01;
    pub const CONTENT_AVAILABLE: u8 = 0x02;
    pub const COMPLETE_SEEDING: u8 = 0x03;
    pub const OK: u8 = 0x05;
    pub const ERROR: u8 = 0x06;
}

/// A message exchanged with an inbound listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A joining peer's chunk manifest, to be reconciled against the local tree
    BlockManifest {
        requester: String,
        /// Encoded [`crate::chunker::BlockManifest`]
        manifest: Vec<u8>,
    },
    /// A manifest was published and can be pulled from the swarm
    ContentAvailable {
        kind: ChangeKind,
        locator: String,
        publisher: String,
    },
    /// Every recipient has the content; stop seeding it
    CompleteSeeding { locator: String },
    Ok,
    Error(String),
}

impl Message {
    /// Short name for logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::BlockManifest { .. } => "block-manifest",
            Self::ContentAvailable { .. } => "content-available",
            Self::CompleteSeeding { .. } => "complete-seeding",
            Self::Ok => "ok",
            Self::Error(_) => "error",
        }
    }
}

fn write_header<W: Write>(w: &mut W, msg_type: u8, len: u32) -> std::io::Result<()> {
    w.write_all(&[msg_type])?;
    w.write_all(&len.to_be_bytes())?;
    Ok(())
}

/// Parse a frame header, returns (type, length)
///
/// # Errors
/// Returns an error if the declared length exceeds [`MAX_FRAME_LEN`].
pub fn parse_header(header: [u8; HEADER_LEN]) -> Result<(u8, u32)> {
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    ensure!(len <= MAX_FRAME_LEN, "frame of {len} bytes exceeds limit");
    Ok((header[0], len))
}

fn encode_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    let Ok(len) = u16::try_from(s.len()) else {
        bail!("string of {} bytes too long for frame", s.len());
    };
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn decode_str<R: Read>(r: &mut R) -> Result<String> {
    let mut len_buf = [0u8; 2];
    r.read_exact(&mut len_buf)?;
    let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
    r.read_exact(&mut buf)?;
    Ok(String::from_utf8(buf)?)
}

fn kind_byte(kind: ChangeKind) -> u8 {
    match kind {
        ChangeKind::Block => 0,
        ChangeKind::Patch => 1,
    }
}

/// Encode a message into a complete frame
///
/// # Errors
/// Returns an error if a string field or the payload is too large
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    let msg_type = match message {
        Message::BlockManifest { requester, manifest } => {
            encode_str(&mut payload, requester)?;
            payload.extend_from_slice(manifest);
            msg::BLOCK_MANIFEST
        }
        Message::ContentAvailable {
            kind,
            locator,
            publisher,
        } => {
            payload.push(kind_byte(*kind));
            encode_str(&mut payload, locator)?;
            encode_str(&mut payload, publisher)?;
            msg::CONTENT_AVAILABLE
        }
        Message::CompleteSeeding { locator } => {
            encode_str(&mut payload, locator)?;
            msg::COMPLETE_SEEDING
        }
        Message::Ok => msg::OK,
        Message::Error(text) => {
            payload.extend_from_slice(text.as_bytes());
            msg::ERROR
        }
    };

    let len = u32::try_from(payload.len()).ok().filter(|l| *l <= MAX_FRAME_LEN);
    let Some(len) = len else {
        bail!("payload of {} bytes exceeds frame limit", payload.len());
    };

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    write_header(&mut frame, msg_type, len)?;
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode a message body given its already-parsed header
///
/// # Errors
/// Returns an error for an unknown type or a truncated or malformed payload
pub fn decode(msg_type: u8, payload: &[u8]) -> Result<Message> {
    let mut r = payload;

    let message = match msg_type {
        msg::BLOCK_MANIFEST => {
            let requester = decode_str(&mut r)?;
            Message::BlockManifest {
                requester,
                manifest: r.to_vec(),
            }
        }
        msg::CONTENT_AVAILABLE => {
            let mut kind = [0u8; 1];
            r.read_exact(&mut kind)?;
            let kind = match kind[0] {
                0 => ChangeKind::Block,
                1 => ChangeKind::Patch,
                other => bail!("unknown changeset kind {other:#04x}"),
            };
            Message::ContentAvailable {
                kind,
                locator: decode_str(&mut r)?,
                publisher: decode_str(&mut r)?,
            }
        }
        msg::COMPLETE_SEEDING => Message::CompleteSeeding {
            locator: decode_str(&mut r)?,
        },
        msg::OK => Message::Ok,
        msg::ERROR => Message::Error(String::from_utf8_lossy(r).into_owned()),
        other => bail!("unknown message type {other:#04x}"),
    };

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_of_messages() {
        let messages = vec![
            Message::BlockManifest {
                requester: "laptop".into(),
                manifest: vec![1, 2, 3],
            },
            Message::ContentAvailable {
                kind: ChangeKind::Patch,
                locator: "swarm:abcd".into(),
                publisher: "desktop".into(),
            },
            Message::CompleteSeeding {
                locator: "swarm:abcd".into(),
            },
            Message::Ok,
            Message::Error("disk full".into()),
        ];

        let mut stream = Vec::new();
        for message in &messages {
            stream.extend(encode(message).unwrap());
        }

        let mut rest = stream.as_slice();
        for expected in &messages {
            let (header, tail) = rest.split_at(HEADER_LEN);
            let (msg_type, len) = parse_header(header.try_into().unwrap()).unwrap();
            let (payload, tail) = tail.split_at(len as usize);
            assert_eq!(&decode(msg_type, payload).unwrap(), expected);
            rest = tail;
        }
        assert!(rest.is_empty());
    }

    #[test]
    fn test_header_layout() {
        let frame = encode(&Message::CompleteSeeding { locator: "x".into() }).unwrap();
        assert_eq!(frame, vec![msg::COMPLETE_SEEDING, 0, 0, 0, 3, 0, 1, b'x']);
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(decode(0x7f, &[]).is_err());
        assert!(decode(msg::CONTENT_AVAILABLE, &[9, 0, 0, 0, 0]).is_err());
        assert!(decode(msg::COMPLETE_SEEDING, &[0, 10, b'a']).is_err());
        assert!(parse_header([msg::OK, 0xff, 0xff, 0xff, 0xff]).is_err());
    }
}
