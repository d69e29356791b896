//! Compact textual wire form (version 3, the chunk-capable format; the
//! earlier JSON+CRC16 and first positional encodings are superseded and
//! rejected).
//!
//! Grammar, per packet type:
//!
//! ```text
//! Beacon   SRC[|name]                      bare 8-char id, no tag
//! Initial  3I SRC DST |pn|acks|key[|name]  key is base64, no padding
//! Data     3D SRC DST |pn|acks|KF|payload  K: C=chat O=offer, F: E/P
//! Ack      3A SRC DST |pn|acks
//! ```
//!
//! Device ids are fixed-width uppercase hex; the broadcast destination is
//! `********`. Packet numbers and range bounds are base-36 (`0-9A-Z`).
//! Ack ranges are `start-end` pairs joined by commas, empty when none.
//! The `Data` payload is the final field and may itself contain pipes.
//!
//! Decoding is total: a photographed frame may be corrupt or a stray code
//! in the background, so every malformed input is a `DecodeError` the
//! caller silently drops, never a panic.

use crate::identity::DeviceId;
use crate::packet::{MessageKind, Packet, PacketBody, WIRE_VERSION};
use crate::sack::{AckRange, AckRanges};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

/// Broadcast destination wildcard, same width as a device id.
pub const BROADCAST: &str = "********";

const HEADER_LEN: usize = 2 + 8 + 8 + 1; // version, tag, src, dst, '|'

/// Base-36 digit alphabet shared with the chunk framing.
pub(crate) const BASE36: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

pub(crate) fn to_base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = [0u8; 13];
    let mut i = buf.len();
    while n > 0 {
        i -= 1;
        buf[i] = BASE36[(n % 36) as usize];
        n /= 36;
    }
    String::from_utf8_lossy(&buf[i..]).into_owned()
}

pub(crate) fn from_base36(s: &str) -> Option<u64> {
    if s.is_empty() {
        return None;
    }
    let mut n: u64 = 0;
    for b in s.bytes() {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'A'..=b'Z' => b - b'A' + 10,
            _ => return None,
        };
        n = n.checked_mul(36)?.checked_add(digit as u64)?;
    }
    Some(n)
}

/// A frame that failed to decode. Always recoverable: the caller drops the
/// frame and keeps going.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("frame too short")]
    Truncated,
    #[error("unsupported wire version {0:?}")]
    Version(char),
    #[error("unknown packet type {0:?}")]
    UnknownType(char),
    #[error("bad device id")]
    BadDeviceId,
    #[error("bad packet number")]
    BadNumber,
    #[error("bad ack ranges")]
    BadRanges,
    #[error("bad key material")]
    BadKey,
    #[error("bad message kind")]
    BadKind,
    #[error("malformed frame")]
    Malformed,
}

/// Encode a packet into its canonical wire string.
pub fn encode(packet: &Packet) -> String {
    match &packet.body {
        PacketBody::Beacon { name } => {
            let mut out = packet.src.to_string();
            if let Some(name) = name {
                out.push('|');
                out.push_str(name);
            }
            out
        }
        PacketBody::Initial { public_key, name } => {
            let mut out = header('I', packet);
            out.push('|');
            out.push_str(&STANDARD_NO_PAD.encode(public_key.as_bytes()));
            if let Some(name) = name {
                out.push('|');
                out.push_str(name);
            }
            out
        }
        PacketBody::Data {
            kind,
            encrypted,
            payload,
        } => {
            let mut out = header('D', packet);
            out.push('|');
            out.push(match kind {
                MessageKind::Chat => 'C',
                MessageKind::Offer => 'O',
            });
            out.push(if *encrypted { 'E' } else { 'P' });
            out.push('|');
            out.push_str(payload);
            out
        }
        PacketBody::Ack => header('A', packet),
    }
}

fn header(tag: char, packet: &Packet) -> String {
    let mut out = String::with_capacity(32);
    out.push(WIRE_VERSION);
    out.push(tag);
    out.push_str(&packet.src.to_string());
    match packet.dst {
        Some(dst) => out.push_str(&dst.to_string()),
        None => out.push_str(BROADCAST),
    }
    out.push('|');
    out.push_str(&to_base36(packet.pn));
    out.push('|');
    out.push_str(&encode_ranges(&packet.acks));
    out
}

fn encode_ranges(ranges: &[AckRange]) -> String {
    let mut out = String::new();
    for (i, r) in ranges.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&to_base36(r.start));
        out.push('-');
        out.push_str(&to_base36(r.end));
    }
    out
}

fn decode_ranges(field: &str) -> Result<Vec<AckRange>, DecodeError> {
    if field.is_empty() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for part in field.split(',') {
        let (start, end) = part.split_once('-').ok_or(DecodeError::BadRanges)?;
        let start = from_base36(start).ok_or(DecodeError::BadRanges)?;
        let end = from_base36(end).ok_or(DecodeError::BadRanges)?;
        out.push(AckRange { start, end });
    }
    // Ranges on the wire must already be sorted, disjoint, and merged.
    if AckRanges::from_sorted(&out).is_none() {
        return Err(DecodeError::BadRanges);
    }
    Ok(out)
}

fn is_beacon_shaped(input: &str) -> bool {
    let b = input.as_bytes();
    if b.len() < 8 || !b[..8].iter().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()) {
        return false;
    }
    // A tagged frame also starts with hex ("3D"/"3A" plus id prefix), but
    // its 9th character is still inside the src id, never a pipe, and its
    // total length is never exactly 8.
    b.len() == 8 || b[8] == b'|'
}

/// Decode one wire string back into a packet. `decode(encode(p)) == p`
/// for every valid packet `p`.
pub fn decode(input: &str) -> Result<Packet, DecodeError> {
    if input.is_empty() {
        return Err(DecodeError::Truncated);
    }
    if is_beacon_shaped(input) {
        return decode_beacon(input);
    }
    let bytes = input.as_bytes();
    if bytes.len() < 2 {
        return Err(DecodeError::Truncated);
    }
    if !bytes[0].is_ascii_digit() {
        return Err(DecodeError::Malformed);
    }
    let tag = bytes[1] as char;
    if !matches!(tag, 'I' | 'D' | 'A') {
        return Err(DecodeError::UnknownType(tag));
    }
    if bytes[0] as char != WIRE_VERSION {
        return Err(DecodeError::Version(bytes[0] as char));
    }
    if bytes.len() < HEADER_LEN || !bytes[..HEADER_LEN].is_ascii() {
        return Err(DecodeError::Truncated);
    }
    let src: DeviceId = input[2..10].parse().map_err(|_| DecodeError::BadDeviceId)?;
    let dst = if &input[10..18] == BROADCAST {
        None
    } else {
        Some(input[10..18].parse().map_err(|_| DecodeError::BadDeviceId)?)
    };
    if bytes[18] != b'|' {
        return Err(DecodeError::Malformed);
    }
    let rest = &input[HEADER_LEN..];
    match tag {
        'I' => {
            let mut fields = rest.splitn(4, '|');
            let pn = parse_pn(fields.next())?;
            let acks = decode_ranges(fields.next().ok_or(DecodeError::Truncated)?)?;
            let key_field = fields.next().ok_or(DecodeError::Truncated)?;
            let key_bytes = STANDARD_NO_PAD
                .decode(key_field)
                .map_err(|_| DecodeError::BadKey)?;
            let key: [u8; 32] = key_bytes.try_into().map_err(|_| DecodeError::BadKey)?;
            let name = fields.next().map(str::to_string);
            Ok(Packet {
                src,
                dst,
                pn,
                acks,
                body: PacketBody::Initial {
                    public_key: crate::identity::PublicKey::from_bytes(key),
                    name,
                },
            })
        }
        'D' => {
            let mut fields = rest.splitn(4, '|');
            let pn = parse_pn(fields.next())?;
            let acks = decode_ranges(fields.next().ok_or(DecodeError::Truncated)?)?;
            let kind_field = fields.next().ok_or(DecodeError::Truncated)?;
            let payload = fields.next().ok_or(DecodeError::Truncated)?;
            let mut kf = kind_field.chars();
            let kind = match kf.next() {
                Some('C') => MessageKind::Chat,
                Some('O') => MessageKind::Offer,
                _ => return Err(DecodeError::BadKind),
            };
            let encrypted = match kf.next() {
                Some('E') => true,
                Some('P') => false,
                _ => return Err(DecodeError::BadKind),
            };
            if kf.next().is_some() {
                return Err(DecodeError::BadKind);
            }
            Ok(Packet {
                src,
                dst,
                pn,
                acks,
                body: PacketBody::Data {
                    kind,
                    encrypted,
                    payload: payload.to_string(),
                },
            })
        }
        'A' => {
            let mut fields = rest.splitn(3, '|');
            let pn = parse_pn(fields.next())?;
            let acks = decode_ranges(fields.next().ok_or(DecodeError::Truncated)?)?;
            if fields.next().is_some() {
                return Err(DecodeError::Malformed);
            }
            Ok(Packet {
                src,
                dst,
                pn,
                acks,
                body: PacketBody::Ack,
            })
        }
        _ => Err(DecodeError::UnknownType(tag)),
    }
}

fn parse_pn(field: Option<&str>) -> Result<u64, DecodeError> {
    from_base36(field.ok_or(DecodeError::Truncated)?).ok_or(DecodeError::BadNumber)
}

fn decode_beacon(input: &str) -> Result<Packet, DecodeError> {
    let src: DeviceId = input[..8].parse().map_err(|_| DecodeError::BadDeviceId)?;
    let name = if input.len() > 8 {
        Some(input[9..].to_string())
    } else {
        None
    };
    Ok(Packet::beacon(src, name))
}
