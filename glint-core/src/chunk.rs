//! Chunk framing: split an encoded packet that exceeds the optical frame
//! into fixed 8-character chunk frames, and reassemble on the far side.
//!
//! Frame layout: marker, base-36 stream id, base-36 chunk index, a flag
//! character, then 4 data characters. The flag is `>` on continuation
//! frames; on the final frame it is instead the digit `1`-`4` giving how
//! many of the data characters are real, with the rest right-padded by
//! the fill character. Reassembly keeps exactly that many, so payloads
//! that genuinely end in the fill character survive.
//!
//! The single-character base-36 index caps a stream at 36 chunks (144
//! data characters). That ceiling is a documented constraint of the
//! format, surfaced as `ChunkError::TooLong` rather than handled.

use std::collections::HashMap;

use crate::wire::BASE36;

/// Characters one optical frame reliably carries. A bare beacon fits
/// exactly; everything longer is chunked.
pub const FRAME_LEN: usize = 8;
/// Data characters per chunk frame.
pub const DATA_LEN: usize = 4;
/// Leading marker distinguishing chunk frames from bare packets.
pub const MARKER: char = '#';
/// Most chunks a single stream can carry.
pub const MAX_CHUNKS: usize = 36;
/// Distinct concurrent stream ids.
pub const MAX_STREAMS: u8 = 36;

const FLAG_MORE: char = '>';
const FILL: char = '~';

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("encoded packet needs {chunks} chunks, format maximum is {MAX_CHUNKS}")]
    TooLong { chunks: usize },
    #[error("stream id out of range")]
    StreamOutOfRange,
    #[error("malformed chunk frame")]
    BadFrame,
}

/// Split an encoded packet into displayable frames. A packet that already
/// fits in one frame passes through untouched as a single element.
pub fn chunk(encoded: &str, stream_id: u8) -> Result<Vec<String>, ChunkError> {
    if stream_id >= MAX_STREAMS {
        return Err(ChunkError::StreamOutOfRange);
    }
    let chars: Vec<char> = encoded.chars().collect();
    if chars.len() <= FRAME_LEN {
        return Ok(vec![encoded.to_string()]);
    }
    let count = chars.len().div_ceil(DATA_LEN);
    if count > MAX_CHUNKS {
        return Err(ChunkError::TooLong { chunks: count });
    }
    let mut out = Vec::with_capacity(count);
    for (index, piece) in chars.chunks(DATA_LEN).enumerate() {
        let last = index == count - 1;
        let mut frame = String::with_capacity(FRAME_LEN);
        frame.push(MARKER);
        frame.push(digit36(stream_id));
        frame.push(digit36(index as u8));
        frame.push(if last {
            digit36(piece.len() as u8)
        } else {
            FLAG_MORE
        });
        frame.extend(piece);
        for _ in piece.len()..DATA_LEN {
            frame.push(FILL);
        }
        out.push(frame);
    }
    Ok(out)
}

/// True when the scanned string is a chunk frame rather than a bare
/// packet.
pub fn is_chunk_frame(input: &str) -> bool {
    input.starts_with(MARKER)
}

fn digit36(v: u8) -> char {
    BASE36[(v as usize) % BASE36.len()] as char
}

fn val36(c: char) -> Option<u8> {
    match c {
        '0'..='9' => Some(c as u8 - b'0'),
        'A'..='Z' => Some(c as u8 - b'A' + 10),
        _ => None,
    }
}

#[derive(Default)]
struct StreamBuf {
    parts: HashMap<u8, String>,
    last: Option<u8>,
}

/// Per-stream reassembly buffers. A stream completes, is returned, and is
/// cleared the instant every index `0..=last` has been observed; nothing
/// accumulates for finished streams.
#[derive(Default)]
pub struct ChunkAssembler {
    streams: HashMap<u8, StreamBuf>,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk frame. Returns the reassembled string once its
    /// stream is complete, `None` while chunks are still missing.
    /// Re-delivered indices overwrite; the transport repeats frames
    /// freely and that must not corrupt assembly.
    pub fn add(&mut self, frame: &str) -> Result<Option<String>, ChunkError> {
        let chars: Vec<char> = frame.chars().collect();
        if chars.len() != FRAME_LEN || chars[0] != MARKER {
            return Err(ChunkError::BadFrame);
        }
        let stream = val36(chars[1]).ok_or(ChunkError::BadFrame)?;
        let index = val36(chars[2]).ok_or(ChunkError::BadFrame)?;
        // `>` continues; a digit marks the final frame and says how many
        // data characters are real (the rest is fill).
        let (last, take) = match chars[3] {
            FLAG_MORE => (false, DATA_LEN),
            d @ '1'..='4' => (true, d as usize - '0' as usize),
            _ => return Err(ChunkError::BadFrame),
        };
        let buf = self.streams.entry(stream).or_default();
        buf.parts.insert(index, chars[4..4 + take].iter().collect());
        if last {
            buf.last = Some(index);
        }
        let Some(last_index) = buf.last else {
            return Ok(None);
        };
        if !(0..=last_index).all(|i| buf.parts.contains_key(&i)) {
            return Ok(None);
        }
        let mut joined = String::new();
        for i in 0..=last_index {
            if let Some(part) = buf.parts.get(&i) {
                joined.push_str(part);
            }
        }
        self.streams.remove(&stream);
        Ok(Some(joined))
    }

    /// Drop every partial stream.
    pub fn reset(&mut self) {
        self.streams.clear();
    }

    /// Streams currently mid-assembly.
    pub fn pending_streams(&self) -> usize {
        self.streams.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_packet_passes_through() {
        let frames = chunk("AAAA1111", 0).unwrap();
        assert_eq!(frames, vec!["AAAA1111".to_string()]);
    }

    #[test]
    fn frames_are_fixed_width() {
        let frames = chunk("ABCDEFGHIJK", 2).unwrap();
        assert_eq!(frames.len(), 3);
        for f in &frames {
            assert_eq!(f.chars().count(), FRAME_LEN);
            assert!(f.starts_with(MARKER));
        }
        assert_eq!(frames[0], "#20>ABCD");
        assert_eq!(frames[1], "#21>EFGH");
        assert_eq!(frames[2], "#223IJK~");
    }

    #[test]
    fn roundtrip_in_order() {
        let input = "3DAAAA1111BBBB2222|1|1-3|CP|salut tout le monde";
        let mut asm = ChunkAssembler::new();
        let frames = chunk(input, 5).unwrap();
        let mut result = None;
        for f in &frames {
            result = asm.add(f).unwrap();
        }
        assert_eq!(result.as_deref(), Some(input));
        assert_eq!(asm.pending_streams(), 0);
    }

    #[test]
    fn roundtrip_out_of_order_and_duplicated() {
        let input = "3IAAAA1111BBBB2222|2||AAAABBBBCCCCDDDD";
        let frames = chunk(input, 9).unwrap();
        let mut asm = ChunkAssembler::new();
        // deliver in reverse, then repeat one in the middle
        let mut result = None;
        for f in frames.iter().rev() {
            assert!(result.is_none());
            result = asm.add(f).unwrap();
        }
        assert_eq!(result.as_deref(), Some(input));
        // duplicates of an already-cleared stream just start a new buffer
        assert_eq!(asm.add(&frames[1]).unwrap(), None);
        asm.reset();
        assert_eq!(asm.pending_streams(), 0);
    }

    #[test]
    fn duplicate_index_mid_stream_overwrites() {
        let input = "0123456789AB";
        let frames = chunk(input, 0).unwrap();
        let mut asm = ChunkAssembler::new();
        assert_eq!(asm.add(&frames[0]).unwrap(), None);
        assert_eq!(asm.add(&frames[0]).unwrap(), None);
        assert_eq!(asm.add(&frames[1]).unwrap(), None);
        assert_eq!(asm.add(&frames[2]).unwrap().as_deref(), Some(input));
    }

    #[test]
    fn interleaved_streams_do_not_mix() {
        let a = "first oversized packet!";
        let b = "second oversized packet";
        let fa = chunk(a, 1).unwrap();
        let fb = chunk(b, 2).unwrap();
        let mut asm = ChunkAssembler::new();
        let mut done = Vec::new();
        for (x, y) in fa.iter().zip(fb.iter()) {
            if let Some(s) = asm.add(x).unwrap() {
                done.push(s);
            }
            if let Some(s) = asm.add(y).unwrap() {
                done.push(s);
            }
        }
        assert_eq!(done, vec![a.to_string(), b.to_string()]);
    }

    #[test]
    fn exact_multiple_of_data_len_has_no_padding() {
        let input = "ABCDEFGHIJKL"; // 12 chars, 3 full chunks
        let frames = chunk(input, 0).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(!frames[2].contains('~'));
        let mut asm = ChunkAssembler::new();
        let mut out = None;
        for f in &frames {
            out = asm.add(f).unwrap();
        }
        assert_eq!(out.as_deref(), Some(input));
    }

    #[test]
    fn oversized_packet_is_a_typed_error() {
        let big = "x".repeat(MAX_CHUNKS * DATA_LEN + 1);
        assert_eq!(
            chunk(&big, 0),
            Err(ChunkError::TooLong {
                chunks: MAX_CHUNKS + 1
            })
        );
        // the boundary itself is fine
        let edge = "x".repeat(MAX_CHUNKS * DATA_LEN);
        assert_eq!(chunk(&edge, 0).unwrap().len(), MAX_CHUNKS);
    }

    #[test]
    fn bad_frames_are_rejected() {
        let mut asm = ChunkAssembler::new();
        for frame in [
            "", "#00", "#00>ABCDE", "x00>ABCD", "#0!>ABCD", "#00?ABCD", "#00.ABCD", "#000ABCD",
            "#005ABCD",
        ] {
            assert_eq!(asm.add(frame), Err(ChunkError::BadFrame), "{frame:?}");
        }
        assert_eq!(chunk("whatever this is", MAX_STREAMS), Err(ChunkError::StreamOutOfRange));
    }

    #[test]
    fn payload_ending_in_fill_char_survives_reassembly() {
        // a plaintext payload is the final wire field and may end in `~`
        for input in [
            "3DAAAA1111BBBB2222|1||CP|see you later~",
            "AAAA1111|name~~",
            "3DAAAA1111BBBB2222|1||CP|~~~~",
        ] {
            let frames = chunk(input, 4).unwrap();
            let mut asm = ChunkAssembler::new();
            let mut out = None;
            for f in &frames {
                out = asm.add(f).unwrap();
            }
            assert_eq!(out.as_deref(), Some(input));
        }
    }

    #[test]
    fn multibyte_payload_chunks_by_characters() {
        let input = "héllo wörld, ça va bien?";
        let frames = chunk(input, 3).unwrap();
        let mut asm = ChunkAssembler::new();
        let mut out = None;
        for f in &frames {
            out = asm.add(f).unwrap();
        }
        assert_eq!(out.as_deref(), Some(input));
    }
}
