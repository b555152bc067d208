//! Variable-byte and diff-coding primitives for serialized posting blocks
//!
//! Entities inside a block are strictly increasing, so a posting is stored
//! as `entity - prev - 1`, with `prev` starting at the reserved index 0.
//! Block types other than zero carry a length-prefixed payload after each
//! delta.

use std::io;

/// Variable-byte encoding for integers (commonly used in search engines)
pub fn encode_vbyte(value: u32, output: &mut Vec<u8>) {
    let mut v = value;
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            output.push(byte | 0x80); // Set high bit to indicate last byte
            break;
        } else {
            output.push(byte);
        }
    }
}

/// Decode a variable-byte encoded integer
pub fn decode_vbyte(input: &[u8], pos: &mut usize) -> io::Result<u32> {
    let mut result: u32 = 0;
    let mut shift = 0;

    loop {
        if *pos >= input.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Unexpected end of vbyte",
            ));
        }

        let byte = input[*pos];
        *pos += 1;

        result |= ((byte & 0x7F) as u32) << shift;

        if byte & 0x80 != 0 {
            return Ok(result);
        }

        shift += 7;
        if shift > 28 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "VByte value too large",
            ));
        }
    }
}

/// Number of bytes `encode_vbyte` will emit for `value`
pub fn vbyte_len(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0xFFF_FFFF => 4,
        _ => 5,
    }
}

/// Diff for a strictly increasing sequence of entity indices:
/// `entity - prev - 1`, with `prev = 0` before the first posting. Entity
/// index 0 is reserved, so the difference never underflows.
pub fn encode_delta(entity: u32, prev: u32) -> u32 {
    entity - prev - 1
}

/// Inverse of [`encode_delta`]
pub fn decode_delta(delta: u32, prev: u32) -> u32 {
    prev + delta + 1
}
