//! Prefixed integer representation (RFC 7541 §5.1).

use lumen::shared::{ErrorType, NetworkError, NetworkResult, ProtocolError};

/// Encode `value` with an `prefix_bits`-bit prefix, OR-ing `prefix_flags`
/// into the first octet.
pub fn encode(sink: &mut Vec<u8>, prefix_flags: u8, prefix_bits: u8, value: usize) {
    let max_prefix = (1usize << prefix_bits) - 1;

    if value < max_prefix {
        sink.push(prefix_flags | value as u8);
        return;
    }

    sink.push(prefix_flags | max_prefix as u8);

    let mut remainder = value - max_prefix;
    while remainder >= 128 {
        sink.push((remainder & 0x7F) as u8 | 0x80);
        remainder >>= 7;
    }
    sink.push(remainder as u8);
}

/// Decode an integer with an `prefix_bits`-bit prefix starting at
/// `source[*position]`, advancing the position past it. Underflow yields
/// `Incomplete` without advancing.
pub fn decode(source: &[u8], position: &mut usize, prefix_bits: u8) -> NetworkResult<usize> {
    let start = *position;

    if start >= source.len() {
        return Err(NetworkError::Incomplete);
    }

    let max_prefix = (1usize << prefix_bits) - 1;
    let mut value = (source[start] & max_prefix as u8) as usize;
    let mut cursor = start + 1;

    if value < max_prefix {
        *position = cursor;
        return Ok(value);
    }

    let mut shift = 0u32;
    loop {
        if cursor >= source.len() {
            return Err(NetworkError::Incomplete);
        }

        // A conforming peer never needs more than ten continuation octets;
        // anything longer is an overflow attack.
        if shift > 63 {
            return Err(NetworkError::Fatal(ErrorType::Protocol(ProtocolError::Malformed)));
        }

        let octet = source[cursor];
        cursor += 1;
        value = match (((octet & 0x7F) as usize) << shift).checked_add(value) {
            Some(value) => value,
            None => return Err(NetworkError::Fatal(ErrorType::Protocol(ProtocolError::Malformed))),
        };
        shift += 7;

        if octet & 0x80 == 0 {
            break;
        }
    }

    *position = cursor;
    Ok(value)
}
