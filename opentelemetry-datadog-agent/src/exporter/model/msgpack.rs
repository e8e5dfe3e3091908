//! Msgpack array framing.
//!
//! The agent payload is an array of traces, each trace an array of spans. Both
//! levels are framed lazily from a running count, so the header is computed
//! here instead of being written up front with [`rmp::encode::write_array_len`].
//!
//! See the [array format family](https://github.com/msgpack/msgpack/blob/master/spec.md#array-format-family).

/// Largest array length msgpack can frame.
pub const MSGPACK_MAX_LENGTH: u64 = u32::MAX as u64;

/// fixarray: up to 15 items, length in the low nibble.
pub(crate) const MSGPACK_ARRAY_FIX: u8 = 0x90;
/// array 16: up to 2^16-1 items, followed by the length in 2 bytes.
pub(crate) const MSGPACK_ARRAY_16: u8 = 0xdc;
/// array 32: up to 2^32-1 items, followed by the length in 4 bytes.
pub(crate) const MSGPACK_ARRAY_32: u8 = 0xdd;

/// Upper bound of [`array_header_size`].
pub(crate) const MAX_ARRAY_HEADER_SIZE: usize = 5;

/// Returns the number of bytes needed to frame an array of `n` items.
///
/// An empty array has no header at all. Callers never put an empty array on the
/// wire: packet buffers hold at least one span and empty requests are not sent.
pub fn array_header_size(n: u64) -> usize {
    debug_assert!(
        n <= MSGPACK_MAX_LENGTH,
        "msgpack array length {n} exceeds {MSGPACK_MAX_LENGTH}"
    );
    match n {
        0 => 0,
        1..=15 => 1,
        16..=0xffff => 3,
        _ => 5,
    }
}

/// Writes the header for an array of `n` items into the tail of `out`.
///
/// Returns the offset at which the header starts, so `&out[offset..]` is exactly
/// the header.
pub fn array_header(out: &mut [u8; 8], n: u64) -> usize {
    let offset = out.len() - array_header_size(n);
    match n {
        0 => {}
        1..=15 => out[offset] = MSGPACK_ARRAY_FIX | n as u8,
        16..=0xffff => {
            out[offset] = MSGPACK_ARRAY_16;
            out[offset + 1..].copy_from_slice(&(n as u16).to_be_bytes());
        }
        _ => {
            out[offset] = MSGPACK_ARRAY_32;
            out[offset + 1..].copy_from_slice(&(n as u32).to_be_bytes());
        }
    }
    offset
}

/// Appends the header for an array of `n` items to `buf`.
pub(crate) fn write_array_header(buf: &mut Vec<u8>, n: u64) {
    let mut header = [0u8; 8];
    let offset = array_header(&mut header, n);
    buf.extend_from_slice(&header[offset..]);
}
