//! Decoder for frames pushed to the direct-response channel.
//!
//! A pushed frame is `[prefix][payload]`. The prefix is one tag byte followed
//! by the payload length as a base-128 varint, but its size is never sent on
//! its own: it has to be recovered from the total frame length. For a frame
//! of `L` bytes the varint occupies the smallest `i >= 1` for which the
//! number of 7-bit groups needed to encode `L - i - 1` is exactly `i`. The
//! payload then starts at `i + 1`.
//!
//! Some lengths admit no such `i` (for example `L = 130`: a 129-byte
//! remainder needs two groups, every shorter one needs one). Those frames
//! are rejected with [`FramingError::NoPrefix`].

use bytes::Bytes;

use crate::error::FramingError;

/// Number of 7-bit groups needed to represent `n - 1`, i.e.
/// `ceil(log2(n) / 7)`. Returns 0 for `n <= 1`.
pub fn seven_bit_groups(n: usize) -> usize {
    let mut groups = 0;
    let mut capacity: u128 = 1;
    while (n as u128) > capacity {
        groups += 1;
        capacity <<= 7;
    }
    groups
}

/// Returns the offset at which the payload of a `frame_len`-byte frame
/// starts.
///
/// # Errors
///
/// [`FramingError::TooShort`] below two bytes, [`FramingError::NoPrefix`]
/// if no varint width is consistent with `frame_len`.
///
/// # Examples
///
/// ```
/// use cloudburst_client::shared::frame::payload_offset;
///
/// assert_eq!(payload_offset(10).unwrap(), 2);
/// assert_eq!(payload_offset(1000).unwrap(), 3);
/// assert!(payload_offset(130).is_err());
/// ```
pub fn payload_offset(frame_len: usize) -> Result<usize, FramingError> {
    if frame_len < 2 {
        return Err(FramingError::TooShort { len: frame_len });
    }

    // seven_bit_groups(frame_len - i) never exceeds seven_bit_groups(frame_len)
    let upper = seven_bit_groups(frame_len).min(frame_len - 1);
    (1..=upper)
        .find(|&i| seven_bit_groups(frame_len - i) == i)
        .map(|i| i + 1)
        .ok_or(FramingError::NoPrefix { len: frame_len })
}

/// A decoded direct-response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    raw: Bytes,
    payload_start: usize,
}

impl ResponseFrame {
    /// Splits `raw` into prefix and payload.
    pub fn decode(raw: Bytes) -> Result<Self, FramingError> {
        let payload_start = payload_offset(raw.len())?;
        Ok(Self { raw, payload_start })
    }

    /// The prefix bytes (tag and varint length).
    pub fn prefix(&self) -> &[u8] {
        &self.raw[..self.payload_start]
    }

    /// Offset of the first payload byte.
    pub fn payload_start(&self) -> usize {
        self.payload_start
    }

    /// The payload, without copying.
    pub fn payload(&self) -> Bytes {
        self.raw.slice(self.payload_start..)
    }

    /// Consumes the frame, returning the payload.
    pub fn into_payload(self) -> Bytes {
        self.payload()
    }

    /// Lowercase hex rendering of the prefix, for logs.
    pub fn prefix_hex(&self) -> String {
        self.prefix().iter().map(|b| format!("{b:02x}")).collect()
    }
}
