//! Length-prefixed framing shared by the collector and the agents.
//!
//! A frame is a fixed ten character, zero padded, ASCII decimal length header
//! followed by exactly that many payload bytes:
//!
//! ```text
//! 0000000002hi
//! ```
//!
//! There is no checksum, version byte or delimiter. The payload is opaque.

use thiserror::Error;

/// Width of the length header in bytes.
pub const HEADER_LEN: usize = 10;

/// Largest length a ten digit header can carry.
pub const MAX_HEADER_VALUE: u64 = 9_999_999_999;

/// Cap applied to incoming frames unless configured otherwise.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Response payload a collector uses to acknowledge a record.
pub const ACK: &[u8] = b"OK";

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("payload of {len} bytes does not fit a {HEADER_LEN} digit header")]
    TooLarge { len: u64 },
    #[error("frame header is not {HEADER_LEN} ascii digits")]
    MalformedHeader,
    #[error("frame length must be greater than zero")]
    InvalidLength,
    #[error("frame of {len} bytes exceeds the configured limit of {max} bytes")]
    ExceedsLimit { len: u64, max: usize },
}

/// Frames `payload` into a freshly allocated buffer.
///
/// # Errors
/// Returns [`FrameError::InvalidLength`] for an empty payload and
/// [`FrameError::TooLarge`] if the payload length needs more than ten digits.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    encode_into(payload, &mut out)?;
    Ok(out)
}

/// Appends the framed `payload` to `out`, leaving `out` untouched on error.
///
/// # Errors
/// Same as [`encode`].
pub fn encode_into(payload: &[u8], out: &mut Vec<u8>) -> Result<(), FrameError> {
    out.extend_from_slice(&encode_header(payload.len())?);
    out.extend_from_slice(payload);
    Ok(())
}

/// Renders the ten byte header for a payload of `len` bytes.
///
/// # Errors
/// Returns [`FrameError::InvalidLength`] if `len` is zero and
/// [`FrameError::TooLarge`] if it needs more than ten digits.
pub fn encode_header(len: usize) -> Result<[u8; HEADER_LEN], FrameError> {
    if len == 0 {
        return Err(FrameError::InvalidLength);
    }
    let len = u64::try_from(len).unwrap_or(u64::MAX);
    if len > MAX_HEADER_VALUE {
        return Err(FrameError::TooLarge { len });
    }
    let mut header = [b'0'; HEADER_LEN];
    let mut rest = len;
    for slot in header.iter_mut().rev() {
        // Each digit is < 10, the cast cannot truncate.
        #[allow(clippy::cast_possible_truncation)]
        let digit = (rest % 10) as u8;
        *slot = b'0' + digit;
        rest /= 10;
    }
    Ok(header)
}

/// Parses a ten byte header into the payload length it announces.
///
/// # Errors
/// [`FrameError::MalformedHeader`] unless all ten bytes are ascii digits,
/// [`FrameError::InvalidLength`] if the value is zero.
pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<usize, FrameError> {
    if !header.iter().all(u8::is_ascii_digit) {
        return Err(FrameError::MalformedHeader);
    }
    let len = header
        .iter()
        .fold(0u64, |acc, digit| acc * 10 + u64::from(digit - b'0'));
    if len == 0 {
        return Err(FrameError::InvalidLength);
    }
    usize::try_from(len).map_err(|_| FrameError::ExceedsLimit {
        len,
        max: usize::MAX,
    })
}

/// Like [`decode_header`] but also rejects lengths above `max`.
///
/// # Errors
/// Any [`decode_header`] error, or [`FrameError::ExceedsLimit`].
pub fn decode_header_bounded(header: &[u8; HEADER_LEN], max: usize) -> Result<usize, FrameError> {
    let len = decode_header(header)?;
    if len > max {
        return Err(FrameError::ExceedsLimit {
            len: u64::try_from(len).unwrap_or(u64::MAX),
            max,
        });
    }
    Ok(len)
}

/// Splits one complete frame off the front of `bytes`.
///
/// Returns `Ok(None)` while `bytes` does not yet hold a whole frame, otherwise
/// the payload and the number of bytes the frame occupied.
///
/// # Errors
/// Any [`decode_header`] error.
pub fn decode(bytes: &[u8]) -> Result<Option<(&[u8], usize)>, FrameError> {
    let Some(header) = bytes.first_chunk::<HEADER_LEN>() else {
        return Ok(None);
    };
    let len = decode_header(header)?;
    let end = HEADER_LEN + len;
    Ok(bytes.get(HEADER_LEN..end).map(|payload| (payload, end)))
}
