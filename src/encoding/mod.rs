//! Deterministic binary encoding for every on-disk structure in FileDB.
//!
//! This module provides the [`Encode`] and [`Decode`] traits used by the
//! block headers, the file header, and the key-index records.  The wire
//! format is fixed and owned by this crate, so files written by one build
//! stay readable by every later build.
//!
//! # Wire format
//!
//! | Rust type          | Encoding                                          |
//! |--------------------|---------------------------------------------------|
//! | `u8`               | 1 byte                                            |
//! | `u16`              | 2 bytes, big-endian                               |
//! | `u32` / `i32`      | 4 bytes, big-endian                               |
//! | `u64` / `i64`      | 8 bytes, big-endian                               |
//! | `bool`             | 1 byte (`0x00` = false, `0x01` = true)            |
//! | `[u8; N]`          | `N` raw bytes (fixed-size, no length prefix)      |
//! | `Vec<u8>`          | `[u32 len][bytes]`                                |
//! | `String`           | `[u32 len][modified UTF-8 bytes]`                 |
//!
//! All multi-byte integers are **big-endian**.
//!
//! # Modified UTF-8
//!
//! Strings are stored the way the legacy key index stores them: the text
//! is walked as UTF-16 code units and each unit is written as
//!
//! - 1 byte for `0x0001..=0x007F`,
//! - 2 bytes for `0x0000` and `0x0080..=0x07FF`,
//! - 3 bytes for everything else (surrogate halves are encoded separately).
//!
//! The length prefix counts encoded bytes, not characters.
//!
//! # Safety limits
//!
//! [`MAX_BYTE_LEN`] caps any decoded length field, so a corrupted prefix
//! cannot trigger a huge allocation.
//!
//! # Zero-panic guarantee
//!
//! No function in this module panics on malformed input; every failure is
//! reported through [`EncodingError`].


use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Safety limits
// ------------------------------------------------------------------------------------------------

/// Maximum byte length for a single `Vec<u8>` or `String` during decoding
/// (256 MiB).
pub const MAX_BYTE_LEN: u32 = 256 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced during encoding or decoding.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The buffer ran out of bytes before decoding completed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// A bool field contained a byte other than `0x00` or `0x01`.
    #[error("invalid bool byte: 0x{0:02X} (expected 0x00 or 0x01)")]
    InvalidBool(u8),

    /// A byte sequence decoded as a string was not valid modified UTF-8.
    #[error("invalid modified UTF-8: {0}")]
    InvalidModifiedUtf8(String),

    /// A length or count exceeded its safety limit.
    #[error("length overflow: {0}")]
    LengthOverflow(String),

    /// A stored checksum did not match the recomputed one.
    #[error("checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    ChecksumMismatch {
        /// Checksum read from the buffer.
        stored: u64,
        /// Checksum recomputed over the covered bytes.
        computed: u64,
    },

    /// Application-level decode error.
    #[error("{0}")]
    Custom(String),
}

// ------------------------------------------------------------------------------------------------
// Core traits
// ------------------------------------------------------------------------------------------------

/// Serialize `self` into a byte buffer.
///
/// Implementations **must** produce deterministic output: the same
/// logical value always yields the exact same byte sequence.
pub trait Encode {
    /// Append the encoded representation of `self` to `buf`.
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// Deserialize a value from a byte slice.
///
/// Returns `(value, bytes_consumed)` on success so that callers can
/// advance a cursor through a buffer containing multiple encoded items.
pub trait Decode: Sized {
    /// Decode one value starting at `buf[0]`.
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError>;
}

// ------------------------------------------------------------------------------------------------
// Convenience functions
// ------------------------------------------------------------------------------------------------

/// Encode a value into a freshly-allocated `Vec<u8>`.
pub fn encode_to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::new();
    value.encode_to(&mut buf)?;
    Ok(buf)
}

/// Decode a value from the beginning of `buf`.
///
/// Returns `(value, bytes_consumed)`.
pub fn decode_from_slice<T: Decode>(buf: &[u8]) -> Result<(T, usize), EncodingError> {
    T::decode_from(buf)
}

/// CRC32 of `bytes`, zero-extended to the 8-byte checksum fields used on disk.
pub fn crc32_u64(bytes: &[u8]) -> u64 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    u64::from(hasher.finalize())
}

// ------------------------------------------------------------------------------------------------
// Internal helpers
// ------------------------------------------------------------------------------------------------

/// Verify that `buf` has at least `needed` bytes, returning
/// [`EncodingError::UnexpectedEof`] if not.
#[inline]
fn require(buf: &[u8], needed: usize) -> Result<(), EncodingError> {
    if buf.len() < needed {
        Err(EncodingError::UnexpectedEof {
            needed,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

/// Convert a `usize` length to `u32`, returning [`EncodingError::LengthOverflow`]
/// if the value exceeds `u32::MAX`.
#[inline]
fn len_to_u32(len: usize) -> Result<u32, EncodingError> {
    u32::try_from(len)
        .map_err(|_| EncodingError::LengthOverflow(format!("length {len} exceeds u32::MAX")))
}

/// Copy the first `N` bytes of `buf` into an array.
#[inline]
fn take_array<const N: usize>(buf: &[u8]) -> Result<[u8; N], EncodingError> {
    require(buf, N)?;
    let mut arr = [0u8; N];
    arr.copy_from_slice(&buf[..N]);
    Ok(arr)
}

/// Validate a decoded length prefix against [`MAX_BYTE_LEN`] and the bytes
/// actually remaining after the prefix.
#[inline]
fn checked_len(len: u32, rest: &[u8], what: &str) -> Result<usize, EncodingError> {
    if len > MAX_BYTE_LEN {
        return Err(EncodingError::LengthOverflow(format!(
            "{what} length {len} exceeds MAX_BYTE_LEN ({MAX_BYTE_LEN})"
        )));
    }
    let len = len as usize;
    require(rest, len)?;
    Ok(len)
}

// ------------------------------------------------------------------------------------------------
// Integers (big-endian)
// ------------------------------------------------------------------------------------------------

macro_rules! impl_be_int {
    ($($ty:ty),*) => {
        $(
            impl Encode for $ty {
                #[inline]
                fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
                    buf.extend_from_slice(&self.to_be_bytes());
                    Ok(())
                }
            }

            impl Decode for $ty {
                #[inline]
                fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
                    const SIZE: usize = std::mem::size_of::<$ty>();
                    let bytes = take_array::<SIZE>(buf)?;
                    Ok((<$ty>::from_be_bytes(bytes), SIZE))
                }
            }
        )*
    };
}

impl_be_int!(u16, u32, u64, i32, i64);

impl Encode for u8 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.push(*self);
        Ok(())
    }
}

impl Decode for u8 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 1)?;
        Ok((buf[0], 1))
    }
}

// ------------------------------------------------------------------------------------------------
// bool
// ------------------------------------------------------------------------------------------------

impl Encode for bool {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.push(u8::from(*self));
        Ok(())
    }
}

impl Decode for bool {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 1)?;
        match buf[0] {
            0 => Ok((false, 1)),
            1 => Ok((true, 1)),
            other => Err(EncodingError::InvalidBool(other)),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Fixed-size byte arrays
// ------------------------------------------------------------------------------------------------

impl<const N: usize> Encode for [u8; N] {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl<const N: usize> Decode for [u8; N] {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        Ok((take_array::<N>(buf)?, N))
    }
}

// ------------------------------------------------------------------------------------------------
// Variable-length byte vectors: [u32 len][bytes]
// ------------------------------------------------------------------------------------------------

impl Encode for Vec<u8> {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        len_to_u32(self.len())?.encode_to(buf)?;
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl Decode for Vec<u8> {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (len, offset) = u32::decode_from(buf)?;
        let len = checked_len(len, &buf[offset..], "byte vector")?;
        Ok((buf[offset..offset + len].to_vec(), offset + len))
    }
}

// ------------------------------------------------------------------------------------------------
// Strings: [u32 len][modified UTF-8 bytes]
// ------------------------------------------------------------------------------------------------

/// Append the modified UTF-8 form of `s` (without length prefix) to `buf`.
pub fn write_modified_utf8(s: &str, buf: &mut Vec<u8>) {
    for unit in s.encode_utf16() {
        match unit {
            0x0001..=0x007F => buf.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                buf.push(0xC0 | ((unit >> 6) & 0x1F) as u8);
                buf.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                buf.push(0xE0 | ((unit >> 12) & 0x0F) as u8);
                buf.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                buf.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
}

/// Number of bytes [`write_modified_utf8`] produces for `s`.
pub fn modified_utf8_len(s: &str) -> usize {
    s.encode_utf16()
        .map(|unit| match unit {
            0x0001..=0x007F => 1,
            0x0000 | 0x0080..=0x07FF => 2,
            _ => 3,
        })
        .sum()
}

/// Decode a complete modified UTF-8 byte sequence (no length prefix).
pub fn read_modified_utf8(bytes: &[u8]) -> Result<String, EncodingError> {
    let malformed =
        |pos: usize| EncodingError::InvalidModifiedUtf8(format!("malformed input around byte {pos}"));

    let mut units = Vec::with_capacity(bytes.len());
    let mut pos = 0;
    while pos < bytes.len() {
        let b0 = u16::from(bytes[pos]);
        match b0 >> 4 {
            0x0..=0x7 => {
                units.push(b0);
                pos += 1;
            }
            0xC | 0xD => {
                let b1 = u16::from(*bytes.get(pos + 1).ok_or_else(|| malformed(pos))?);
                if b1 & 0xC0 != 0x80 {
                    return Err(malformed(pos + 1));
                }
                units.push(((b0 & 0x1F) << 6) | (b1 & 0x3F));
                pos += 2;
            }
            0xE => {
                let b1 = u16::from(*bytes.get(pos + 1).ok_or_else(|| malformed(pos))?);
                let b2 = u16::from(*bytes.get(pos + 2).ok_or_else(|| malformed(pos))?);
                if b1 & 0xC0 != 0x80 || b2 & 0xC0 != 0x80 {
                    return Err(malformed(pos + 1));
                }
                units.push(((b0 & 0x0F) << 12) | ((b1 & 0x3F) << 6) | (b2 & 0x3F));
                pos += 3;
            }
            _ => return Err(malformed(pos)),
        }
    }

    String::from_utf16(&units).map_err(|e| EncodingError::InvalidModifiedUtf8(e.to_string()))
}

impl Encode for String {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        len_to_u32(modified_utf8_len(self))?.encode_to(buf)?;
        write_modified_utf8(self, buf);
        Ok(())
    }
}

impl Decode for String {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (len, offset) = u32::decode_from(buf)?;
        let len = checked_len(len, &buf[offset..], "string")?;
        let s = read_modified_utf8(&buf[offset..offset + len])?;
        Ok((s, offset + len))
    }
}
