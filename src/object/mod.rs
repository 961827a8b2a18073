//! Object-valued payloads.
//!
//! An [`ObjectCodec`] turns values into payload bytes and back. A payload
//! may hold several objects written one after another (see
//! [`FileDb::append_item`](crate::FileDb::append_item));
//! [`decode_objects`] splits such a payload again.
//!
//! Codecs may keep per-stream state (scratch buffers, back-reference
//! tables); callers reset them after every top-level call so that state
//! never outlives one payload.

#[cfg(test)]
mod tests;

use std::marker::PhantomData;

use tracing::warn;

use crate::encoding::{Decode, Encode, EncodingError};

/// Serializes values of type `T` to bytes and back.
pub trait ObjectCodec<T> {
    /// Encodes one value.
    fn serialize(&mut self, value: &T) -> Result<Vec<u8>, EncodingError>;

    /// Decodes one value from the front of `bytes`, returning it together
    /// with the number of bytes consumed.
    fn deserialize(&mut self, bytes: &[u8]) -> Result<(T, usize), EncodingError>;

    /// Drops any state accumulated since the last reset.
    fn reset(&mut self);
}

/// [`ObjectCodec`] for any type implementing the crate's [`Encode`] /
/// [`Decode`] traits.
#[derive(Debug)]
pub struct EncodingCodec<T> {
    scratch: Vec<u8>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> EncodingCodec<T> {
    /// Creates a codec with an empty scratch buffer.
    pub fn new() -> Self {
        Self {
            scratch: Vec::new(),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for EncodingCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Encode + Decode> ObjectCodec<T> for EncodingCodec<T> {
    fn serialize(&mut self, value: &T) -> Result<Vec<u8>, EncodingError> {
        self.scratch.clear();
        value.encode_to(&mut self.scratch)?;
        Ok(self.scratch.clone())
    }

    fn deserialize(&mut self, bytes: &[u8]) -> Result<(T, usize), EncodingError> {
        T::decode_from(bytes)
    }

    fn reset(&mut self) {
        self.scratch = Vec::new();
    }
}

/// Decodes every object stored back to back in `bytes`.
///
/// With `lenient`, a trailing object that fails to decode is logged and
/// dropped; otherwise its error is returned.
pub fn decode_objects<T, C: ObjectCodec<T>>(
    codec: &mut C,
    bytes: &[u8],
    lenient: bool,
) -> Result<Vec<T>, EncodingError> {
    let mut objects = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        match codec.deserialize(&bytes[offset..]) {
            Ok((_, 0)) => {
                return Err(EncodingError::Custom(format!(
                    "codec consumed no bytes at offset {offset}"
                )));
            }
            Ok((object, used)) => {
                objects.push(object);
                offset += used;
            }
            Err(e) if lenient => {
                warn!(
                    offset,
                    dropped = bytes.len() - offset,
                    "Ignoring corrupt trailing object: {e}"
                );
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(objects)
}
