//! Index-file record naming where a key's payload lives.
//!
//! ```text
//! [key_len u32][key: modified UTF-8][data_location i32][timestamp i64]
//! ```
//!
//! The index location is not stored: it is the start block the record
//! itself was read from.

use crate::encoding::{Decode, Encode, EncodingError};

/// Location of one key's payload, plus its timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationRecord {
    /// User key.
    pub key: String,

    /// Start block of this record in the index file.
    pub index_location: u32,

    /// Start block of the payload in the data file.
    pub data_location: u32,

    /// Caller-supplied timestamp (milliseconds by convention).
    pub timestamp: i64,
}

impl LocationRecord {
    /// A record not yet written to the index file.
    pub fn new(key: impl Into<String>, data_location: u32, timestamp: i64) -> Self {
        Self {
            key: key.into(),
            index_location: 0,
            data_location,
            timestamp,
        }
    }

    /// Decodes an index-file payload read from `index_location`.
    pub fn decode_at(index_location: u32, bytes: &[u8]) -> Result<Self, EncodingError> {
        let (record, used) = Self::decode_from(bytes)?;
        if used != bytes.len() {
            return Err(EncodingError::Custom(format!(
                "{} trailing bytes after location record",
                bytes.len() - used
            )));
        }
        Ok(Self {
            index_location,
            ..record
        })
    }
}

impl Encode for LocationRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key.encode_to(buf)?;
        let data_location = i32::try_from(self.data_location).map_err(|_| {
            EncodingError::LengthOverflow(format!(
                "data location {} exceeds i32::MAX",
                self.data_location
            ))
        })?;
        data_location.encode_to(buf)?;
        self.timestamp.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for LocationRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (key, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (data_location, n) = i32::decode_from(&buf[offset..])?;
        offset += n;
        let (timestamp, n) = i64::decode_from(&buf[offset..])?;
        offset += n;

        let data_location = u32::try_from(data_location).map_err(|_| {
            EncodingError::Custom(format!("negative data location {data_location}"))
        })?;

        Ok((
            Self {
                key,
                index_location: 0,
                data_location,
                timestamp,
            },
            offset,
        ))
    }
}
