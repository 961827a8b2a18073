//! On-disk structures of a chained data file.
//!
//! ```text
//! FILE HEADER (15 bytes, offset 0)
//!   [version u16][allocation_unit i32][data_checksums u8][header_crc u64]
//!
//! BLOCK (18 + allocation_unit [+ 8] bytes)
//!   [occupied u8][is_start u8][data_length i32][next_block i32][header_crc u64]
//!   [payload: allocation_unit bytes]
//!   [data_crc u64]              (only when data checksums are enabled)
//! ```
//!
//! All integers are big-endian. Both checksums are CRC32 values stored
//! zero-extended in 8 bytes. `data_length` is `-1` on non-start blocks and
//! `next_block` is [`NULL_LINK`] on the last block of a chain.
//!
//! A block whose 18 header bytes are all zero is free. This is also what a
//! freshly zero-extended file reads as, so growing the file needs no extra
//! formatting writes.

use crate::encoding::{self, Decode, Encode, EncodingError};

/// Format version written into every file header.
pub const FORMAT_VERSION: u16 = 1;

/// Size of the file header in bytes.
pub const FILE_HEADER_SIZE: usize = 15;

/// Size of a block header in bytes.
pub const BLOCK_HEADER_SIZE: usize = 18;

/// Width of every stored checksum.
const CHECKSUM_SIZE: usize = 8;

/// Size of the optional data checksum footer in bytes.
pub const BLOCK_FOOTER_SIZE: usize = CHECKSUM_SIZE;

/// `next_block` value terminating a chain.
pub const NULL_LINK: i32 = -1;

/// Bytes of the block header covered by its checksum.
const BLOCK_HEADER_CRC_SPAN: usize = 10;

/// Bytes of the file header covered by its checksum.
const FILE_HEADER_CRC_SPAN: usize = 7;

// ------------------------------------------------------------------------------------------------
// File header
// ------------------------------------------------------------------------------------------------

/// Geometry of a data file, fixed when the file is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Format version.
    pub version: u16,

    /// Usable payload bytes per block.
    pub allocation_unit: u32,

    /// Whether every block carries a data checksum footer.
    pub data_checksums: bool,
}

impl FileHeader {
    /// Header for a new file at the current format version.
    pub fn new(allocation_unit: u32, data_checksums: bool) -> Self {
        Self {
            version: FORMAT_VERSION,
            allocation_unit,
            data_checksums,
        }
    }

    /// Total on-disk size of one block.
    pub fn block_size(&self) -> usize {
        let footer = if self.data_checksums {
            BLOCK_FOOTER_SIZE
        } else {
            0
        };
        BLOCK_HEADER_SIZE + self.allocation_unit as usize + footer
    }
}

impl Encode for FileHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let start = buf.len();
        self.version.encode_to(buf)?;
        let unit = i32::try_from(self.allocation_unit).map_err(|_| {
            EncodingError::LengthOverflow(format!(
                "allocation unit {} exceeds i32::MAX",
                self.allocation_unit
            ))
        })?;
        unit.encode_to(buf)?;
        self.data_checksums.encode_to(buf)?;
        encoding::crc32_u64(&buf[start..]).encode_to(buf)?;
        Ok(())
    }
}

impl Decode for FileHeader {
    /// Decodes and checksum-verifies a file header.
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (stored, _) = u64::decode_from(buf.get(FILE_HEADER_CRC_SPAN..).unwrap_or_default())?;
        let computed = encoding::crc32_u64(&buf[..FILE_HEADER_CRC_SPAN]);
        if stored != computed {
            return Err(EncodingError::ChecksumMismatch { stored, computed });
        }

        let mut off = 0;
        let (version, n) = u16::decode_from(&buf[off..])?;
        off += n;
        let (unit, n) = i32::decode_from(&buf[off..])?;
        off += n;
        let (data_checksums, n) = bool::decode_from(&buf[off..])?;
        off += n;
        off += CHECKSUM_SIZE;

        let allocation_unit = u32::try_from(unit)
            .map_err(|_| EncodingError::Custom(format!("negative allocation unit {unit}")))?;

        Ok((
            Self {
                version,
                allocation_unit,
                data_checksums,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Block header
// ------------------------------------------------------------------------------------------------

/// Header of a single block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block belongs to a live chain.
    pub occupied: bool,

    /// Block is the first of its chain.
    pub is_start: bool,

    /// Logical length of the whole chain; only meaningful on start blocks.
    pub data_length: Option<u32>,

    /// Next block of the chain, `None` on the last block.
    pub next_block: Option<u32>,
}

impl BlockHeader {
    /// Header of a free block (encodes as all zeros).
    pub const FREE: BlockHeader = BlockHeader {
        occupied: false,
        is_start: false,
        data_length: None,
        next_block: None,
    };

    /// Header of the first block of a chain.
    pub fn start(data_length: u32, next_block: Option<u32>) -> Self {
        Self {
            occupied: true,
            is_start: true,
            data_length: Some(data_length),
            next_block,
        }
    }

    /// Header of a follow-on block of a chain.
    pub fn follow(next_block: Option<u32>) -> Self {
        Self {
            occupied: true,
            is_start: false,
            data_length: None,
            next_block,
        }
    }

    /// Encoded header as a fixed-size array.
    pub fn to_bytes(&self) -> Result<[u8; BLOCK_HEADER_SIZE], EncodingError> {
        let mut buf = Vec::with_capacity(BLOCK_HEADER_SIZE);
        self.encode_to(&mut buf)?;
        let mut out = [0u8; BLOCK_HEADER_SIZE];
        out.copy_from_slice(&buf);
        Ok(out)
    }
}

fn link_to_i32(link: Option<u32>) -> Result<i32, EncodingError> {
    match link {
        None => Ok(NULL_LINK),
        Some(v) => i32::try_from(v)
            .map_err(|_| EncodingError::LengthOverflow(format!("value {v} exceeds i32::MAX"))),
    }
}

fn i32_to_link(raw: i32) -> Result<Option<u32>, EncodingError> {
    match raw {
        NULL_LINK => Ok(None),
        v if v >= 0 => Ok(Some(v as u32)),
        v => Err(EncodingError::Custom(format!("invalid link value {v}"))),
    }
}

impl Encode for BlockHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        if !self.occupied {
            buf.extend_from_slice(&[0u8; BLOCK_HEADER_SIZE]);
            return Ok(());
        }

        let start = buf.len();
        self.occupied.encode_to(buf)?;
        self.is_start.encode_to(buf)?;
        let data_length = if self.is_start {
            link_to_i32(Some(self.data_length.unwrap_or(0)))?
        } else {
            NULL_LINK
        };
        data_length.encode_to(buf)?;
        link_to_i32(self.next_block)?.encode_to(buf)?;
        encoding::crc32_u64(&buf[start..]).encode_to(buf)?;
        Ok(())
    }
}

impl Decode for BlockHeader {
    /// Decodes and checksum-verifies a block header.
    ///
    /// An all-zero header decodes as [`BlockHeader::FREE`].
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let raw = buf.get(..BLOCK_HEADER_SIZE).ok_or(EncodingError::UnexpectedEof {
            needed: BLOCK_HEADER_SIZE,
            available: buf.len(),
        })?;
        if raw.iter().all(|&b| b == 0) {
            return Ok((Self::FREE, BLOCK_HEADER_SIZE));
        }

        let (stored, _) = u64::decode_from(&raw[BLOCK_HEADER_CRC_SPAN..])?;
        let computed = encoding::crc32_u64(&raw[..BLOCK_HEADER_CRC_SPAN]);
        if stored != computed {
            return Err(EncodingError::ChecksumMismatch { stored, computed });
        }

        let mut off = 0;
        let (occupied, n) = bool::decode_from(&raw[off..])?;
        off += n;
        let (is_start, n) = bool::decode_from(&raw[off..])?;
        off += n;
        let (data_length, n) = i32::decode_from(&raw[off..])?;
        off += n;
        let (next_block, n) = i32::decode_from(&raw[off..])?;
        off += n;
        off += CHECKSUM_SIZE;

        if !occupied {
            return Ok((Self::FREE, off));
        }

        let data_length = if is_start {
            Some(i32_to_link(data_length)?.ok_or_else(|| {
                EncodingError::Custom("start block without data length".into())
            })?)
        } else {
            None
        };

        Ok((
            Self {
                occupied,
                is_start,
                data_length,
                next_block: i32_to_link(next_block)?,
            },
            off,
        ))
    }
}

/// Encodes one full block: header, payload padded to `allocation_unit`,
/// and the data checksum footer when enabled.
pub fn encode_block(
    header: &BlockHeader,
    payload: &[u8],
    geometry: &FileHeader,
) -> Result<Vec<u8>, EncodingError> {
    let unit = geometry.allocation_unit as usize;
    if payload.len() > unit {
        return Err(EncodingError::LengthOverflow(format!(
            "payload of {} bytes exceeds allocation unit {unit}",
            payload.len()
        )));
    }

    let mut buf = Vec::with_capacity(geometry.block_size());
    header.encode_to(&mut buf)?;
    buf.extend_from_slice(payload);
    buf.resize(BLOCK_HEADER_SIZE + unit, 0);
    if geometry.data_checksums {
        encoding::crc32_u64(&buf[BLOCK_HEADER_SIZE..]).encode_to(&mut buf)?;
    }
    Ok(buf)
}

/// Payload region of an encoded block.
pub fn block_payload<'a>(block: &'a [u8], geometry: &FileHeader) -> &'a [u8] {
    &block[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + geometry.allocation_unit as usize]
}

/// Verifies the data checksum footer of an encoded block.
///
/// Always succeeds when the geometry has data checksums disabled.
pub fn verify_block_data(block: &[u8], geometry: &FileHeader) -> Result<(), EncodingError> {
    if !geometry.data_checksums {
        return Ok(());
    }
    let footer_at = BLOCK_HEADER_SIZE + geometry.allocation_unit as usize;
    let (stored, _) = u64::decode_from(&block[footer_at..])?;
    let computed = encoding::crc32_u64(block_payload(block, geometry));
    if stored != computed {
        return Err(EncodingError::ChecksumMismatch { stored, computed });
    }
    Ok(())
}
