//! TIFF header and IFD parsing over an in-memory buffer.
//!
//! # Classic TIFF Header (8 bytes)
//! ```text
//! Bytes 0-1: Byte order (0x4949 = little-endian "II", 0x4D4D = big-endian "MM")
//! Bytes 2-3: Version (42 = 0x002A)
//! Bytes 4-7: Offset to first IFD (4 bytes)
//! ```
//!
//! # IFD Layout
//! ```text
//! 2 bytes:      entry count N
//! N * 12 bytes: entries (2 tag + 2 type + 4 count + 4 value/offset)
//! 4 bytes:      offset of the next IFD (0 terminates the chain)
//! ```
//!
//! BigTIFF files are rejected: microscopy stacks handled here fit in 4 GiB.

use crate::error::TiffError;

use super::tags::{FieldType, TiffTag};

// =============================================================================
// Constants
// =============================================================================

/// Magic bytes indicating little-endian byte order ("II" for Intel)
const BYTE_ORDER_LITTLE_ENDIAN: u16 = 0x4949;

/// Magic bytes indicating big-endian byte order ("MM" for Motorola)
const BYTE_ORDER_BIG_ENDIAN: u16 = 0x4D4D;

/// Version number for classic TIFF
pub const VERSION_TIFF: u16 = 42;

/// Size of classic TIFF header in bytes
pub const TIFF_HEADER_SIZE: usize = 8;

/// Size of one IFD entry in bytes
pub const IFD_ENTRY_SIZE: usize = 12;

// =============================================================================
// ByteOrder
// =============================================================================

/// Byte order (endianness) of a TIFF file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Little-endian ("II" = Intel)
    LittleEndian,
    /// Big-endian ("MM" = Motorola)
    BigEndian,
}

impl ByteOrder {
    /// Read a u16 from a byte slice using this byte order.
    ///
    /// # Panics
    /// Panics if the slice has fewer than 2 bytes.
    #[inline]
    pub fn read_u16(self, bytes: &[u8]) -> u16 {
        let raw = [bytes[0], bytes[1]];
        match self {
            ByteOrder::LittleEndian => u16::from_le_bytes(raw),
            ByteOrder::BigEndian => u16::from_be_bytes(raw),
        }
    }

    /// Read a u32 from a byte slice using this byte order.
    ///
    /// # Panics
    /// Panics if the slice has fewer than 4 bytes.
    #[inline]
    pub fn read_u32(self, bytes: &[u8]) -> u32 {
        let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
        match self {
            ByteOrder::LittleEndian => u32::from_le_bytes(raw),
            ByteOrder::BigEndian => u32::from_be_bytes(raw),
        }
    }
}

// =============================================================================
// TiffHeader
// =============================================================================

/// Parsed classic TIFF header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiffHeader {
    /// Byte order for all multi-byte values in the file
    pub byte_order: ByteOrder,

    /// Offset to the first IFD in the file
    pub first_ifd_offset: u64,
}

impl TiffHeader {
    /// Parse a TIFF header from the start of `bytes`.
    ///
    /// # Errors
    /// - `FileTooSmall` if there aren't 8 bytes
    /// - `InvalidMagic` if byte order bytes are not II or MM
    /// - `InvalidVersion` if version is not 42 (BigTIFF included)
    /// - `InvalidIfdOffset` if the first IFD offset is outside the file
    pub fn parse(bytes: &[u8]) -> Result<Self, TiffError> {
        if bytes.len() < TIFF_HEADER_SIZE {
            return Err(TiffError::FileTooSmall {
                required: TIFF_HEADER_SIZE as u64,
                actual: bytes.len() as u64,
            });
        }

        let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
        let byte_order = match magic {
            BYTE_ORDER_LITTLE_ENDIAN => ByteOrder::LittleEndian,
            BYTE_ORDER_BIG_ENDIAN => ByteOrder::BigEndian,
            _ => return Err(TiffError::InvalidMagic(magic)),
        };

        let version = byte_order.read_u16(&bytes[2..4]);
        if version != VERSION_TIFF {
            return Err(TiffError::InvalidVersion(version));
        }

        let first_ifd_offset = byte_order.read_u32(&bytes[4..8]) as u64;
        if first_ifd_offset < TIFF_HEADER_SIZE as u64 || first_ifd_offset >= bytes.len() as u64 {
            return Err(TiffError::InvalidIfdOffset(first_ifd_offset));
        }

        Ok(TiffHeader {
            byte_order,
            first_ifd_offset,
        })
    }
}

// =============================================================================
// IfdEntry
// =============================================================================

/// One 12-byte IFD entry, value bytes kept raw until requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfdEntry {
    /// Numeric tag ID
    pub tag_id: u16,

    /// Parsed field type, `None` if the type is not modelled
    pub field_type: Option<FieldType>,

    /// Raw field type value
    pub field_type_raw: u16,

    /// Number of values
    pub count: u32,

    /// The 4-byte value/offset field exactly as stored
    pub value_offset_bytes: [u8; 4],
}

impl IfdEntry {
    fn parse(bytes: &[u8], byte_order: ByteOrder) -> Self {
        let field_type_raw = byte_order.read_u16(&bytes[2..4]);
        IfdEntry {
            tag_id: byte_order.read_u16(&bytes[0..2]),
            field_type: FieldType::from_u16(field_type_raw),
            field_type_raw,
            count: byte_order.read_u32(&bytes[4..8]),
            value_offset_bytes: [bytes[8], bytes[9], bytes[10], bytes[11]],
        }
    }

    /// Read this entry's values as unsigned integers.
    ///
    /// Accepts BYTE, SHORT and LONG fields, inline or out-of-line. `data` is
    /// the whole file so offsets can be followed.
    pub fn read_unsigned(
        &self,
        data: &[u8],
        byte_order: ByteOrder,
        tag: TiffTag,
    ) -> Result<Vec<u32>, TiffError> {
        let field_type = self
            .field_type
            .ok_or(TiffError::UnknownFieldType(self.field_type_raw))?;
        let width = match field_type {
            FieldType::Byte | FieldType::Short | FieldType::Long => field_type.size_in_bytes(),
            other => {
                return Err(TiffError::InvalidTagValue {
                    tag: tag.name(),
                    message: format!("expected Byte, Short or Long, got {:?}", other),
                })
            }
        };

        let count = self.count as usize;
        let total = width as u64 * count as u64;
        let raw: &[u8] = if field_type.fits_inline(count as u64) {
            &self.value_offset_bytes[..total as usize]
        } else {
            let offset = byte_order.read_u32(&self.value_offset_bytes) as u64;
            let end = offset.checked_add(total).unwrap_or(u64::MAX);
            if end > data.len() as u64 {
                return Err(TiffError::InvalidTagValue {
                    tag: tag.name(),
                    message: format!(
                        "{} value bytes at offset {} exceed file size {}",
                        total,
                        offset,
                        data.len()
                    ),
                });
            }
            &data[offset as usize..end as usize]
        };

        Ok(raw
            .chunks_exact(width)
            .map(|c| match field_type {
                FieldType::Byte => c[0] as u32,
                FieldType::Short => byte_order.read_u16(c) as u32,
                _ => byte_order.read_u32(c),
            })
            .collect())
    }
}

// =============================================================================
// Ifd
// =============================================================================

/// A parsed Image File Directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ifd {
    /// Entries in file order
    pub entries: Vec<IfdEntry>,

    /// Offset of the next IFD, 0 if this is the last one
    pub next_ifd_offset: u64,
}

impl Ifd {
    /// Parse the IFD located at `offset` in `data`.
    pub fn parse(data: &[u8], offset: u64, byte_order: ByteOrder) -> Result<Self, TiffError> {
        let start = offset as usize;
        if offset >= data.len() as u64 || start + 2 > data.len() {
            return Err(TiffError::InvalidIfdOffset(offset));
        }

        let entry_count = byte_order.read_u16(&data[start..start + 2]) as usize;
        let entries_start = start + 2;
        let entries_end = entries_start + entry_count * IFD_ENTRY_SIZE;
        let ifd_end = entries_end + 4;
        if ifd_end > data.len() {
            return Err(TiffError::FileTooSmall {
                required: ifd_end as u64,
                actual: data.len() as u64,
            });
        }

        let entries = data[entries_start..entries_end]
            .chunks_exact(IFD_ENTRY_SIZE)
            .map(|bytes| IfdEntry::parse(bytes, byte_order))
            .collect();
        let next_ifd_offset = byte_order.read_u32(&data[entries_end..ifd_end]) as u64;

        Ok(Ifd {
            entries,
            next_ifd_offset,
        })
    }

    /// Find the entry for `tag`.
    pub fn get_entry_by_tag(&self, tag: TiffTag) -> Option<&IfdEntry> {
        self.entries.iter().find(|e| e.tag_id == tag.as_u16())
    }

    /// Read all unsigned values of `tag`, `None` if the tag is absent.
    pub fn values(
        &self,
        tag: TiffTag,
        data: &[u8],
        byte_order: ByteOrder,
    ) -> Result<Option<Vec<u32>>, TiffError> {
        self.get_entry_by_tag(tag)
            .map(|entry| entry.read_unsigned(data, byte_order, tag))
            .transpose()
    }

    /// Read a single-valued tag, `None` if absent.
    pub fn value(
        &self,
        tag: TiffTag,
        data: &[u8],
        byte_order: ByteOrder,
    ) -> Result<Option<u32>, TiffError> {
        match self.values(tag, data, byte_order)? {
            None => Ok(None),
            Some(values) => match values.first() {
                Some(&v) => Ok(Some(v)),
                None => Err(TiffError::InvalidTagValue {
                    tag: tag.name(),
                    message: "count is 0".to_string(),
                }),
            },
        }
    }

    /// Read a required single-valued tag.
    pub fn required(&self, tag: TiffTag, data: &[u8], byte_order: ByteOrder) -> Result<u32, TiffError> {
        self.value(tag, data, byte_order)?
            .ok_or(TiffError::MissingTag(tag.name()))
    }
}

// =============================================================================
// Tests
// =============================================================================
