#![forbid(unsafe_code)]
//! Unit-carrying primitive types shared across the quire workspace.
//!
//! Every on-device or in-cache address lives behind a newtype so that page
//! indices, device sectors, filesystem blocks, and raw byte offsets cannot be
//! mixed up silently. Conversions that can overflow return `Option` or a
//! [`UnitError`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Log2 of the page size.
pub const PAGE_SHIFT: u32 = 12;
/// Size of one cached page in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Log2 of the device sector size.
pub const SECTOR_SHIFT: u32 = 9;
/// Size of one device sector in bytes.
pub const SECTOR_SIZE: usize = 1 << SECTOR_SHIFT;

/// Sectors covered by one page.
pub const SECTORS_PER_PAGE: u64 = (PAGE_SIZE / SECTOR_SIZE) as u64;

/// Validation error for unit construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnitError {
    #[error("invalid block size {value}: {reason}")]
    InvalidBlockSize { value: u32, reason: &'static str },
}

/// Page-aligned offset into a file, in units of [`PAGE_SIZE`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct PageIndex(pub u64);

impl PageIndex {
    /// Byte offset of the first byte of this page.
    #[must_use]
    pub fn byte_offset(self) -> Option<ByteOffset> {
        self.0.checked_mul(PAGE_SIZE as u64).map(ByteOffset)
    }

    /// The page after this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Page index containing `offset`.
    #[must_use]
    pub fn containing(offset: ByteOffset) -> Self {
        Self(offset.0 >> PAGE_SHIFT)
    }

    /// Number of pages needed to cover `len` bytes.
    #[must_use]
    pub fn spanning(len: u64) -> u64 {
        len.div_ceil(u64::from(1_u32 << PAGE_SHIFT))
    }
}

/// Absolute sector number on a block device.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct SectorNumber(pub u64);

impl SectorNumber {
    /// Sector `count` sectors past this one, `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Byte offset of this sector.
    #[must_use]
    pub fn byte_offset(self) -> Option<ByteOffset> {
        self.0.checked_mul(SECTOR_SIZE as u64).map(ByteOffset)
    }
}

/// Filesystem block number (file-logical or device-physical, depending on
/// context; the mapper trait converts between the two).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct BlockNumber(pub u64);

/// Byte offset, either into a file or a device.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Offset within the containing page.
    #[must_use]
    pub fn page_offset(self) -> usize {
        (self.0 & (PAGE_SIZE as u64 - 1)) as usize
    }
}

/// Validated sub-page block size: a power of two in `SECTOR_SIZE..=PAGE_SIZE`.
///
/// All buffers attached to one page share one `BlockSize`; validating at
/// construction lets the buffer layer divide pages without re-checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in
    /// `[SECTOR_SIZE, PAGE_SIZE]`.
    pub fn new(value: u32) -> Result<Self, UnitError> {
        if !value.is_power_of_two() {
            return Err(UnitError::InvalidBlockSize {
                value,
                reason: "must be a power of two",
            });
        }
        if (value as usize) < SECTOR_SIZE || (value as usize) > PAGE_SIZE {
            return Err(UnitError::InvalidBlockSize {
                value,
                reason: "must lie between the sector size and the page size",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Number of bits to shift to convert between bytes and blocks.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// How many blocks of this size fit in one page.
    #[must_use]
    pub fn blocks_per_page(self) -> usize {
        PAGE_SIZE / self.0 as usize
    }

    /// How many sectors one block of this size spans.
    #[must_use]
    pub fn sectors_per_block(self) -> u64 {
        u64::from(self.0 >> SECTOR_SHIFT)
    }

    /// First file-logical block of page `index`.
    #[must_use]
    pub fn first_block_of_page(self, index: PageIndex) -> BlockNumber {
        BlockNumber(index.0 << (PAGE_SHIFT - self.shift()))
    }

    /// File-logical block containing `byte_offset`.
    #[must_use]
    pub fn byte_to_block(self, byte_offset: u64) -> BlockNumber {
        BlockNumber(byte_offset >> u64::from(self.shift()))
    }

    /// First sector of a device block, `None` on overflow.
    #[must_use]
    pub fn first_sector_of_block(self, block: BlockNumber) -> Option<SectorNumber> {
        block
            .0
            .checked_mul(self.sectors_per_block())
            .map(SectorNumber)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_rejects_out_of_range() {
        assert!(BlockSize::new(0).is_err());
        assert!(BlockSize::new(768).is_err());
        assert!(BlockSize::new(256).is_err());
        assert!(BlockSize::new((PAGE_SIZE * 2) as u32).is_err());
        assert!(BlockSize::new(512).is_ok());
        assert!(BlockSize::new(1024).is_ok());
        assert!(BlockSize::new(PAGE_SIZE as u32).is_ok());
    }

    #[test]
    fn block_size_geometry() {
        let bs = BlockSize::new(1024).expect("valid block size");
        assert_eq!(bs.blocks_per_page(), 4);
        assert_eq!(bs.sectors_per_block(), 2);
        assert_eq!(bs.first_block_of_page(PageIndex(3)), BlockNumber(12));
        assert_eq!(
            bs.first_sector_of_block(BlockNumber(12)),
            Some(SectorNumber(24))
        );
        assert_eq!(bs.byte_to_block(4096), BlockNumber(4));
    }

    #[test]
    fn page_index_conversions() {
        assert_eq!(PageIndex::containing(ByteOffset(4095)), PageIndex(0));
        assert_eq!(PageIndex::containing(ByteOffset(4096)), PageIndex(1));
        assert_eq!(PageIndex(2).byte_offset(), Some(ByteOffset(8192)));
        assert_eq!(ByteOffset(4106).page_offset(), 10);
        assert_eq!(PageIndex::spanning(0), 0);
        assert_eq!(PageIndex::spanning(1), 1);
        assert_eq!(PageIndex::spanning(4096), 1);
        assert_eq!(PageIndex::spanning(4097), 2);
    }

    #[test]
    fn sector_arithmetic() {
        assert_eq!(SectorNumber(8).byte_offset(), Some(ByteOffset(4096)));
        assert_eq!(SectorNumber(u64::MAX).checked_add(1), None);
        assert_eq!(SECTORS_PER_PAGE, 8);
    }
}
