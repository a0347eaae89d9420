//! On-page binary layout for section headers, data-page headers, and entry
//! headers.
//!
//! All multi-byte fields are little-endian. Structures are never cast in
//! place; every access goes through these explicit encode/decode accessors so
//! the raw-byte boundary stays small and auditable.

use crate::error::{Result, StoreError};
use crate::types::OwnerKind;

/// Bytes reserved at the start of a section's header page for the fixed
/// header fields. The available-space table starts right after.
pub const RESERVED_HEADER_SPACE: usize = 64;

/// Fixed header at the start of every data page.
pub const PAGE_HEADER_LEN: usize = 24;

/// Per-entry header: allocated size plus the packed used-size word.
pub const ENTRY_HEADER_LEN: usize = 4;

/// Flag byte value marking a section header page.
pub const FLAG_SECTION_HEADER: u8 = 0x01;

/// Flag byte value marking a small-data page.
pub const FLAG_DATA_PAGE: u8 = 0x02;

/// Freed marker in the packed used-size word.
pub const ENTRY_FREED_BIT: u16 = 0x8000;

/// Compressed marker in the packed used-size word.
pub const ENTRY_COMPRESSED_BIT: u16 = 0x4000;

/// Low bits of the packed word that hold the actual used byte count.
pub const ENTRY_USED_MASK: u16 = 0x3FFF;

mod section_offsets {
    //! Byte offsets of the fixed section-header fields.
    use core::ops::Range;

    pub const OWNER_HASH: Range<usize> = 0..8;
    pub const PAGE_NUMBER: Range<usize> = 8..16;
    pub const NUMBER_OF_PAGES: Range<usize> = 16..18;
    pub const LAST_USED_PAGE: Range<usize> = 18..20;
    pub const NUMBER_OF_ENTRIES: Range<usize> = 20..24;
    pub const ALLOCATED_SIZE: Range<usize> = 24..32;
    pub const OWNER_KIND: usize = 32;
    pub const FLAGS: usize = 33;
}

mod page_offsets {
    //! Byte offsets of the data-page header fields.
    use core::ops::Range;

    pub const PAGE_NUMBER: Range<usize> = 0..8;
    pub const OWNER_HASH: Range<usize> = 8..16;
    pub const POSITION_IN_SECTION: Range<usize> = 16..18;
    pub const NEXT_ALLOCATION: Range<usize> = 18..20;
    pub const NUMBER_OF_ENTRIES: Range<usize> = 20..22;
    pub const OWNER_KIND: usize = 22;
    pub const FLAGS: usize = 23;
}

/// Decoded form of a section's header page.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SectionHeader {
    /// Hash of the owning entity's name.
    pub owner_hash: u64,
    /// Page number of the header page itself (the section's base).
    pub page_number: u64,
    /// Number of data pages (the header page is not counted).
    pub number_of_pages: u16,
    /// Index of the page the last allocation landed in. A hint, not a
    /// guarantee.
    pub last_used_page: u16,
    /// Live entries across the whole section.
    pub number_of_entries: u32,
    /// Total bytes handed out, entry headers included.
    pub allocated_size: u64,
    /// Kind tag of the owning entity.
    pub owner_kind: OwnerKind,
    /// Page-role flags; must contain [`FLAG_SECTION_HEADER`].
    pub flags: u8,
}

impl SectionHeader {
    /// Writes the fixed fields into the start of a header page.
    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < RESERVED_HEADER_SPACE {
            return Err(StoreError::Corruption(
                "section header buffer too small".into(),
            ));
        }
        dst[section_offsets::OWNER_HASH].copy_from_slice(&self.owner_hash.to_le_bytes());
        dst[section_offsets::PAGE_NUMBER].copy_from_slice(&self.page_number.to_le_bytes());
        dst[section_offsets::NUMBER_OF_PAGES].copy_from_slice(&self.number_of_pages.to_le_bytes());
        dst[section_offsets::LAST_USED_PAGE].copy_from_slice(&self.last_used_page.to_le_bytes());
        dst[section_offsets::NUMBER_OF_ENTRIES]
            .copy_from_slice(&self.number_of_entries.to_le_bytes());
        dst[section_offsets::ALLOCATED_SIZE].copy_from_slice(&self.allocated_size.to_le_bytes());
        dst[section_offsets::OWNER_KIND] = self.owner_kind.0;
        dst[section_offsets::FLAGS] = self.flags;
        Ok(())
    }

    /// Reads the fixed fields back from a header page.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < RESERVED_HEADER_SPACE {
            return Err(StoreError::Corruption(
                "section header truncated".into(),
            ));
        }
        let flags = src[section_offsets::FLAGS];
        if flags & FLAG_SECTION_HEADER == 0 {
            return Err(StoreError::Corruption(
                "page is not a section header".into(),
            ));
        }
        Ok(Self {
            owner_hash: u64::from_le_bytes(src[section_offsets::OWNER_HASH].try_into().unwrap()),
            page_number: u64::from_le_bytes(src[section_offsets::PAGE_NUMBER].try_into().unwrap()),
            number_of_pages: u16::from_le_bytes(
                src[section_offsets::NUMBER_OF_PAGES].try_into().unwrap(),
            ),
            last_used_page: u16::from_le_bytes(
                src[section_offsets::LAST_USED_PAGE].try_into().unwrap(),
            ),
            number_of_entries: u32::from_le_bytes(
                src[section_offsets::NUMBER_OF_ENTRIES].try_into().unwrap(),
            ),
            allocated_size: u64::from_le_bytes(
                src[section_offsets::ALLOCATED_SIZE].try_into().unwrap(),
            ),
            owner_kind: OwnerKind(src[section_offsets::OWNER_KIND]),
            flags,
        })
    }
}

/// Decoded form of a data page's header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RawPageHeader {
    /// Global page number of this page.
    pub page_number: u64,
    /// Copy of the section's owner hash, so ownership can be checked without
    /// walking to the section header first.
    pub owner_hash: u64,
    /// Zero-based position among the section's data pages.
    pub position_in_section: u16,
    /// Offset of the next free byte; bytes below it hold entries.
    pub next_allocation: u16,
    /// Live entries on this page.
    pub number_of_entries: u16,
    /// Kind tag copied from the section.
    pub owner_kind: OwnerKind,
    /// Page-role flags; must contain [`FLAG_DATA_PAGE`].
    pub flags: u8,
}

impl RawPageHeader {
    /// Writes the header into the start of a data page.
    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < PAGE_HEADER_LEN {
            return Err(StoreError::Corruption("page header buffer too small".into()));
        }
        dst[page_offsets::PAGE_NUMBER].copy_from_slice(&self.page_number.to_le_bytes());
        dst[page_offsets::OWNER_HASH].copy_from_slice(&self.owner_hash.to_le_bytes());
        dst[page_offsets::POSITION_IN_SECTION]
            .copy_from_slice(&self.position_in_section.to_le_bytes());
        dst[page_offsets::NEXT_ALLOCATION].copy_from_slice(&self.next_allocation.to_le_bytes());
        dst[page_offsets::NUMBER_OF_ENTRIES].copy_from_slice(&self.number_of_entries.to_le_bytes());
        dst[page_offsets::OWNER_KIND] = self.owner_kind.0;
        dst[page_offsets::FLAGS] = self.flags;
        Ok(())
    }

    /// Reads a header back from a data page, validating its role flag and
    /// allocation bound.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < PAGE_HEADER_LEN {
            return Err(StoreError::Corruption("page header truncated".into()));
        }
        let flags = src[page_offsets::FLAGS];
        if flags & FLAG_DATA_PAGE == 0 {
            return Err(StoreError::Corruption("page is not a raw data page".into()));
        }
        let next_allocation =
            u16::from_le_bytes(src[page_offsets::NEXT_ALLOCATION].try_into().unwrap());
        if (next_allocation as usize) < PAGE_HEADER_LEN || next_allocation as usize > src.len() {
            return Err(StoreError::Corruption(format!(
                "next allocation offset {next_allocation} out of page bounds"
            )));
        }
        Ok(Self {
            page_number: u64::from_le_bytes(src[page_offsets::PAGE_NUMBER].try_into().unwrap()),
            owner_hash: u64::from_le_bytes(src[page_offsets::OWNER_HASH].try_into().unwrap()),
            position_in_section: u16::from_le_bytes(
                src[page_offsets::POSITION_IN_SECTION].try_into().unwrap(),
            ),
            next_allocation,
            number_of_entries: u16::from_le_bytes(
                src[page_offsets::NUMBER_OF_ENTRIES].try_into().unwrap(),
            ),
            owner_kind: OwnerKind(src[page_offsets::OWNER_KIND]),
            flags,
        })
    }
}

/// Per-entry size word pair: allocated capacity plus the packed used-size
/// word carrying the freed and compressed flags.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EntrySizes {
    /// Capacity reserved for the entry, fixed at allocation time. Signed on
    /// purpose: a non-positive value can only come from corruption and must
    /// be caught, never wrapped.
    pub allocated: i16,
    used_raw: u16,
}

impl EntrySizes {
    /// A fresh entry header: full capacity, nothing used, no flags.
    pub fn new(allocated: i16) -> Self {
        Self {
            allocated,
            used_raw: 0,
        }
    }

    /// Bytes of the payload that hold live data.
    pub fn used(&self) -> u16 {
        self.used_raw & ENTRY_USED_MASK
    }

    /// Whether the entry has been freed.
    pub fn is_freed(&self) -> bool {
        self.used_raw & ENTRY_FREED_BIT != 0
    }

    /// Whether the payload is stored compressed.
    pub fn is_compressed(&self) -> bool {
        self.used_raw & ENTRY_COMPRESSED_BIT != 0
    }

    /// Replaces the used byte count, keeping the flag bits.
    pub fn set_used(&mut self, used: u16) {
        debug_assert!(used <= ENTRY_USED_MASK);
        self.used_raw = (self.used_raw & !ENTRY_USED_MASK) | (used & ENTRY_USED_MASK);
    }

    /// Sets or clears the freed marker.
    pub fn set_freed(&mut self, freed: bool) {
        if freed {
            self.used_raw |= ENTRY_FREED_BIT;
        } else {
            self.used_raw &= !ENTRY_FREED_BIT;
        }
    }

    /// Sets or clears the compressed marker.
    pub fn set_compressed(&mut self, compressed: bool) {
        if compressed {
            self.used_raw |= ENTRY_COMPRESSED_BIT;
        } else {
            self.used_raw &= !ENTRY_COMPRESSED_BIT;
        }
    }

    /// Writes the header at the start of `dst`.
    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < ENTRY_HEADER_LEN {
            return Err(StoreError::Corruption(
                "entry header buffer too small".into(),
            ));
        }
        dst[0..2].copy_from_slice(&self.allocated.to_le_bytes());
        dst[2..4].copy_from_slice(&self.used_raw.to_le_bytes());
        Ok(())
    }

    /// Reads a header from the start of `src`.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < ENTRY_HEADER_LEN {
            return Err(StoreError::Corruption("entry header truncated".into()));
        }
        Ok(Self {
            allocated: i16::from_le_bytes(src[0..2].try_into().unwrap()),
            used_raw: u16::from_le_bytes(src[2..4].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_header_round_trip() {
        let header = SectionHeader {
            owner_hash: 0xDEAD_BEEF_CAFE_F00D,
            page_number: 42,
            number_of_pages: 31,
            last_used_page: 7,
            number_of_entries: 1234,
            allocated_size: 98_765,
            owner_kind: OwnerKind(3),
            flags: FLAG_SECTION_HEADER,
        };
        let mut buf = vec![0u8; 4096];
        header.encode(&mut buf).expect("encode");
        let decoded = SectionHeader::decode(&buf).expect("decode");
        assert_eq!(header, decoded);
    }

    #[test]
    fn section_header_rejects_wrong_role() {
        let mut buf = vec![0u8; 4096];
        let header = SectionHeader {
            owner_hash: 1,
            page_number: 0,
            number_of_pages: 1,
            last_used_page: 0,
            number_of_entries: 0,
            allocated_size: 0,
            owner_kind: OwnerKind(0),
            flags: FLAG_DATA_PAGE,
        };
        header.encode(&mut buf).expect("encode");
        assert!(matches!(
            SectionHeader::decode(&buf),
            Err(StoreError::Corruption(_))
        ));
    }

    #[test]
    fn page_header_round_trip() {
        let header = RawPageHeader {
            page_number: 43,
            owner_hash: 0x1122_3344_5566_7788,
            position_in_section: 0,
            next_allocation: PAGE_HEADER_LEN as u16,
            number_of_entries: 0,
            owner_kind: OwnerKind(9),
            flags: FLAG_DATA_PAGE,
        };
        let mut buf = vec![0u8; 4096];
        header.encode(&mut buf).expect("encode");
        assert_eq!(RawPageHeader::decode(&buf).expect("decode"), header);
    }

    #[test]
    fn page_header_rejects_bad_next_allocation() {
        let mut buf = vec![0u8; 4096];
        let header = RawPageHeader {
            page_number: 1,
            owner_hash: 1,
            position_in_section: 0,
            next_allocation: PAGE_HEADER_LEN as u16,
            number_of_entries: 0,
            owner_kind: OwnerKind(0),
            flags: FLAG_DATA_PAGE,
        };
        header.encode(&mut buf).expect("encode");
        buf[18..20].copy_from_slice(&8u16.to_le_bytes());
        assert!(matches!(
            RawPageHeader::decode(&buf),
            Err(StoreError::Corruption(_))
        ));
    }

    #[test]
    fn entry_sizes_flags_keep_used_count() {
        let mut sizes = EntrySizes::new(512);
        sizes.set_used(300);
        sizes.set_compressed(true);
        assert_eq!(sizes.used(), 300);
        assert!(sizes.is_compressed());
        assert!(!sizes.is_freed());

        sizes.set_freed(true);
        assert_eq!(sizes.used(), 300);
        assert!(sizes.is_freed());
        assert!(sizes.is_compressed());

        sizes.set_freed(false);
        sizes.set_compressed(false);
        assert_eq!(sizes.used(), 300);
        assert!(!sizes.is_freed());
        assert!(!sizes.is_compressed());
    }

    #[test]
    fn entry_sizes_round_trip() {
        let mut sizes = EntrySizes::new(2000);
        sizes.set_used(1999);
        sizes.set_compressed(true);
        let mut buf = [0u8; ENTRY_HEADER_LEN];
        sizes.encode(&mut buf).expect("encode");
        let decoded = EntrySizes::decode(&buf).expect("decode");
        assert_eq!(decoded, sizes);
        assert_eq!(decoded.allocated, 2000);
        assert_eq!(decoded.used(), 1999);
        assert!(decoded.is_compressed());
    }

    #[test]
    fn entry_sizes_negative_allocated_survives_decode() {
        // Decode must hand the negative value back untouched; it is the
        // compactor's job to treat it as fatal.
        let mut buf = [0u8; ENTRY_HEADER_LEN];
        buf[0..2].copy_from_slice(&(-5i16).to_le_bytes());
        let sizes = EntrySizes::decode(&buf).expect("decode");
        assert_eq!(sizes.allocated, -5);
    }
}
