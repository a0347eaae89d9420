//! Identifier types shared across the crate.

use std::fmt;

/// Opaque address of one entry: `page_number * page_size + offset`.
///
/// This is the only address handed to callers. It survives storage
/// round-trips unchanged and is reassigned only through an explicit move
/// reported during page compaction.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct EntryId(pub u64);

impl EntryId {
    /// Builds an identifier from a page number and an in-page byte offset.
    pub fn new(page_number: u64, offset: usize, page_size: usize) -> Self {
        debug_assert!(offset < page_size);
        Self(page_number * page_size as u64 + offset as u64)
    }

    /// The page number this identifier addresses.
    pub fn page_number(self, page_size: usize) -> u64 {
        self.0 / page_size as u64
    }

    /// The byte offset within the page.
    pub fn offset(self, page_size: usize) -> usize {
        (self.0 % page_size as u64) as usize
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tag identifying the kind of entity a section belongs to (for example a
/// specific table class). Stored verbatim in section and page headers.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct OwnerKind(pub u8);

impl fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for OwnerKind {
    fn from(value: u8) -> Self {
        OwnerKind(value)
    }
}

impl From<OwnerKind> for u8 {
    fn from(value: OwnerKind) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_id_round_trip() {
        let id = EntryId::new(7, 1234, 8192);
        assert_eq!(id.page_number(8192), 7);
        assert_eq!(id.offset(8192), 1234);
        assert_eq!(id.0, 7 * 8192 + 1234);
    }

    #[test]
    fn entry_id_offset_zero() {
        let id = EntryId::new(3, 0, 4096);
        assert_eq!(id.page_number(4096), 3);
        assert_eq!(id.offset(4096), 0);
    }
}
