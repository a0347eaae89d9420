//! Section sizing policy.
//!
//! A section's page count is chosen from the database's current size so that
//! small databases are not blown up by pre-allocation while large ones
//! amortize the header overhead over bigger runs. The function is pure so the
//! tier boundaries can be tested exhaustively.

use super::layout::RESERVED_HEADER_SPACE;

/// Returns the total page count (header page included) for a new section,
/// given how many pages the database currently has allocated.
///
/// The top tier is the hard ceiling: one header page can track at most
/// `(page_size - RESERVED_HEADER_SPACE) / 2` pages, two bytes of free-space
/// accounting each.
pub fn pages_in_section(allocated_pages: u64, page_size: usize) -> u16 {
    let ceiling = ((page_size - RESERVED_HEADER_SPACE) / 2) as u16;
    let tier = match allocated_pages {
        p if p > 1024 * 32 => ceiling,
        p if p > 1024 * 16 => 1024,
        p if p > 1024 * 8 => 512,
        p if p > 1024 * 4 => 128,
        _ => 32,
    };
    tier.min(ceiling)
}
