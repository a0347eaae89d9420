//! Packed small-value sections.
//!
//! A section is one header page followed by a fixed run of data pages into
//! which variable-length records are packed back to back. Records get a
//! stable global identifier (`page_number * page_size + offset`); freeing
//! leaves holes that are only reclaimed when allocation pressure triggers a
//! per-page compaction, which reports every surviving record's move so the
//! owning structure can repoint its references.
//!
//! All attempts are made to reduce how often data moves, even at the cost of
//! fragmentation: the fast path only ever appends at a page's tail, and a
//! page is rewritten solely when its tracked free space says a request fits
//! but the tail does not.

pub mod layout;
pub mod sizing;

use std::fmt::Write as _;

use tracing::{debug, trace};

use crate::error::{Result, StoreError};
use crate::txn::PageTxn;
use crate::types::{EntryId, OwnerKind};
use crate::{compress, hash};

use layout::{
    EntrySizes, RawPageHeader, SectionHeader, ENTRY_HEADER_LEN, ENTRY_USED_MASK, FLAG_DATA_PAGE,
    FLAG_SECTION_HEADER, PAGE_HEADER_LEN, RESERVED_HEADER_SPACE,
};

/// Largest payload a single entry can hold for the given page size.
///
/// Bounded three ways: an entry must leave room for at least one sibling on
/// its page, the allocated-size field is a signed 16-bit value, and the used
/// count only has fourteen bits in the packed size word.
pub fn max_item_size(page_size: usize) -> usize {
    let half_page = (page_size - PAGE_HEADER_LEN) / 2;
    half_page
        .min(ENTRY_USED_MASK as usize)
        .saturating_sub(ENTRY_HEADER_LEN)
}

/// Receiver for entry relocations during page compaction.
///
/// Whatever owns the identifiers (a table, an index) implements this to
/// repoint its references. The payload handed over is always directly usable:
/// compressed entries are decompressed first, with `was_compressed` telling
/// the listener what the stored form was.
pub trait MoveListener {
    /// Called once per surviving entry whose identifier changed.
    ///
    /// Returning an error aborts the compaction; the enclosing transaction is
    /// expected to roll back.
    fn on_entry_moved(
        &mut self,
        old: EntryId,
        new: EntryId,
        payload: &[u8],
        was_compressed: bool,
    ) -> Result<()>;
}

impl<F> MoveListener for F
where
    F: FnMut(EntryId, EntryId, &[u8], bool) -> Result<()>,
{
    fn on_entry_moved(
        &mut self,
        old: EntryId,
        new: EntryId,
        payload: &[u8],
        was_compressed: bool,
    ) -> Result<()> {
        self(old, new, payload, was_compressed)
    }
}

/// Payload view returned by [`RawSection::read_entry`].
#[derive(Debug)]
pub struct EntryData<'a> {
    /// Used bytes of the entry, as stored.
    pub payload: &'a [u8],
    /// Whether the stored bytes are compressed.
    pub compressed: bool,
}

/// One active small-data section inside a write transaction.
///
/// Holds the transaction exclusively for its lifetime; every mutation goes
/// through [`PageTxn::acquire_writable`] so the copy-on-write contract is
/// honored before any byte changes. Once `try_allocate` returns `None` the
/// section should be retired: existing data stays valid and addressable, but
/// new values belong in a fresh section.
pub struct RawSection<'t> {
    txn: &'t mut PageTxn,
    header_page: u64,
}

impl<'t> RawSection<'t> {
    /// Creates a new section sized by the current database size.
    ///
    /// `requested_pages` caps the tier-derived page count but never raises
    /// it. One page of the run becomes the header; the rest are data pages,
    /// each stamped with the owner hash so ownership checks never need the
    /// header page.
    pub fn create(
        txn: &'t mut PageTxn,
        owner: &[u8],
        owner_kind: OwnerKind,
        requested_pages: Option<u16>,
    ) -> Result<Self> {
        let page_size = txn.page_size();
        let tier = sizing::pages_in_section(txn.allocated_pages(), page_size);
        let total_pages = requested_pages.map_or(tier, |r| r.min(tier));
        if total_pages < 2 {
            return Err(StoreError::InvalidArgument(
                "a section needs a header page and at least one data page".into(),
            ));
        }
        let number_of_pages = total_pages - 1;
        debug_assert!(
            RESERVED_HEADER_SPACE + 2 * number_of_pages as usize <= page_size,
            "available-space table must fit beside the reserved header"
        );

        let base = txn.allocate_run(total_pages as usize)?;
        let owner_hash = hash::owner_hash64(owner);

        {
            let buf = txn.acquire_writable(base)?;
            SectionHeader {
                owner_hash,
                page_number: base,
                number_of_pages,
                last_used_page: 0,
                number_of_entries: 0,
                allocated_size: 0,
                owner_kind,
                flags: FLAG_SECTION_HEADER,
            }
            .encode(buf)?;
            let free = (page_size - PAGE_HEADER_LEN) as u16;
            for index in 0..number_of_pages as usize {
                let at = RESERVED_HEADER_SPACE + index * 2;
                buf[at..at + 2].copy_from_slice(&free.to_le_bytes());
            }
        }

        for index in 0..number_of_pages {
            let page_number = base + u64::from(index) + 1;
            let buf = txn.acquire_writable(page_number)?;
            RawPageHeader {
                page_number,
                owner_hash,
                position_in_section: index,
                next_allocation: PAGE_HEADER_LEN as u16,
                number_of_entries: 0,
                owner_kind,
                flags: FLAG_DATA_PAGE,
            }
            .encode(buf)?;
        }

        debug!(
            header_page = base,
            pages = number_of_pages,
            owner_hash,
            "section.create"
        );
        Ok(Self {
            txn,
            header_page: base,
        })
    }

    /// Reattaches to an existing section by its header page number.
    pub fn open(txn: &'t mut PageTxn, header_page: u64) -> Result<Self> {
        let header = SectionHeader::decode(txn.page(header_page)?)?;
        if header.page_number != header_page {
            return Err(StoreError::Corruption(format!(
                "section header at page {header_page} claims page number {}",
                header.page_number
            )));
        }
        Ok(Self { txn, header_page })
    }

    /// Page number of this section's header page.
    pub fn header_page(&self) -> u64 {
        self.header_page
    }

    /// Number of data pages in this section.
    pub fn data_pages(&self) -> Result<u16> {
        Ok(self.load_header()?.number_of_pages)
    }

    /// Live entries across the section.
    pub fn entry_count(&self) -> Result<u32> {
        Ok(self.load_header()?.number_of_entries)
    }

    /// Total bytes handed out to live entries, headers included.
    pub fn allocated_bytes(&self) -> Result<u64> {
        Ok(self.load_header()?.allocated_size)
    }

    /// Fraction of the section's total page space holding allocations.
    pub fn density(&self) -> Result<f64> {
        let header = self.load_header()?;
        let capacity = u64::from(header.number_of_pages) * self.txn.page_size() as u64;
        if capacity == 0 {
            return Ok(0.0);
        }
        Ok(header.allocated_size as f64 / capacity as f64)
    }

    /// Tracked free bytes of one data page.
    pub fn free_space(&self, index: u16) -> Result<u16> {
        let header = self.load_header()?;
        if index >= header.number_of_pages {
            return Err(StoreError::InvalidArgument(format!(
                "page index {index} outside section of {} pages",
                header.number_of_pages
            )));
        }
        self.available_space(index)
    }

    /// Largest payload this section can accept in a single entry.
    pub fn max_item_size(&self) -> usize {
        max_item_size(self.txn.page_size())
    }

    /// Tries to allocate `size` bytes, compacting a page if fragmentation is
    /// all that stands in the way.
    ///
    /// Returns the entry's identifier, or `None` when no page can satisfy
    /// the request even after compaction; that is the signal to retire this
    /// section.
    /// The new entry has its full capacity reserved and a used size of zero;
    /// [`RawSection::write_entry`] fills it in.
    pub fn try_allocate(
        &mut self,
        size: usize,
        moves: &mut dyn MoveListener,
    ) -> Result<Option<EntryId>> {
        if size == 0 || size > self.max_item_size() {
            return Err(StoreError::InvalidArgument(format!(
                "cannot allocate {size} bytes, valid sizes are 1..={}",
                self.max_item_size()
            )));
        }
        let page_size = self.txn.page_size();
        let footprint = size + ENTRY_HEADER_LEN;
        let header = self.load_header()?;

        // Start at the last used page to skip over the run of full ones.
        for index in header.last_used_page..header.number_of_pages {
            let available = self.available_space(index)?;
            if (available as usize) < footprint {
                continue;
            }
            let page_number = header.page_number + u64::from(index) + 1;
            let page_header = RawPageHeader::decode(self.txn.page(page_number)?)?;
            if page_header.next_allocation as usize + footprint > page_size {
                // Free bytes exist but not at the tail; leave the page to the
                // compacting pass.
                continue;
            }
            let (id, _) = self.append_entry(page_number, size)?;
            self.set_available_space(index, available - footprint as u16)?;
            self.finish_allocation(index, footprint)?;
            trace!(page = page_number, size, id = id.0, "section.alloc.fast");
            return Ok(Some(id));
        }

        // No page has a contiguous tail gap. Rescan from the start; the first
        // page whose tracked free space fits is worth rewriting.
        for index in 0..header.number_of_pages {
            let available = self.available_space(index)?;
            if (available as usize) < footprint {
                continue;
            }
            let page_number = header.page_number + u64::from(index) + 1;
            self.compact_page(index, moves)?;
            let page_header = RawPageHeader::decode(self.txn.page(page_number)?)?;
            if page_header.next_allocation as usize + footprint > page_size {
                return Err(StoreError::Unrecoverable(format!(
                    "available-space table claims {available} free bytes in page {page_number} \
                     but compaction left no room for {footprint}"
                )));
            }
            let (id, next_allocation) = self.append_entry(page_number, size)?;
            self.set_available_space(index, (page_size - next_allocation as usize) as u16)?;
            self.finish_allocation(index, footprint)?;
            trace!(
                page = page_number,
                size,
                id = id.0,
                "section.alloc.compacted"
            );
            return Ok(Some(id));
        }

        trace!(header_page = self.header_page, size, "section.alloc.exhausted");
        Ok(None)
    }

    /// Copies `data` into an allocated entry and records its used size.
    ///
    /// `compressed` marks the stored form so later moves can hand listeners
    /// decompressed bytes.
    pub fn write_entry(&mut self, id: EntryId, data: &[u8], compressed: bool) -> Result<()> {
        let (page_number, offset, _) = self.locate(id)?;
        let page_size = self.txn.page_size();
        let buf = self.txn.acquire_writable(page_number)?;
        let page_header = RawPageHeader::decode(buf)?;
        check_entry_offset(offset, &page_header, id)?;
        let mut sizes = EntrySizes::decode(&buf[offset..])?;
        if sizes.is_freed() {
            return Err(StoreError::InvalidArgument(format!(
                "entry {id} has been freed"
            )));
        }
        let allocated = sizes.allocated as usize;
        if sizes.allocated <= 0 || offset + ENTRY_HEADER_LEN + allocated > page_size {
            return Err(StoreError::Corruption(format!(
                "entry {id} has allocated size {} beyond page bounds",
                sizes.allocated
            )));
        }
        if data.len() > allocated {
            return Err(StoreError::InvalidArgument(format!(
                "payload of {} bytes exceeds the {allocated} bytes allocated for entry {id}",
                data.len()
            )));
        }
        sizes.set_used(data.len() as u16);
        sizes.set_compressed(compressed);
        sizes.encode(&mut buf[offset..offset + ENTRY_HEADER_LEN])?;
        let start = offset + ENTRY_HEADER_LEN;
        buf[start..start + data.len()].copy_from_slice(data);
        trace!(id = id.0, len = data.len(), compressed, "section.write");
        Ok(())
    }

    /// Returns the live payload for an identifier.
    pub fn read_entry(&self, id: EntryId) -> Result<EntryData<'_>> {
        let (page_number, offset, _) = self.locate(id)?;
        let page_size = self.txn.page_size();
        let buf = self.txn.page(page_number)?;
        let page_header = RawPageHeader::decode(buf)?;
        check_entry_offset(offset, &page_header, id)?;
        let sizes = EntrySizes::decode(&buf[offset..])?;
        if sizes.is_freed() {
            return Err(StoreError::InvalidArgument(format!(
                "entry {id} has been freed"
            )));
        }
        let used = sizes.used() as usize;
        if offset + ENTRY_HEADER_LEN + used > page_size {
            return Err(StoreError::Corruption(format!(
                "entry {id} has used size {used} beyond page bounds"
            )));
        }
        let start = offset + ENTRY_HEADER_LEN;
        Ok(EntryData {
            payload: &buf[start..start + used],
            compressed: sizes.is_compressed(),
        })
    }

    /// Reports an entry's reserved capacity and used byte count.
    pub fn entry_size_of(&self, id: EntryId) -> Result<(u16, u16)> {
        let (page_number, offset, _) = self.locate(id)?;
        let buf = self.txn.page(page_number)?;
        let page_header = RawPageHeader::decode(buf)?;
        check_entry_offset(offset, &page_header, id)?;
        let sizes = EntrySizes::decode(&buf[offset..])?;
        if sizes.allocated <= 0 {
            return Err(StoreError::Corruption(format!(
                "entry {id} has non-positive allocated size {}",
                sizes.allocated
            )));
        }
        Ok((sizes.allocated as u16, sizes.used()))
    }

    /// Marks an entry freed. The bytes stay in place until allocation
    /// pressure compacts the page; only the bookkeeping changes here.
    pub fn free_entry(&mut self, id: EntryId) -> Result<()> {
        let (page_number, offset, index) = self.locate(id)?;
        let allocated = {
            let buf = self.txn.acquire_writable(page_number)?;
            let mut page_header = RawPageHeader::decode(buf)?;
            check_entry_offset(offset, &page_header, id)?;
            let mut sizes = EntrySizes::decode(&buf[offset..])?;
            if sizes.is_freed() {
                return Err(StoreError::InvalidArgument(format!(
                    "entry {id} has already been freed"
                )));
            }
            if sizes.allocated <= 0 {
                return Err(StoreError::Corruption(format!(
                    "entry {id} has non-positive allocated size {}",
                    sizes.allocated
                )));
            }
            sizes.set_freed(true);
            sizes.encode(&mut buf[offset..offset + ENTRY_HEADER_LEN])?;
            page_header.number_of_entries =
                page_header.number_of_entries.checked_sub(1).ok_or_else(|| {
                    StoreError::Corruption(format!(
                        "page {page_number} entry count underflow on free"
                    ))
                })?;
            page_header.encode(buf)?;
            sizes.allocated as usize
        };

        let footprint = (allocated + ENTRY_HEADER_LEN) as u64;
        let available = self
            .available_space(index)?
            .checked_add(footprint as u16)
            .ok_or_else(|| {
                StoreError::Corruption(format!(
                    "page {page_number} available-space overflow on free"
                ))
            })?;
        self.set_available_space(index, available)?;

        let mut header = self.load_header()?;
        header.number_of_entries = header.number_of_entries.checked_sub(1).ok_or_else(|| {
            StoreError::Corruption("section entry count underflow on free".into())
        })?;
        header.allocated_size = header.allocated_size.checked_sub(footprint).ok_or_else(|| {
            StoreError::Corruption("section allocated-size underflow on free".into())
        })?;
        self.store_header(&header)?;
        trace!(id = id.0, allocated, "section.free");
        Ok(())
    }

    /// Whether an identifier addresses a data page of this very section run.
    pub fn contains(&self, id: EntryId) -> Result<bool> {
        let header = self.load_header()?;
        let page_number = id.page_number(self.txn.page_size());
        Ok(page_number > header.page_number
            && page_number <= header.page_number + u64::from(header.number_of_pages))
    }

    /// Whether an identifier belongs to this section's logical owner.
    ///
    /// An identifier inside this section's own page range is owned outright.
    /// Anything else is resolved by reading the page it points into, walking
    /// back to that page's section header via its recorded position, and
    /// comparing owner hashes. One owner may have several sections over
    /// time, and this disambiguates without a global directory.
    pub fn is_owned(&self, id: EntryId) -> Result<bool> {
        if self.contains(id)? {
            return Ok(true);
        }
        let header = self.load_header()?;
        let page_number = id.page_number(self.txn.page_size());
        let foreign = RawPageHeader::decode(self.txn.page(page_number)?)?;
        let foreign_section_page = foreign
            .page_number
            .checked_sub(u64::from(foreign.position_in_section) + 1)
            .ok_or_else(|| {
                StoreError::Corruption(format!(
                    "page {page_number} records a position before its section header"
                ))
            })?;
        let foreign_header = SectionHeader::decode(self.txn.page(foreign_section_page)?)?;
        Ok(foreign_header.owner_hash == header.owner_hash)
    }

    /// Human-readable listing of one page's entries: offset, allocated size,
    /// used size, and the freed marker. Diagnostic only.
    pub fn debug_dump_page(&self, index: u16) -> Result<String> {
        let header = self.load_header()?;
        if index >= header.number_of_pages {
            return Err(StoreError::InvalidArgument(format!(
                "page index {index} outside section of {} pages",
                header.number_of_pages
            )));
        }
        let page_number = header.page_number + u64::from(index) + 1;
        let buf = self.txn.page(page_number)?;
        let page_header = RawPageHeader::decode(buf)?;
        let mut out = format!(
            "page {} ({} entries, next allocation {})\n",
            page_number, page_header.number_of_entries, page_header.next_allocation
        );
        let mut cursor = PAGE_HEADER_LEN;
        while cursor < page_header.next_allocation as usize {
            let sizes = EntrySizes::decode(&buf[cursor..])?;
            if sizes.allocated <= 0 {
                return Err(StoreError::Corruption(format!(
                    "entry at offset {cursor} in page {page_number} has allocated size {}",
                    sizes.allocated
                )));
            }
            let _ = writeln!(
                &mut out,
                "{cursor} - {} / {}{}",
                sizes.allocated,
                sizes.used(),
                if sizes.is_freed() { " - freed" } else { "" }
            );
            cursor += ENTRY_HEADER_LEN + sizes.allocated as usize;
        }
        Ok(out)
    }

    /// Rewrites one data page in place, squeezing out freed entries.
    ///
    /// Live entries keep their relative order and reserved capacity; every
    /// entry whose identifier changes is reported through `moves` before its
    /// bytes land at the new offset. Only this page is touched.
    fn compact_page(&mut self, index: u16, moves: &mut dyn MoveListener) -> Result<()> {
        let page_size = self.txn.page_size();
        let header = self.load_header()?;
        let page_number = header.page_number + u64::from(index) + 1;

        let next_allocation = {
            let buf = self.txn.acquire_writable(page_number)?;
            let mut page_header = RawPageHeader::decode(buf)?;

            if page_header.number_of_entries == 0 {
                page_header.next_allocation = PAGE_HEADER_LEN as u16;
                page_header.encode(buf)?;
                buf[PAGE_HEADER_LEN..].fill(0);
                page_header.next_allocation
            } else {
                let scratch = buf.to_vec();
                let old_next = page_header.next_allocation as usize;
                page_header.next_allocation = PAGE_HEADER_LEN as u16;
                page_header.number_of_entries = 0;
                buf[PAGE_HEADER_LEN..].fill(0);

                let mut cursor = PAGE_HEADER_LEN;
                while cursor < old_next {
                    let sizes = EntrySizes::decode(&scratch[cursor..])?;
                    if sizes.allocated <= 0 {
                        return Err(StoreError::Unrecoverable(format!(
                            "allocated size must be positive, got {} at offset {cursor} \
                             in page {page_number}",
                            sizes.allocated
                        )));
                    }
                    let step = ENTRY_HEADER_LEN + sizes.allocated as usize;
                    if cursor + step > old_next {
                        return Err(StoreError::Unrecoverable(format!(
                            "entry at offset {cursor} extends past the allocation bound \
                             of page {page_number}"
                        )));
                    }
                    if sizes.is_freed() {
                        cursor += step;
                        continue;
                    }
                    let used = sizes.used() as usize;
                    if used > sizes.allocated as usize {
                        return Err(StoreError::Unrecoverable(format!(
                            "entry at offset {cursor} in page {page_number} uses {used} \
                             of {} allocated bytes",
                            sizes.allocated
                        )));
                    }

                    let write_at = page_header.next_allocation as usize;
                    let old_id = EntryId::new(page_number, cursor, page_size);
                    let new_id = EntryId::new(page_number, write_at, page_size);
                    let payload = &scratch[cursor + ENTRY_HEADER_LEN..cursor + ENTRY_HEADER_LEN + used];
                    if old_id != new_id {
                        if sizes.is_compressed() {
                            let plain = compress::decompress(payload)?;
                            moves.on_entry_moved(old_id, new_id, &plain, true)?;
                        } else {
                            moves.on_entry_moved(old_id, new_id, payload, false)?;
                        }
                    }

                    sizes.encode(&mut buf[write_at..write_at + ENTRY_HEADER_LEN])?;
                    buf[write_at + ENTRY_HEADER_LEN..write_at + ENTRY_HEADER_LEN + used]
                        .copy_from_slice(payload);
                    page_header.next_allocation = (write_at + step) as u16;
                    page_header.number_of_entries += 1;
                    cursor += step;
                }

                page_header.encode(buf)?;
                page_header.next_allocation
            }
        };

        self.set_available_space(index, (page_size - next_allocation as usize) as u16)?;
        trace!(
            page = page_number,
            next_allocation,
            "section.compact"
        );
        Ok(())
    }

    /// Stamps a fresh entry header at a page's tail and returns its
    /// identifier plus the advanced allocation offset.
    fn append_entry(&mut self, page_number: u64, size: usize) -> Result<(EntryId, u16)> {
        let page_size = self.txn.page_size();
        let buf = self.txn.acquire_writable(page_number)?;
        let mut page_header = RawPageHeader::decode(buf)?;
        let offset = page_header.next_allocation as usize;
        let end = offset + ENTRY_HEADER_LEN + size;
        if end > page_size {
            return Err(StoreError::Corruption(format!(
                "entry of {size} bytes does not fit page {page_number} at offset {offset}"
            )));
        }
        EntrySizes::new(size as i16).encode(&mut buf[offset..offset + ENTRY_HEADER_LEN])?;
        page_header.next_allocation = end as u16;
        page_header.number_of_entries += 1;
        page_header.encode(buf)?;
        Ok((
            EntryId::new(page_number, offset, page_size),
            page_header.next_allocation,
        ))
    }

    /// Rolls the section-level counters forward after a successful
    /// allocation.
    fn finish_allocation(&mut self, index: u16, footprint: usize) -> Result<()> {
        let mut header = self.load_header()?;
        header.number_of_entries += 1;
        header.allocated_size += footprint as u64;
        header.last_used_page = index;
        self.store_header(&header)
    }

    /// Resolves an identifier to its page, in-page offset, and page index,
    /// rejecting anything outside this section's data pages.
    fn locate(&self, id: EntryId) -> Result<(u64, usize, u16)> {
        let header = self.load_header()?;
        let page_size = self.txn.page_size();
        let page_number = id.page_number(page_size);
        if page_number <= header.page_number
            || page_number > header.page_number + u64::from(header.number_of_pages)
        {
            return Err(StoreError::InvalidArgument(format!(
                "identifier {id} is outside section at page {}",
                self.header_page
            )));
        }
        let offset = id.offset(page_size);
        let index = (page_number - header.page_number - 1) as u16;
        Ok((page_number, offset, index))
    }

    fn load_header(&self) -> Result<SectionHeader> {
        SectionHeader::decode(self.txn.page(self.header_page)?)
    }

    fn store_header(&mut self, header: &SectionHeader) -> Result<()> {
        header.encode(self.txn.acquire_writable(self.header_page)?)
    }

    fn available_space(&self, index: u16) -> Result<u16> {
        let buf = self.txn.page(self.header_page)?;
        let at = RESERVED_HEADER_SPACE + index as usize * 2;
        if at + 2 > buf.len() {
            return Err(StoreError::Corruption(format!(
                "available-space slot {index} outside header page"
            )));
        }
        Ok(u16::from_le_bytes(buf[at..at + 2].try_into().unwrap()))
    }

    fn set_available_space(&mut self, index: u16, value: u16) -> Result<()> {
        let buf = self.txn.acquire_writable(self.header_page)?;
        let at = RESERVED_HEADER_SPACE + index as usize * 2;
        if at + 2 > buf.len() {
            return Err(StoreError::Corruption(format!(
                "available-space slot {index} outside header page"
            )));
        }
        buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

/// Validates that an offset points at an entry header below the page's
/// allocation watermark.
fn check_entry_offset(offset: usize, page_header: &RawPageHeader, id: EntryId) -> Result<()> {
    if offset < PAGE_HEADER_LEN || offset + ENTRY_HEADER_LEN > page_header.next_allocation as usize
    {
        return Err(StoreError::InvalidArgument(format!(
            "identifier {id} does not address an entry in page {}",
            page_header.page_number
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_SIZE: usize = 4096;

    fn new_txn() -> PageTxn {
        PageTxn::new(PAGE_SIZE).expect("txn")
    }

    fn nop() -> impl FnMut(EntryId, EntryId, &[u8], bool) -> Result<()> {
        |_, _, _: &[u8], _| Ok(())
    }

    #[derive(Default)]
    struct MoveRecorder {
        moves: Vec<(EntryId, EntryId, Vec<u8>, bool)>,
    }

    impl MoveListener for MoveRecorder {
        fn on_entry_moved(
            &mut self,
            old: EntryId,
            new: EntryId,
            payload: &[u8],
            was_compressed: bool,
        ) -> Result<()> {
            self.moves.push((old, new, payload.to_vec(), was_compressed));
            Ok(())
        }
    }

    fn fill_entries(section: &mut RawSection<'_>, count: usize, size: usize) -> Vec<EntryId> {
        let mut ids = Vec::with_capacity(count);
        for n in 0..count {
            let id = section
                .try_allocate(size, &mut nop())
                .expect("allocate")
                .expect("space");
            let payload: Vec<u8> = (0..size).map(|i| ((i + n * 31) % 251) as u8).collect();
            section.write_entry(id, &payload, false).expect("write");
            ids.push(id);
        }
        ids
    }

    #[test]
    fn compaction_without_freed_entries_changes_nothing() {
        let mut txn = new_txn();
        let mut section =
            RawSection::create(&mut txn, b"orders", OwnerKind(1), Some(2)).expect("create");
        let ids = fill_entries(&mut section, 8, 100);

        let page_number = section.header_page() + 1;
        let before = section.txn.page(page_number).expect("page").to_vec();

        let mut recorder = MoveRecorder::default();
        section.compact_page(0, &mut recorder).expect("compact");

        assert!(recorder.moves.is_empty(), "no entry may move");
        let after = section.txn.page(page_number).expect("page").to_vec();
        assert_eq!(before, after, "page bytes must be untouched");
        for (n, id) in ids.iter().enumerate() {
            let data = section.read_entry(*id).expect("read");
            assert_eq!(data.payload[0], ((n * 31) % 251) as u8);
        }
    }

    #[test]
    fn compaction_drops_freed_entries_and_keeps_order() {
        let mut txn = new_txn();
        let mut section =
            RawSection::create(&mut txn, b"orders", OwnerKind(1), Some(2)).expect("create");
        let ids = fill_entries(&mut section, 6, 80);

        section.free_entry(ids[1]).expect("free");
        section.free_entry(ids[4]).expect("free");
        let expected: Vec<Vec<u8>> = [0usize, 2, 3, 5]
            .iter()
            .map(|&n| section.read_entry(ids[n]).expect("read").payload.to_vec())
            .collect();

        let mut recorder = MoveRecorder::default();
        section.compact_page(0, &mut recorder).expect("compact");

        // Entry 0 already sits at the lowest offset and must not be reported.
        assert_eq!(recorder.moves.len(), 3);
        let mut survivors = vec![(ids[0], expected[0].clone())];
        for ((old, new, payload, compressed), want) in
            recorder.moves.iter().zip(expected[1..].iter())
        {
            assert!(old.0 > new.0, "entries only slide toward the page start");
            assert_eq!(payload, want);
            assert!(!compressed);
            survivors.push((*new, want.clone()));
        }
        for (id, want) in &survivors {
            assert_eq!(section.read_entry(*id).expect("read").payload, &want[..]);
        }
        // Relative order survives: new offsets ascend with original order.
        let offsets: Vec<usize> = survivors
            .iter()
            .map(|(id, _)| id.offset(PAGE_SIZE))
            .collect();
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn compacting_a_fully_freed_page_resets_it() {
        let mut txn = new_txn();
        let mut section =
            RawSection::create(&mut txn, b"orders", OwnerKind(1), Some(2)).expect("create");
        let ids = fill_entries(&mut section, 3, 200);
        for id in ids {
            section.free_entry(id).expect("free");
        }

        let mut recorder = MoveRecorder::default();
        section.compact_page(0, &mut recorder).expect("compact");
        assert!(recorder.moves.is_empty());

        let page_number = section.header_page() + 1;
        let buf = section.txn.page(page_number).expect("page");
        let page_header = RawPageHeader::decode(buf).expect("header");
        assert_eq!(page_header.next_allocation as usize, PAGE_HEADER_LEN);
        assert_eq!(page_header.number_of_entries, 0);
        assert!(buf[PAGE_HEADER_LEN..].iter().all(|&b| b == 0));
        assert_eq!(
            section.free_space(0).expect("free space") as usize,
            PAGE_SIZE - PAGE_HEADER_LEN
        );
    }

    #[test]
    fn listener_error_aborts_compaction() {
        let mut txn = new_txn();
        let mut section =
            RawSection::create(&mut txn, b"orders", OwnerKind(1), Some(2)).expect("create");
        let ids = fill_entries(&mut section, 4, 64);
        section.free_entry(ids[0]).expect("free");

        let mut failing = |_: EntryId, _: EntryId, _: &[u8], _: bool| -> Result<()> {
            Err(StoreError::InvalidArgument("listener rejected move".into()))
        };
        let err = section
            .compact_page(0, &mut failing)
            .expect_err("listener failure must propagate");
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[test]
    fn compaction_detects_zeroed_allocated_size() {
        let mut txn = new_txn();
        let header_page;
        {
            let mut section =
                RawSection::create(&mut txn, b"orders", OwnerKind(1), Some(2)).expect("create");
            header_page = section.header_page();
            let ids = fill_entries(&mut section, 3, 64);
            section.free_entry(ids[2]).expect("free");
        }

        // Zero the first entry's allocated-size field behind the section's back.
        let buf = txn.acquire_writable(header_page + 1).expect("page");
        buf[PAGE_HEADER_LEN..PAGE_HEADER_LEN + 2].copy_from_slice(&0i16.to_le_bytes());

        let mut section = RawSection::open(&mut txn, header_page).expect("open");
        let err = section
            .compact_page(0, &mut MoveRecorder::default())
            .expect_err("corrupt entry must be fatal");
        assert!(matches!(err, StoreError::Unrecoverable(_)));
    }

    #[test]
    fn compressed_entries_are_decompressed_for_the_listener() {
        let mut txn = new_txn();
        let mut section =
            RawSection::create(&mut txn, b"orders", OwnerKind(1), Some(2)).expect("create");

        let plain: Vec<u8> = std::iter::repeat_with(|| b"abcdef".iter().copied())
            .take(50)
            .flatten()
            .collect();
        let packed = compress::compress(&plain).expect("compress");

        let filler = section
            .try_allocate(40, &mut nop())
            .expect("allocate")
            .expect("space");
        let id = section
            .try_allocate(packed.len(), &mut nop())
            .expect("allocate")
            .expect("space");
        section.write_entry(id, &packed, true).expect("write");
        section.free_entry(filler).expect("free");

        let mut recorder = MoveRecorder::default();
        section.compact_page(0, &mut recorder).expect("compact");
        assert_eq!(recorder.moves.len(), 1);
        let (old, new, payload, was_compressed) = &recorder.moves[0];
        assert_eq!(*old, id);
        assert!(new.0 < old.0);
        assert!(*was_compressed);
        assert_eq!(payload, &plain, "listener must see decompressed bytes");

        // The stored form stays compressed at the new offset.
        let stored = section.read_entry(*new).expect("read");
        assert!(stored.compressed);
        assert_eq!(stored.payload, &packed[..]);
    }
}
