//! B-Tree page layout
//!
//! Fixed-size pages with a 24-byte header followed by sorted,
//! length-prefixed entries. Data pages map keys to multi-version value
//! cells; index pages map boundary keys to child page addresses and carry
//! a separate leftmost-child pointer for keys below every boundary.
//!
//! ```text
//! 0   u8   page type (1 = data, 2 = index)
//! 1   u8   reserved
//! 2   u16  key count
//! 4   u32  used entry bytes
//! 8   u64  right sibling page (0 = none)
//! 16  u64  leftmost child page (index pages)
//! 24  ...  entries
//! ```
//!
//! Data entry: `u16 key_len | u32 value_len | key | value`.
//! Index entry: `u16 key_len | u64 child | key`.

use crate::{PersistitError, Result};
use byteorder::{BigEndian, ByteOrder};

pub const PAGE_HEADER_SIZE: usize = 24;

const TYPE_DATA: u8 = 1;
const TYPE_INDEX: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Data,
    Index,
}

pub fn init(page: &mut [u8], page_type: PageType) {
    for byte in page.iter_mut() {
        *byte = 0;
    }
    page[0] = match page_type {
        PageType::Data => TYPE_DATA,
        PageType::Index => TYPE_INDEX,
    };
}

pub fn page_type(page: &[u8]) -> Result<PageType> {
    match page.first() {
        Some(&TYPE_DATA) => Ok(PageType::Data),
        Some(&TYPE_INDEX) => Ok(PageType::Index),
        other => Err(PersistitError::CorruptVolume(format!(
            "unknown page type {:?}",
            other
        ))),
    }
}

pub fn key_count(page: &[u8]) -> usize {
    BigEndian::read_u16(&page[2..]) as usize
}

fn set_key_count(page: &mut [u8], count: usize) {
    BigEndian::write_u16(&mut page[2..], count as u16);
}

pub fn used(page: &[u8]) -> usize {
    BigEndian::read_u32(&page[4..]) as usize
}

fn set_used(page: &mut [u8], used: usize) {
    BigEndian::write_u32(&mut page[4..], used as u32);
}

pub fn right_sibling(page: &[u8]) -> u64 {
    BigEndian::read_u64(&page[8..])
}

pub fn set_right_sibling(page: &mut [u8], sibling: u64) {
    BigEndian::write_u64(&mut page[8..], sibling);
}

pub fn leftmost_child(page: &[u8]) -> u64 {
    BigEndian::read_u64(&page[16..])
}

pub fn set_leftmost_child(page: &mut [u8], child: u64) {
    BigEndian::write_u64(&mut page[16..], child);
}

/// Entry bytes a page can hold.
pub fn capacity(page_size: usize) -> usize {
    page_size - PAGE_HEADER_SIZE
}

pub fn data_entry_size(key_len: usize, value_len: usize) -> usize {
    6 + key_len + value_len
}

pub fn index_entry_size(key_len: usize) -> usize {
    10 + key_len
}

#[derive(Debug, Clone, Copy)]
pub struct DataEntry<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
pub struct IndexEntry<'a> {
    pub key: &'a [u8],
    pub child: u64,
}

fn entry_span(page: &[u8], offset: usize, is_data: bool) -> Result<usize> {
    let limit = PAGE_HEADER_SIZE + used(page);
    if offset + 2 > limit {
        return Err(corrupt_page());
    }
    let key_len = BigEndian::read_u16(&page[offset..]) as usize;
    let span = if is_data {
        if offset + 6 > limit {
            return Err(corrupt_page());
        }
        let value_len = BigEndian::read_u32(&page[offset + 2..]) as usize;
        data_entry_size(key_len, value_len)
    } else {
        index_entry_size(key_len)
    };
    if offset + span > limit {
        return Err(corrupt_page());
    }
    Ok(span)
}

fn entry_key(page: &[u8], offset: usize, is_data: bool) -> &[u8] {
    let key_len = BigEndian::read_u16(&page[offset..]) as usize;
    if is_data {
        &page[offset + 6..offset + 6 + key_len]
    } else {
        &page[offset + 10..offset + 10 + key_len]
    }
}

fn corrupt_page() -> PersistitError {
    PersistitError::CorruptVolume("malformed page entry".into())
}

pub fn data_entries(page: &[u8]) -> Result<Vec<DataEntry<'_>>> {
    debug_assert_eq!(page_type(page)?, PageType::Data);
    let mut out = Vec::with_capacity(key_count(page));
    let mut offset = PAGE_HEADER_SIZE;
    for _ in 0..key_count(page) {
        let span = entry_span(page, offset, true)?;
        let key_len = BigEndian::read_u16(&page[offset..]) as usize;
        let value_len = BigEndian::read_u32(&page[offset + 2..]) as usize;
        out.push(DataEntry {
            key: &page[offset + 6..offset + 6 + key_len],
            value: &page[offset + 6 + key_len..offset + 6 + key_len + value_len],
        });
        offset += span;
    }
    Ok(out)
}

pub fn index_entries(page: &[u8]) -> Result<Vec<IndexEntry<'_>>> {
    debug_assert_eq!(page_type(page)?, PageType::Index);
    let mut out = Vec::with_capacity(key_count(page));
    let mut offset = PAGE_HEADER_SIZE;
    for _ in 0..key_count(page) {
        let span = entry_span(page, offset, false)?;
        let key_len = BigEndian::read_u16(&page[offset..]) as usize;
        out.push(IndexEntry {
            key: &page[offset + 10..offset + 10 + key_len],
            child: BigEndian::read_u64(&page[offset + 2..]),
        });
        offset += span;
    }
    Ok(out)
}

/// Position of `key` in the page: `(entry index, byte offset, exact)`.
/// When inexact, the position is where an entry with that key would be
/// inserted.
pub fn find(page: &[u8], key: &[u8]) -> Result<(usize, usize, bool)> {
    let is_data = page_type(page)? == PageType::Data;
    let mut offset = PAGE_HEADER_SIZE;
    for index in 0..key_count(page) {
        let span = entry_span(page, offset, is_data)?;
        let entry_key = entry_key(page, offset, is_data);
        match entry_key.cmp(key) {
            std::cmp::Ordering::Equal => return Ok((index, offset, true)),
            std::cmp::Ordering::Greater => return Ok((index, offset, false)),
            std::cmp::Ordering::Less => offset += span,
        }
    }
    Ok((key_count(page), offset, false))
}

/// Child page to descend into for `key`.
pub fn find_child(page: &[u8], key: &[u8]) -> Result<u64> {
    let mut child = leftmost_child(page);
    for entry in index_entries(page)? {
        if entry.key <= key {
            child = entry.child;
        } else {
            break;
        }
    }
    Ok(child)
}

/// Value cell for an exact key match.
pub fn get_data<'a>(page: &'a [u8], key: &[u8]) -> Result<Option<&'a [u8]>> {
    let (_, offset, exact) = find(page, key)?;
    if !exact {
        return Ok(None);
    }
    let key_len = BigEndian::read_u16(&page[offset..]) as usize;
    let value_len = BigEndian::read_u32(&page[offset + 2..]) as usize;
    Ok(Some(
        &page[offset + 6 + key_len..offset + 6 + key_len + value_len],
    ))
}

/// Insert or replace a data entry. Returns false, leaving the page
/// untouched, when the result would not fit.
pub fn insert_data(page: &mut [u8], key: &[u8], value: &[u8]) -> Result<bool> {
    let (_, offset, exact) = find(page, key)?;
    let new_span = data_entry_size(key.len(), value.len());
    let old_span = if exact {
        entry_span(page, offset, true)?
    } else {
        0
    };
    let current = used(page);
    if current - old_span + new_span > capacity(page.len()) {
        return Ok(false);
    }

    let area_end = PAGE_HEADER_SIZE + current;
    let tail_start = offset + old_span;
    // shift the tail to its new position
    page.copy_within(tail_start..area_end, offset + new_span);

    BigEndian::write_u16(&mut page[offset..], key.len() as u16);
    BigEndian::write_u32(&mut page[offset + 2..], value.len() as u32);
    page[offset + 6..offset + 6 + key.len()].copy_from_slice(key);
    page[offset + 6 + key.len()..offset + new_span].copy_from_slice(value);

    set_used(page, current - old_span + new_span);
    if !exact {
        set_key_count(page, key_count(page) + 1);
    }
    Ok(true)
}

/// Insert an index entry (boundary key -> child). Returns false when the
/// result would not fit.
pub fn insert_index(page: &mut [u8], key: &[u8], child: u64) -> Result<bool> {
    let (_, offset, exact) = find(page, key)?;
    if exact {
        return Err(PersistitError::IllegalState(
            "duplicate boundary key in index page".into(),
        ));
    }
    let new_span = index_entry_size(key.len());
    let current = used(page);
    if current + new_span > capacity(page.len()) {
        return Ok(false);
    }

    let area_end = PAGE_HEADER_SIZE + current;
    page.copy_within(offset..area_end, offset + new_span);
    BigEndian::write_u16(&mut page[offset..], key.len() as u16);
    BigEndian::write_u64(&mut page[offset + 2..], child);
    page[offset + 10..offset + 10 + key.len()].copy_from_slice(key);

    set_used(page, current + new_span);
    set_key_count(page, key_count(page) + 1);
    Ok(true)
}

/// Remove the entry holding `key`. Returns false if absent.
pub fn remove_entry(page: &mut [u8], key: &[u8]) -> Result<bool> {
    let is_data = page_type(page)? == PageType::Data;
    let (_, offset, exact) = find(page, key)?;
    if !exact {
        return Ok(false);
    }
    let span = entry_span(page, offset, is_data)?;
    let area_end = PAGE_HEADER_SIZE + used(page);
    page.copy_within(offset + span..area_end, offset);
    set_used(page, used(page) - span);
    set_key_count(page, key_count(page) - 1);
    Ok(true)
}

/// Replace the whole entry area of a data page.
pub fn rewrite_data(page: &mut [u8], entries: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
    let total: usize = entries
        .iter()
        .map(|(k, v)| data_entry_size(k.len(), v.len()))
        .sum();
    if total > capacity(page.len()) {
        return Err(PersistitError::IllegalState(
            "rewritten data page overflows".into(),
        ));
    }
    let sibling = right_sibling(page);
    init(page, PageType::Data);
    set_right_sibling(page, sibling);
    let mut offset = PAGE_HEADER_SIZE;
    for (key, value) in entries {
        BigEndian::write_u16(&mut page[offset..], key.len() as u16);
        BigEndian::write_u32(&mut page[offset + 2..], value.len() as u32);
        page[offset + 6..offset + 6 + key.len()].copy_from_slice(key);
        page[offset + 6 + key.len()..offset + 6 + key.len() + value.len()]
            .copy_from_slice(value);
        offset += data_entry_size(key.len(), value.len());
    }
    set_used(page, total);
    set_key_count(page, entries.len());
    Ok(())
}

/// Replace the whole entry area of an index page.
pub fn rewrite_index(
    page: &mut [u8],
    leftmost: u64,
    entries: &[(Vec<u8>, u64)],
) -> Result<()> {
    let total: usize = entries
        .iter()
        .map(|(k, _)| index_entry_size(k.len()))
        .sum();
    if total > capacity(page.len()) {
        return Err(PersistitError::IllegalState(
            "rewritten index page overflows".into(),
        ));
    }
    let sibling = right_sibling(page);
    init(page, PageType::Index);
    set_right_sibling(page, sibling);
    set_leftmost_child(page, leftmost);
    let mut offset = PAGE_HEADER_SIZE;
    for (key, child) in entries {
        BigEndian::write_u16(&mut page[offset..], key.len() as u16);
        BigEndian::write_u64(&mut page[offset + 2..], *child);
        page[offset + 10..offset + 10 + key.len()].copy_from_slice(key);
        offset += index_entry_size(key.len());
    }
    set_used(page, total);
    set_key_count(page, entries.len());
    Ok(())
}
