//! Multi-version value cells
//!
//! Every value slot in a data page holds a cell: a sequence of versions,
//! oldest first, each tagged with the writer's version handle. Readers
//! pick the newest version visible at their snapshot; pruning discards
//! aborted versions and committed versions superseded below the active
//! transaction floor.
//!
//! A version payload starts with a tag byte: plain data, a point-delete
//! tombstone, or an anti-value carrying the elided upper bound of a range
//! delete. Tombstones and anti-values read as "absent".

use crate::txn::index::TransactionIndex;
use crate::txn::status::TransactionStatus;
use crate::txn::handle_to_ts;
use crate::{PersistitError, Result};
use byteorder::{BigEndian, ByteOrder};
use std::sync::Arc;

pub const TAG_DATA: u8 = 0;
pub const TAG_TOMBSTONE: u8 = 1;
pub const TAG_ANTIVALUE: u8 = 2;

const VERSION_HEADER: usize = 12;

/// One version within a cell.
#[derive(Debug, Clone, Copy)]
pub struct Version<'a> {
    pub handle: i64,
    pub payload: &'a [u8],
}

pub fn encode_data(value: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + value.len());
    payload.push(TAG_DATA);
    payload.extend_from_slice(value);
    payload
}

pub fn encode_tombstone() -> Vec<u8> {
    vec![TAG_TOMBSTONE]
}

pub fn encode_anti_value(anti: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + anti.len());
    payload.push(TAG_ANTIVALUE);
    payload.extend_from_slice(anti);
    payload
}

/// Data bytes of a payload, None for tombstones and anti-values.
pub fn data_bytes(payload: &[u8]) -> Option<&[u8]> {
    match payload.first() {
        Some(&TAG_DATA) => Some(&payload[1..]),
        _ => None,
    }
}

pub fn is_delete_marker(payload: &[u8]) -> bool {
    matches!(payload.first(), Some(&TAG_TOMBSTONE) | Some(&TAG_ANTIVALUE))
}

pub fn append_version(cell: &mut Vec<u8>, handle: i64, payload: &[u8]) {
    let mut header = [0u8; VERSION_HEADER];
    BigEndian::write_i64(&mut header[0..8], handle);
    BigEndian::write_u32(&mut header[8..12], payload.len() as u32);
    cell.extend_from_slice(&header);
    cell.extend_from_slice(payload);
}

pub fn new_cell(handle: i64, payload: &[u8]) -> Vec<u8> {
    let mut cell = Vec::with_capacity(VERSION_HEADER + payload.len());
    append_version(&mut cell, handle, payload);
    cell
}

/// Decode all versions of a cell, oldest first.
pub fn versions(cell: &[u8]) -> Result<Vec<Version<'_>>> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset < cell.len() {
        if offset + VERSION_HEADER > cell.len() {
            return Err(corrupt_cell());
        }
        let handle = BigEndian::read_i64(&cell[offset..]);
        let len = BigEndian::read_u32(&cell[offset + 8..]) as usize;
        let start = offset + VERSION_HEADER;
        let end = start + len;
        if end > cell.len() {
            return Err(corrupt_cell());
        }
        out.push(Version {
            handle,
            payload: &cell[start..end],
        });
        offset = end;
    }
    Ok(out)
}

fn corrupt_cell() -> PersistitError {
    PersistitError::CorruptVolume("malformed multi-version value cell".into())
}

/// The newest version payload visible at `(snapshot_ts, step)`, tag byte
/// included. `None` means no version is visible at all.
pub fn fetch_visible<'a>(
    cell: &'a [u8],
    index: &TransactionIndex,
    snapshot_ts: i64,
    step: u32,
    current: Option<&Arc<TransactionStatus>>,
) -> Result<Option<&'a [u8]>> {
    let mut visible = None;
    for version in versions(cell)? {
        if index.is_visible(version.handle, snapshot_ts, step, current) {
            visible = Some(version.payload);
        }
    }
    Ok(visible)
}

/// Drop aborted versions and committed versions superseded below the
/// active transaction floor. Returns the pruned cell and decrements the
/// writers' MVCC counts for every dropped version.
pub fn prune(cell: &[u8], index: &TransactionIndex) -> Result<Vec<u8>> {
    let parsed = versions(cell)?;
    let floor = index.active_transaction_floor();

    // a version is settled if every live snapshot must see it as committed
    let settled = |handle: i64| -> bool {
        if handle == 0 {
            return true;
        }
        match index.status_for(handle_to_ts(handle)) {
            None => true,
            Some(status) => status
                .commit_timestamp()
                .map_or(false, |tc| tc <= floor),
        }
    };

    // newest settled version survives; every older one is dead
    let newest_settled = parsed
        .iter()
        .rposition(|version| settled(version.handle));

    let mut pruned = Vec::with_capacity(cell.len());
    for (position, version) in parsed.iter().enumerate() {
        let aborted = index.is_aborted(version.handle);
        let superseded = newest_settled.map_or(false, |n| position < n) && settled(version.handle);
        if aborted || superseded {
            if version.handle != 0 {
                if let Some(status) = index.status_for(handle_to_ts(version.handle)) {
                    status.decrement_mvcc_count();
                }
            }
            continue;
        }
        append_version(&mut pruned, version.handle, version.payload);
    }
    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::TimestampAllocator;
    use crate::txn::ts_to_handle;

    fn index() -> TransactionIndex {
        TransactionIndex::new(Arc::new(TimestampAllocator::new()), 16)
    }

    #[test]
    fn test_cell_round_trip() {
        let mut cell = new_cell(0, &encode_data(b"one"));
        append_version(&mut cell, ts_to_handle(5, 1), &encode_data(b"two"));
        let parsed = versions(&cell).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].handle, 0);
        assert_eq!(data_bytes(parsed[0].payload), Some(&b"one"[..]));
        assert_eq!(parsed[1].handle, ts_to_handle(5, 1));
        assert_eq!(data_bytes(parsed[1].payload), Some(&b"two"[..]));
    }

    #[test]
    fn test_truncated_cell_detected() {
        let cell = new_cell(0, &encode_data(b"payload"));
        assert!(versions(&cell[..cell.len() - 1]).is_err());
        assert!(versions(&cell[..5]).is_err());
    }

    #[test]
    fn test_fetch_picks_newest_visible() {
        let idx = index();
        let writer = idx.register_transaction();
        let mut cell = new_cell(0, &encode_data(b"old"));
        append_version(
            &mut cell,
            ts_to_handle(writer.ts(), 0),
            &encode_data(b"new"),
        );

        // before commit: other readers see the primordial version
        let reader_ts = idx.allocator().update_timestamp();
        let payload = fetch_visible(&cell, &idx, reader_ts, 0, None).unwrap();
        assert_eq!(data_bytes(payload.unwrap()), Some(&b"old"[..]));

        // the writer itself sees its own version
        let own = fetch_visible(&cell, &idx, writer.ts(), 0, Some(&writer)).unwrap();
        assert_eq!(data_bytes(own.unwrap()), Some(&b"new"[..]));

        // after commit, later snapshots see the new version
        let commit_ts = idx.allocator().update_timestamp();
        idx.notify_committed(&writer, commit_ts).unwrap();
        let payload = fetch_visible(&cell, &idx, commit_ts, 0, None).unwrap();
        assert_eq!(data_bytes(payload.unwrap()), Some(&b"new"[..]));
    }

    #[test]
    fn test_tombstone_reads_as_absent_marker() {
        let mut cell = new_cell(0, &encode_data(b"x"));
        append_version(&mut cell, 0, &encode_tombstone());
        let idx = index();
        let payload = fetch_visible(&cell, &idx, 10, 0, None).unwrap().unwrap();
        assert!(is_delete_marker(payload));
        assert_eq!(data_bytes(payload), None);
    }

    #[test]
    fn test_prune_drops_aborted_versions() {
        let idx = index();
        let writer = idx.register_transaction();
        writer.increment_mvcc_count();
        let mut cell = new_cell(0, &encode_data(b"keep"));
        append_version(
            &mut cell,
            ts_to_handle(writer.ts(), 0),
            &encode_data(b"drop"),
        );
        idx.notify_aborted(&writer).unwrap();

        let pruned = prune(&cell, &idx).unwrap();
        let parsed = versions(&pruned).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(data_bytes(parsed[0].payload), Some(&b"keep"[..]));
        assert_eq!(writer.mvcc_count(), 0);
    }

    #[test]
    fn test_prune_keeps_versions_live_readers_may_need() {
        let idx = index();
        // a long-running reader pins the floor
        let reader = idx.register_transaction();
        let writer = idx.register_transaction();
        writer.increment_mvcc_count();

        let mut cell = new_cell(0, &encode_data(b"old"));
        append_version(
            &mut cell,
            ts_to_handle(writer.ts(), 0),
            &encode_data(b"new"),
        );
        idx.notify_committed(&writer, idx.allocator().update_timestamp())
            .unwrap();
        idx.update_active_transaction_cache();

        // the commit is above the floor (reader still active), so the old
        // version must survive
        let pruned = prune(&cell, &idx).unwrap();
        assert_eq!(versions(&pruned).unwrap().len(), 2);

        // once the reader finishes the old version is superseded
        idx.notify_aborted(&reader).unwrap();
        idx.update_active_transaction_cache();
        let pruned = prune(&pruned, &idx).unwrap();
        let parsed = versions(&pruned).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(data_bytes(parsed[0].payload), Some(&b"new"[..]));
        // the surviving version still counts against its writer
        assert_eq!(writer.mvcc_count(), 1);
    }
}
