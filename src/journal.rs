//! Journal interface
//!
//! The write-ahead journal proper is an external collaborator; the engine
//! consumes it through [`JournalManager`]: journal-first page reads, page
//! writes that are flushed to the volume at checkpoint, and the checkpoint
//! tick itself. Two implementations ship with the crate: an in-memory
//! journal for volatile engines and tests, and a file-backed journal whose
//! record format is length-prefixed bincode with CRC32 protection.

use crate::{PersistitError, Result};
use ahash::AHashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

/// Contract between the engine and the journal.
pub trait JournalManager: Send + Sync {
    /// Copy the newest journaled image of `(volume_id, page)` into `buf`.
    /// Returns false on miss, in which case the caller reads the volume
    /// file instead.
    fn read_page_from_journal(&self, volume_id: u64, page: u64, buf: &mut [u8]) -> Result<bool>;

    /// Record a page image. Durable volumes route every page write here;
    /// the image reaches the volume file at the next checkpoint.
    fn write_page_to_journal(
        &self,
        volume_id: u64,
        page: u64,
        data: &[u8],
        timestamp: i64,
    ) -> Result<()>;

    /// Durability point: all volume metadata flushed before this call and
    /// all accumulator snapshot records written for `timestamp` are
    /// recoverable after it returns.
    fn checkpoint(&self, timestamp: i64) -> Result<()>;

    /// Hand back the page images of `volume_id` that have not yet been
    /// flushed to the volume, marking them flushed. Called under the
    /// checkpoint protocol.
    fn drain_volume(&self, volume_id: u64) -> Result<Vec<(u64, Vec<u8>)>>;

    /// Timestamp of the most recent checkpoint, 0 if none.
    fn last_checkpoint_timestamp(&self) -> i64;
}

struct PageImage {
    data: Vec<u8>,
    flushed: bool,
}

/// In-memory journal. Survives engine restarts only as long as the caller
/// keeps the instance alive, which is exactly what crash-recovery tests
/// need.
pub struct MemoryJournal {
    pages: Mutex<AHashMap<(u64, u64), PageImage>>,
    checkpoint_ts: AtomicI64,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self {
            pages: Mutex::new(AHashMap::new()),
            checkpoint_ts: AtomicI64::new(0),
        }
    }
}

impl Default for MemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl JournalManager for MemoryJournal {
    fn read_page_from_journal(&self, volume_id: u64, page: u64, buf: &mut [u8]) -> Result<bool> {
        let pages = self.pages.lock();
        match pages.get(&(volume_id, page)) {
            Some(image) => {
                if image.data.len() != buf.len() {
                    return Err(PersistitError::CorruptVolume(format!(
                        "journaled page {} has size {}, volume page size is {}",
                        page,
                        image.data.len(),
                        buf.len()
                    )));
                }
                buf.copy_from_slice(&image.data);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn write_page_to_journal(
        &self,
        volume_id: u64,
        page: u64,
        data: &[u8],
        _timestamp: i64,
    ) -> Result<()> {
        let mut pages = self.pages.lock();
        pages.insert(
            (volume_id, page),
            PageImage {
                data: data.to_vec(),
                flushed: false,
            },
        );
        Ok(())
    }

    fn checkpoint(&self, timestamp: i64) -> Result<()> {
        self.checkpoint_ts.store(timestamp, Ordering::Release);
        Ok(())
    }

    fn drain_volume(&self, volume_id: u64) -> Result<Vec<(u64, Vec<u8>)>> {
        let mut pages = self.pages.lock();
        let mut drained = Vec::new();
        for ((vid, page), image) in pages.iter_mut() {
            if *vid == volume_id && !image.flushed {
                image.flushed = true;
                drained.push((*page, image.data.clone()));
            }
        }
        drained.sort_by_key(|(page, _)| *page);
        Ok(drained)
    }

    fn last_checkpoint_timestamp(&self) -> i64 {
        self.checkpoint_ts.load(Ordering::Acquire)
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum JournalRecord {
    PageImage {
        volume_id: u64,
        page: u64,
        timestamp: i64,
        data: Vec<u8>,
    },
    Checkpoint {
        timestamp: i64,
    },
}

/// File-backed journal: append-only records, each length-prefixed and
/// CRC32-checked so a torn tail write is detected and dropped on reopen.
pub struct FileJournal {
    path: PathBuf,
    file: Mutex<File>,
    pages: Mutex<AHashMap<(u64, u64), PageImage>>,
    checkpoint_ts: AtomicI64,
}

impl FileJournal {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        let mut pages = AHashMap::new();
        let mut checkpoint_ts = 0i64;
        let mut corrupted = 0usize;

        file.seek(SeekFrom::Start(0))?;
        loop {
            let mut len_buf = [0u8; 4];
            match file.read_exact(&mut len_buf) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut crc_buf = [0u8; 4];
            let mut body = vec![0u8; len];
            let read_body = file
                .read_exact(&mut crc_buf)
                .and_then(|_| file.read_exact(&mut body));
            match read_body {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    log::warn!("journal {}: partial record at end of file", path.display());
                    break;
                }
                Err(e) => return Err(e.into()),
            }
            if crc32(&body) != u32::from_be_bytes(crc_buf) {
                corrupted += 1;
                continue;
            }
            let record: JournalRecord = match bincode::deserialize(&body) {
                Ok(record) => record,
                Err(_) => {
                    corrupted += 1;
                    continue;
                }
            };
            match record {
                JournalRecord::PageImage {
                    volume_id,
                    page,
                    data,
                    ..
                } => {
                    pages.insert(
                        (volume_id, page),
                        PageImage {
                            data,
                            flushed: false,
                        },
                    );
                }
                JournalRecord::Checkpoint { timestamp } => checkpoint_ts = timestamp,
            }
        }
        if corrupted > 0 {
            log::warn!(
                "journal {}: skipped {} corrupted records",
                path.display(),
                corrupted
            );
        }

        Ok(Self {
            path,
            file: Mutex::new(file),
            pages: Mutex::new(pages),
            checkpoint_ts: AtomicI64::new(checkpoint_ts),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, record: &JournalRecord, sync: bool) -> Result<()> {
        let body = bincode::serialize(record)?;
        let mut file = self.file.lock();
        file.write_all(&(body.len() as u32).to_be_bytes())?;
        file.write_all(&crc32(&body).to_be_bytes())?;
        file.write_all(&body)?;
        if sync {
            file.sync_data()?;
        }
        Ok(())
    }
}

impl JournalManager for FileJournal {
    fn read_page_from_journal(&self, volume_id: u64, page: u64, buf: &mut [u8]) -> Result<bool> {
        let pages = self.pages.lock();
        match pages.get(&(volume_id, page)) {
            Some(image) => {
                if image.data.len() != buf.len() {
                    return Err(PersistitError::CorruptVolume(format!(
                        "journaled page {} has size {}, volume page size is {}",
                        page,
                        image.data.len(),
                        buf.len()
                    )));
                }
                buf.copy_from_slice(&image.data);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn write_page_to_journal(
        &self,
        volume_id: u64,
        page: u64,
        data: &[u8],
        timestamp: i64,
    ) -> Result<()> {
        self.append(
            &JournalRecord::PageImage {
                volume_id,
                page,
                timestamp,
                data: data.to_vec(),
            },
            false,
        )?;
        let mut pages = self.pages.lock();
        pages.insert(
            (volume_id, page),
            PageImage {
                data: data.to_vec(),
                flushed: false,
            },
        );
        Ok(())
    }

    fn checkpoint(&self, timestamp: i64) -> Result<()> {
        self.append(&JournalRecord::Checkpoint { timestamp }, true)?;
        self.checkpoint_ts.store(timestamp, Ordering::Release);
        Ok(())
    }

    fn drain_volume(&self, volume_id: u64) -> Result<Vec<(u64, Vec<u8>)>> {
        let mut pages = self.pages.lock();
        let mut drained = Vec::new();
        for ((vid, page), image) in pages.iter_mut() {
            if *vid == volume_id && !image.flushed {
                image.flushed = true;
                drained.push((*page, image.data.clone()));
            }
        }
        drained.sort_by_key(|(page, _)| *page);
        Ok(drained)
    }

    fn last_checkpoint_timestamp(&self) -> i64 {
        self.checkpoint_ts.load(Ordering::Acquire)
    }
}

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
