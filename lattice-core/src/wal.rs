//! Write-ahead log and staged copy-on-write updates.
//!
//! A [`StagedUpdate`] collects exclusively locked pages, hands out private
//! copies of their images, and on commit writes every image as one log record
//! before installing them. Abort (or drop) discards the copies, so a partially
//! built update never becomes visible.
//!
//! # Record format
//!
//! ```text
//! magic u32 | lsn u64 | count u32 | (page u32, image [PAGE_SIZE])* | crc32 u32
//! ```
//!
//! The checksum covers everything before it. Replay stops at the first record
//! that is short or fails its checksum; that record was never acknowledged.

use crate::page::{PAGE_SIZE, PageId};
use crate::storage::{PageStore, PageWriteGuard};
use anyhow::{Context, Result, anyhow};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, warn};

const RECORD_MAGIC: u32 = 0x4C57_414C;
const RECORD_HEADER: usize = 4 + 8 + 4;
const PAGE_ENTRY: usize = 4 + PAGE_SIZE;
const RECORD_TRAILER: usize = 4;

/// When the log is forced to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Fsync the log on every commit. Commits survive power loss.
    #[default]
    Full,
    /// Fsync only at checkpoints. Commits survive a process crash.
    Normal,
    /// Never fsync.
    Off,
}

/// One committed group of page images.
#[derive(Debug)]
pub(crate) struct WalRecord {
    pub lsn: u64,
    pub pages: Vec<(PageId, Vec<u8>)>,
}

#[derive(Debug)]
pub(crate) struct Wal {
    file: File,
    len: u64,
    next_lsn: u64,
    sync: SyncMode,
}

impl Wal {
    pub(crate) fn open(path: &Path, sync: SyncMode) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .with_context(|| format!("Failed to open write-ahead log: {}", path.display()))?;
        let len = file.metadata()?.len();

        Ok(Self { file, len, next_lsn: 1, sync })
    }

    /// Reads every intact record. Torn tails are dropped.
    pub(crate) fn recover(&mut self) -> Result<Vec<WalRecord>> {
        let mut bytes = Vec::with_capacity(self.len as usize);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut bytes)?;

        let (records, consumed) = parse_records(&bytes);
        if consumed < bytes.len() {
            warn!(
                discarded = bytes.len() - consumed,
                "wal.recover.torn_tail"
            );
        }
        if let Some(last) = records.last() {
            self.next_lsn = last.lsn + 1;
        }
        Ok(records)
    }

    /// Appends one record and returns its sequence number.
    pub(crate) fn append(&mut self, images: &[(PageId, &[u8])]) -> Result<u64> {
        let lsn = self.next_lsn;
        let mut buf = Vec::with_capacity(RECORD_HEADER + images.len() * PAGE_ENTRY + RECORD_TRAILER);
        buf.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
        buf.extend_from_slice(&lsn.to_le_bytes());
        buf.extend_from_slice(&(images.len() as u32).to_le_bytes());
        for &(page, image) in images {
            debug_assert_eq!(image.len(), PAGE_SIZE);
            buf.extend_from_slice(&page.to_le_bytes());
            buf.extend_from_slice(image);
        }
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        self.file.write_all(&buf).context("Failed to append to write-ahead log")?;
        if self.sync == SyncMode::Full {
            self.file.sync_data()?;
        }

        self.len += buf.len() as u64;
        self.next_lsn += 1;
        Ok(lsn)
    }

    pub(crate) fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        if self.sync != SyncMode::Off {
            self.file.sync_all()?;
        }
        self.len = 0;
        Ok(())
    }

    pub(crate) fn len(&self) -> u64 {
        self.len
    }
}

fn parse_records(bytes: &[u8]) -> (Vec<WalRecord>, usize) {
    let mut records = Vec::new();
    let mut at = 0;

    while let Some((record, size)) = parse_record(&bytes[at..]) {
        records.push(record);
        at += size;
    }

    (records, at)
}

fn parse_record(bytes: &[u8]) -> Option<(WalRecord, usize)> {
    let header = bytes.get(..RECORD_HEADER)?;
    let magic = u32::from_le_bytes(header[0..4].try_into().ok()?);
    if magic != RECORD_MAGIC {
        return None;
    }
    let lsn = u64::from_le_bytes(header[4..12].try_into().ok()?);
    let count = u32::from_le_bytes(header[12..16].try_into().ok()?) as usize;

    let body_end = RECORD_HEADER.checked_add(count.checked_mul(PAGE_ENTRY)?)?;
    let total = body_end.checked_add(RECORD_TRAILER)?;
    let record = bytes.get(..total)?;

    let stored = u32::from_le_bytes(record[body_end..total].try_into().ok()?);
    if crc32fast::hash(&record[..body_end]) != stored {
        return None;
    }

    let pages = record[RECORD_HEADER..body_end]
        .chunks_exact(PAGE_ENTRY)
        .map(|entry| {
            let page = PageId::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]);
            (page, entry[4..].to_vec())
        })
        .collect();

    Some((WalRecord { lsn, pages }, total))
}

/// Handle to a page registered in a [`StagedUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageHandle(usize);

struct StagedPage {
    guard: PageWriteGuard,
    image: Box<[u8]>,
}

/// A group of page modifications that commit or abort together.
///
/// Registering a page moves its exclusive lock into the scope; the lock is
/// released only by `commit`, `commit_retaining`, `abort` or drop. Changes made
/// through `page_mut` go to a private copy and are invisible to readers until
/// commit succeeds.
pub struct StagedUpdate<'s> {
    store: &'s PageStore,
    pages: Vec<StagedPage>,
}

impl std::fmt::Debug for StagedUpdate<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pages: Vec<PageId> = self.pages.iter().map(|p| p.guard.page_id()).collect();
        f.debug_struct("StagedUpdate").field("pages", &pages).finish()
    }
}

impl<'s> StagedUpdate<'s> {
    pub(crate) fn new(store: &'s PageStore) -> Self {
        Self { store, pages: Vec::new() }
    }

    /// Takes ownership of a locked page and stages a copy of its image.
    pub fn register(&mut self, guard: PageWriteGuard) -> StageHandle {
        let image = guard.image().to_vec().into_boxed_slice();
        self.pages.push(StagedPage { guard, image });
        StageHandle(self.pages.len() - 1)
    }

    /// Staged image of a registered page.
    #[must_use]
    pub fn page(&self, handle: StageHandle) -> &[u8] {
        &self.pages[handle.0].image
    }

    /// Mutable staged image of a registered page.
    pub fn page_mut(&mut self, handle: StageHandle) -> &mut [u8] {
        &mut self.pages[handle.0].image
    }

    /// Page id behind a handle.
    #[must_use]
    pub fn page_id(&self, handle: StageHandle) -> PageId {
        self.pages[handle.0].guard.page_id()
    }

    /// Number of registered pages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// True if nothing has been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Publishes every staged image atomically and releases the locks.
    ///
    /// # Errors
    ///
    /// Returns an error if the log append fails. Nothing is published then and
    /// the locks are released with the committed images unchanged.
    pub fn commit(self) -> Result<()> {
        self.finish(None).map(|_| ())
    }

    /// Like [`commit`](Self::commit), but keeps the lock on one page.
    ///
    /// The returned guard sees the newly committed image.
    ///
    /// # Errors
    ///
    /// Returns an error if the log append fails.
    pub fn commit_retaining(self, keep: StageHandle) -> Result<PageWriteGuard> {
        self.finish(Some(keep))?
            .ok_or_else(|| anyhow!("retained page was not registered in the staged update"))
    }

    /// Discards every staged image and releases the locks.
    pub fn abort(self) {
        debug!(pages = self.pages.len(), "wal.staged_update.abort");
    }

    fn finish(mut self, keep: Option<StageHandle>) -> Result<Option<PageWriteGuard>> {
        let pages = std::mem::take(&mut self.pages);
        if pages.is_empty() {
            return Ok(None);
        }

        {
            let images: Vec<(PageId, &[u8])> =
                pages.iter().map(|p| (p.guard.page_id(), &p.image[..])).collect();
            self.store.commit_images(&images)?;
        }

        let mut retained = None;
        for (index, mut staged) in pages.into_iter().enumerate() {
            staged.guard.install(&staged.image);
            if keep == Some(StageHandle(index)) {
                retained = Some(staged.guard);
            }
        }

        Ok(retained)
    }
}
