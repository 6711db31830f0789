//! Page store: the durable substrate every insertion runs on.
//!
//! Pages live in a memory-mapped data file and are cached as in-memory frames,
//! one `RwLock` per page. Readers take a shared lock, writers take the
//! exclusive lock and hand it to a [`StagedUpdate`] which keeps it until commit
//! or abort. Committed images go to the write-ahead log first, then to the
//! mapped file, then into the frames.
//!
//! A page handed out by [`PageStore::allocate_page`] whose image is never
//! committed goes back to a free set and is handed out again before the file
//! grows. Zeroed pages found on open (left by a crash between growth and
//! commit) start out in that set.

use crate::error::StoreError;
use crate::page::{INVALID_PAGE, PAGE_SIZE, PageId, SlottedPage};
use crate::wal::{StagedUpdate, SyncMode, Wal};
use anyhow::{Context, Result};
use fs2::FileExt;
use memmap2::MmapMut;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

type Frame = Arc<RwLock<Box<[u8]>>>;

type FreePages = Arc<Mutex<BTreeSet<PageId>>>;

/// Shared lock on a page frame.
pub type PageReadGuard = ArcRwLockReadGuard<RawRwLock, Box<[u8]>>;

/// Exclusive lock on a page frame.
///
/// Holding the guard is the right to stage a new image for the page.
pub struct PageWriteGuard {
    page: PageId,
    guard: ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>,
    /// Set for a fresh allocation until an image is installed
    release_to: Option<FreePages>,
}

impl PageWriteGuard {
    /// Page this guard locks
    #[must_use]
    pub fn page_id(&self) -> PageId {
        self.page
    }

    /// Current committed image
    #[must_use]
    pub fn image(&self) -> &[u8] {
        &self.guard
    }

    pub(crate) fn install(&mut self, image: &[u8]) {
        self.guard.copy_from_slice(image);
        self.release_to = None;
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        if let Some(free) = self.release_to.take() {
            free.lock().insert(self.page);
            debug!(page = self.page, "store.allocation_released");
        }
    }
}

impl std::fmt::Debug for PageWriteGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageWriteGuard").field("page", &self.page).finish_non_exhaustive()
    }
}

/// Durability and growth settings for a [`PageStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// When the write-ahead log is forced to disk
    pub sync: SyncMode,

    /// Log size that triggers a checkpoint
    pub wal_checkpoint_bytes: u64,

    /// How long `allocate_page` waits for the extension lock
    pub extension_lock_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            sync: SyncMode::Full,
            wal_checkpoint_bytes: 4 * 1024 * 1024,
            extension_lock_timeout: Duration::from_secs(5),
        }
    }
}

/// Fixed-size page store backed by a memory-mapped file
pub struct PageStore {
    /// File handle (owns the file lock)
    file: File,

    /// Mapped view of the data file; also serializes writes and remaps
    mmap: Mutex<MmapMut>,

    /// One frame per allocated page
    frames: RwLock<Vec<Frame>>,

    /// Serializes file growth
    extension: Mutex<()>,

    /// Allocated pages that never received a committed image
    free: FreePages,

    /// Write-ahead log; holding it serializes commits and checkpoints
    wal: Mutex<Wal>,

    options: StoreOptions,

    fail_next_commit: AtomicBool,
}

impl std::fmt::Debug for PageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageStore")
            .field("page_count", &self.page_count())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Path of the write-ahead log that belongs to a data file
#[must_use]
pub fn wal_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push("-wal");
    PathBuf::from(name)
}

impl PageStore {
    /// Opens or creates a page store
    ///
    /// A new file starts with one zeroed page reserved for metadata. Any
    /// committed updates still in the write-ahead log are replayed into the
    /// data file before the frames are loaded.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be opened or created
    /// - The file is already locked by another process
    /// - The file length is not a whole number of pages
    /// - Log replay fails
    pub fn open<P: AsRef<Path>>(path: P, options: StoreOptions) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lattice file: {}", path.display()))?;

        file.try_lock_exclusive()
            .context("Lattice file is already open by another process")?;

        let len = file.metadata()?.len();
        if len == 0 {
            file.set_len(PAGE_SIZE as u64)?;
        } else if len % PAGE_SIZE as u64 != 0 {
            anyhow::bail!(
                "Corrupted lattice file at {}: length {} is not a multiple of {}",
                path.display(),
                len,
                PAGE_SIZE
            );
        }

        // SAFETY: the file is exclusively locked by this process and every
        // access to the mapping goes through the `mmap` mutex.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };

        let mut wal = Wal::open(&wal_path(path), options.sync)?;
        let records = wal.recover()?;
        if !records.is_empty() {
            for record in &records {
                for (page, image) in &record.pages {
                    let end = (*page as usize + 1) * PAGE_SIZE;
                    if end > mmap.len() {
                        file.set_len(end as u64)?;
                        // SAFETY: as above; the old mapping is dropped here.
                        mmap = unsafe { MmapMut::map_mut(&file)? };
                    }
                    mmap[end - PAGE_SIZE..end].copy_from_slice(image);
                }
            }
            mmap.flush()?;
            file.sync_all()?;
            wal.truncate()?;
            info!(records = records.len(), "store.wal_recovery.replayed");
        }

        let frames: Vec<Frame> = mmap
            .chunks_exact(PAGE_SIZE)
            .map(|chunk| Arc::new(RwLock::new(chunk.to_vec().into_boxed_slice())))
            .collect();

        // Page 0 stays reserved even while it is still zeroed
        let free: BTreeSet<PageId> = frames
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, frame)| !SlottedPage::new(&frame.read()[..]).is_initialized())
            .map(|(page, _)| page as PageId)
            .collect();
        if !free.is_empty() {
            info!(pages = free.len(), "store.open.unused_pages");
        }

        Ok(Self {
            file,
            mmap: Mutex::new(mmap),
            frames: RwLock::new(frames),
            extension: Mutex::new(()),
            free: Arc::new(Mutex::new(free)),
            wal: Mutex::new(wal),
            options,
            fail_next_commit: AtomicBool::new(false),
        })
    }

    /// Number of allocated pages
    pub fn page_count(&self) -> u32 {
        self.frames.read().len() as u32
    }

    fn frame(&self, page: PageId) -> Result<Frame, StoreError> {
        let frames = self.frames.read();
        frames
            .get(page as usize)
            .cloned()
            .ok_or(StoreError::PageOutOfRange { page, page_count: frames.len() as u32 })
    }

    /// Locks a page for read-only inspection
    ///
    /// # Errors
    ///
    /// Returns `StoreError::PageOutOfRange` for unknown pages.
    pub fn lock_shared(&self, page: PageId) -> Result<PageReadGuard> {
        Ok(self.frame(page)?.read_arc())
    }

    /// Locks a page for modification, waiting for other holders
    ///
    /// # Errors
    ///
    /// Returns `StoreError::PageOutOfRange` for unknown pages.
    pub fn lock_exclusive(&self, page: PageId) -> Result<PageWriteGuard> {
        let guard = self.frame(page)?.write_arc();
        Ok(PageWriteGuard { page, guard, release_to: None })
    }

    /// Locks a page for modification only if nobody else holds it
    ///
    /// # Errors
    ///
    /// Returns `StoreError::PageOutOfRange` for unknown pages.
    pub fn try_lock_exclusive(&self, page: PageId) -> Result<Option<PageWriteGuard>> {
        Ok(self.frame(page)?.try_write_arc().map(|guard| PageWriteGuard { page, guard, release_to: None }))
    }

    /// Hands out one zeroed page, locked
    ///
    /// A page released by an earlier allocation that never committed is
    /// returned first (lowest id first); otherwise the file grows by one page.
    /// Allocation is serialized by the store-wide extension lock, so two
    /// callers never receive the same page. The page is not linked anywhere;
    /// the caller stages its initialization and the link to it. If the guard
    /// is dropped before an image is committed for it, the page is released
    /// again.
    ///
    /// # Errors
    ///
    /// Returns an error if the extension lock times out, the store is full, or
    /// the file cannot grow.
    pub fn allocate_page(&self) -> Result<PageWriteGuard> {
        let timeout = self.options.extension_lock_timeout;
        let _extension = self
            .extension
            .try_lock_for(timeout)
            .ok_or(StoreError::ExtensionLockTimeout { millis: timeout.as_millis() })?;

        let released = self.free.lock().pop_first();
        if let Some(page) = released {
            let mut guard = self.frame(page)?.write_arc();
            guard.fill(0);
            debug!(page, "store.allocate_page.reused");
            return Ok(PageWriteGuard { page, guard, release_to: Some(Arc::clone(&self.free)) });
        }

        let page = self.page_count();
        if page >= INVALID_PAGE {
            return Err(StoreError::StoreFull { max: INVALID_PAGE }.into());
        }

        {
            let mut mmap = self.mmap.lock();
            let new_len = (u64::from(page) + 1) * PAGE_SIZE as u64;
            self.file
                .set_len(new_len)
                .with_context(|| format!("Failed to grow lattice file to {new_len} bytes"))?;
            // SAFETY: the mapping is only touched under this mutex, and frames
            // hold copies, so nothing borrows the old mapping.
            *mmap = unsafe { MmapMut::map_mut(&self.file)? };
        }

        let frame: Frame = Arc::new(RwLock::new(vec![0u8; PAGE_SIZE].into_boxed_slice()));
        let guard = frame.write_arc();
        self.frames.write().push(frame);

        info!(page, "store.allocate_page");
        Ok(PageWriteGuard { page, guard, release_to: Some(Arc::clone(&self.free)) })
    }

    /// Starts a staged-update scope
    pub fn begin(&self) -> StagedUpdate<'_> {
        StagedUpdate::new(self)
    }

    /// Makes committed page images durable and visible in the data file.
    ///
    /// Callers hold the exclusive lock of every page in `images`.
    pub(crate) fn commit_images(&self, images: &[(PageId, &[u8])]) -> Result<u64> {
        let mut wal = self.wal.lock();

        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::InjectedFailure.into());
        }

        let lsn = wal.append(images)?;

        {
            let mut mmap = self.mmap.lock();
            let page_count = (mmap.len() / PAGE_SIZE) as u32;
            for &(page, image) in images {
                let start = page as usize * PAGE_SIZE;
                let dst = mmap
                    .get_mut(start..start + PAGE_SIZE)
                    .ok_or(StoreError::PageOutOfRange { page, page_count })?;
                dst.copy_from_slice(image);
            }
        }

        {
            let mut free = self.free.lock();
            for &(page, _) in images {
                free.remove(&page);
            }
        }

        // The record is durable from here on; a failed checkpoint is retried by
        // the next commit or flush.
        if wal.len() >= self.options.wal_checkpoint_bytes {
            if let Err(err) = self.checkpoint(&mut wal) {
                warn!(error = %err, "store.checkpoint_failed");
            }
        }

        Ok(lsn)
    }

    fn checkpoint(&self, wal: &mut Wal) -> Result<()> {
        self.mmap.lock().flush()?;
        if self.options.sync != SyncMode::Off {
            self.file.sync_all()?;
        }
        let truncated = wal.len();
        wal.truncate()?;
        debug!(truncated, "store.checkpoint");
        Ok(())
    }

    /// Flushes the data file and truncates the write-ahead log
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails
    pub fn flush(&self) -> Result<()> {
        let mut wal = self.wal.lock();
        self.checkpoint(&mut wal)
    }

    /// Number of allocated pages waiting to be handed out again
    pub fn free_page_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Current size of the write-ahead log in bytes
    pub fn wal_len(&self) -> u64 {
        self.wal.lock().len()
    }

    /// Makes the next commit fail before anything reaches the log
    #[cfg(any(test, feature = "internals"))]
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }
}

impl Drop for PageStore {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
