//! Buffered page cache.
//!
//! The cache is the only owner of decoded pages and of the table header.
//! The tree reads and writes pages exclusively through it.
//!
//! # Design
//!
//! - A `Mutex` guards the frame map, the clock ring, and the pin counts;
//!   it is held only for short critical sections inside cache methods.
//! - `fetch` returns an RAII guard that unpins on drop, so no error path
//!   can leak a pin.
//! - Eviction is a clock: pinned frames are skipped, referenced frames get
//!   a second chance, and dirty frames are written out before being
//!   dropped. A full rotation over nothing but pinned frames fails with
//!   `CacheExhausted`.
//! - The header lives outside the ring and is never evicted. The free-page
//!   allocator mutates it here; `flush_all` persists it.
//!
//! # Invariants
//!
//! - A pinned page is never evicted.
//! - A dirty page is never dropped without being written.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::file::{self, FileError, TableFile};
use crate::header::{FORMAT_VERSION, TableHeader};
use crate::page::{PageError, PageId, SlottedPage};
use crate::schema::Schema;

/// Default number of cached frames. Any value covering tree depth plus the
/// working set of one operation suffices.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// One cached page plus its bookkeeping.
#[derive(Debug)]
struct Frame {
    page: SlottedPage,
    dirty: bool,
    pins: u32,
    referenced: bool,
}

#[derive(Debug)]
struct CacheInner {
    file: TableFile,
    header: TableHeader,
    frames: HashMap<PageId, Frame>,
    ring: Vec<PageId>,
    hand: usize,
}

/// A bounded, pinning, clock-evicting cache over one table file.
#[derive(Debug)]
pub struct PageCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

/// A fetched page, pinned for the lifetime of the guard.
///
/// The guard holds a private copy of the page; mutations become visible to
/// other readers only through [`PageCache::write_page`].
#[derive(Debug)]
pub struct PageRef<'a> {
    cache: &'a PageCache,
    page: SlottedPage,
}

impl Deref for PageRef<'_> {
    type Target = SlottedPage;

    fn deref(&self) -> &SlottedPage {
        &self.page
    }
}

impl DerefMut for PageRef<'_> {
    fn deref_mut(&mut self) -> &mut SlottedPage {
        &mut self.page
    }
}

impl Drop for PageRef<'_> {
    fn drop(&mut self) {
        self.cache.unpin(self.page.page_id);
    }
}

/// A snapshot of allocator and cache counters.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub root_page: PageId,
    pub next_page_id: PageId,
    pub num_pages: u32,
    pub free_pages: usize,
    pub cached_pages: usize,
    pub pinned_pages: usize,
}

impl PageCache {
    /// Create a fresh table file and its cache.
    pub fn create(path: &Path, schema: Schema, capacity: usize) -> Result<Arc<Self>, CacheError> {
        let header = TableHeader::new(schema);
        let file = TableFile::create(path, &header)?;
        Ok(Arc::new(Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner {
                file,
                header,
                frames: HashMap::new(),
                ring: Vec::new(),
                hand: 0,
            }),
        }))
    }

    /// Open an existing table file.
    pub fn open(path: &Path, capacity: usize) -> Result<Arc<Self>, CacheError> {
        let (file, header) = TableFile::open(path)?;
        Ok(Arc::new(Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner {
                file,
                header,
                frames: HashMap::new(),
                ring: Vec::new(),
                hand: 0,
            }),
        }))
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().expect("lock poisoned")
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fetch a page, reading it from disk on a miss. The returned guard
    /// pins the page until dropped.
    pub fn fetch(&self, id: PageId) -> Result<PageRef<'_>, CacheError> {
        let mut inner = self.lock();
        if id == 0 || id >= inner.header.next_page_id {
            return Err(CacheError::InvalidPageId(id));
        }

        if let Some(frame) = inner.frames.get_mut(&id) {
            frame.referenced = true;
            frame.pins += 1;
            let page = frame.page.clone();
            return Ok(PageRef { cache: self, page });
        }

        while inner.frames.len() >= self.capacity {
            Self::evict_one(&mut inner)?;
        }

        let bytes = inner.file.read_page(id)?;
        let page = SlottedPage::from_bytes(&bytes, id)?;
        inner.frames.insert(
            id,
            Frame {
                page: page.clone(),
                dirty: false,
                pins: 1,
                referenced: true,
            },
        );
        inner.ring.push(id);
        Ok(PageRef { cache: self, page })
    }

    /// Insert a page created in memory (by a split, root growth, or bulk
    /// load). The page enters the cache dirty and pinned; its id must not
    /// already be cached.
    pub fn add_new_page(&self, page: SlottedPage) -> Result<PageRef<'_>, CacheError> {
        let id = page.page_id;
        let mut inner = self.lock();
        if id == 0 || id >= inner.header.next_page_id {
            return Err(CacheError::InvalidPageId(id));
        }
        if inner.frames.contains_key(&id) {
            return Err(CacheError::AlreadyCached(id));
        }

        while inner.frames.len() >= self.capacity {
            Self::evict_one(&mut inner)?;
        }

        inner.frames.insert(
            id,
            Frame {
                page: page.clone(),
                dirty: true,
                pins: 1,
                referenced: true,
            },
        );
        inner.ring.push(id);
        Ok(PageRef { cache: self, page })
    }

    /// Drop one pin. Never evicts directly. Tolerates ids that were freed
    /// while a guard was still alive.
    pub fn unpin(&self, id: PageId) {
        let mut inner = self.lock();
        if let Some(frame) = inner.frames.get_mut(&id) {
            frame.pins = frame.pins.saturating_sub(1);
        }
    }

    /// Store a modified page back into its frame and mark it dirty.
    pub fn write_page(&self, page: &SlottedPage) -> Result<(), CacheError> {
        let mut inner = self.lock();
        let frame = inner
            .frames
            .get_mut(&page.page_id)
            .ok_or(CacheError::NotCached(page.page_id))?;
        frame.page = page.clone();
        frame.dirty = true;
        Ok(())
    }

    /// Mark a cached page dirty without replacing its contents.
    pub fn make_dirty(&self, id: PageId) {
        let mut inner = self.lock();
        if let Some(frame) = inner.frames.get_mut(&id) {
            frame.dirty = true;
        }
    }

    /// Hand out a page id: reuse from the free list, else bump the
    /// next-page counter.
    pub fn allocate_page(&self) -> PageId {
        let mut inner = self.lock();
        if let Some(id) = inner.header.free_list.pop() {
            id
        } else {
            let id = inner.header.next_page_id;
            inner.header.next_page_id += 1;
            id
        }
    }

    /// Return an orphaned page to the free list and drop it from the cache
    /// unconditionally.
    pub fn free_page(&self, id: PageId) {
        let mut inner = self.lock();
        inner.frames.remove(&id);
        if let Some(pos) = inner.ring.iter().position(|&p| p == id) {
            inner.ring.remove(pos);
            if pos < inner.hand {
                inner.hand -= 1;
            }
            if inner.hand >= inner.ring.len() {
                inner.hand = 0;
            }
        }
        inner.header.free_list.push(id);
    }

    /// Advance the clock until an unpinned, unreferenced frame is dropped.
    fn evict_one(inner: &mut CacheInner) -> Result<(), CacheError> {
        let mut steps = 0;
        let max_steps = inner.ring.len() * 2;
        while steps < max_steps && !inner.ring.is_empty() {
            if inner.hand >= inner.ring.len() {
                inner.hand = 0;
            }
            let id = inner.ring[inner.hand];

            let Some(frame) = inner.frames.get_mut(&id) else {
                // Stale ring entry; drop it without counting a step.
                let hand = inner.hand;
                inner.ring.remove(hand);
                continue;
            };

            if frame.pins > 0 {
                inner.hand += 1;
                steps += 1;
                continue;
            }
            if frame.referenced {
                frame.referenced = false;
                inner.hand += 1;
                steps += 1;
                continue;
            }

            if frame.dirty {
                let bytes = frame.page.to_bytes();
                inner.file.write_page(id, &bytes)?;
                frame.dirty = false;
            }
            inner.frames.remove(&id);
            let hand = inner.hand;
            inner.ring.remove(hand);
            if inner.hand >= inner.ring.len() {
                inner.hand = 0;
            }
            return Ok(());
        }
        Err(CacheError::Exhausted)
    }

    /// Write every dirty frame and the header, fsyncing both. Frames stay
    /// cached but clean.
    pub fn flush_all(&self) -> Result<(), CacheError> {
        let mut inner = self.lock();
        let CacheInner {
            file,
            header,
            frames,
            ..
        } = &mut *inner;

        for (id, frame) in frames.iter_mut() {
            if frame.dirty {
                file.write_page(*id, &frame.page.to_bytes())?;
                frame.dirty = false;
            }
        }
        file.sync()?;

        header.num_pages = header.next_page_id - 1;
        file.write_header(header)?;
        file.sync()?;
        Ok(())
    }

    /// Flush everything and release the file on drop.
    pub fn close(&self) -> Result<(), CacheError> {
        self.flush_all()
    }

    /// Replace the data file with a rebuilt one (the vacuum rename step):
    /// write the new pages and a fresh header to a sibling temp file, fsync
    /// it, atomically rename it over the live file, reopen, and invalidate
    /// every cached frame.
    pub fn swap_rebuilt(
        &self,
        pages: &[SlottedPage],
        new_root: PageId,
    ) -> Result<(), CacheError> {
        let mut inner = self.lock();

        let max_id = pages.iter().map(|p| p.page_id).max().unwrap_or(0);
        let header = TableHeader {
            version: FORMAT_VERSION,
            root_page: new_root,
            next_page_id: max_id + 1,
            num_pages: max_id,
            schema: inner.header.schema.clone(),
            free_list: Vec::new(),
        };

        let live_path = inner.file.path().to_path_buf();
        let tmp_path = live_path.with_extension("db.tmp");
        file::write_rebuilt(&tmp_path, &header, pages)?;
        std::fs::rename(&tmp_path, &live_path).map_err(CacheError::Io)?;

        let (new_file, new_header) = TableFile::open(&live_path)?;
        inner.file = new_file;
        inner.header = new_header;
        inner.frames.clear();
        inner.ring.clear();
        inner.hand = 0;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Header access
    // ------------------------------------------------------------------

    #[must_use]
    pub fn root_page(&self) -> PageId {
        self.lock().header.root_page
    }

    pub fn set_root(&self, id: PageId) {
        self.lock().header.root_page = id;
    }

    #[must_use]
    pub fn schema(&self) -> Schema {
        self.lock().header.schema.clone()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            root_page: inner.header.root_page,
            next_page_id: inner.header.next_page_id,
            num_pages: inner.header.next_page_id - 1,
            free_pages: inner.header.free_list.len(),
            cached_pages: inner.frames.len(),
            pinned_pages: inner.frames.values().filter(|f| f.pins > 0).count(),
        }
    }
}

/// Errors from the page cache.
#[derive(Debug)]
pub enum CacheError {
    /// Every frame is pinned; nothing can be evicted.
    Exhausted,
    /// Page id 0 or beyond the allocated range.
    InvalidPageId(PageId),
    /// `write_page` against a page that is not resident.
    NotCached(PageId),
    /// `add_new_page` against an id that is already resident.
    AlreadyCached(PageId),
    /// Underlying file failure.
    File(FileError),
    /// A stored page failed to decode.
    Page(PageError),
    /// Raw I/O failure outside the table file (vacuum rename).
    Io(std::io::Error),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted => write!(f, "page cache exhausted: all frames pinned"),
            Self::InvalidPageId(id) => write!(f, "invalid page id: {id}"),
            Self::NotCached(id) => write!(f, "page {id} is not cached"),
            Self::AlreadyCached(id) => write!(f, "page {id} is already cached"),
            Self::File(e) => write!(f, "cache file error: {e}"),
            Self::Page(e) => write!(f, "cache page error: {e}"),
            Self::Io(e) => write!(f, "cache I/O error: {e}"),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::File(e) => Some(e),
            Self::Page(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<FileError> for CacheError {
    fn from(e: FileError) -> Self {
        Self::File(e)
    }
}

impl From<PageError> for CacheError {
    fn from(e: PageError) -> Self {
        Self::Page(e)
    }
}
