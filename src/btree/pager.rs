//! File I/O and the page cache.
//!
//! The pager owns the database file and a sparse vector of cached pages
//! with LRU eviction. Cached pages are immutable (`Arc<Page>`); all
//! mutation happens on transactional clones and re-enters the cache
//! wholesale through [`Pager::apply_commit`]. That keeps the cache clean
//! outside the commit window, so eviction never needs to write.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};

use log::{debug, info};

use crate::{
    btree::{
        consts::{DB_HEADER_SIZE, PAGE_SIZE},
        page::{DbHeader, Page, TableLeafPage},
    },
    error::DbError,
    types::{DbResult, PageIndex},
    utils::HandyRwLock,
};

struct CacheSlot {
    page: Arc<Page>,
    last_used: AtomicU64,
}

struct PagerState {
    header: DbHeader,
    total_pages: u32,
    slots: Vec<Option<CacheSlot>>,
    cached: usize,
    capacity: usize,
}

pub struct Pager {
    file: Mutex<File>,
    path: PathBuf,
    tick: AtomicU64,
    state: RwLock<PagerState>,
}

impl Pager {
    /// Open (or create) the database file. The file must be a whole
    /// number of pages; a fresh database is one page long: the header
    /// plus an empty schema table root.
    pub fn open(path: &Path, cache_capacity: usize, create_if_missing: bool) -> DbResult<Pager> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create_if_missing)
            .open(path)?;

        let len = file.metadata()?.len();
        let (header, total_pages) = if len == 0 {
            let header = DbHeader::new();
            let root = Page::TableLeaf(TableLeafPage::new_root());
            let mut buf = header.marshal()?;
            buf.extend_from_slice(&root.marshal(PAGE_SIZE - DB_HEADER_SIZE)?);
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&buf)?;
            file.sync_all()?;
            info!("created database file {:?}", path);
            (header, 1)
        } else {
            if len % PAGE_SIZE as u64 != 0 {
                return Err(DbError::corrupt(format!(
                    "file size {} is not a multiple of the page size",
                    len
                )));
            }
            let mut buf = vec![0u8; DB_HEADER_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            let header = DbHeader::unmarshal(&buf)?;
            (header, (len / PAGE_SIZE as u64) as u32)
        };

        Ok(Pager {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            tick: AtomicU64::new(1),
            state: RwLock::new(PagerState {
                header,
                total_pages,
                slots: Vec::new(),
                cached: 0,
                capacity: cache_capacity.max(1),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> DbHeader {
        self.state.rl().header
    }

    pub fn total_pages(&self) -> u32 {
        self.state.rl().total_pages
    }

    fn body_size(index: PageIndex) -> usize {
        if index == 0 {
            PAGE_SIZE - DB_HEADER_SIZE
        } else {
            PAGE_SIZE
        }
    }

    fn body_offset(index: PageIndex) -> u64 {
        if index == 0 {
            DB_HEADER_SIZE as u64
        } else {
            index as u64 * PAGE_SIZE as u64
        }
    }

    fn touch(&self, slot: &CacheSlot) {
        let now = self.tick.fetch_add(1, Ordering::Relaxed);
        slot.last_used.store(now, Ordering::Relaxed);
    }

    /// Fetch a page, loading it from disk on a cache miss. The fast
    /// path only takes the shared side of the lock.
    pub fn get_page(&self, index: PageIndex) -> DbResult<Arc<Page>> {
        {
            let state = self.state.rl();
            if index >= state.total_pages {
                return Err(DbError::PageIndexOutOfRange {
                    index,
                    total: state.total_pages,
                });
            }
            if let Some(Some(slot)) = state.slots.get(index as usize) {
                self.touch(slot);
                return Ok(Arc::clone(&slot.page));
            }
        }

        let mut state = self.state.wl();
        if index >= state.total_pages {
            return Err(DbError::PageIndexOutOfRange {
                index,
                total: state.total_pages,
            });
        }
        // another thread may have loaded it while we waited
        if let Some(Some(slot)) = state.slots.get(index as usize) {
            self.touch(slot);
            return Ok(Arc::clone(&slot.page));
        }

        let page = Arc::new(self.read_page_from_disk(index)?);
        debug!("loaded page {} ({})", index, page.kind_name());
        self.insert_slot(&mut state, index, Arc::clone(&page));
        Ok(page)
    }

    fn read_page_from_disk(&self, index: PageIndex) -> DbResult<Page> {
        let mut buf = vec![0u8; Self::body_size(index)];
        {
            let mut file = self.file.lock().unwrap();
            file.seek(SeekFrom::Start(Self::body_offset(index)))?;
            file.read_exact(&mut buf)?;
        }
        Page::unmarshal(&buf)
    }

    fn insert_slot(&self, state: &mut PagerState, index: PageIndex, page: Arc<Page>) {
        if state.cached >= state.capacity {
            Self::evict_one(state);
        }
        if state.slots.len() <= index as usize {
            state.slots.resize_with(index as usize + 1, || None);
        }
        let replaced = state.slots[index as usize]
            .replace(CacheSlot {
                page,
                last_used: AtomicU64::new(self.tick.fetch_add(1, Ordering::Relaxed)),
            })
            .is_some();
        if !replaced {
            state.cached += 1;
        }
    }

    /// Drop the least recently used page. Page 0 stays: it carries the
    /// header and the schema table root.
    fn evict_one(state: &mut PagerState) {
        let mut victim: Option<(usize, u64)> = None;
        for (i, slot) in state.slots.iter().enumerate().skip(1) {
            if let Some(slot) = slot {
                let used = slot.last_used.load(Ordering::Relaxed);
                if victim.map_or(true, |(_, best)| used < best) {
                    victim = Some((i, used));
                }
            }
        }
        if let Some((i, _)) = victim {
            debug!("evicting page {}", i);
            state.slots[i] = None;
            state.cached -= 1;
        }
    }

    /// Serialize the current in-memory form of a page, for journaling.
    pub fn page_body_bytes(&self, index: PageIndex) -> DbResult<Vec<u8>> {
        let page = self.get_page(index)?;
        page.marshal(Self::body_size(index))
    }

    /// Install a committed write set and flush it: swap the pages into
    /// the cache, extend the page count, write everything to disk with
    /// one fsync at the end. Runs under the cache write lock so a
    /// concurrent reader can neither observe nor evict a half-applied
    /// commit.
    pub fn apply_commit(
        &self,
        pages: &[(PageIndex, Arc<Page>)],
        new_header: Option<DbHeader>,
        new_total: u32,
    ) -> DbResult<()> {
        let mut state = self.state.wl();
        debug_assert!(new_total >= state.total_pages);
        state.total_pages = new_total;
        if let Some(h) = new_header {
            state.header = h;
        }
        for (index, page) in pages {
            self.insert_slot(&mut state, *index, Arc::clone(page));
        }

        // batched write + single fsync, page 0 split around the header
        {
            let mut file = self.file.lock().unwrap();
            if let Some(h) = new_header {
                let buf = h.marshal()?;
                file.seek(SeekFrom::Start(0))?;
                file.write_all(&buf)?;
            }
            for (index, page) in pages {
                let buf = page.marshal(Self::body_size(*index))?;
                file.seek(SeekFrom::Start(Self::body_offset(*index)))?;
                file.write_all(&buf)?;
            }
            file.sync_all()?;
        }

        while state.cached > state.capacity {
            Self::evict_one(&mut state);
        }
        Ok(())
    }

    /// Forget every cached page. Test support.
    pub fn clear_cache(&self) {
        let mut state = self.state.wl();
        state.slots.clear();
        state.cached = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::page::FreePage;

    fn temp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("minisql_pager_{}_{}.db", name, std::process::id()));
        let _ = std::fs::remove_file(&p);
        p
    }

    #[test]
    fn test_open_creates_one_page() {
        let path = temp_path("create");
        let pager = Pager::open(&path, 10, true).unwrap();
        assert_eq!(pager.total_pages(), 1);
        let page = pager.get_page(0).unwrap();
        assert!(matches!(&*page, Page::TableLeaf(p) if p.is_root));
        drop(pager);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            PAGE_SIZE as u64
        );
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_out_of_range_read() {
        let path = temp_path("range");
        let pager = Pager::open(&path, 10, true).unwrap();
        assert!(matches!(
            pager.get_page(5),
            Err(DbError::PageIndexOutOfRange { index: 5, .. })
        ));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_apply_commit_persists_pages() {
        let path = temp_path("apply");
        {
            let pager = Pager::open(&path, 10, true).unwrap();
            let page = Arc::new(Page::Free(FreePage::new(0)));
            pager.apply_commit(&[(1, page)], None, 2).unwrap();
            assert_eq!(pager.total_pages(), 2);
        }
        {
            let pager = Pager::open(&path, 10, false).unwrap();
            assert_eq!(pager.total_pages(), 2);
            let page = pager.get_page(1).unwrap();
            assert!(matches!(&*page, Page::Free(_)));
        }
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_header_round_trips_through_file() {
        let path = temp_path("header");
        {
            let pager = Pager::open(&path, 10, true).unwrap();
            let header = DbHeader {
                first_free_page: 3,
                free_page_count: 1,
            };
            pager.apply_commit(&[], Some(header), 1).unwrap();
        }
        {
            let pager = Pager::open(&path, 10, false).unwrap();
            assert_eq!(pager.header().first_free_page, 3);
            assert_eq!(pager.header().free_page_count, 1);
        }
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_truncated_file_is_corrupt() {
        let path = temp_path("corrupt");
        std::fs::write(&path, vec![0u8; PAGE_SIZE + 17]).unwrap();
        assert!(matches!(
            Pager::open(&path, 10, false),
            Err(DbError::CorruptFile(_))
        ));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_cache_eviction_keeps_page_zero() {
        let path = temp_path("evict");
        let pager = Pager::open(&path, 2, true).unwrap();
        let mut pages = Vec::new();
        for i in 1..6u32 {
            pages.push((i, Arc::new(Page::Free(FreePage::new(0)))));
        }
        pager.apply_commit(&pages, None, 6).unwrap();
        // fill the tiny cache well past capacity
        for i in 0..6u32 {
            pager.get_page(i).unwrap();
        }
        let state = pager.state.rl();
        assert!(state.cached <= 2);
        assert!(state.slots[0].is_some());
        drop(state);
        std::fs::remove_file(&path).unwrap();
    }
}
