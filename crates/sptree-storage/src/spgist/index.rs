//! The index handle.

use std::sync::Arc;

use parking_lot::Mutex;
use sptree_common::types::ItemPointer;
use sptree_wal::{ChangeRecord, CreateIndexPayload, WalSink};
use tracing::{debug, info};

use super::config::SpGistConfig;
use super::error::{SpGistError, SpGistResult};
use super::insert::{stamp, InsertContext, InsertOutcome, Inserter};
use super::inspect::{TreeInspector, TreeReport};
use super::meta::{init_meta_page, read_meta, write_meta, MetaData};
use super::page::{page_flags, FIXED_BLOCKS, META_BLOCK, NULLS_ROOT_BLOCK, ROOT_BLOCK};
use super::space::SpaceMap;
use super::strategy::PartitionStrategy;
use crate::buffer::BufferManager;
use crate::page::PageFlags;

/// Counters kept by an index handle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Insertions that completed.
    pub inserts: u64,
    /// Insertions abandoned on latch contention.
    pub retries: u64,
}

/// A space-partitioned tree index over one page store.
///
/// The handle is shared between inserting threads; every mutable state it
/// owns sits behind a latch or a mutex.
pub struct SpGistIndex {
    buffers: Arc<BufferManager>,
    space: SpaceMap,
    config: SpGistConfig,
    strategy: Arc<dyn PartitionStrategy>,
    wal: Arc<dyn WalSink>,
    stats: Mutex<IndexStats>,
}

impl SpGistIndex {
    fn assemble(
        buffers: Arc<BufferManager>,
        config: SpGistConfig,
        strategy: Arc<dyn PartitionStrategy>,
        wal: Arc<dyn WalSink>,
    ) -> SpGistResult<Self> {
        config.validate()?;
        if buffers.page_size() != config.page_size {
            return Err(SpGistError::InvalidConfig(format!(
                "store page size {} differs from index page size {}",
                buffers.page_size(),
                config.page_size
            )));
        }
        Ok(Self {
            space: SpaceMap::new(&config),
            buffers,
            config,
            strategy,
            wal,
            stats: Mutex::new(IndexStats::default()),
        })
    }

    /// Creates an index in an empty store: the meta page and two empty
    /// leaf roots, one for each tree.
    pub fn create(
        buffers: Arc<BufferManager>,
        config: SpGistConfig,
        strategy: Arc<dyn PartitionStrategy>,
        wal: Arc<dyn WalSink>,
    ) -> SpGistResult<Self> {
        let index = Self::assemble(buffers, config, strategy, wal)?;
        if index.buffers.page_count() != 0 {
            return Err(SpGistError::InvalidConfig(format!(
                "cannot create an index in a store holding {} pages",
                index.buffers.page_count()
            )));
        }

        let mut meta = index.buffers.extend()?;
        let mut root = index.buffers.extend()?;
        let mut nulls_root = index.buffers.extend()?;
        if (meta.page_id(), root.page_id(), nulls_root.page_id())
            != (META_BLOCK, ROOT_BLOCK, NULLS_ROOT_BLOCK)
        {
            return Err(SpGistError::internal("fixed pages were not allocated first"));
        }

        init_meta_page(&mut meta.page_mut(), &MetaData::default())?;
        root.page_mut().initialize(ROOT_BLOCK, page_flags(true, false));
        nulls_root
            .page_mut()
            .initialize(NULLS_ROOT_BLOCK, page_flags(true, true));

        let lsn = index
            .wal
            .record_change(&ChangeRecord::CreateIndex(CreateIndexPayload {
                page_size: index.config.page_size as u32,
                meta: META_BLOCK,
                root: ROOT_BLOCK,
                nulls_root: NULLS_ROOT_BLOCK,
            }))?;
        let lsn = index.wal.is_logged().then_some(lsn);
        for guard in [&mut meta, &mut root, &mut nulls_root] {
            stamp(lsn, guard);
        }

        info!(page_size = index.config.page_size, "created index");
        Ok(index)
    }

    /// Attaches to a store that already holds an index.
    pub fn open(
        buffers: Arc<BufferManager>,
        config: SpGistConfig,
        strategy: Arc<dyn PartitionStrategy>,
        wal: Arc<dyn WalSink>,
    ) -> SpGistResult<Self> {
        let index = Self::assemble(buffers, config, strategy, wal)?;
        if index.buffers.page_count() < FIXED_BLOCKS {
            return Err(SpGistError::corrupted(
                META_BLOCK,
                format!("store holds only {} pages", index.buffers.page_count()),
            ));
        }

        let meta = {
            let guard = index.buffers.lock(META_BLOCK)?;
            read_meta(&guard.page())?
        };
        for (root, nulls) in [(ROOT_BLOCK, false), (NULLS_ROOT_BLOCK, true)] {
            let guard = index.buffers.lock(root)?;
            let flags = guard.page().flags();
            if flags.contains(PageFlags::META) || flags.stores_nulls() != nulls {
                return Err(SpGistError::corrupted(root, "root page has wrong flags"));
            }
        }
        index.space.load(&meta);

        info!(pages = index.buffers.page_count(), "opened index");
        Ok(index)
    }

    /// Creates an index over a fresh in-memory store.
    pub fn in_memory(
        config: SpGistConfig,
        strategy: Arc<dyn PartitionStrategy>,
        wal: Arc<dyn WalSink>,
    ) -> SpGistResult<Self> {
        let buffers = Arc::new(BufferManager::new(config.buffer_config())?);
        Self::create(buffers, config, strategy, wal)
    }

    /// Returns the page store.
    pub fn buffers(&self) -> &Arc<BufferManager> {
        &self.buffers
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SpGistConfig {
        &self.config
    }

    /// Returns the page-allocation cache.
    pub fn space_map(&self) -> &SpaceMap {
        &self.space
    }

    /// Returns a copy of the counters.
    pub fn stats(&self) -> IndexStats {
        self.stats.lock().clone()
    }

    /// Inserts one entry; `None` is a null key.
    ///
    /// `RetryRequested` means nothing was changed and the call should be
    /// repeated with the same arguments.
    pub fn insert(
        &self,
        key: Option<&[u8]>,
        heap_ptr: ItemPointer,
        ctx: &InsertContext,
    ) -> SpGistResult<InsertOutcome> {
        let inserter = Inserter {
            buffers: &self.buffers,
            space: &self.space,
            config: &self.config,
            strategy: self.strategy.as_ref(),
            wal: self.wal.as_ref(),
            ctx,
        };
        let outcome = inserter.run(key, heap_ptr)?;

        let mut stats = self.stats.lock();
        match outcome {
            InsertOutcome::Completed => stats.inserts += 1,
            InsertOutcome::RetryRequested => stats.retries += 1,
        }
        Ok(outcome)
    }

    /// Inserts one entry, repeating the attempt until it is not contended.
    ///
    /// Cancellation through `ctx` still ends the loop.
    pub fn insert_with_retry(
        &self,
        key: Option<&[u8]>,
        heap_ptr: ItemPointer,
        ctx: &InsertContext,
    ) -> SpGistResult<()> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.insert(key, heap_ptr, ctx)? {
                InsertOutcome::Completed => {
                    if attempts > 1 {
                        debug!(attempts, heap = %heap_ptr, "insertion completed after retries");
                    }
                    return Ok(());
                }
                InsertOutcome::RetryRequested => std::thread::yield_now(),
            }
        }
    }

    /// Writes the page-allocation cache to the meta page.
    ///
    /// Best effort: returns false without waiting if the meta page is
    /// latched by someone else.
    pub fn sync_metadata(&self) -> SpGistResult<bool> {
        let Some(mut guard) = self.buffers.try_lock(META_BLOCK)? else {
            return Ok(false);
        };
        write_meta(&mut guard.page_mut(), &self.space.snapshot())?;
        Ok(true)
    }

    /// Syncs the meta page and writes dirty pages to the backing file.
    ///
    /// Returns the number of pages written.
    pub fn flush(&self) -> SpGistResult<usize> {
        self.sync_metadata()?;
        let written = self.buffers.flush()?;
        debug!(written, "flushed index");
        Ok(written)
    }

    /// Walks both trees and checks their structure.
    ///
    /// Latches one page at a time; concurrent insertions may make the
    /// report inconsistent.
    pub fn inspect(&self) -> SpGistResult<TreeReport> {
        TreeInspector::new(&self.buffers).run()
    }
}

impl std::fmt::Debug for SpGistIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpGistIndex")
            .field("config", &self.config)
            .field("pages", &self.buffers.page_count())
            .field("stats", &*self.stats.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spgist::text::TextRadixStrategy;
    use sptree_common::types::PageId;
    use sptree_wal::{MemoryWal, NoopWal};

    fn text_index(wal: Arc<dyn WalSink>) -> SpGistIndex {
        let config = SpGistConfig::for_testing();
        let strategy = Arc::new(TextRadixStrategy::for_page_size(config.page_size));
        SpGistIndex::in_memory(config, strategy, wal).unwrap()
    }

    #[test]
    fn test_create_lays_out_fixed_pages() {
        let wal = Arc::new(MemoryWal::new());
        let index = text_index(wal.clone());
        assert_eq!(index.buffers().page_count(), FIXED_BLOCKS);

        let root = index.buffers().lock(ROOT_BLOCK).unwrap();
        assert!(root.page().flags().is_leaf());
        assert!(!root.page().flags().stores_nulls());
        assert!(root.page().lsn().is_valid());
        drop(root);

        let nulls = index.buffers().lock(NULLS_ROOT_BLOCK).unwrap();
        assert!(nulls.page().flags().is_leaf());
        assert!(nulls.page().flags().stores_nulls());

        let records = wal.records().unwrap();
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0], ChangeRecord::CreateIndex(_)));
    }

    #[test]
    fn test_create_rejects_used_store() {
        let config = SpGistConfig::for_testing();
        let buffers = Arc::new(BufferManager::new(config.buffer_config()).unwrap());
        drop(buffers.extend().unwrap());
        let err = SpGistIndex::create(
            buffers,
            config,
            Arc::new(TextRadixStrategy::default()),
            Arc::new(NoopWal),
        )
        .unwrap_err();
        assert!(matches!(err, SpGistError::InvalidConfig(_)));
    }

    #[test]
    fn test_page_size_mismatch() {
        let buffers = Arc::new(BufferManager::new(SpGistConfig::default().buffer_config()).unwrap());
        let err = SpGistIndex::create(
            buffers,
            SpGistConfig::for_testing(),
            Arc::new(TextRadixStrategy::default()),
            Arc::new(NoopWal),
        )
        .unwrap_err();
        assert!(matches!(err, SpGistError::InvalidConfig(_)));
    }

    #[test]
    fn test_insert_counts_and_sync() {
        let index = text_index(Arc::new(NoopWal));
        let ctx = InsertContext::default();
        for i in 0..10u32 {
            let key = format!("key{i}");
            index
                .insert_with_retry(Some(key.as_bytes()), ItemPointer::new(PageId::new(100), i as u16 + 1), &ctx)
                .unwrap();
        }
        assert_eq!(index.stats().inserts, 10);
        assert_eq!(index.stats().retries, 0);
        assert!(index.sync_metadata().unwrap());

        let meta = {
            let guard = index.buffers().lock(META_BLOCK).unwrap();
            read_meta(&guard.page()).unwrap()
        };
        assert_eq!(meta, index.space_map().snapshot());
        assert_eq!(index.inspect().unwrap().live_entries(), 10);
    }

    #[test]
    fn test_sync_metadata_skips_busy_meta_page() {
        let index = text_index(Arc::new(NoopWal));
        let _held = index.buffers().lock(META_BLOCK).unwrap();
        assert!(!index.sync_metadata().unwrap());
    }

    #[test]
    fn test_open_reloads_cache() {
        let config = SpGistConfig::for_testing();
        let strategy: Arc<dyn PartitionStrategy> =
            Arc::new(TextRadixStrategy::for_page_size(config.page_size));
        let index = SpGistIndex::in_memory(config.clone(), strategy.clone(), Arc::new(NoopWal)).unwrap();
        let ctx = InsertContext::default();
        for i in 0..400u32 {
            let key = format!("{i:05}-padding-to-fill-pages");
            index
                .insert_with_retry(Some(key.as_bytes()), ItemPointer::new(PageId::new(7), (i % 200) as u16 + 1), &ctx)
                .unwrap();
        }
        index.sync_metadata().unwrap();
        let snapshot = index.space_map().snapshot();

        let buffers = index.buffers().clone();
        drop(index);
        let reopened = SpGistIndex::open(buffers, config, strategy, Arc::new(NoopWal)).unwrap();
        assert_eq!(reopened.space_map().snapshot(), snapshot);
        assert_eq!(reopened.inspect().unwrap().live_entries(), 400);
    }
}
