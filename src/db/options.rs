use crate::db::{
    BLOCK_CACHE_CAPACITY, DATA_BLOCK_SIZE, LEVEL0_FILES_THRESHOLD, LEVEL_SIZE_BASE, MAX_LEVEL,
    MAX_PAGE_SIZE, MEMTABLE_SIZE_THRESHOLD, MIN_LEVEL,
};
use crate::error::StrataError;
use crate::Result;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Callback receiving human readable store events.
pub type Logger = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
pub struct Options {
    pub memtable_size: usize,
    pub block_size: usize,
    pub max_levels: usize,
    pub level0_page_threshold: usize,
    pub level_size_base: u64,
    pub max_page_size: u64,
    pub cache_capacity: usize,
    /// `sync_data` the journal after every append, not only flush it to the OS.
    pub journal_sync: bool,
    pub compaction_interval: Duration,
    pub close_timeout: Duration,
    pub logger: Option<Logger>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            memtable_size: MEMTABLE_SIZE_THRESHOLD,
            block_size: DATA_BLOCK_SIZE,
            max_levels: MAX_LEVEL,
            level0_page_threshold: LEVEL0_FILES_THRESHOLD,
            level_size_base: LEVEL_SIZE_BASE,
            max_page_size: MAX_PAGE_SIZE,
            cache_capacity: BLOCK_CACHE_CAPACITY,
            journal_sync: false,
            compaction_interval: Duration::from_secs(1),
            close_timeout: Duration::from_secs(30),
            logger: None,
        }
    }
}

impl Options {
    pub fn with_memtable_size(mut self, memtable_size: usize) -> Self {
        self.memtable_size = memtable_size;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_max_levels(mut self, max_levels: usize) -> Self {
        self.max_levels = max_levels;
        self
    }

    pub fn with_level0_page_threshold(mut self, threshold: usize) -> Self {
        self.level0_page_threshold = threshold;
        self
    }

    pub fn with_level_size_base(mut self, level_size_base: u64) -> Self {
        self.level_size_base = level_size_base;
        self
    }

    pub fn with_max_page_size(mut self, max_page_size: u64) -> Self {
        self.max_page_size = max_page_size;
        self
    }

    pub fn with_cache_capacity(mut self, cache_capacity: usize) -> Self {
        self.cache_capacity = cache_capacity;
        self
    }

    pub fn with_journal_sync(mut self, journal_sync: bool) -> Self {
        self.journal_sync = journal_sync;
        self
    }

    pub fn with_compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_logger(mut self, logger: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.logger = Some(Arc::new(logger));
        self
    }

    /// Reject settings the store cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_levels < MIN_LEVEL {
            return Err(StrataError::Custom(format!(
                "max_levels is {}, at least {} levels are required",
                self.max_levels, MIN_LEVEL
            )));
        }
        Ok(())
    }

    /// Size limit of level `level` (>= 1) before it is compacted into the next one.
    pub fn level_size_limit(&self, level: usize) -> u64 {
        debug_assert!(level >= 1);
        self.level_size_base
            .saturating_mul(10u64.saturating_pow(level as u32 - 1))
    }

    /// Write `msg` to the `log` facade and to the user supplied logger, if any.
    pub(crate) fn log_event(&self, msg: &str) {
        info!("{}", msg);
        if let Some(logger) = &self.logger {
            logger(msg);
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("memtable_size", &self.memtable_size)
            .field("block_size", &self.block_size)
            .field("max_levels", &self.max_levels)
            .field("level0_page_threshold", &self.level0_page_threshold)
            .field("level_size_base", &self.level_size_base)
            .field("max_page_size", &self.max_page_size)
            .field("cache_capacity", &self.cache_capacity)
            .field("journal_sync", &self.journal_sync)
            .field("compaction_interval", &self.compaction_interval)
            .field("close_timeout", &self.close_timeout)
            .field("logger", &self.logger.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::db::options::Options;

    #[test]
    fn test_level_size_limit() {
        let options = Options::default().with_level_size_base(100);
        assert_eq!(options.level_size_limit(1), 100);
        assert_eq!(options.level_size_limit(2), 1000);
        assert_eq!(options.level_size_limit(3), 10000);
    }

    #[test]
    fn test_validate() {
        assert!(Options::default().validate().is_ok());
        assert!(Options::default().with_max_levels(2).validate().is_ok());
        assert!(Options::default().with_max_levels(1).validate().is_err());
        assert!(Options::default().with_max_levels(0).validate().is_err());
    }
}
