//! Cache configuration, built the way the teacher builds `KernelConfig`: a
//! plain struct with validating `with_*` builder methods rather than a
//! config-parsing crate, since option parsing itself lives outside this core.

use crate::error::Errno;

/// Hard bound on the number of vectors a single downstream write call may
/// carry, independent of configuration.
pub const MAX_VECTOR_COUNT: usize = 8;

const MIN_WINDOW_SIZE: u64 = 512 * 1024;
const MAX_WINDOW_SIZE: u64 = 1024 * 1024 * 1024;
const MAX_DISABLE_PREFIX: u64 = 1024 * 1024;

/// Tunables for the write-behind cache core.
///
/// Corresponds to the `cache-size`, `aggregate-size`, `flush-behind`,
/// `enable-O_SYNC`, `enable-trickling-writes` and `disable-for-first-nbytes`
/// options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    window_size: u64,
    aggregate_size: u64,
    flush_behind: bool,
    enable_o_sync: bool,
    enable_trickling_writes: bool,
    disable_for_first_nbytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            window_size: MIN_WINDOW_SIZE * 2,
            aggregate_size: 128 * 1024,
            flush_behind: true,
            enable_o_sync: true,
            enable_trickling_writes: true,
            disable_for_first_nbytes: 0,
        }
    }
}

impl CacheConfig {
    /// Starts from the documented defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `cache-size`/`window-size`, clamped to `[512 KiB, 1 GiB]`.
    #[must_use]
    pub fn with_window_size(mut self, bytes: u64) -> Self {
        self.window_size = bytes.clamp(MIN_WINDOW_SIZE, MAX_WINDOW_SIZE);
        self
    }

    /// Sets `aggregate-size`, the batch-flush threshold.
    #[must_use]
    pub fn with_aggregate_size(mut self, bytes: u64) -> Self {
        self.aggregate_size = bytes;
        self
    }

    /// Sets `flush-behind`.
    #[must_use]
    pub fn with_flush_behind(mut self, enabled: bool) -> Self {
        self.flush_behind = enabled;
        self
    }

    /// Sets `enable-O_SYNC`.
    #[must_use]
    pub fn with_enable_o_sync(mut self, enabled: bool) -> Self {
        self.enable_o_sync = enabled;
        self
    }

    /// Sets `enable-trickling-writes`.
    #[must_use]
    pub fn with_trickling_writes(mut self, enabled: bool) -> Self {
        self.enable_trickling_writes = enabled;
        self
    }

    /// Sets `disable-for-first-nbytes`, clamped to `[0, 1 MiB]`.
    #[must_use]
    pub fn with_disable_for_first_nbytes(mut self, bytes: u64) -> Self {
        self.disable_for_first_nbytes = bytes.min(MAX_DISABLE_PREFIX);
        self
    }

    /// Validates the `window_conf >= aggregate_size` invariant required at
    /// init, returning the config or `ENOMEM`-unrelated `EINVAL`.
    pub fn build(self) -> Result<Self, Errno> {
        if self.window_size < self.aggregate_size {
            return Err(Errno::EINVAL);
        }
        Ok(self)
    }

    /// Current window (cache-size) limit.
    #[must_use]
    pub fn window_size(&self) -> u64 {
        self.window_size
    }

    /// Live-reconfigures the window limit, re-clamping to bounds.
    pub fn set_window_size(&mut self, bytes: u64) {
        self.window_size = bytes.clamp(MIN_WINDOW_SIZE, MAX_WINDOW_SIZE);
    }

    /// Current aggregate (batch-flush) threshold.
    #[must_use]
    pub fn aggregate_size(&self) -> u64 {
        self.aggregate_size
    }

    /// Whether `flush` acknowledges immediately and completes in the
    /// background.
    #[must_use]
    pub fn flush_behind(&self) -> bool {
        self.flush_behind
    }

    /// Whether `O_SYNC` opens disable caching for the file.
    #[must_use]
    pub fn enable_o_sync(&self) -> bool {
        self.enable_o_sync
    }

    /// Whether the scheduler ships pending writes below the aggregate
    /// threshold.
    #[must_use]
    pub fn trickling_writes(&self) -> bool {
        self.enable_trickling_writes
    }

    /// Byte count for which caching is disabled at the start of a newly
    /// opened file.
    #[must_use]
    pub fn disable_for_first_nbytes(&self) -> u64 {
        self.disable_for_first_nbytes
    }
}
