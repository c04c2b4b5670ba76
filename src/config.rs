use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::core::{KB, MB, Result};
use crate::plug::{BlockingHttp, build_default_transport};

#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Largest prefix a stream may buffer in memory before spooling to disk.
    pub max_buffer_limit: usize,
    /// Section buffers at least this large are allocated with anonymous mmap. 0 disables.
    pub mmap_threshold: usize,
    /// Largest head a positional reader keeps for repeated probes at offset 0.
    pub head_cache_limit: usize,
    pub temp_dir: PathBuf,
    /// How far a cached reader may be skipped forward instead of opening a new range.
    pub reader_skip_tolerance: u64,
    pub max_live_readers: usize,
    pub download_concurrency: usize,
    pub download_part_size: u64,
    pub retry_max_attempts: usize,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_buffer_limit: 16 * MB as usize,
            mmap_threshold: 4 * MB as usize,
            head_cache_limit: 256 * KB as usize,
            temp_dir: std::env::temp_dir(),
            reader_skip_tolerance: 4 * MB,
            max_live_readers: 16,
            download_concurrency: 3,
            download_part_size: 10 * MB,
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_millis(50),
            retry_max_delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration plus the HTTP transport every stream built from it shares.
pub struct StreamEnv {
    config: StreamConfig,
    transport: Arc<dyn BlockingHttp>,
}

impl StreamEnv {
    pub fn builder() -> StreamEnvBuilder {
        StreamEnvBuilder::new()
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn BlockingHttp> {
        &self.transport
    }
}

impl fmt::Debug for StreamEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamEnv")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

pub struct StreamEnvBuilder {
    config: StreamConfig,
    transport: Option<Arc<dyn BlockingHttp>>,
}

impl Default for StreamEnvBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamEnvBuilder {
    pub fn new() -> Self {
        Self {
            config: StreamConfig::default(),
            transport: None,
        }
    }

    pub fn config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn BlockingHttp>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn max_buffer_limit(mut self, limit: usize) -> Self {
        self.config.max_buffer_limit = limit;
        self
    }

    pub fn mmap_threshold(mut self, threshold: usize) -> Self {
        self.config.mmap_threshold = threshold;
        self
    }

    pub fn head_cache_limit(mut self, limit: usize) -> Self {
        self.config.head_cache_limit = limit;
        self
    }

    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.temp_dir = dir.into();
        self
    }

    pub fn reader_skip_tolerance(mut self, tolerance: u64) -> Self {
        self.config.reader_skip_tolerance = tolerance;
        self
    }

    pub fn max_live_readers(mut self, max: usize) -> Self {
        self.config.max_live_readers = max.max(1);
        self
    }

    pub fn download_concurrency(mut self, concurrency: usize) -> Self {
        self.config.download_concurrency = concurrency.max(1);
        self
    }

    pub fn download_part_size(mut self, part_size: u64) -> Self {
        self.config.download_part_size = part_size.max(1);
        self
    }

    pub fn retry_max_attempts(mut self, attempts: usize) -> Self {
        self.config.retry_max_attempts = attempts;
        self
    }

    pub fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.config.retry_base_delay = delay;
        self
    }

    pub fn retry_max_delay(mut self, delay: Duration) -> Self {
        self.config.retry_max_delay = delay;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<Arc<StreamEnv>> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => build_default_transport(&self.config)?,
        };

        Ok(Arc::new(StreamEnv {
            config: self.config,
            transport,
        }))
    }
}
