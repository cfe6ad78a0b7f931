//! Database and connection configuration.

use std::time::Duration;

/// Default number of background worker threads.
pub const DEFAULT_WORKER_THREADS: usize = 2;

/// Default number of idle storage handles kept in the reuse pool.
pub const DEFAULT_POOL_CAPACITY: usize = 5;

/// Default time an idle pooled handle survives before eviction.
pub const DEFAULT_POOL_LIFETIME: Duration = Duration::from_secs(90);

/// Default capacity of a connection's object cache.
pub const DEFAULT_OBJECT_CACHE_LIMIT: usize = 250;

/// Default capacity of a connection's metadata cache.
pub const DEFAULT_METADATA_CACHE_LIMIT: usize = 500;

/// Database-wide settings, fixed at open time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Number of threads running asynchronous transactions. Values below
    /// one are treated as one.
    pub worker_threads: usize,
    /// Maximum number of idle storage handles retained for reuse.
    /// Zero disables pooling entirely.
    pub pool_capacity: usize,
    /// How long an idle pooled handle lives before the background
    /// reaper closes it. [`Duration::ZERO`] disables eviction.
    pub pool_lifetime: Duration,
    /// Settings a connection starts with when none are given. Each
    /// connection copies these at creation; later changes affect only
    /// connections created afterwards.
    pub connection_defaults: ConnectionConfig,
    /// Marks the database as shared with other processes. The flag is
    /// recorded and exposed but no cross-process notifier ships; the
    /// directory lock still excludes concurrent writers.
    pub multiprocess: bool,
}

impl Config {
    /// The default configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            pool_lifetime: DEFAULT_POOL_LIFETIME,
            connection_defaults: ConnectionConfig::new(),
            multiprocess: false,
        }
    }

    /// Sets the worker thread count.
    #[must_use]
    pub const fn with_worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count;
        self
    }

    /// Sets the idle handle pool capacity.
    #[must_use]
    pub const fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    /// Sets the idle handle lifetime.
    #[must_use]
    pub const fn with_pool_lifetime(mut self, lifetime: Duration) -> Self {
        self.pool_lifetime = lifetime;
        self
    }

    /// Sets the defaults new connections start with.
    #[must_use]
    pub const fn with_connection_defaults(mut self, defaults: ConnectionConfig) -> Self {
        self.connection_defaults = defaults;
        self
    }

    /// Marks the database as multiprocess.
    #[must_use]
    pub const fn with_multiprocess(mut self, multiprocess: bool) -> Self {
        self.multiprocess = multiprocess;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// How a connection's caches react when another connection changes a row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CachePolicy {
    /// Evict the cached entry; the next read refetches and deserializes.
    #[default]
    Containment,
    /// Adopt the committed value carried by the change set, sharing one
    /// allocation across connections. Removed rows are evicted.
    Identity,
}

/// Per-connection settings, fixed when the connection is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Whether the connection caches deserialized objects at all.
    pub object_cache_enabled: bool,
    /// Object cache capacity in rows. Zero means unbounded.
    pub object_cache_limit: usize,
    /// Whether the connection caches deserialized metadata at all.
    pub metadata_cache_enabled: bool,
    /// Metadata cache capacity in rows. Zero means unbounded.
    pub metadata_cache_limit: usize,
    /// Cache policy for objects.
    pub object_policy: CachePolicy,
    /// Cache policy for metadata.
    pub metadata_policy: CachePolicy,
}

impl ConnectionConfig {
    /// The default configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            object_cache_enabled: true,
            object_cache_limit: DEFAULT_OBJECT_CACHE_LIMIT,
            metadata_cache_enabled: true,
            metadata_cache_limit: DEFAULT_METADATA_CACHE_LIMIT,
            object_policy: CachePolicy::Containment,
            metadata_policy: CachePolicy::Containment,
        }
    }

    /// Enables or disables the object cache.
    #[must_use]
    pub const fn with_object_cache_enabled(mut self, enabled: bool) -> Self {
        self.object_cache_enabled = enabled;
        self
    }

    /// Sets the object cache capacity.
    #[must_use]
    pub const fn with_object_cache_limit(mut self, limit: usize) -> Self {
        self.object_cache_limit = limit;
        self
    }

    /// Enables or disables the metadata cache.
    #[must_use]
    pub const fn with_metadata_cache_enabled(mut self, enabled: bool) -> Self {
        self.metadata_cache_enabled = enabled;
        self
    }

    /// Sets the metadata cache capacity.
    #[must_use]
    pub const fn with_metadata_cache_limit(mut self, limit: usize) -> Self {
        self.metadata_cache_limit = limit;
        self
    }

    /// Sets the object cache policy.
    #[must_use]
    pub const fn with_object_policy(mut self, policy: CachePolicy) -> Self {
        self.object_policy = policy;
        self
    }

    /// Sets the metadata cache policy.
    #[must_use]
    pub const fn with_metadata_policy(mut self, policy: CachePolicy) -> Self {
        self.metadata_policy = policy;
        self
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new()
    }
}
