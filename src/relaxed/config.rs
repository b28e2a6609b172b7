use serde::Deserialize;

use std::{path, time::Duration};

use crate::{util::files, Result};

/// Default value for latch timeout, for latches acquired out of order.
pub const LOCK_TIMEOUT: Duration = Duration::from_millis(1);
/// Default value for the time shutdown waits for the balancer to drain.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
/// Default value for number of times remove() restarts from root, before
/// deferring the unlink to the balancer.
pub const REMOVE_RESTARTS: usize = 16;
/// Default value for number of slots in the first arena segment.
pub const SLAB_SIZE: usize = 1024;

/// Configuration for [Index][crate::relaxed::Index].
#[derive(Clone, Debug)]
pub struct Config {
    /// name of the index.
    pub name: String,
    /// Timeout for latches that are acquired out of the root-to-leaf
    /// order, by the balancer, and by remove() while latching the parent.
    ///
    /// Default: [LOCK_TIMEOUT]
    pub lock_timeout: Duration,
    /// Upper bound on the time shutdown waits for pending requests to be
    /// processed.
    ///
    /// Default: [SHUTDOWN_TIMEOUT]
    pub shutdown_timeout: Duration,
    /// Number of consecutive latch timeouts after which remove() stops
    /// restarting and tags the leaf for removal instead.
    ///
    /// Default: [REMOVE_RESTARTS]
    pub remove_restarts: usize,
    /// Bound the balancer's request channel. None for unbounded channel.
    ///
    /// Default: None
    pub chan_size: Option<usize>,
    /// Number of slots in the first arena segment, every subsequent
    /// segment doubles.
    ///
    /// Default: [SLAB_SIZE]
    pub slab_size: usize,
}

impl Config {
    /// Create a new configuration value, use the `set_*` methods to add more
    /// configuration.
    pub fn new(name: &str) -> Config {
        Config {
            name: name.to_string(),
            lock_timeout: LOCK_TIMEOUT,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
            remove_restarts: REMOVE_RESTARTS,
            chan_size: None,
            slab_size: SLAB_SIZE,
        }
    }

    /// Load configuration from toml file. Missing parameters shall take
    /// their default value.
    pub fn from_toml<P>(loc: P) -> Result<Config>
    where
        P: AsRef<path::Path>,
    {
        let cfg: TomlConfig = files::load_toml(loc)?;
        Ok(cfg.into())
    }

    pub fn set_lock_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn set_shutdown_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn set_remove_restarts(&mut self, restarts: usize) -> &mut Self {
        self.remove_restarts = restarts;
        self
    }

    /// Use a size-bounded channel to queue requests with the balancer.
    /// Writers shall block when the channel is full.
    pub fn set_chan_size(&mut self, size: Option<usize>) -> &mut Self {
        self.chan_size = size;
        self
    }

    pub fn set_slab_size(&mut self, size: usize) -> &mut Self {
        self.slab_size = size;
        self
    }
}

impl Config {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.lock_timeout == Duration::from_secs(0) {
            err_at!(InvalidInput, msg: "{} lock_timeout can't be zero", self.name)?;
        }
        if let Some(0) = self.chan_size {
            err_at!(InvalidInput, msg: "{} chan_size can't be zero", self.name)?;
        }
        if self.slab_size < 2 {
            err_at!(InvalidInput, msg: "{} slab_size {}", self.name, self.slab_size)?;
        }
        Ok(())
    }
}

#[derive(Clone, Deserialize)]
struct TomlConfig {
    name: String,
    lock_timeout_us: Option<u64>,
    shutdown_timeout_ms: Option<u64>,
    remove_restarts: Option<usize>,
    chan_size: Option<usize>,
    slab_size: Option<usize>,
}

impl From<TomlConfig> for Config {
    fn from(cfg: TomlConfig) -> Config {
        let mut config = Config::new(&cfg.name);
        if let Some(us) = cfg.lock_timeout_us {
            config.set_lock_timeout(Duration::from_micros(us));
        }
        if let Some(ms) = cfg.shutdown_timeout_ms {
            config.set_shutdown_timeout(Duration::from_millis(ms));
        }
        if let Some(restarts) = cfg.remove_restarts {
            config.set_remove_restarts(restarts);
        }
        if let Some(size) = cfg.slab_size {
            config.set_slab_size(size);
        }
        config.set_chan_size(cfg.chan_size);
        config
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
