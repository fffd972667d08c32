// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Daemon configuration for MirrorFS Core

use std::path::PathBuf;
use std::time::Duration;

/// Kernel cache policy for attributes and entries
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CachePolicy {
    /// Never cache; every operation goes to the daemon.
    None,
    /// Cache with a short timeout, invalidated on detected change.
    Auto,
    /// Cache aggressively; the tree is assumed private to this daemon.
    Always,
}

impl CachePolicy {
    fn default_timeout(self) -> Duration {
        match self {
            CachePolicy::None => Duration::ZERO,
            CachePolicy::Auto => Duration::from_secs(1),
            CachePolicy::Always => Duration::from_secs(86400),
        }
    }
}

/// Shared version tracking endpoints
#[derive(Clone, Debug)]
pub struct SharedConfig {
    /// Coordinator control socket (SEQPACKET).
    pub socket: PathBuf,
    /// Memory-mapped version counter file.
    pub table: PathBuf,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/tmp/ireg.sock"),
            table: PathBuf::from("/dev/shm/fuse_shared_versions"),
        }
    }
}

/// MirrorFS daemon configuration
#[derive(Clone, Debug)]
pub struct Config {
    /// Backing directory mirrored by the daemon.
    pub source: PathBuf,
    pub cache: CachePolicy,
    /// Attribute/entry timeout; `None` derives it from the cache policy.
    pub timeout: Option<Duration>,
    /// Kernel writeback caching requested.
    pub writeback: bool,
    /// Serve extended attribute operations (ENOSYS when off).
    pub xattr: bool,
    /// Serve advisory flock locks.
    pub flock: bool,
    /// Refuse racy fallbacks (EPERM) instead of best-effort path recovery.
    pub norace: bool,
    /// Cross-daemon version tracking; `Some` makes the coordinator mandatory.
    pub shared: Option<SharedConfig>,
}

impl Config {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            cache: CachePolicy::Auto,
            timeout: None,
            writeback: false,
            xattr: false,
            flock: false,
            norace: false,
            shared: None,
        }
    }

    /// Effective attribute/entry timeout.
    pub fn effective_timeout(&self) -> Duration {
        self.timeout.unwrap_or_else(|| self.cache.default_timeout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_derived_from_cache_policy() {
        let mut config = Config::new("/srv/tree");
        assert_eq!(config.effective_timeout(), Duration::from_secs(1));
        config.cache = CachePolicy::None;
        assert_eq!(config.effective_timeout(), Duration::ZERO);
        config.cache = CachePolicy::Always;
        assert_eq!(config.effective_timeout(), Duration::from_secs(86400));
    }

    #[test]
    fn test_explicit_timeout_wins() {
        let mut config = Config::new("/srv/tree");
        config.timeout = Some(Duration::from_millis(250));
        assert_eq!(config.effective_timeout(), Duration::from_millis(250));
    }
}
