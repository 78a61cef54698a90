//! Store configuration

use std::path::PathBuf;
use std::time::Duration;

use crate::notification_queue::DEFAULT_SLEEP_TICK;

/// Env var naming the defaults file (`KEY=VALUE` lines)
pub const ENV_DEFAULTS: &str = "SYSPROP_DEFAULTS";
/// Env var naming the persistent property directory
pub const ENV_PERSIST_DIR: &str = "SYSPROP_PERSIST_DIR";
/// Env var selecting the wait mode: `queue` or `sleep`
pub const ENV_WAIT: &str = "SYSPROP_WAIT";

/// Where the original system kept its build-time defaults
pub const DEFAULT_BUILD_PROP_PATH: &str = "/system/build.prop";
/// Where the original system kept persistent properties
pub const DEFAULT_PERSIST_DIR: &str = "/data/property";

/// How readers block while a record is being written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitMode {
    /// Block on the store's notification queue until woken
    #[default]
    Queue,
    /// Sleep for the given tick and re-check
    Sleep(Duration),
}

impl WaitMode {
    /// Parse `queue` or `sleep`; unknown values yield `None`
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue" => Some(Self::Queue),
            "sleep" => Some(Self::Sleep(DEFAULT_SLEEP_TICK)),
            _ => None,
        }
    }
}

/// Settings for `PropertyStore::init`
///
/// The default configuration loads nothing from disk and persists nothing,
/// which gives an isolated in-memory store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreConfig {
    pub defaults_path: Option<PathBuf>,
    pub persist_dir: Option<PathBuf>,
    pub wait_mode: WaitMode,
}

impl StoreConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_defaults_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.defaults_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_persist_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.persist_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_wait_mode(mut self, wait_mode: WaitMode) -> Self {
        self.wait_mode = wait_mode;
        self
    }

    /// Read the configuration from `SYSPROP_*` environment variables
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as `from_env`, with an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let wait_mode = match non_empty(ENV_WAIT) {
            Some(raw) => WaitMode::parse(&raw).unwrap_or_else(|| {
                tracing::warn!("{ENV_WAIT}={raw:?} is not 'queue' or 'sleep', using queue");
                WaitMode::Queue
            }),
            None => WaitMode::Queue,
        };

        Self {
            defaults_path: non_empty(ENV_DEFAULTS).map(PathBuf::from),
            persist_dir: non_empty(ENV_PERSIST_DIR).map(PathBuf::from),
            wait_mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_is_in_memory() {
        let config = StoreConfig::default();
        assert!(config.defaults_path.is_none());
        assert!(config.persist_dir.is_none());
        assert_eq!(config.wait_mode, WaitMode::Queue);
    }

    #[test]
    fn test_from_lookup() {
        let vars = HashMap::from([
            (ENV_DEFAULTS, "/tmp/build.prop"),
            (ENV_PERSIST_DIR, "/tmp/props"),
            (ENV_WAIT, "Sleep"),
        ]);
        let config = StoreConfig::from_lookup(|name| vars.get(name).map(|v| (*v).to_string()));
        assert_eq!(config.defaults_path, Some(PathBuf::from("/tmp/build.prop")));
        assert_eq!(config.persist_dir, Some(PathBuf::from("/tmp/props")));
        assert_eq!(config.wait_mode, WaitMode::Sleep(DEFAULT_SLEEP_TICK));
    }

    #[test]
    fn test_from_lookup_ignores_blank_and_unknown() {
        let vars = HashMap::from([(ENV_PERSIST_DIR, "  "), (ENV_WAIT, "spin")]);
        let config = StoreConfig::from_lookup(|name| vars.get(name).map(|v| (*v).to_string()));
        assert!(config.persist_dir.is_none());
        assert_eq!(config.wait_mode, WaitMode::Queue);
    }
}
