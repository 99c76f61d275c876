use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the storage engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory path for the database
    pub dir: PathBuf,

    /// Number of live write-buffer entries that triggers a rotation
    /// (default: 10,000)
    pub rotate_threshold: usize,

    /// Maximum combined file size of two segments that the compactor will
    /// merge (default: 50 MiB)
    pub max_merge_size: u64,

    /// How often the background worker runs a compact + flush pass
    /// (default: 500 ms)
    pub worker_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./cinderdb"),
            rotate_threshold: 10_000,
            max_merge_size: 50 * 1024 * 1024, // 50 MiB
            worker_interval: Duration::from_millis(500),
        }
    }
}

impl Config {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the write-buffer rotation threshold
    pub fn rotate_threshold(mut self, entries: usize) -> Self {
        self.rotate_threshold = entries;
        self
    }

    /// Set the maximum combined size of a merge pair
    pub fn max_merge_size(mut self, bytes: u64) -> Self {
        self.max_merge_size = bytes;
        self
    }

    /// Set the background worker interval
    pub fn worker_interval(mut self, interval: Duration) -> Self {
        self.worker_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.dir, PathBuf::from("./cinderdb"));
        assert_eq!(config.rotate_threshold, 10_000);
        assert_eq!(config.max_merge_size, 50 * 1024 * 1024);
        assert_eq!(config.worker_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_config_builder() {
        let config = Config::new("/tmp/test")
            .rotate_threshold(100)
            .max_merge_size(1024)
            .worker_interval(Duration::from_millis(50));

        assert_eq!(config.dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.rotate_threshold, 100);
        assert_eq!(config.max_merge_size, 1024);
        assert_eq!(config.worker_interval, Duration::from_millis(50));
    }
}
