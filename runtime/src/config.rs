use std::time::Duration;

use serde::{Deserialize, Serialize};
use wasi_farm_shm::DualLockMode;

/// Configuration for a [`crate::Farm`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FarmConfig {
    /// Give up on a Park or background call after this long. `None` waits forever.
    pub call_timeout: Option<Duration>,
    /// Highest thread id `thread-spawn` hands out.
    pub max_threads: u32,
    /// Bytes for spawn requests and the final report.
    pub background_allocator_capacity: usize,
    /// Backoff rounds for two-fd operations; `None` locks in strict order.
    pub dual_lock_retries: Option<u32>,
    /// How long the background worker waits for killed workers to report.
    pub shutdown_grace: Duration,
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            call_timeout: None,
            max_threads: 1 << 16,
            background_allocator_capacity: 64 * 1024,
            dual_lock_retries: None,
            shutdown_grace: Duration::from_millis(200),
        }
    }
}

impl FarmConfig {
    pub fn dual_lock_mode(&self) -> DualLockMode {
        match self.dual_lock_retries {
            Some(retries) => DualLockMode::Backoff { retries },
            None => DualLockMode::Ordered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = FarmConfig::default();
        assert_eq!(config.max_threads, 65536);
        assert_eq!(config.dual_lock_mode(), DualLockMode::Ordered);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: FarmConfig =
            serde_json::from_str(r#"{"dual_lock_retries": 3, "max_threads": 8}"#).unwrap();
        assert_eq!(config.max_threads, 8);
        assert_eq!(config.dual_lock_mode(), DualLockMode::Backoff { retries: 3 });
        assert_eq!(config.shutdown_grace, Duration::from_millis(200));
    }
}
