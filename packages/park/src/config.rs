use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a [`crate::Park`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParkConfig {
    /// Upper bound on the fd table; opens beyond it fail with `ERRNO_NFILE`.
    pub max_fds: u32,
    /// Number of Refs that may be attached at once. Ids of dropped Refs are
    /// reused.
    pub max_refs: u32,
    /// Bytes available for in-flight payloads (paths, read and write buffers).
    pub allocator_capacity: usize,
    /// Index of the initial descriptor serving as stdin, if any.
    pub stdin: Option<u32>,
    pub stdout: Option<u32>,
    pub stderr: Option<u32>,
    /// How long an fd loop waits for allocator room for a result before it
    /// fails the call. `None` waits as long as it takes.
    pub call_timeout: Option<Duration>,
}

impl Default for ParkConfig {
    fn default() -> Self {
        Self {
            max_fds: 128,
            max_refs: 64,
            allocator_capacity: 1 << 20,
            stdin: Some(0),
            stdout: Some(1),
            stderr: Some(2),
            call_timeout: None,
        }
    }
}

impl ParkConfig {
    /// Descriptor indices for stdin, stdout and stderr, in that order.
    pub fn stdio(&self) -> [Option<u32>; 3] {
        [self.stdin, self.stdout, self.stderr]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: ParkConfig = serde_json::from_str(r#"{"max_fds": 32, "stderr": null}"#).unwrap();
        assert_eq!(config.max_fds, 32);
        assert_eq!(config.max_refs, 64);
        assert_eq!(config.stdio(), [Some(0), Some(1), None]);
    }
}
