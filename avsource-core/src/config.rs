//! Source configuration

use serde::{Deserialize, Serialize};

use crate::backend::LogLevel;

/// What a full queue does with a new item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Block the producer until the consumer makes room
    Block,
    /// Evict the oldest queued item
    DropOldest,
}

/// Buffering and teardown settings for a `Source`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Packets held for a stream that is not being read right now.
    /// Always drop-oldest: the buffer lives on the caller thread.
    pub packet_buffer_capacity: usize,
    /// Worker input queue
    pub video_packet_capacity: usize,
    pub video_packet_policy: BackpressurePolicy,
    /// Worker output queue
    pub video_image_capacity: usize,
    pub video_image_policy: BackpressurePolicy,
    /// How long teardown waits for the worker before detaching it
    pub worker_join_timeout_ms: u64,
    pub backend_log_level: LogLevel,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            packet_buffer_capacity: 256,
            video_packet_capacity: 120,
            video_packet_policy: BackpressurePolicy::Block,
            video_image_capacity: 30,
            video_image_policy: BackpressurePolicy::DropOldest,
            worker_join_timeout_ms: 2_000,
            backend_log_level: LogLevel::Quiet,
        }
    }
}

impl SourceConfig {
    /// Reject settings that cannot work.
    ///
    /// The caller thread feeds the worker and drains its output, so if both
    /// queues block the caller can wait on a worker that waits on the caller.
    pub fn validate(&self) -> Result<(), String> {
        if self.packet_buffer_capacity == 0 {
            return Err("packet_buffer_capacity must be at least 1".into());
        }
        if self.video_packet_capacity == 0 || self.video_image_capacity == 0 {
            return Err("video queue capacities must be at least 1".into());
        }
        if self.video_packet_policy == BackpressurePolicy::Block
            && self.video_image_policy == BackpressurePolicy::Block
        {
            return Err("video packet and image queues cannot both block".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(SourceConfig::default().validate().is_ok());
    }

    #[test]
    fn test_both_blocking_rejected() {
        let config = SourceConfig {
            video_image_policy: BackpressurePolicy::Block,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("cannot both block"));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = SourceConfig {
            packet_buffer_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SourceConfig = serde_json::from_str(
            r#"{ "video_image_capacity": 8, "video_packet_policy": "drop_oldest", "backend_log_level": "debug" }"#,
        )
        .unwrap();

        assert_eq!(config.video_image_capacity, 8);
        assert_eq!(config.video_packet_policy, BackpressurePolicy::DropOldest);
        assert_eq!(config.backend_log_level, LogLevel::Debug);
        assert_eq!(config.packet_buffer_capacity, 256);
    }
}
