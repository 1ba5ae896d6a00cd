//! Node configuration.
//!
//! Defaults are tuned for an addon channel limited to ~255-byte frames and a
//! few messages per second. The suspension predicate is not part of this
//! struct; it is installed on the node (see `SyncNode::set_suspension_predicate`).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::codec::HEADER_LEN;

/// Smallest chunk that still leaves room for fragment metadata.
pub const MIN_CHUNK_SIZE: usize = 64;

/// Sync node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Encoded messages larger than this are split into fragments.
    pub max_chunk_size: usize,
    /// Tokens added per `rate_limit_interval`; one token per frame.
    pub rate_limit_tokens: u32,
    pub rate_limit_interval: Duration,
    /// Token bucket capacity.
    pub rate_limit_burst: u32,
    /// Outbound queue capacity in frames.
    pub max_queued_frames: usize,
    /// Incomplete chunk sets older than this are discarded.
    pub reassembly_timeout: Duration,
    /// Concurrent reassembly buffers across all senders.
    pub max_reassembly_buffers: usize,
    /// Largest message accepted through reassembly, in bytes.
    pub max_reassembly_bytes: usize,
    /// Debounce window for incremental publishes.
    pub publish_cooldown: Duration,
    /// Debounce window for full rebroadcasts triggered by new peers.
    pub full_sync_cooldown: Duration,
    /// Periodic full rebroadcast (convergence fallback).
    pub full_sync_interval: Duration,
    /// Fallback roster refresh when no change notification arrives.
    pub roster_refresh_interval: Duration,
    /// Offline peers unseen this long are forgotten.
    pub peer_stale_after_secs: u64,
    /// Tombstones are garbage-collected after this long.
    pub tombstone_retention_secs: u64,
    /// Records by departed members are pruned after this long.
    pub record_retention_secs: u64,
    /// How often retention pruning runs.
    pub prune_interval: Duration,
    /// Send uncompressed payloads for older clients.
    pub legacy_transport: bool,
    /// Encoded bodies below this size are never compressed.
    pub compression_threshold: usize,
    /// Log dropped messages at `warn` instead of `trace`.
    pub diagnostics: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 240,
            rate_limit_tokens: 4,
            rate_limit_interval: Duration::from_secs(1),
            rate_limit_burst: 10,
            max_queued_frames: 2_000,
            reassembly_timeout: Duration::from_secs(30),
            max_reassembly_buffers: 64,
            max_reassembly_bytes: 512 * 1024,
            publish_cooldown: Duration::from_secs(2),
            full_sync_cooldown: Duration::from_secs(15),
            full_sync_interval: Duration::from_secs(600),
            roster_refresh_interval: Duration::from_secs(60),
            peer_stale_after_secs: 30 * 24 * 3600,
            tombstone_retention_secs: 14 * 24 * 3600,
            record_retention_secs: 30 * 24 * 3600,
            prune_interval: Duration::from_secs(300),
            legacy_transport: false,
            compression_threshold: 64,
            diagnostics: false,
        }
    }
}

impl SyncConfig {
    /// Generous limits and short timers so tests run without waiting.
    pub fn for_testing() -> Self {
        Self {
            max_chunk_size: 4096,
            rate_limit_tokens: 1_000,
            rate_limit_interval: Duration::from_millis(10),
            rate_limit_burst: 1_000,
            max_queued_frames: 10_000,
            reassembly_timeout: Duration::from_secs(5),
            max_reassembly_buffers: 16,
            max_reassembly_bytes: 1024 * 1024,
            publish_cooldown: Duration::from_millis(100),
            full_sync_cooldown: Duration::from_millis(200),
            full_sync_interval: Duration::from_secs(60),
            roster_refresh_interval: Duration::from_secs(10),
            prune_interval: Duration::from_secs(60),
            diagnostics: true,
            ..Self::default()
        }
    }

    /// Reject settings the node cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_chunk_size < MIN_CHUNK_SIZE {
            return Err(ConfigError::invalid(
                "max_chunk_size",
                format!("must be at least {MIN_CHUNK_SIZE}"),
            ));
        }
        if self.rate_limit_tokens == 0 || self.rate_limit_burst == 0 {
            return Err(ConfigError::invalid(
                "rate_limit_tokens",
                "rate limit tokens and burst must be non-zero",
            ));
        }
        if self.rate_limit_interval.is_zero() {
            return Err(ConfigError::invalid("rate_limit_interval", "must be non-zero"));
        }
        if self.max_queued_frames == 0 {
            return Err(ConfigError::invalid("max_queued_frames", "must be non-zero"));
        }
        if self.max_reassembly_buffers == 0 {
            return Err(ConfigError::invalid("max_reassembly_buffers", "must be non-zero"));
        }
        if self.max_reassembly_bytes < self.max_chunk_size {
            return Err(ConfigError::invalid(
                "max_reassembly_bytes",
                "must be at least max_chunk_size",
            ));
        }
        if self.compression_threshold < HEADER_LEN {
            return Err(ConfigError::invalid(
                "compression_threshold",
                format!("must be at least {HEADER_LEN}"),
            ));
        }
        Ok(())
    }
}

/// Invalid configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { field, reason } => {
                write!(f, "Invalid config `{field}`: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(SyncConfig::default().validate().is_ok());
        assert!(SyncConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_tiny_chunk_rejected() {
        let config = SyncConfig {
            max_chunk_size: 8,
            ..SyncConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_chunk_size"));
    }

    #[test]
    fn test_zero_rate_rejected() {
        let config = SyncConfig {
            rate_limit_tokens: 0,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_roundtrips_through_bincode() {
        let config = SyncConfig::for_testing();
        let bytes = bincode::serde::encode_to_vec(&config, bincode::config::standard()).unwrap();
        let (decoded, _): (SyncConfig, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(decoded, config);
    }
}
