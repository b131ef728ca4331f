//! Collaboration settings shared by the peer-to-peer components.

use std::time::Duration;

/// Default STUN server handed to the peer connection.
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Configuration for a collaboration session.
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// ICE server URLs passed to the peer-connection primitive.
    pub ice_servers: Vec<String>,
    /// How long offer/answer creation waits for local candidates.
    pub candidate_settle: Duration,
    /// Minimum spacing between pointer presence broadcasts.
    pub presence_interval: Duration,
    /// Uncompressed bytes per asset chunk.
    pub asset_chunk_size: usize,
    /// Label of the graph + presence channel.
    pub sync_channel: String,
    /// Label of the binary asset channel.
    pub file_channel: String,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            candidate_settle: Duration::from_secs(1),
            presence_interval: Duration::from_millis(16),
            asset_chunk_size: 16 * 1024,
            sync_channel: "sync".to_string(),
            file_channel: "file-transfer".to_string(),
        }
    }
}

impl CollabConfig {
    /// No settle delay and no ICE servers, for in-process peers.
    pub fn local() -> Self {
        Self {
            ice_servers: Vec::new(),
            candidate_settle: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Both channel labels, in creation order.
    pub fn channel_labels(&self) -> [&str; 2] {
        [&self.sync_channel, &self.file_channel]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CollabConfig::default();
        assert_eq!(config.candidate_settle, Duration::from_secs(1));
        assert_eq!(config.presence_interval, Duration::from_millis(16));
        assert_eq!(config.asset_chunk_size, 16384);
        assert_eq!(config.channel_labels(), ["sync", "file-transfer"]);
        assert_eq!(config.ice_servers.len(), 1);
    }

    #[test]
    fn test_local_config_skips_settle() {
        let config = CollabConfig::local();
        assert!(config.candidate_settle.is_zero());
        assert!(config.ice_servers.is_empty());
        assert_eq!(config.sync_channel, "sync");
    }
}
