//! Configuration for the RDMA-CM connection layer.

use serde::{Deserialize, Serialize};

/// Tunables for connection establishment and the data path.
///
/// The handshake timeouts and the listen backlog are protocol constants in
/// practice; they are exposed here with the production defaults so that
/// tests and unusual deployments can override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdmaCmConfig {
    /// Address-resolution timeout used on the socket-level connect path, in
    /// milliseconds.
    #[serde(default = "default_addr_resolve_timeout_ms")]
    pub addr_resolve_timeout_ms: u32,

    /// Resolution timeout used on the manager-level path (internal
    /// re-resolution), in milliseconds.
    #[serde(default = "default_cm_resolve_timeout_ms")]
    pub cm_resolve_timeout_ms: u32,

    /// Route-resolution timeout, in milliseconds.
    #[serde(default = "default_route_resolve_timeout_ms")]
    pub route_resolve_timeout_ms: u32,

    /// Backlog for listening endpoints.
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: u32,

    /// Transport-level retry count attached to connect requests.
    #[serde(default = "default_retry_count")]
    pub retry_count: u8,

    /// Maximum payload posted per send work request, in bytes. Larger
    /// sends are split.
    #[serde(default = "default_send_buf_size")]
    pub send_buf_size: u32,

    /// Maximum receive completions harvested per poll.
    #[serde(default = "default_poll_batch")]
    pub poll_batch: usize,
}

fn default_addr_resolve_timeout_ms() -> u32 {
    5000
}
fn default_cm_resolve_timeout_ms() -> u32 {
    2000
}
fn default_route_resolve_timeout_ms() -> u32 {
    2000
}
fn default_listen_backlog() -> u32 {
    128
}
fn default_retry_count() -> u8 {
    7
}
fn default_send_buf_size() -> u32 {
    16 * 1024
}
fn default_poll_batch() -> usize {
    16
}

impl Default for RdmaCmConfig {
    fn default() -> Self {
        Self {
            addr_resolve_timeout_ms: default_addr_resolve_timeout_ms(),
            cm_resolve_timeout_ms: default_cm_resolve_timeout_ms(),
            route_resolve_timeout_ms: default_route_resolve_timeout_ms(),
            listen_backlog: default_listen_backlog(),
            retry_count: default_retry_count(),
            send_buf_size: default_send_buf_size(),
            poll_batch: default_poll_batch(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RdmaCmConfig::default();
        assert_eq!(config.addr_resolve_timeout_ms, 5000);
        assert_eq!(config.cm_resolve_timeout_ms, 2000);
        assert_eq!(config.route_resolve_timeout_ms, 2000);
        assert_eq!(config.listen_backlog, 128);
        assert_eq!(config.retry_count, 7);
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = RdmaCmConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: RdmaCmConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.listen_backlog, config.listen_backlog);
        assert_eq!(back.send_buf_size, config.send_buf_size);
    }

    #[test]
    fn test_partial_deserialization_uses_defaults() {
        let back: RdmaCmConfig = serde_json::from_str(r#"{"listen_backlog": 64}"#).unwrap();
        assert_eq!(back.listen_backlog, 64);
        assert_eq!(back.addr_resolve_timeout_ms, 5000);
        assert_eq!(back.retry_count, 7);
    }
}
