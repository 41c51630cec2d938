use serde::Deserialize;
use std::path::Path;

fn default_handle_pool_size() -> usize {
    256
}

fn default_connect_pool_size() -> usize {
    16
}

fn default_connect_timer_resolution_ms() -> u64 {
    100
}

fn default_write_pool_size() -> usize {
    64
}

fn default_shutdown_pool_size() -> usize {
    16
}

fn default_stream_read_buffer_size() -> usize {
    256 * 1024
}

fn default_tcp_listen_backlog() -> u32 {
    32
}

/// Reactor tuning knobs. Every field has a default and is clamped to a sane
/// range on load, so a partial or empty config file is always usable.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReactorConfig {
    /// Pre-sized capacity of the handle pool.
    #[serde(default = "default_handle_pool_size")]
    pub handle_pool_size: usize,
    /// Pre-sized capacity of the connect request table.
    #[serde(default = "default_connect_pool_size")]
    pub connect_pool_size: usize,
    /// Bucket width for connect-timeout coalescing, in milliseconds.
    #[serde(default = "default_connect_timer_resolution_ms")]
    pub connect_timer_resolution_ms: u64,
    /// Pre-sized capacity of the write request table.
    #[serde(default = "default_write_pool_size")]
    pub write_pool_size: usize,
    /// Pre-sized capacity of the shutdown request table.
    #[serde(default = "default_shutdown_pool_size")]
    pub shutdown_pool_size: usize,
    /// Size of the per-stream read buffer, allocated lazily on the first
    /// `enable_read`.
    #[serde(default = "default_stream_read_buffer_size")]
    pub stream_read_buffer_size: usize,
    /// Listen backlog for accepting sockets.
    #[serde(default = "default_tcp_listen_backlog")]
    pub tcp_listen_backlog: u32,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            handle_pool_size: default_handle_pool_size(),
            connect_pool_size: default_connect_pool_size(),
            connect_timer_resolution_ms: default_connect_timer_resolution_ms(),
            write_pool_size: default_write_pool_size(),
            shutdown_pool_size: default_shutdown_pool_size(),
            stream_read_buffer_size: default_stream_read_buffer_size(),
            tcp_listen_backlog: default_tcp_listen_backlog(),
        }
    }
}

impl ReactorConfig {
    /// Load configuration from a TOML file, clamping out-of-range values.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        let config: ReactorConfig = toml::from_str(&raw).map_err(ConfigError::Parse)?;
        Ok(config.clamped())
    }

    /// Clamp every field into its supported range.
    pub fn clamped(mut self) -> Self {
        self.handle_pool_size = self.handle_pool_size.min(65_536);
        self.connect_pool_size = self.connect_pool_size.min(512);
        self.connect_timer_resolution_ms = self.connect_timer_resolution_ms.clamp(1, 60_000);
        self.write_pool_size = self.write_pool_size.min(4_096);
        self.shutdown_pool_size = self.shutdown_pool_size.min(512);
        self.stream_read_buffer_size = self.stream_read_buffer_size.clamp(2_048, 16 * 1024 * 1024);
        self.tcp_listen_backlog = self.tcp_listen_backlog.clamp(5, 2_000);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReactorConfig::default();
        assert_eq!(config.handle_pool_size, 256);
        assert_eq!(config.connect_timer_resolution_ms, 100);
        assert_eq!(config.stream_read_buffer_size, 256 * 1024);
    }

    #[test]
    fn test_partial_toml() {
        let config: ReactorConfig =
            toml::from_str("stream_read_buffer_size = 4096\n").unwrap();
        assert_eq!(config.stream_read_buffer_size, 4096);
        assert_eq!(config.handle_pool_size, 256);
    }

    #[test]
    fn test_clamping() {
        let config: ReactorConfig = toml::from_str(
            "connect_timer_resolution_ms = 0\n\
             stream_read_buffer_size = 1\n\
             tcp_listen_backlog = 100000\n",
        )
        .unwrap();
        let config = config.clamped();
        assert_eq!(config.connect_timer_resolution_ms, 1);
        assert_eq!(config.stream_read_buffer_size, 2_048);
        assert_eq!(config.tcp_listen_backlog, 2_000);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(toml::from_str::<ReactorConfig>("bogus = 1\n").is_err());
    }
}
