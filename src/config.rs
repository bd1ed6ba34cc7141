// ABOUTME: Relay configuration knobs with the defaults the service binary ships with

use std::time::Duration;

use thiserror::Error;

use crate::net::ListenAddr;

/// Default size of one pool frame: 1 MiB.
pub const DEFAULT_FRAME_SIZE: usize = 1024 * 1024;

/// Default number of frames in the pool.
pub const DEFAULT_FRAME_COUNT: usize = 1024;

/// Default endpoint for the input stream supplier.
pub const DEFAULT_SUPPLIER_LISTEN: &str = "unix:///tmp/bytehub.sock";

/// Default endpoint for output stream consumers.
pub const DEFAULT_CONSUMER_LISTEN: &str = "tcp://0.0.0.0:4096";

/// Default per-consumer write deadline. A consumer whose socket cannot take a
/// frame within this window is treated as failed and evicted, so one wedged
/// peer cannot stall the fan-out forever.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration error for dimensions that make no sense.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("frame size must be a positive number of bytes")]
    ZeroFrameSize,

    #[error("frame count must be a positive number of frames")]
    ZeroFrameCount,
}

/// Everything the relay needs to run.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bytes per pool frame.
    pub frame_size: usize,
    /// Number of frames in the pool. Also the capacity of the shared
    /// supplier-to-dispatcher channel and of every per-consumer inbox.
    pub frame_count: usize,
    /// Endpoint to accept the single input stream supplier on.
    pub supplier_listen: ListenAddr,
    /// Endpoint to accept output stream consumers on.
    pub consumer_listen: ListenAddr,
    /// Per-consumer write deadline; `None` disables the deadline entirely.
    pub write_timeout: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            frame_count: DEFAULT_FRAME_COUNT,
            supplier_listen: DEFAULT_SUPPLIER_LISTEN
                .parse()
                .expect("default supplier address is well-formed"),
            consumer_listen: DEFAULT_CONSUMER_LISTEN
                .parse()
                .expect("default consumer address is well-formed"),
            write_timeout: Some(DEFAULT_WRITE_TIMEOUT),
        }
    }
}

impl RelayConfig {
    /// Reject dimensions the pool cannot be built with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_size == 0 {
            return Err(ConfigError::ZeroFrameSize);
        }
        if self.frame_count == 0 {
            return Err(ConfigError::ZeroFrameCount);
        }
        Ok(())
    }

    /// Total bytes of frame memory this configuration reserves.
    pub fn total_bytes(&self) -> usize {
        self.frame_size * self.frame_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.total_bytes(), DEFAULT_FRAME_SIZE * DEFAULT_FRAME_COUNT);
    }

    #[test]
    fn zero_dimensions_are_rejected() {
        let mut config = RelayConfig::default();
        config.frame_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroFrameSize));

        config.frame_size = 1;
        config.frame_count = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroFrameCount));
    }
}
