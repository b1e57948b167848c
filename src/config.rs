//! Transfer configuration.
//!
//! Loaded from TOML (`~/.config/zmx/config.toml` by default); every field
//! has a default so a partial file is fine.

use crate::error::{Result, ZmodemError};
use crate::zmodem::protocol::MAX_SUBPACKET_LEN;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// How long one wait for a header may take
    pub header_timeout_ms: u64,
    /// Granularity of cancellation checks while waiting
    pub poll_interval_ms: u64,
    /// Resends of a request before a wait is given up
    pub max_retries: u32,
    /// Framing errors tolerated within one wait
    pub max_errors: u32,
    /// Payload bytes per data sub-packet
    pub chunk_size: usize,
    /// Negotiate 32-bit CRCs when the peer supports them
    pub use_crc32: bool,
    /// Ask the peer to escape all control characters
    pub escape_control: bool,
    /// Continue partially received files / request continuation when sending
    pub resume: bool,
    /// Print `rz\r` before the first ZRQINIT so a shell starts the receiver
    pub send_rz_command: bool,
    /// Wait for the final ZFIN / "OO" exchange
    pub finish_timeout_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            header_timeout_ms: 10_000,
            poll_interval_ms: 100,
            max_retries: 10,
            max_errors: 10,
            chunk_size: 1024,
            use_crc32: true,
            escape_control: false,
            resume: false,
            send_rz_command: true,
            finish_timeout_ms: 2_000,
        }
    }
}

impl TransferConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ZmodemError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("zmx/config.toml")
    }

    /// Load from the default path if it exists
    pub fn load_or_default() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.header_timeout_ms == 0 || self.poll_interval_ms == 0 {
            return Err(ZmodemError::Config("timeouts must be non-zero".to_string()));
        }
        if self.finish_timeout_ms == 0 {
            return Err(ZmodemError::Config(
                "finish timeout must be non-zero".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(ZmodemError::Config("chunk size must be non-zero".to_string()));
        }
        if self.max_retries == 0 {
            return Err(ZmodemError::Config("max_retries must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn header_timeout(&self) -> Duration {
        Duration::from_millis(self.header_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn finish_timeout(&self) -> Duration {
        Duration::from_millis(self.finish_timeout_ms)
    }

    /// Chunk size clamped to the largest sub-packet peers accept
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.clamp(1, MAX_SUBPACKET_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = TransferConfig::default();
        assert_eq!(config.chunk_size, 1024);
        assert!(config.use_crc32);
        assert!(!config.resume);
        assert!(config.validate().is_ok());
        assert_eq!(config.header_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_config_validation() {
        let mut config = TransferConfig::default();
        config.chunk_size = 0;
        assert!(config.validate().is_err());

        config.chunk_size = 1024;
        config.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_chunk_size_clamped() {
        let config = TransferConfig {
            chunk_size: 1 << 20,
            ..Default::default()
        };
        assert_eq!(config.effective_chunk_size(), MAX_SUBPACKET_LEN);
    }

    #[test]
    fn test_partial_toml_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "resume = true\nchunk_size = 4096\n").unwrap();

        let config = TransferConfig::from_file(&path).unwrap();
        assert!(config.resume);
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.max_retries, 10);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "chunk_size = \"big\"\n").unwrap();

        assert!(matches!(
            TransferConfig::from_file(&path),
            Err(ZmodemError::Config(_))
        ));
    }
}
