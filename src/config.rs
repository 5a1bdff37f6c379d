//! Recognized configuration options: a `toml` file at a fixed default path,
//! with an explicit path override for tests.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::constants::{RDMA_BUF_THRESHOLD_RANGE, SEND_BUF_SZ, XIO_IOVLEN};

const DEFAULT_CONFIG_PATH: &str = "/etc/rdma-conn-core/config.toml";

/// Errors raised while loading or validating [`Options`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the config file.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse the config file as TOML.
    #[error("parse error: {0}")]
    ParseError(#[from] toml::de::Error),

    /// `rdma_buf_threshold` fell outside `[1024, 65536]`.
    #[error("rdma_buf_threshold {0} out of range [1024, 65536]")]
    ThresholdOutOfRange(usize),

    /// Options are read-only once a `Context` has opened them.
    #[error("options are read-only after first open")]
    ReadOnly,
}

/// The flat configuration record from spec §6.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Bind an explicit mempool to new `Context`s.
    pub enable_mem_pool: bool,
    /// Reserved; no in-core effect.
    pub enable_dma_latency: bool,
    /// Size boundary between inline and RDMA-transferred messages.
    pub rdma_buf_threshold: usize,
    /// Upper bound on receive scatter-gather-entry count.
    pub max_in_iovsz: usize,
    /// Upper bound on send scatter-gather-entry count.
    pub max_out_iovsz: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            enable_mem_pool: true,
            enable_dma_latency: false,
            rdma_buf_threshold: SEND_BUF_SZ,
            max_in_iovsz: XIO_IOVLEN,
            max_out_iovsz: XIO_IOVLEN,
        }
    }
}

impl Options {
    /// Validates the `rdma_buf_threshold` range invariant from spec §6.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !RDMA_BUF_THRESHOLD_RANGE.contains(&self.rdma_buf_threshold) {
            return Err(ConfigError::ThresholdOutOfRange(self.rdma_buf_threshold));
        }
        Ok(())
    }
}

/// Tracks the `rdma_buf_attr_rdonly` latch from spec §6: options become
/// read-only once a `Context` has opened with them.
#[derive(Debug, Default)]
pub struct OptionsGuard {
    opened: AtomicBool,
    options: Options,
}

impl OptionsGuard {
    /// Wraps a validated option set, initially writable.
    pub fn new(options: Options) -> Result<Self, ConfigError> {
        options.validate()?;
        Ok(Self {
            opened: AtomicBool::new(false),
            options,
        })
    }

    /// Returns the current options.
    pub fn get(&self) -> Options {
        self.options
    }

    /// Marks the options read-only. Called once, the first time a `Context` opens.
    pub fn mark_opened(&self) {
        self.opened.store(true, Ordering::SeqCst);
    }

    /// Replaces the options, refusing if already opened (spec §6 `rdma_buf_attr_rdonly`).
    pub fn set(&mut self, options: Options) -> Result<(), ConfigError> {
        if self.opened.load(Ordering::SeqCst) {
            return Err(ConfigError::ReadOnly);
        }
        options.validate()?;
        self.options = options;
        Ok(())
    }
}

/// Loads [`Options`] from TOML files.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads from the default path.
    pub fn load_default() -> Result<Options, ConfigError> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    /// Loads from an explicit path.
    pub fn load_from_path(path: &str) -> Result<Options, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let options: Options = toml::from_str(&content)?;
        options.validate()?;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Options::default().validate().is_ok());
    }

    #[test]
    fn threshold_out_of_range_rejected() {
        let opts = Options {
            rdma_buf_threshold: 100,
            ..Options::default()
        };
        assert!(matches!(
            opts.validate(),
            Err(ConfigError::ThresholdOutOfRange(100))
        ));
    }

    #[test]
    fn read_only_after_open() {
        let guard = OptionsGuard::new(Options::default()).unwrap();
        guard.mark_opened();
        let mut guard = guard;
        assert!(matches!(
            guard.set(Options::default()),
            Err(ConfigError::ReadOnly)
        ));
    }
}
