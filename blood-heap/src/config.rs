//! Heap Configuration
//!
//! Sizing policy for the heap-region manager. Configuration can be set
//! programmatically or loaded from environment variables.
//!
//! All sizes held by [`HeapConfig`] are in words. Environment variables are
//! given in bytes and rounded down to whole words.
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `BLOOD_HEAP_SPACE_SIZE` | Default nursery region size in bytes | 1048576 (1MB) |
//! | `BLOOD_HEAP_MINOR_GC_SPACE` | Nursery occupancy that triggers a minor GC, in bytes | 16777216 (16MB) |
//! | `BLOOD_HEAP_RESERVED_SPACE` | Space held back for native stacks and heap, in bytes | 0 |
//! | `BLOOD_HEAP_CODE_SPACE_SIZE` | Minimum code region size in bytes | 524288 (512KB) |
//! | `BLOOD_HEAP_SIZE` | Total space budgeted for the heap in bytes (0 = unknown) | 0 |
//! | `BLOOD_HEAP_EXECUTABLE_CODE` | Map code regions executable ("true"/"false") | true |
//! | `BLOOD_HEAP_CHECK_OBJECTS` | Write-protect immutable regions outside GC | false |
//!
//! # Example
//!
//! ```rust
//! use blood_heap::config::HeapConfig;
//!
//! let config = HeapConfig::builder()
//!     .default_space_size(64 * 1024)
//!     .space_before_minor_gc(1024 * 1024)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.default_space_size, 64 * 1024);
//! ```

use std::env;

use thiserror::Error;

use crate::WORD;

/// Default nursery region size: 1MB.
pub const DEFAULT_SPACE_BYTES: usize = 1024 * 1024;

/// Default minor-GC threshold: 16MB of nursery.
pub const DEFAULT_MINOR_GC_BYTES: usize = 16 * 1024 * 1024;

/// Default minimum code region size: 512KB.
pub const DEFAULT_CODE_SPACE_BYTES: usize = 512 * 1024;

/// Configuration for a [`MemMgr`](crate::MemMgr).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    /// Size of a standard nursery region in words.
    pub default_space_size: usize,

    /// Nursery occupancy in words above which no new nursery region is
    /// created and the caller must collect.
    pub space_before_minor_gc: usize,

    /// Words temporarily reserved while a new local region is mapped.
    /// 0 disables the reservation.
    pub reserved_space: usize,

    /// Minimum size of a newly mapped code region in words.
    pub code_space_size: usize,

    /// Total space budgeted for the heap in words, used for reporting.
    /// 0 means unknown.
    pub heap_size: usize,

    /// Map code regions with execute permission.
    /// Default: true. Interpreted runtimes do not need it.
    pub executable_code: bool,

    /// Write-protect immutable local regions outside collection.
    /// Default: false.
    pub check_objects: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            default_space_size: DEFAULT_SPACE_BYTES / WORD,
            space_before_minor_gc: DEFAULT_MINOR_GC_BYTES / WORD,
            reserved_space: 0,
            code_space_size: DEFAULT_CODE_SPACE_BYTES / WORD,
            heap_size: 0,
            executable_code: true,
            check_objects: false,
        }
    }
}

impl HeapConfig {
    /// Create a new builder for HeapConfig.
    pub fn builder() -> HeapConfigBuilder {
        HeapConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are not set, or that hold values which would not
    /// validate, leave the default in place.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(words) = parse_env_words("BLOOD_HEAP_SPACE_SIZE") {
            if words > 0 {
                config.default_space_size = words;
            }
        }

        if let Some(words) = parse_env_words("BLOOD_HEAP_MINOR_GC_SPACE") {
            if words > 0 {
                config.space_before_minor_gc = words;
            }
        }

        if let Some(words) = parse_env_words("BLOOD_HEAP_RESERVED_SPACE") {
            config.reserved_space = words;
        }

        if let Some(words) = parse_env_words("BLOOD_HEAP_CODE_SPACE_SIZE") {
            if words > 1 {
                config.code_space_size = words;
            }
        }

        if let Some(words) = parse_env_words("BLOOD_HEAP_SIZE") {
            config.heap_size = words;
        }

        if let Some(val) = parse_env_bool("BLOOD_HEAP_EXECUTABLE_CODE") {
            config.executable_code = val;
        }

        if let Some(val) = parse_env_bool("BLOOD_HEAP_CHECK_OBJECTS") {
            config.check_objects = val;
        }

        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_space_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "default_space_size".into(),
                message: "must be at least 1 word".into(),
            });
        }

        if self.space_before_minor_gc == 0 {
            return Err(ConfigError::InvalidValue {
                field: "space_before_minor_gc".into(),
                message: "must be at least 1 word".into(),
            });
        }

        if self.code_space_size < 2 {
            return Err(ConfigError::InvalidValue {
                field: "code_space_size".into(),
                message: "must hold at least a length word and one word of code".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
}

/// Builder for HeapConfig.
#[derive(Debug, Clone, Default)]
pub struct HeapConfigBuilder {
    config: HeapConfig,
}

impl HeapConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the standard nursery region size in words.
    pub fn default_space_size(mut self, words: usize) -> Self {
        self.config.default_space_size = words;
        self
    }

    /// Set the nursery occupancy ceiling in words.
    pub fn space_before_minor_gc(mut self, words: usize) -> Self {
        self.config.space_before_minor_gc = words;
        self
    }

    /// Set the reserved space in words.
    pub fn reserved_space(mut self, words: usize) -> Self {
        self.config.reserved_space = words;
        self
    }

    /// Set the minimum code region size in words.
    pub fn code_space_size(mut self, words: usize) -> Self {
        self.config.code_space_size = words;
        self
    }

    /// Set the heap budget in words.
    pub fn heap_size(mut self, words: usize) -> Self {
        self.config.heap_size = words;
        self
    }

    /// Map code regions executable or not.
    pub fn executable_code(mut self, enabled: bool) -> Self {
        self.config.executable_code = enabled;
        self
    }

    /// Enable write protection of immutable regions outside GC.
    pub fn check_objects(mut self, enabled: bool) -> Self {
        self.config.check_objects = enabled;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<HeapConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build without validation.
    pub fn build_unchecked(self) -> HeapConfig {
        self.config
    }
}

/// Parse a byte count from an environment variable and convert to words.
fn parse_env_words(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|v| parse_bytes(&v)).map(|bytes| bytes / WORD)
}

/// Parse a byte count, accepting an optional `k`/`m`/`g` suffix.
fn parse_bytes(value: &str) -> Option<usize> {
    let value = value.trim();
    let (digits, multiplier) = match value.char_indices().last() {
        Some((i, 'k' | 'K')) => (&value[..i], 1024),
        Some((i, 'm' | 'M')) => (&value[..i], 1024 * 1024),
        Some((i, 'g' | 'G')) => (&value[..i], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    digits.trim().parse::<usize>().ok()?.checked_mul(multiplier)
}

/// Parse a boolean from an environment variable.
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|v| match v.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HeapConfig::default();
        assert_eq!(config.default_space_size * WORD, DEFAULT_SPACE_BYTES);
        assert_eq!(config.space_before_minor_gc * WORD, DEFAULT_MINOR_GC_BYTES);
        assert_eq!(config.reserved_space, 0);
        assert!(config.executable_code);
        assert!(!config.check_objects);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = HeapConfig::builder()
            .default_space_size(1024)
            .space_before_minor_gc(4096)
            .reserved_space(16)
            .code_space_size(64)
            .heap_size(1 << 20)
            .executable_code(false)
            .check_objects(true)
            .build()
            .unwrap();

        assert_eq!(config.default_space_size, 1024);
        assert_eq!(config.space_before_minor_gc, 4096);
        assert_eq!(config.reserved_space, 16);
        assert_eq!(config.code_space_size, 64);
        assert_eq!(config.heap_size, 1 << 20);
        assert!(!config.executable_code);
        assert!(config.check_objects);
    }

    #[test]
    fn test_validation_errors() {
        let result = HeapConfig::builder().default_space_size(0).build();
        assert!(matches!(result, Err(ConfigError::InvalidValue { ref field, .. }) if field == "default_space_size"));

        let result = HeapConfig::builder().space_before_minor_gc(0).build();
        assert!(result.is_err());

        let result = HeapConfig::builder().code_space_size(1).build();
        assert!(result.is_err());

        // Unchecked builds skip validation.
        let config = HeapConfig::builder().default_space_size(0).build_unchecked();
        assert_eq!(config.default_space_size, 0);
    }

    #[test]
    fn test_parse_bytes() {
        assert_eq!(parse_bytes("4096"), Some(4096));
        assert_eq!(parse_bytes("64k"), Some(64 * 1024));
        assert_eq!(parse_bytes("2M"), Some(2 * 1024 * 1024));
        assert_eq!(parse_bytes(" 1g "), Some(1024 * 1024 * 1024));
        assert_eq!(parse_bytes("lots"), None);
        assert_eq!(parse_bytes(""), None);
    }

    #[test]
    fn test_from_env() {
        env::set_var("BLOOD_HEAP_SPACE_SIZE", "256k");
        env::set_var("BLOOD_HEAP_EXECUTABLE_CODE", "off");
        env::set_var("BLOOD_HEAP_MINOR_GC_SPACE", "not-a-number");

        let config = HeapConfig::from_env();
        assert_eq!(config.default_space_size, 256 * 1024 / WORD);
        assert!(!config.executable_code);
        assert_eq!(config.space_before_minor_gc, DEFAULT_MINOR_GC_BYTES / WORD);

        env::remove_var("BLOOD_HEAP_SPACE_SIZE");
        env::remove_var("BLOOD_HEAP_EXECUTABLE_CODE");
        env::remove_var("BLOOD_HEAP_MINOR_GC_SPACE");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            field: "code_space_size".into(),
            message: "too small".into(),
        };
        assert_eq!(err.to_string(), "invalid configuration for 'code_space_size': too small");
    }
}
