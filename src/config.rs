//! Cache configuration with environment overrides.

use std::env;
use std::num::ParseIntError;
use thiserror::Error;

/// Idle slots kept by default before the oldest is evicted.
pub const DEFAULT_SIZE_LIMIT: usize = 100;

/// Environment variable overriding `CacheConfig::size_limit`.
pub const SIZE_LIMIT_ENV: &str = "SLOT_CACHE_SIZE_LIMIT";

/// Errors raised while reading cache configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The variable is set but is not a non-negative integer.
    #[error("invalid value {value:?} for {var}: expected a non-negative integer")]
    InvalidSizeLimit {
        var: String,
        value: String,
        #[source]
        source: ParseIntError,
    },

    /// The variable is set but is not valid unicode.
    #[error("{var} is set but is not valid unicode")]
    NotUnicode { var: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of idle (unreferenced) slots retained. Slots with
    /// live handles never count against it. 0 evicts eagerly.
    pub size_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size_limit: DEFAULT_SIZE_LIMIT,
        }
    }
}

impl CacheConfig {
    pub fn with_size_limit(size_limit: usize) -> Self {
        Self { size_limit }
    }

    /// Defaults overridden by `SLOT_CACHE_SIZE_LIMIT` when set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    /// Apply `SLOT_CACHE_SIZE_LIMIT` on top of `self`. An unset variable
    /// leaves the value unchanged; a malformed one is an error.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_env_var(SIZE_LIMIT_ENV)
    }

    /// Like `with_env_overrides`, reading the limit from `var`.
    pub fn with_env_var(mut self, var: &str) -> Result<Self, ConfigError> {
        match env::var(var) {
            Ok(raw) => self.size_limit = parse_size_limit(var, &raw)?,
            Err(env::VarError::NotPresent) => {}
            Err(env::VarError::NotUnicode(_)) => {
                return Err(ConfigError::NotUnicode {
                    var: var.to_string(),
                })
            }
        }
        Ok(self)
    }
}

fn parse_size_limit(var: &str, raw: &str) -> Result<usize, ConfigError> {
    raw.trim()
        .parse::<usize>()
        .map_err(|source| ConfigError::InvalidSizeLimit {
            var: var.to_string(),
            value: raw.to_string(),
            source,
        })
}
