//! Storage configuration.
//!
//! Configuration is loaded from environment variables, each falling back to
//! a default when unset.
//!
//! # Environment Variables
//!
//! - `CONTRAIL_DATA_DIRECTORY`: Directory used by file-backed storage (default: `./data`)
//! - `CONTRAIL_ROOT_PATH`: Identifier of the root folder (default: `contrail/storage/root`)
//! - `CONTRAIL_PAGE_SIZE`: Default B-tree page size (default: `200`)
//! - `CONTRAIL_LEASE_TIMEOUT_SECS`: Lock lease in seconds (default: `1800`)
//! - `CONTRAIL_CACHE_CAPACITY`: Identity cache capacity (default: `1000`)
//!
//! # Invariants
//!
//! - `page_size` is even and at least 2
//! - `cache_capacity` is greater than zero
//! - `root_path` is a valid, non-empty identifier path

use std::path::PathBuf;
use std::time::Duration;

use crate::types::Identifier;

const DATA_DIRECTORY_VAR: &str = "CONTRAIL_DATA_DIRECTORY";
const ROOT_PATH_VAR: &str = "CONTRAIL_ROOT_PATH";
const PAGE_SIZE_VAR: &str = "CONTRAIL_PAGE_SIZE";
const LEASE_TIMEOUT_VAR: &str = "CONTRAIL_LEASE_TIMEOUT_SECS";
const CACHE_CAPACITY_VAR: &str = "CONTRAIL_CACHE_CAPACITY";

/// Storage system configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Directory where file-backed storage keeps its data.
    pub data_directory: PathBuf,
    /// Path of the root folder that anchors all revision metadata.
    pub root_path: String,
    /// Page size for B-trees created without an explicit one.
    pub page_size: usize,
    /// Lease after which a held lock may be broken by a waiter.
    pub lease_timeout: Duration,
    /// Number of decoded objects kept in the identity cache.
    pub cache_capacity: usize,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable is missing.
    MissingEnvVar(String),
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingEnvVar(name) => {
                write!(f, "missing required environment variable: {name}")
            }
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_directory: PathBuf::from(Self::DEFAULT_DATA_DIRECTORY),
            root_path: Self::DEFAULT_ROOT_PATH.to_string(),
            page_size: Self::DEFAULT_PAGE_SIZE,
            lease_timeout: Duration::from_secs(Self::DEFAULT_LEASE_TIMEOUT_SECS),
            cache_capacity: Self::DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl StorageConfig {
    /// Default data directory.
    pub const DEFAULT_DATA_DIRECTORY: &'static str = "./data";
    /// Default root folder path.
    pub const DEFAULT_ROOT_PATH: &'static str = "contrail/storage/root";
    /// Default B-tree page size.
    pub const DEFAULT_PAGE_SIZE: usize = 200;
    /// Default lock lease: thirty minutes.
    pub const DEFAULT_LEASE_TIMEOUT_SECS: u64 = 30 * 60;
    /// Default identity cache capacity.
    pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to a value that cannot be
    /// parsed or violates one of the invariants above.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_directory = std::env::var(DATA_DIRECTORY_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(Self::DEFAULT_DATA_DIRECTORY));
        let root_path = Self::load_root_path()?;
        let page_size = load_number(PAGE_SIZE_VAR, Self::DEFAULT_PAGE_SIZE)?;
        let lease_secs = load_number(LEASE_TIMEOUT_VAR, Self::DEFAULT_LEASE_TIMEOUT_SECS)?;
        let cache_capacity = load_number(CACHE_CAPACITY_VAR, Self::DEFAULT_CACHE_CAPACITY)?;

        let config = Self {
            data_directory,
            root_path,
            page_size,
            lease_timeout: Duration::from_secs(lease_secs),
            cache_capacity,
        };
        config.validate()?;
        Ok(config)
    }

    fn load_root_path() -> Result<String, ConfigError> {
        let Ok(value) = std::env::var(ROOT_PATH_VAR) else {
            return Ok(Self::DEFAULT_ROOT_PATH.to_string());
        };
        Identifier::new(&value)
            .map(|id| id.as_str().to_string())
            .map_err(|e| ConfigError::InvalidValue {
                name: ROOT_PATH_VAR.to_string(),
                message: e.to_string(),
            })
    }

    /// Check the invariants listed in the module documentation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the offending variable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size < 2 || self.page_size % 2 != 0 {
            return Err(ConfigError::InvalidValue {
                name: PAGE_SIZE_VAR.to_string(),
                message: format!("{} must be an even number of at least 2", self.page_size),
            });
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                name: CACHE_CAPACITY_VAR.to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if Identifier::new(&self.root_path).is_err() {
            return Err(ConfigError::InvalidValue {
                name: ROOT_PATH_VAR.to_string(),
                message: format!("'{}' is not a valid identifier", self.root_path),
            });
        }
        Ok(())
    }

    /// The root folder identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if `root_path` is not a valid identifier.
    pub fn root_id(&self) -> Result<Identifier, ConfigError> {
        Identifier::new(&self.root_path).map_err(|e| ConfigError::InvalidValue {
            name: ROOT_PATH_VAR.to_string(),
            message: e.to_string(),
        })
    }
}

fn load_number<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{value}' is not a valid number"),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = StorageConfig::default();
        assert_eq!(config.data_directory, PathBuf::from("./data"));
        assert_eq!(config.root_path, "contrail/storage/root");
        assert_eq!(config.page_size, 200);
        assert_eq!(config.lease_timeout, Duration::from_secs(1800));
        assert_eq!(config.cache_capacity, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_odd_page_size_is_invalid() {
        let config = StorageConfig {
            page_size: 7,
            ..StorageConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { name, .. }) if name == PAGE_SIZE_VAR
        ));
    }

    #[test]
    fn test_zero_cache_capacity_is_invalid() {
        let config = StorageConfig {
            cache_capacity: 0,
            ..StorageConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_root_id() {
        let config = StorageConfig {
            root_path: "/db//root/".to_string(),
            ..StorageConfig::default()
        };
        assert_eq!(config.root_id().expect("root id").as_str(), "db/root");

        let empty = StorageConfig {
            root_path: "/".to_string(),
            ..StorageConfig::default()
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_config_error_display_invalid() {
        let error = ConfigError::InvalidValue {
            name: "TEST_VAR".to_string(),
            message: "bad value".to_string(),
        };
        assert_eq!(error.to_string(), "invalid value for TEST_VAR: bad value");
    }
}
