//! Service configuration
use super::error::ContractError;
use anyhow::Context;
use std::path::PathBuf;
use tracing::info;

pub const DB_PATH_VAR: &str = "CONTRACT_APPROVAL_DB_PATH";
pub const CACHE_CAPACITY_VAR: &str = "CONTRACT_APPROVAL_CACHE_BYTES";
pub const PAGE_SIZE_VAR: &str = "CONTRACT_APPROVAL_ACTIVITY_PAGE_SIZE";
pub const MAX_PAGE_SIZE_VAR: &str = "CONTRACT_APPROVAL_ACTIVITY_MAX_PAGE_SIZE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Path to the sled database
    pub db_path: PathBuf,
    /// Page cache size in bytes
    pub cache_capacity: u64,
    /// Throw the database away on drop
    pub temporary: bool,
    /// Activity page size when a query sets no limit
    pub activity_page_size: usize,
    /// Upper bound on any requested activity page
    pub max_activity_page_size: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("contract-approval.sled"),
            cache_capacity: 64 * 1024 * 1024, // 64MB
            temporary: false,
            activity_page_size: 50,
            max_activity_page_size: 500,
        }
    }
}

impl ServiceConfig {
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: path.into(),
            ..Self::default()
        }
    }

    pub fn temporary() -> Self {
        Self {
            temporary: true,
            ..Self::default()
        }
    }

    /// Defaults overridden by `CONTRACT_APPROVAL_*` environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup(DB_PATH_VAR) {
            config.db_path = PathBuf::from(path);
        }
        if let Some(bytes) = lookup(CACHE_CAPACITY_VAR) {
            config.cache_capacity = bytes
                .parse()
                .with_context(|| format!("{CACHE_CAPACITY_VAR} is not a byte count: {bytes}"))?;
        }
        if let Some(size) = lookup(PAGE_SIZE_VAR) {
            config.activity_page_size = size
                .parse()
                .with_context(|| format!("{PAGE_SIZE_VAR} is not a number: {size}"))?;
        }
        if let Some(size) = lookup(MAX_PAGE_SIZE_VAR) {
            config.max_activity_page_size = size
                .parse()
                .with_context(|| format!("{MAX_PAGE_SIZE_VAR} is not a number: {size}"))?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.activity_page_size == 0 {
            anyhow::bail!("activity page size must be at least 1");
        }
        if self.activity_page_size > self.max_activity_page_size {
            anyhow::bail!(
                "activity page size {} exceeds the maximum {}",
                self.activity_page_size,
                self.max_activity_page_size
            );
        }
        Ok(())
    }

    /// Requested limit, defaulted and capped
    pub fn page_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.activity_page_size)
            .min(self.max_activity_page_size)
            .max(1)
    }

    pub fn open_db(&self) -> Result<sled::Db, ContractError> {
        let mut config = sled::Config::new()
            .cache_capacity(self.cache_capacity)
            .temporary(self.temporary);
        // temporary databases get a fresh path from sled
        if !self.temporary {
            config = config.path(&self.db_path);
        }
        let db = config.open()?;

        info!(path = %self.db_path.display(), temporary = self.temporary, "database opened");
        Ok(db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overrides_defaults() {
        let vars = HashMap::from([
            (DB_PATH_VAR, "/var/lib/contracts.sled"),
            (PAGE_SIZE_VAR, "20"),
        ]);
        let config =
            ServiceConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap();

        assert_eq!(config.db_path, PathBuf::from("/var/lib/contracts.sled"));
        assert_eq!(config.activity_page_size, 20);
        assert_eq!(config.max_activity_page_size, 500);
    }

    #[test]
    fn malformed_numbers_are_reported() {
        let err = ServiceConfig::from_lookup(|name| {
            (name == CACHE_CAPACITY_VAR).then(|| "lots".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains(CACHE_CAPACITY_VAR));
    }

    #[test]
    fn page_size_is_defaulted_and_capped() {
        let config = ServiceConfig::default();
        assert_eq!(config.page_size(None), 50);
        assert_eq!(config.page_size(Some(10_000)), 500);
        assert_eq!(config.page_size(Some(0)), 1);
    }

    #[test]
    fn temporary_databases_do_not_share_a_path() {
        let first = ServiceConfig::temporary().open_db().unwrap();
        let second = ServiceConfig::temporary().open_db().unwrap();
        first.insert(b"k", b"first".to_vec()).unwrap();
        assert!(second.get(b"k").unwrap().is_none());
    }

    #[test]
    fn zero_maximum_still_yields_a_page() {
        let config = ServiceConfig {
            max_activity_page_size: 0,
            ..ServiceConfig::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(config.page_size(None), 1);
        assert_eq!(config.page_size(Some(25)), 1);
    }

    #[test]
    fn inverted_page_sizes_are_rejected() {
        let config = ServiceConfig {
            activity_page_size: 600,
            ..ServiceConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
