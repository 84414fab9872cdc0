use std::env;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub log_level: String,
    pub fees: FeeConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite file
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeConfig {
    pub currency: String,
    pub receipt_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_capacity: u64,
    pub ttl_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                path: "bursar.db".to_string(),
            },
            log_level: "info".to_string(),
            fees: FeeConfig {
                currency: "USD".to_string(),
                receipt_prefix: "RCP".to_string(),
            },
            cache: CacheConfig {
                max_capacity: 1000,
                ttl_secs: 300,
            },
        }
    }
}

impl AppConfig {
    /// Defaults overridden by `BURSAR_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|name| env::var(name).ok())
    }

    /// Apply overrides from any variable source. Unparseable numbers keep the
    /// current value.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("BURSAR_DATABASE") {
            self.database.path = v;
        }
        if let Some(v) = lookup("BURSAR_LOG") {
            self.log_level = v;
        }
        if let Some(v) = lookup("BURSAR_CURRENCY") {
            self.fees.currency = v;
        }
        if let Some(v) = lookup("BURSAR_RECEIPT_PREFIX") {
            self.fees.receipt_prefix = v;
        }
        if let Some(v) = lookup("BURSAR_CACHE_CAPACITY") {
            self.cache.max_capacity = v.parse().unwrap_or(self.cache.max_capacity);
        }
        if let Some(v) = lookup("BURSAR_CACHE_TTL_SECS") {
            self.cache.ttl_secs = v.parse().unwrap_or(self.cache.ttl_secs);
        }
        self
    }

    pub fn database_url(&self) -> String {
        database_url(&self.database.path)
    }

    pub fn existing_database_url(&self) -> String {
        existing_database_url(&self.database.path)
    }
}

/// SQLite URL for a file path, creating the file if it does not exist.
pub fn database_url(path: &str) -> String {
    format!("{}?mode=rwc", existing_database_url(path))
}

/// SQLite URL for a file path that must already exist.
pub fn existing_database_url(path: &str) -> String {
    format!("sqlite:{}", path)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.database.path, "bursar.db");
        assert_eq!(config.fees.receipt_prefix, "RCP");
        assert_eq!(config.cache.max_capacity, 1000);
        assert_eq!(config.cache.ttl_secs, 300);
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("BURSAR_DATABASE", "/tmp/school.db"),
            ("BURSAR_RECEIPT_PREFIX", "SCH"),
            ("BURSAR_CACHE_TTL_SECS", "30"),
            ("BURSAR_CACHE_CAPACITY", "lots"),
        ]
        .into_iter()
        .collect();

        let config =
            AppConfig::default().with_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.database.path, "/tmp/school.db");
        assert_eq!(config.fees.receipt_prefix, "SCH");
        assert_eq!(config.cache.ttl_secs, 30);
        assert_eq!(config.cache.max_capacity, 1000);
        assert_eq!(config.fees.currency, "USD");
    }

    #[test]
    fn test_database_url() {
        assert_eq!(database_url("school.db"), "sqlite:school.db?mode=rwc");
        assert_eq!(existing_database_url("school.db"), "sqlite:school.db");
    }
}
