//! reservoir.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::duration::parse_duration;
use crate::error::{ConfigError, ConfigResult};
use crate::types::IsolationLevel;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservoirConfig {
    pub source: SourceSettings,
    pub pool: Option<PoolSettings>,
}

/// Target identity and connection defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceSettings {
    pub driver: String,
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub auto_commit: Option<bool>,
    pub isolation: Option<IsolationLevel>,
    pub network_timeout: Option<String>,
    pub properties: Option<BTreeMap<String, String>>,
}

/// Pool limits and health-check policy. Unset fields fall back to the
/// pool defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolSettings {
    pub max_active: Option<usize>,
    pub max_idle: Option<usize>,
    pub max_checkout_time: Option<String>,
    pub time_to_wait: Option<String>,
    pub local_bad_connection_tolerance: Option<usize>,
    pub ping_enabled: Option<bool>,
    pub ping_query: Option<String>,
    pub ping_connections_not_used_for: Option<String>,
    pub drain_timeout: Option<String>,
}

impl ReservoirConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> ConfigResult<Self> {
        let config: ReservoirConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check value ranges and duration syntax without building a pool.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.source.url.trim().is_empty() {
            return Err(ConfigError::Invalid("source.url must not be empty".to_string()));
        }
        if let Some(timeout) = &self.source.network_timeout {
            parse_duration("source.network_timeout", timeout)?;
        }

        let Some(pool) = &self.pool else {
            return Ok(());
        };
        if pool.max_active == Some(0) {
            return Err(ConfigError::Invalid("pool.max_active must be at least 1".to_string()));
        }
        let durations = [
            ("pool.max_checkout_time", &pool.max_checkout_time),
            ("pool.time_to_wait", &pool.time_to_wait),
            ("pool.ping_connections_not_used_for", &pool.ping_connections_not_used_for),
            ("pool.drain_timeout", &pool.drain_timeout),
        ];
        for (field, value) in durations {
            if let Some(value) = value {
                parse_duration(field, value)?;
            }
        }
        if pool.ping_enabled == Some(true)
            && pool.ping_query.as_deref().is_none_or(|q| q.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "pool.ping_query is required when pool.ping_enabled = true".to_string(),
            ));
        }
        Ok(())
    }

    /// Scaffold a minimal reservoir.toml pointing at `url`.
    pub fn scaffold(driver: &str, url: &str) -> Self {
        ReservoirConfig {
            source: SourceSettings {
                driver: driver.to_string(),
                url: url.to_string(),
                username: None,
                password: None,
                auto_commit: Some(false),
                isolation: None,
                network_timeout: None,
                properties: None,
            },
            pool: Some(PoolSettings {
                max_active: Some(10),
                max_idle: Some(5),
                max_checkout_time: Some("20s".to_string()),
                time_to_wait: Some("20s".to_string()),
                local_bad_connection_tolerance: Some(3),
                ping_enabled: Some(false),
                ping_query: None,
                ping_connections_not_used_for: Some("0ms".to_string()),
                drain_timeout: Some("30s".to_string()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FULL: &str = r#"
[source]
driver = "memory"
url = "mem://orders"
username = "app"
password = "secret"
auto_commit = false
isolation = "read-committed"
network_timeout = "5s"

[source.properties]
application_name = "reservoir"

[pool]
max_active = 4
max_idle = 2
max_checkout_time = "250ms"
time_to_wait = "1s"
ping_enabled = true
ping_query = "SELECT 1"
ping_connections_not_used_for = "0ms"
"#;

    #[test]
    fn test_parse_minimal() {
        let toml_str = r#"
[source]
driver = "memory"
url = "mem://db"
"#;
        let config = ReservoirConfig::parse(toml_str).unwrap();
        assert_eq!(config.source.url, "mem://db");
        assert!(config.pool.is_none());
    }

    #[test]
    fn test_parse_full() {
        let config = ReservoirConfig::parse(FULL).unwrap();
        assert_eq!(config.source.username.as_deref(), Some("app"));
        assert_eq!(config.source.isolation, Some(IsolationLevel::ReadCommitted));
        let props = config.source.properties.as_ref().unwrap();
        assert_eq!(props.get("application_name").map(String::as_str), Some("reservoir"));
        let pool = config.pool.unwrap();
        assert_eq!(pool.max_active, Some(4));
        assert_eq!(pool.ping_query.as_deref(), Some("SELECT 1"));
    }

    #[test]
    fn test_scaffold_round_trips() {
        let config = ReservoirConfig::scaffold("memory", "mem://scaffold");
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("mem://scaffold"));
        let reparsed = ReservoirConfig::parse(&toml_str).unwrap();
        assert_eq!(reparsed.pool.unwrap().max_idle, Some(5));
    }

    #[test]
    fn test_rejects_empty_url() {
        let err = ReservoirConfig::parse("[source]\ndriver = \"memory\"\nurl = \"\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_zero_max_active() {
        let toml_str = "[source]\ndriver = \"m\"\nurl = \"mem://x\"\n[pool]\nmax_active = 0\n";
        assert!(ReservoirConfig::parse(toml_str).is_err());
    }

    #[test]
    fn test_rejects_bad_duration() {
        let toml_str = "[source]\ndriver = \"m\"\nurl = \"mem://x\"\n[pool]\ntime_to_wait = \"forever\"\n";
        let err = ReservoirConfig::parse(toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDuration { field: "pool.time_to_wait", .. }));
    }

    #[test]
    fn test_ping_enabled_requires_query() {
        let toml_str = "[source]\ndriver = \"m\"\nurl = \"mem://x\"\n[pool]\nping_enabled = true\n";
        assert!(ReservoirConfig::parse(toml_str).is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();
        let config = ReservoirConfig::from_file(file.path()).unwrap();
        assert_eq!(config.source.driver, "memory");
    }

    #[test]
    fn test_from_missing_file() {
        let err = ReservoirConfig::from_file(Path::new("/nonexistent/reservoir.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
