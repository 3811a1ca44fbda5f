//! Unpooled connection source, the raw connection factory the pool sits on.
//!
//! A [`Driver`] turns a URL plus a property bag into a live
//! [`RawConnection`]. [`UnpooledSource`] owns the target identity
//! (URL, credentials, driver properties) and the per-connection defaults
//! (autocommit, isolation, network timeout), assembles the property bag for
//! each request, and configures every connection the driver hands back.
//! There is no reuse here: every call opens a new connection.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use reservoir_core::{ConfigResult, IsolationLevel, SourceSettings, parse_duration};
use tracing::debug;

use crate::error::ConnectionError;

/// Driver property bag. `user` and `password` keys carry credentials.
pub type Properties = BTreeMap<String, String>;

/// A live, unpooled connection as produced by a driver.
///
/// Every method may block for a network round trip.
pub trait RawConnection: Send + std::fmt::Debug {
    /// Whether the connection has been closed (by us or the server).
    fn is_closed(&mut self) -> Result<bool, ConnectionError>;
    fn auto_commit(&mut self) -> Result<bool, ConnectionError>;
    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<(), ConnectionError>;
    fn set_isolation(&mut self, level: IsolationLevel) -> Result<(), ConnectionError>;
    fn set_network_timeout(&mut self, timeout: Duration) -> Result<(), ConnectionError>;
    /// Execute a statement, discarding any result rows.
    fn execute(&mut self, statement: &str) -> Result<(), ConnectionError>;
    fn commit(&mut self) -> Result<(), ConnectionError>;
    fn rollback(&mut self) -> Result<(), ConnectionError>;
    /// Close the underlying transport. Idempotent.
    fn close(&mut self) -> Result<(), ConnectionError>;
}

/// Factory for raw connections, injected so the pool never touches
/// driver discovery or wire details.
pub trait Driver: Send + Sync {
    /// Open a new connection to `url` using `properties`.
    fn connect(
        &self,
        url: &str,
        properties: &Properties,
    ) -> Result<Box<dyn RawConnection>, ConnectionError>;
}

/// Roll back uncommitted work when the connection is in manual-commit mode.
pub(crate) fn rollback_if_manual(conn: &mut dyn RawConnection) -> Result<(), ConnectionError> {
    if !conn.auto_commit()? {
        conn.rollback()?;
    }
    Ok(())
}

/// Target identity and defaults applied to every new connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceConfig {
    /// Driver name (informational; the driver itself is injected).
    pub driver: String,
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Extra properties forwarded to the driver on every connect.
    pub driver_properties: Properties,
    /// Autocommit mode forced onto new connections, if set.
    pub auto_commit: Option<bool>,
    pub default_isolation: Option<IsolationLevel>,
    pub default_network_timeout: Option<Duration>,
}

impl SourceConfig {
    pub fn new(driver: &str, url: &str) -> Self {
        Self {
            driver: driver.to_string(),
            url: url.to_string(),
            ..Self::default()
        }
    }

    /// Builder method: set default credentials.
    pub fn with_credentials(self, username: &str, password: &str) -> Self {
        Self {
            username: Some(username.to_string()),
            password: Some(password.to_string()),
            ..self
        }
    }

    /// Builder method: force autocommit on or off for new connections.
    pub fn with_auto_commit(self, auto_commit: bool) -> Self {
        Self {
            auto_commit: Some(auto_commit),
            ..self
        }
    }

    /// Builder method: add one driver property.
    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.driver_properties
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Build from the `[source]` table of `reservoir.toml`.
    pub fn from_settings(settings: &SourceSettings) -> ConfigResult<Self> {
        let default_network_timeout = settings
            .network_timeout
            .as_deref()
            .map(|s| parse_duration("source.network_timeout", s))
            .transpose()?;
        Ok(Self {
            driver: settings.driver.clone(),
            url: settings.url.clone(),
            username: settings.username.clone(),
            password: settings.password.clone(),
            driver_properties: settings.properties.clone().unwrap_or_default(),
            auto_commit: settings.auto_commit,
            default_isolation: settings.isolation,
            default_network_timeout,
        })
    }
}

/// Opens a fresh, configured connection on every request.
pub struct UnpooledSource {
    config: SourceConfig,
    driver: Arc<dyn Driver>,
}

impl UnpooledSource {
    pub fn new(config: SourceConfig, driver: Arc<dyn Driver>) -> Self {
        Self { config, driver }
    }

    /// Open a connection with the configured default credentials.
    pub fn connect(&self) -> Result<Box<dyn RawConnection>, ConnectionError> {
        self.new_connection(self.config.username.as_deref(), self.config.password.as_deref())
    }

    /// Open a connection, letting caller credentials override the defaults.
    pub fn new_connection(
        &self,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Box<dyn RawConnection>, ConnectionError> {
        let properties = self.properties_for(username, password);
        let mut conn = self.driver.connect(&self.config.url, &properties)?;
        if let Err(e) = self.configure(conn.as_mut()) {
            debug!(url = %self.config.url, error = %e, "failed to configure new connection");
            let _ = conn.close();
            return Err(e);
        }
        Ok(conn)
    }

    /// Property bag for a connect call: driver properties first, then the
    /// `user` / `password` overrides when present.
    pub fn properties_for(&self, username: Option<&str>, password: Option<&str>) -> Properties {
        let mut properties = self.config.driver_properties.clone();
        if let Some(username) = username {
            properties.insert("user".to_string(), username.to_string());
        }
        if let Some(password) = password {
            properties.insert("password".to_string(), password.to_string());
        }
        properties
    }

    fn configure(&self, conn: &mut dyn RawConnection) -> Result<(), ConnectionError> {
        if let Some(timeout) = self.config.default_network_timeout {
            conn.set_network_timeout(timeout)?;
        }
        if let Some(auto_commit) = self.config.auto_commit {
            if conn.auto_commit()? != auto_commit {
                conn.set_auto_commit(auto_commit)?;
            }
        }
        if let Some(level) = self.config.default_isolation {
            conn.set_isolation(level)?;
        }
        Ok(())
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub(crate) fn config_mut(&mut self) -> &mut SourceConfig {
        &mut self.config
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn username(&self) -> Option<&str> {
        self.config.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.config.password.as_deref()
    }

    pub(crate) fn set_driver(&mut self, name: &str, driver: Arc<dyn Driver>) {
        self.config.driver = name.to_string();
        self.driver = driver;
    }
}

impl std::fmt::Debug for UnpooledSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnpooledSource")
            .field("driver", &self.config.driver)
            .field("url", &self.config.url)
            .field("username", &self.config.username)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDriver;

    fn source_with(config: SourceConfig) -> (UnpooledSource, Arc<MemoryDriver>) {
        let driver = Arc::new(MemoryDriver::new());
        (UnpooledSource::new(config, driver.clone()), driver)
    }

    #[test]
    fn properties_include_driver_properties() {
        let config = SourceConfig::new("memory", "mem://db").with_property("application_name", "svc");
        let (source, _) = source_with(config);
        let props = source.properties_for(None, None);
        assert_eq!(props.get("application_name").map(String::as_str), Some("svc"));
        assert!(!props.contains_key("user"));
    }

    #[test]
    fn caller_credentials_override_properties() {
        let config = SourceConfig::new("memory", "mem://db")
            .with_property("user", "from-props")
            .with_property("password", "p0");
        let (source, _) = source_with(config);
        let props = source.properties_for(Some("alice"), Some("s3cret"));
        assert_eq!(props.get("user").map(String::as_str), Some("alice"));
        assert_eq!(props.get("password").map(String::as_str), Some("s3cret"));
    }

    #[test]
    fn connect_uses_default_credentials() {
        let config = SourceConfig::new("memory", "mem://db").with_credentials("app", "pw");
        let (source, driver) = source_with(config);
        source.connect().unwrap();
        let opened = driver.opened();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].url(), "mem://db");
        assert_eq!(opened[0].property("user").as_deref(), Some("app"));
    }

    #[test]
    fn new_connection_applies_defaults() {
        let config = SourceConfig {
            default_isolation: Some(IsolationLevel::Serializable),
            default_network_timeout: Some(Duration::from_secs(3)),
            ..SourceConfig::new("memory", "mem://db").with_auto_commit(false)
        };
        let (source, driver) = source_with(config);
        let mut conn = source.new_connection(None, None).unwrap();
        assert!(!conn.auto_commit().unwrap());
        let state = &driver.opened()[0];
        assert_eq!(state.isolation(), Some(IsolationLevel::Serializable));
        assert_eq!(state.network_timeout(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn connect_failure_propagates_verbatim() {
        let (source, driver) = source_with(SourceConfig::new("memory", "mem://db"));
        driver.behavior().set_fail_connect(true);
        let err = source.connect().unwrap_err();
        assert_eq!(err.kind, crate::ConnectionErrorKind::Refused);
    }

    #[test]
    fn from_settings_parses_timeout() {
        let settings = SourceSettings {
            driver: "memory".to_string(),
            url: "mem://db".to_string(),
            network_timeout: Some("250ms".to_string()),
            isolation: Some(IsolationLevel::ReadCommitted),
            ..SourceSettings::default()
        };
        let config = SourceConfig::from_settings(&settings).unwrap();
        assert_eq!(config.default_network_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.default_isolation, Some(IsolationLevel::ReadCommitted));
    }

    #[test]
    fn rollback_if_manual_skips_autocommit() {
        let (source, driver) = source_with(SourceConfig::new("memory", "mem://db").with_auto_commit(true));
        let mut conn = source.connect().unwrap();
        rollback_if_manual(conn.as_mut()).unwrap();
        assert_eq!(driver.opened()[0].rollbacks(), 0);
    }
}
