//! Connection pool manager.
//!
//! Hands out [`PooledHandle`]s backed by an [`UnpooledSource`], bounded by
//! `max_active` checked-out and `max_idle` pooled connections.
//!
//! # Architecture
//!
//! ```text
//! acquire(user, password)
//!   → idle connection available      → pop oldest-returned
//!   → active < max_active            → open a new one through the source
//!   → oldest checkout is overdue     → reclaim it from its holder
//!   → otherwise                      → wait up to time_to_wait, start over
//!   → validate (ping) the candidate  → bad: count, retry; good: check out
//!
//! handle.close() / drop
//!   → release(wrapper)
//!     → healthy, idle has room, same config → rewrap into idle, wake waiters
//!     → otherwise                          → close the raw connection
//! ```
//!
//! All bookkeeping happens under one lock. The only time an acquisition
//! gives the lock up is the bounded wait. Raw connection calls made on the
//! pool's behalf (connect, rollback, probe, close) run while the lock is
//! held; lock order is always pool state, then raw connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reservoir_core::{ConfigResult, IsolationLevel, PoolSettings, ReservoirConfig, parse_duration};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::connection::{PooledConnection, PooledHandle, TypeCode};
use crate::error::{PoolError, PoolResult};
use crate::health;
use crate::source::{Driver, Properties, SourceConfig, UnpooledSource, rollback_if_manual};
use crate::state::{PoolState, PoolStats};

/// Pool limits and health-check policy.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolConfig {
    /// Maximum checked-out connections (default: 10).
    pub max_active: usize,
    /// Maximum pooled idle connections (default: 5).
    pub max_idle: usize,
    /// Checkout age after which a connection may be reclaimed (default: 20s).
    pub max_checkout_time: Duration,
    /// Bound on a single wait for a connection; the wait is retried (default: 20s).
    /// Zero waits until a connection is released, with no bound.
    pub time_to_wait: Duration,
    /// Bad connections one acquisition tolerates beyond `max_idle` (default: 3).
    pub local_bad_connection_tolerance: usize,
    /// Probe statement for health checks.
    pub ping_query: String,
    /// Whether the probe statement runs at all (default: false).
    pub ping_enabled: bool,
    /// Run the probe only on connections unused for longer than this (default: 0).
    pub ping_connections_not_used_for: Duration,
    /// How long `shutdown` waits for checked-out connections (default: 30s).
    pub drain_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active: 10,
            max_idle: 5,
            max_checkout_time: Duration::from_secs(20),
            time_to_wait: Duration::from_secs(20),
            local_bad_connection_tolerance: 3,
            ping_query: "NO PING QUERY SET".to_string(),
            ping_enabled: false,
            ping_connections_not_used_for: Duration::ZERO,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Builder method: set both connection limits.
    pub fn with_limits(self, max_active: usize, max_idle: usize) -> Self {
        Self {
            max_active,
            max_idle,
            ..self
        }
    }

    pub fn with_max_checkout_time(self, max_checkout_time: Duration) -> Self {
        Self {
            max_checkout_time,
            ..self
        }
    }

    pub fn with_time_to_wait(self, time_to_wait: Duration) -> Self {
        Self {
            time_to_wait,
            ..self
        }
    }

    pub fn with_local_bad_connection_tolerance(self, tolerance: usize) -> Self {
        Self {
            local_bad_connection_tolerance: tolerance,
            ..self
        }
    }

    /// Builder method: enable probing with `query`.
    pub fn with_ping(self, query: &str) -> Self {
        Self {
            ping_query: query.to_string(),
            ping_enabled: true,
            ..self
        }
    }

    pub fn with_ping_connections_not_used_for(self, threshold: Duration) -> Self {
        Self {
            ping_connections_not_used_for: threshold,
            ..self
        }
    }

    pub fn with_drain_timeout(self, drain_timeout: Duration) -> Self {
        Self {
            drain_timeout,
            ..self
        }
    }

    /// Build from the `[pool]` table of `reservoir.toml`; unset fields keep
    /// their defaults.
    pub fn from_settings(settings: &PoolSettings) -> ConfigResult<Self> {
        let defaults = Self::default();
        let duration = |field: &'static str, value: &Option<String>, default: Duration| {
            value
                .as_deref()
                .map(|s| parse_duration(field, s))
                .transpose()
                .map(|d| d.unwrap_or(default))
        };
        Ok(Self {
            max_active: settings.max_active.unwrap_or(defaults.max_active),
            max_idle: settings.max_idle.unwrap_or(defaults.max_idle),
            max_checkout_time: duration(
                "pool.max_checkout_time",
                &settings.max_checkout_time,
                defaults.max_checkout_time,
            )?,
            time_to_wait: duration(
                "pool.time_to_wait",
                &settings.time_to_wait,
                defaults.time_to_wait,
            )?,
            local_bad_connection_tolerance: settings
                .local_bad_connection_tolerance
                .unwrap_or(defaults.local_bad_connection_tolerance),
            ping_query: settings.ping_query.clone().unwrap_or(defaults.ping_query),
            ping_enabled: settings.ping_enabled.unwrap_or(defaults.ping_enabled),
            ping_connections_not_used_for: duration(
                "pool.ping_connections_not_used_for",
                &settings.ping_connections_not_used_for,
                defaults.ping_connections_not_used_for,
            )?,
            drain_timeout: duration(
                "pool.drain_timeout",
                &settings.drain_timeout,
                defaults.drain_timeout,
            )?,
        })
    }
}

/// Everything guarded by the pool lock.
struct Inner {
    state: PoolState,
    config: PoolConfig,
    source: UnpooledSource,
    /// Identity of connections made for the current configuration.
    expected_type_code: TypeCode,
}

/// Pool internals shared with every outstanding handle.
pub(crate) struct Shared {
    inner: Mutex<Inner>,
    /// Signalled whenever a connection leaves the active list.
    available: Notify,
    closed: AtomicBool,
}

/// A bounded pool of database connections.
///
/// Cheap to clone; clones share the same pool. Dropping the last clone and
/// the last outstanding handle closes every pooled connection.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<Shared>,
}

impl ConnectionPool {
    pub fn new(source: UnpooledSource, config: PoolConfig) -> Self {
        let expected_type_code =
            TypeCode::new(source.url(), source.username(), source.password());
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: PoolState::default(),
                    config,
                    source,
                    expected_type_code,
                }),
                available: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Build a pool from a parsed `reservoir.toml` and a driver.
    pub fn from_config(config: &ReservoirConfig, driver: Arc<dyn Driver>) -> ConfigResult<Self> {
        let source = UnpooledSource::new(SourceConfig::from_settings(&config.source)?, driver);
        let pool_config = match &config.pool {
            Some(settings) => PoolConfig::from_settings(settings)?,
            None => PoolConfig::default(),
        };
        Ok(Self::new(source, pool_config))
    }

    /// Check out a connection using the configured credentials.
    pub async fn acquire(&self) -> PoolResult<PooledHandle> {
        let (username, password) = {
            let inner = self.shared.inner.lock();
            (
                inner.source.username().map(str::to_string),
                inner.source.password().map(str::to_string),
            )
        };
        self.acquire_as(username.as_deref(), password.as_deref()).await
    }

    /// Check out a connection on behalf of `username` / `password`.
    ///
    /// Waits while the pool is saturated, in slices of `time_to_wait`, until
    /// a connection is released or the oldest checkout becomes overdue.
    /// Dropping the returned future abandons the attempt without touching
    /// pool state.
    pub async fn acquire_as(
        &self,
        username: Option<&str>,
        password: Option<&str>,
    ) -> PoolResult<PooledHandle> {
        let started = Instant::now();
        let mut counted_wait = false;
        let mut local_bad = 0usize;

        loop {
            // Registered before the closed check and the state lock, so a
            // release or shutdown that lands in between still wakes us.
            let notified = self.shared.available.notified();
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(if counted_wait {
                    PoolError::Cancelled
                } else {
                    PoolError::Closed
                });
            }

            let wait = {
                let mut inner = self.shared.inner.lock();
                match inner.take_candidate(username, password)? {
                    Some(candidate) => {
                        if inner.check_out(candidate, username, password, started) {
                            let conn = inner.state.active.back().ok_or_else(|| {
                                PoolError::Internal("checked-out connection missing".to_string())
                            })?;
                            return Ok(PooledHandle::attach(Arc::clone(&self.shared), conn));
                        }
                        local_bad += 1;
                        let limit = inner.config.max_idle + inner.config.local_bad_connection_tolerance;
                        if local_bad > limit {
                            debug!(bad = local_bad, "could not get a good connection to the database");
                            return Err(PoolError::Exhausted { bad: local_bad });
                        }
                        continue;
                    }
                    None => {
                        if !counted_wait {
                            inner.state.counters.had_to_wait_count += 1;
                            counted_wait = true;
                        }
                        inner.config.time_to_wait
                    }
                }
            };

            debug!(wait = ?wait, "waiting for a connection");
            let wait_started = Instant::now();
            if wait.is_zero() {
                notified.await;
            } else {
                // A timed-out wait is just another pass through the loop.
                let _ = tokio::time::timeout(wait, notified).await;
            }
            self.shared.inner.lock().state.counters.accumulated_wait_time += wait_started.elapsed();
        }
    }

    /// Close every active and idle connection. Outstanding handles become
    /// invalid; the pool stays usable and opens fresh connections on demand.
    pub fn force_close_all(&self) {
        self.reconfigure(|_| {});
    }

    /// Apply a configuration change and invalidate every connection, in one
    /// critical section.
    fn reconfigure(&self, apply: impl FnOnce(&mut Inner)) {
        let closed = {
            let mut inner = self.shared.inner.lock();
            apply(&mut inner);
            inner.invalidate_all()
        };
        debug!(closed, "forcefully closed/removed all connections");
        self.shared.available.notify_waiters();
    }

    /// Stop accepting acquisitions, wait up to `drain_timeout` for checked-out
    /// connections to come back, then close everything.
    ///
    /// Tasks blocked in `acquire` fail with [`PoolError::Cancelled`]; later
    /// calls fail with [`PoolError::Closed`]. Returns the number of connections
    /// that were still checked out when the drain timeout expired.
    pub async fn shutdown(&self) -> usize {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.available.notify_waiters();

        let drain_timeout = self.config().drain_timeout;
        info!(drain_timeout = ?drain_timeout, "connection pool draining started");

        let deadline = Instant::now() + drain_timeout;
        let poll_interval = Duration::from_millis(10);
        loop {
            let active = self.active_count();
            if active == 0 {
                info!("all checked-out connections drained gracefully");
                break;
            }
            if Instant::now() >= deadline {
                warn!(remaining = active, "drain timeout expired, force-closing remaining connections");
                break;
            }
            tokio::time::sleep(poll_interval).await;
        }

        let force_closed = {
            let mut inner = self.shared.inner.lock();
            let active = inner.state.active.len();
            inner.invalidate_all();
            active
        };
        info!(force_closed, "connection pool shut down");
        force_closed
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    // ── Statistics ──────────────────────────────────────────────────

    pub fn stats(&self) -> PoolStats {
        self.shared.inner.lock().state.stats()
    }

    pub fn active_count(&self) -> usize {
        self.shared.inner.lock().state.active.len()
    }

    pub fn idle_count(&self) -> usize {
        self.shared.inner.lock().state.idle.len()
    }

    /// Log pool statistics at `tracing::info` level.
    pub fn log_stats(&self) {
        let (stats, url) = {
            let inner = self.shared.inner.lock();
            (inner.state.stats(), inner.source.url().to_string())
        };
        info!(
            url = %url,
            active = stats.active,
            idle = stats.idle,
            requests = stats.request_count,
            had_to_wait = stats.had_to_wait_count,
            bad_connections = stats.bad_connection_count,
            claimed_overdue = stats.claimed_overdue_count,
            average_request_time = ?stats.average_request_time,
            average_checkout_time = ?stats.average_checkout_time,
            "pool statistics"
        );
    }

    // ── Configuration ───────────────────────────────────────────────

    pub fn config(&self) -> PoolConfig {
        self.shared.inner.lock().config.clone()
    }

    pub fn source_config(&self) -> SourceConfig {
        self.shared.inner.lock().source.config().clone()
    }

    pub fn set_driver(&self, name: &str, driver: Arc<dyn Driver>) {
        self.reconfigure(|inner| inner.source.set_driver(name, driver));
    }

    pub fn set_url(&self, url: &str) {
        self.reconfigure(|inner| inner.source.config_mut().url = url.to_string());
    }

    pub fn set_username(&self, username: Option<&str>) {
        self.reconfigure(|inner| inner.source.config_mut().username = username.map(str::to_string));
    }

    pub fn set_password(&self, password: Option<&str>) {
        self.reconfigure(|inner| inner.source.config_mut().password = password.map(str::to_string));
    }

    pub fn set_driver_properties(&self, properties: Properties) {
        self.reconfigure(|inner| inner.source.config_mut().driver_properties = properties);
    }

    pub fn set_default_auto_commit(&self, auto_commit: Option<bool>) {
        self.reconfigure(|inner| inner.source.config_mut().auto_commit = auto_commit);
    }

    pub fn set_default_isolation(&self, level: Option<IsolationLevel>) {
        self.reconfigure(|inner| inner.source.config_mut().default_isolation = level);
    }

    pub fn set_default_network_timeout(&self, timeout: Option<Duration>) {
        self.reconfigure(|inner| inner.source.config_mut().default_network_timeout = timeout);
    }

    pub fn set_max_active(&self, max_active: usize) {
        self.reconfigure(|inner| inner.config.max_active = max_active);
    }

    pub fn set_max_idle(&self, max_idle: usize) {
        self.reconfigure(|inner| inner.config.max_idle = max_idle);
    }

    pub fn set_max_checkout_time(&self, max_checkout_time: Duration) {
        self.reconfigure(|inner| inner.config.max_checkout_time = max_checkout_time);
    }

    pub fn set_time_to_wait(&self, time_to_wait: Duration) {
        self.reconfigure(|inner| inner.config.time_to_wait = time_to_wait);
    }

    pub fn set_ping_query(&self, query: &str) {
        self.reconfigure(|inner| inner.config.ping_query = query.to_string());
    }

    pub fn set_ping_enabled(&self, enabled: bool) {
        self.reconfigure(|inner| inner.config.ping_enabled = enabled);
    }

    pub fn set_ping_connections_not_used_for(&self, threshold: Duration) {
        self.reconfigure(|inner| inner.config.ping_connections_not_used_for = threshold);
    }

    /// Takes effect for the next acquisition; existing connections are kept.
    pub fn set_local_bad_connection_tolerance(&self, tolerance: usize) {
        self.shared.inner.lock().config.local_bad_connection_tolerance = tolerance;
    }
}

impl Inner {
    /// Find a connection to hand out: idle first, then a new one, then an
    /// overdue one. `None` means the caller has to wait.
    fn take_candidate(
        &mut self,
        username: Option<&str>,
        password: Option<&str>,
    ) -> PoolResult<Option<PooledConnection>> {
        if let Some(conn) = self.state.idle.pop_front() {
            debug!(raw_id = conn.raw_id(), "checked out connection from pool");
            return Ok(Some(conn));
        }

        if self.state.active.len() < self.config.max_active {
            let raw = self.source.new_connection(username, password)?;
            let conn = PooledConnection::new(raw);
            debug!(raw_id = conn.raw_id(), "created connection");
            return Ok(Some(conn));
        }

        let overdue = match self.state.active.front() {
            Some(oldest) => oldest.checkout_time() > self.config.max_checkout_time,
            None => {
                return Err(PoolError::Internal(format!(
                    "pool saturated with no active connections (max_active = {})",
                    self.config.max_active
                )));
            }
        };
        if !overdue {
            return Ok(None);
        }
        Ok(self.state.active.pop_front().map(|oldest| self.reclaim(oldest)))
    }

    /// Take an overdue connection away from its holder.
    fn reclaim(&mut self, overdue: PooledConnection) -> PooledConnection {
        let checkout_time = overdue.checkout_time();
        let counters = &mut self.state.counters;
        counters.claimed_overdue_count += 1;
        counters.accumulated_overdue_checkout_time += checkout_time;
        counters.accumulated_checkout_time += checkout_time;

        {
            let mut raw = overdue.raw().lock();
            if let Err(e) = rollback_if_manual(raw.as_mut()) {
                debug!(raw_id = overdue.raw_id(), error = %e, "bad connection, could not roll back");
            }
            overdue.invalidate();
        }

        let conn = overdue.rewrap();
        debug!(
            raw_id = conn.raw_id(),
            checkout_time = ?checkout_time,
            "claimed overdue connection"
        );
        conn
    }

    /// Validate `conn` and move it into the active list. Returns `false` if
    /// the connection was bad and has been discarded.
    fn check_out(
        &mut self,
        mut conn: PooledConnection,
        username: Option<&str>,
        password: Option<&str>,
        started: Instant,
    ) -> bool {
        let mut good = health::is_valid(&conn, &self.config);
        if good {
            let mut raw = conn.raw().lock();
            if let Err(e) = rollback_if_manual(raw.as_mut()) {
                warn!(raw_id = conn.raw_id(), error = %e, "rollback on checkout failed");
                good = false;
            }
        }
        if !good {
            debug!(
                raw_id = conn.raw_id(),
                "a bad connection was returned from the pool, getting another connection"
            );
            self.state.counters.bad_connection_count += 1;
            conn.discard();
            return false;
        }

        conn.set_type_code(TypeCode::new(self.source.url(), username, password));
        conn.mark_checked_out();
        self.state.active.push_back(conn);
        self.state.counters.request_count += 1;
        self.state.counters.accumulated_request_time += started.elapsed();
        true
    }

    /// Take a wrapper back from its handle.
    fn check_in(&mut self, wrapper_id: u64) {
        let Some(conn) = self.state.remove_active(wrapper_id) else {
            debug!(wrapper_id, "a bad connection attempted to return to the pool, discarding");
            self.state.counters.bad_connection_count += 1;
            return;
        };

        if !health::is_valid(&conn, &self.config) {
            debug!(raw_id = conn.raw_id(), "a bad connection attempted to return to the pool, discarding");
            self.state.counters.bad_connection_count += 1;
            // Close the raw connection too; nothing else holds this wrapper.
            conn.discard();
            return;
        }

        self.state.counters.accumulated_checkout_time += conn.checkout_time();
        let rolled_back = {
            let mut raw = conn.raw().lock();
            rollback_if_manual(raw.as_mut())
        };
        if let Err(e) = &rolled_back {
            warn!(raw_id = conn.raw_id(), error = %e, "rollback on return failed");
        }

        let poolable = rolled_back.is_ok()
            && self.state.idle.len() < self.config.max_idle
            && conn.type_code() == self.expected_type_code;
        if poolable {
            let fresh = conn.rewrap();
            conn.invalidate();
            debug!(raw_id = fresh.raw_id(), idle = self.state.idle.len() + 1, "returned connection to pool");
            self.state.idle.push_back(fresh);
        } else {
            let mut raw = conn.raw().lock();
            let _ = raw.close();
            conn.invalidate();
            debug!(raw_id = conn.raw_id(), "closed connection");
        }
    }

    /// Recompute the expected identity and close every connection.
    fn invalidate_all(&mut self) -> usize {
        self.expected_type_code = TypeCode::new(
            self.source.url(),
            self.source.username(),
            self.source.password(),
        );
        let drained = self.state.drain_all();
        for conn in &drained {
            conn.discard();
        }
        drained.len()
    }
}

impl Shared {
    /// Return a wrapper to the pool. Never fails; problems are logged.
    pub(crate) fn release(&self, wrapper_id: u64) {
        self.inner.lock().check_in(wrapper_id);
        self.available.notify_waiters();
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.inner.get_mut().invalidate_all();
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("ConnectionPool")
            .field("source", &inner.source)
            .field("config", &inner.config)
            .field("active", &inner.state.active.len())
            .field("idle", &inner.state.idle.len())
            .field("closed", &self.shared.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDriver;
    use reservoir_core::SourceSettings;

    fn test_config() -> PoolConfig {
        PoolConfig::default()
            .with_limits(3, 2)
            .with_time_to_wait(Duration::from_secs(5))
            .with_drain_timeout(Duration::from_millis(100))
    }

    fn make_pool(config: PoolConfig) -> (ConnectionPool, Arc<MemoryDriver>) {
        make_pool_with(SourceConfig::new("memory", "mem://test"), config)
    }

    fn make_pool_with(source: SourceConfig, config: PoolConfig) -> (ConnectionPool, Arc<MemoryDriver>) {
        let driver = Arc::new(MemoryDriver::new());
        let source = UnpooledSource::new(source.with_credentials("app", "secret"), driver.clone());
        (ConnectionPool::new(source, config), driver)
    }

    // ── PoolConfig ──────────────────────────────────────────────────

    #[test]
    fn config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_active, 10);
        assert_eq!(config.max_idle, 5);
        assert_eq!(config.max_checkout_time, Duration::from_secs(20));
        assert_eq!(config.time_to_wait, Duration::from_secs(20));
        assert_eq!(config.local_bad_connection_tolerance, 3);
        assert_eq!(config.ping_query, "NO PING QUERY SET");
        assert!(!config.ping_enabled);
        assert_eq!(config.ping_connections_not_used_for, Duration::ZERO);
    }

    #[test]
    fn config_from_settings_overrides_only_set_fields() {
        let settings = PoolSettings {
            max_active: Some(4),
            max_checkout_time: Some("250ms".to_string()),
            ping_enabled: Some(true),
            ping_query: Some("SELECT 1".to_string()),
            ..Default::default()
        };
        let config = PoolConfig::from_settings(&settings).unwrap();
        assert_eq!(config.max_active, 4);
        assert_eq!(config.max_idle, 5);
        assert_eq!(config.max_checkout_time, Duration::from_millis(250));
        assert_eq!(config.time_to_wait, Duration::from_secs(20));
        assert!(config.ping_enabled);
        assert_eq!(config.ping_query, "SELECT 1");
    }

    #[test]
    fn config_from_settings_rejects_bad_duration() {
        let settings = PoolSettings {
            drain_timeout: Some("soon".to_string()),
            ..Default::default()
        };
        assert!(PoolConfig::from_settings(&settings).is_err());
    }

    #[test]
    fn from_config_builds_pool() {
        let config = ReservoirConfig {
            source: SourceSettings {
                driver: "memory".to_string(),
                url: "mem://orders".to_string(),
                username: Some("app".to_string()),
                ..Default::default()
            },
            pool: Some(PoolSettings {
                max_active: Some(2),
                ..Default::default()
            }),
        };
        let pool = ConnectionPool::from_config(&config, Arc::new(MemoryDriver::new())).unwrap();
        assert_eq!(pool.config().max_active, 2);
        assert_eq!(pool.source_config().url, "mem://orders");
        assert_eq!(pool.source_config().username.as_deref(), Some("app"));
    }

    // ── Acquire / release ───────────────────────────────────────────

    #[tokio::test]
    async fn acquire_creates_connection() {
        let (pool, driver) = make_pool(test_config());
        let handle = pool.acquire().await.unwrap();
        assert!(handle.is_valid());
        assert_eq!(handle.last_used_at(), handle.checkout_at());
        assert!(handle.created_at() <= handle.checkout_at());
        assert_eq!(driver.connects(), 1);
        assert_eq!(pool.active_count(), 1);
        assert_eq!(pool.idle_count(), 0);

        let state = &driver.opened()[0];
        assert_eq!(state.property("user").as_deref(), Some("app"));
        assert_eq!(state.property("password").as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn released_connection_is_reused_under_new_wrapper() {
        let (pool, driver) = make_pool(test_config());
        let first = pool.acquire().await.unwrap();
        let (first_id, raw_id) = (first.id(), first.raw_id());
        first.close();
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.active_count(), 0);

        let second = pool.acquire().await.unwrap();
        assert_eq!(second.raw_id(), raw_id);
        assert_ne!(second.id(), first_id);
        assert_eq!(driver.connects(), 1);
        assert_eq!(pool.stats().request_count, 2);
    }

    #[tokio::test]
    async fn drop_returns_connection() {
        let (pool, _driver) = make_pool(test_config());
        {
            let _handle = pool.acquire().await.unwrap();
            assert_eq!(pool.active_count(), 1);
        }
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn idle_is_served_oldest_returned_first() {
        let (pool, _driver) = make_pool(test_config());
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let (a_raw, b_raw) = (a.raw_id(), b.raw_id());
        b.close();
        a.close();

        assert_eq!(pool.acquire().await.unwrap().raw_id(), b_raw);
        assert_ne!(a_raw, b_raw);
    }

    #[tokio::test]
    async fn release_beyond_max_idle_closes_raw() {
        let (pool, driver) = make_pool(test_config().with_limits(3, 1));
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        a.close();
        b.close();

        assert_eq!(pool.idle_count(), 1);
        assert_eq!(driver.open_count(), 1);
        assert!(driver.opened()[1].is_closed());
    }

    #[tokio::test]
    async fn manual_commit_connections_are_rolled_back() {
        let source = SourceConfig::new("memory", "mem://test").with_auto_commit(false);
        let (pool, driver) = make_pool_with(source, test_config());
        let handle = pool.acquire().await.unwrap();
        handle.execute("UPDATE t SET x = 1").unwrap();
        let before = driver.opened()[0].rollbacks();
        handle.close();

        assert_eq!(driver.opened()[0].rollbacks(), before + 1);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn failed_rollback_on_return_retires_connection() {
        let source = SourceConfig::new("memory", "mem://test").with_auto_commit(false);
        let (pool, driver) = make_pool_with(source, test_config());
        let handle = pool.acquire().await.unwrap();
        driver.behavior().set_fail_rollback(true);
        handle.close();

        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.active_count(), 0);
        assert!(driver.opened()[0].is_closed());
    }

    #[tokio::test]
    async fn foreign_credentials_are_not_pooled() {
        let (pool, driver) = make_pool(test_config());
        let handle = pool.acquire_as(Some("ops"), Some("hunter2")).await.unwrap();
        assert_eq!(driver.opened()[0].property("user").as_deref(), Some("ops"));
        handle.close();

        assert_eq!(pool.idle_count(), 0);
        assert!(driver.opened()[0].is_closed());
    }

    #[tokio::test]
    async fn unhealthy_connection_is_closed_on_return() {
        let (pool, driver) = make_pool(test_config());
        let handle = pool.acquire().await.unwrap();
        driver.behavior().set_fail_liveness(true);
        handle.close();

        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.stats().bad_connection_count, 1);
        assert!(driver.opened()[0].is_closed());
    }

    #[tokio::test]
    async fn dead_idle_connection_is_replaced() {
        let (pool, driver) = make_pool(test_config());
        let handle = pool.acquire().await.unwrap();
        let dead_raw = handle.raw_id();
        handle.close();
        driver.opened()[0].kill();

        let handle = pool.acquire().await.unwrap();
        assert_ne!(handle.raw_id(), dead_raw);
        assert_eq!(driver.connects(), 2);
        assert_eq!(pool.stats().bad_connection_count, 1);
    }

    #[tokio::test]
    async fn too_many_bad_connections_fails() {
        let (pool, driver) = make_pool(
            test_config()
                .with_limits(10, 1)
                .with_local_bad_connection_tolerance(1),
        );
        driver.behavior().set_fail_liveness(true);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { bad: 3 }));
        assert_eq!(driver.connects(), 3);
        assert_eq!(pool.stats().bad_connection_count, 3);
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn connect_failure_propagates() {
        let (pool, driver) = make_pool(test_config());
        driver.behavior().set_fail_connect(true);
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Connection(_)));
        assert_eq!(pool.active_count(), 0);
    }

    // ── Waiting and overdue reclamation ─────────────────────────────

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn waiter_gets_released_connection() {
        let (pool, driver) = make_pool(test_config().with_limits(1, 1));
        let held = pool.acquire().await.unwrap();
        let (held_id, raw_id) = (held.id(), held.raw_id());

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|h| (h.id(), h.raw_id())) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        held.close();

        let (waiter_id, waiter_raw_id) = waiter.await.unwrap().unwrap();
        assert_eq!(waiter_raw_id, raw_id);
        assert_ne!(waiter_id, held_id);
        assert_eq!(driver.connects(), 1);
        let stats = pool.stats();
        assert_eq!(stats.had_to_wait_count, 1);
        assert!(stats.average_wait_time > Duration::ZERO);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn zero_time_to_wait_blocks_until_release() {
        let (pool, _driver) = make_pool(
            test_config()
                .with_limits(1, 1)
                .with_time_to_wait(Duration::ZERO),
        );
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|h| h.raw_id()) })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Still parked in its first wait: no slice has ended yet.
        let stats = pool.stats();
        assert_eq!(stats.had_to_wait_count, 1);
        assert_eq!(stats.average_wait_time, Duration::ZERO);
        assert!(!waiter.is_finished());

        let raw_id = held.raw_id();
        held.close();
        assert_eq!(waiter.await.unwrap().unwrap(), raw_id);
        assert!(pool.stats().average_wait_time >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn overdue_connection_is_reclaimed() {
        let (pool, driver) = make_pool(
            test_config()
                .with_limits(1, 1)
                .with_max_checkout_time(Duration::from_millis(20)),
        );
        let stale = pool.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let fresh = pool.acquire().await.unwrap();
        assert_eq!(fresh.raw_id(), stale.raw_id());
        assert!(!stale.is_valid());
        assert!(matches!(
            stale.execute("SELECT 1"),
            Err(PoolError::InvalidConnection { .. })
        ));
        assert!(fresh.execute("SELECT 1").is_ok());
        assert_eq!(driver.connects(), 1);

        let stats = pool.stats();
        assert_eq!(stats.claimed_overdue_count, 1);
        assert!(stats.average_overdue_checkout_time >= Duration::from_millis(20));

        // The reclaimed handle no longer owns anything.
        drop(stale);
        assert_eq!(pool.active_count(), 1);
        assert_eq!(pool.stats().bad_connection_count, 1);
    }

    #[tokio::test]
    async fn wait_is_counted_once_across_slices() {
        let (pool, _driver) = make_pool(
            test_config()
                .with_limits(1, 1)
                .with_time_to_wait(Duration::from_millis(10))
                .with_max_checkout_time(Duration::from_millis(80)),
        );
        let _held = pool.acquire().await.unwrap();
        let _next = pool.acquire().await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.had_to_wait_count, 1);
        assert_eq!(stats.claimed_overdue_count, 1);
        assert!(stats.average_wait_time >= Duration::from_millis(10));
    }

    // ── Invalidation ────────────────────────────────────────────────

    #[tokio::test]
    async fn force_close_all_invalidates_everything() {
        let (pool, driver) = make_pool(test_config());
        let kept = pool.acquire().await.unwrap();
        pool.acquire().await.unwrap().close();
        assert_eq!((pool.active_count(), pool.idle_count()), (1, 1));

        pool.force_close_all();
        assert_eq!((pool.active_count(), pool.idle_count()), (0, 0));
        assert!(!kept.is_valid());
        assert_eq!(driver.open_count(), 0);

        kept.close();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.stats().bad_connection_count, 1);

        let handle = pool.acquire().await.unwrap();
        assert!(handle.is_valid());
        assert_eq!(driver.connects(), 3);
    }

    #[tokio::test]
    async fn setters_close_pooled_connections() {
        let (pool, driver) = make_pool(test_config());
        pool.acquire().await.unwrap().close();
        assert_eq!(pool.idle_count(), 1);

        pool.set_max_idle(4);
        assert_eq!(pool.config().max_idle, 4);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(driver.open_count(), 0);

        pool.acquire().await.unwrap().close();
        pool.set_url("mem://other");
        assert_eq!(pool.idle_count(), 0);
        pool.acquire().await.unwrap().close();
        assert_eq!(driver.opened()[2].url(), "mem://other");
    }

    #[tokio::test]
    async fn credential_change_applies_to_new_connections() {
        let (pool, driver) = make_pool(test_config());
        pool.set_username(Some("ops"));
        pool.set_password(None);

        let handle = pool.acquire().await.unwrap();
        let state = &driver.opened()[0];
        assert_eq!(state.property("user").as_deref(), Some("ops"));
        assert_eq!(state.property("password"), None);
        handle.close();
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn tolerance_change_keeps_connections() {
        let (pool, _driver) = make_pool(test_config());
        pool.acquire().await.unwrap().close();
        pool.set_local_bad_connection_tolerance(7);
        assert_eq!(pool.config().local_bad_connection_tolerance, 7);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn dropping_pool_closes_idle_connections() {
        let (pool, driver) = make_pool(test_config());
        pool.acquire().await.unwrap().close();
        assert_eq!(driver.open_count(), 1);
        drop(pool);
        assert_eq!(driver.open_count(), 0);
    }

    // ── Shutdown ────────────────────────────────────────────────────

    #[tokio::test]
    async fn shutdown_closes_idle_and_rejects_acquire() {
        let (pool, driver) = make_pool(test_config());
        pool.acquire().await.unwrap().close();

        assert_eq!(pool.shutdown().await, 0);
        assert!(pool.is_shut_down());
        assert_eq!(driver.open_count(), 0);
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
    }

    #[tokio::test]
    async fn shutdown_force_closes_after_drain_timeout() {
        let (pool, driver) = make_pool(test_config());
        let held = pool.acquire().await.unwrap();

        assert_eq!(pool.shutdown().await, 1);
        assert!(!held.is_valid());
        assert_eq!(driver.open_count(), 0);
    }

    #[tokio::test]
    async fn log_stats_does_not_panic() {
        let (pool, _driver) = make_pool(test_config());
        pool.acquire().await.unwrap().close();
        pool.log_stats();
        assert!(format!("{pool:?}").contains("ConnectionPool"));
    }
}
