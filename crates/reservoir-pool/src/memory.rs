//! In-process driver for simulations and tests.
//!
//! [`MemoryDriver`] hands out [`MemoryConnection`]s that never touch the
//! network. Failure modes are switched at runtime through the shared
//! [`MemoryBehavior`], and every opened connection leaves a
//! [`MemoryConnectionState`] behind so callers can inspect what the pool
//! did to it (rollbacks, statements, close).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use reservoir_core::IsolationLevel;

use crate::error::ConnectionError;
use crate::source::{Driver, Properties, RawConnection};

/// Runtime switches shared by a driver and all of its connections.
#[derive(Debug, Default)]
pub struct MemoryBehavior {
    fail_connect: AtomicBool,
    fail_queries: AtomicBool,
    fail_rollback: AtomicBool,
    fail_liveness: AtomicBool,
    /// When non-zero, every Nth statement across all connections fails.
    fail_every: AtomicU64,
    statements: AtomicU64,
}

impl MemoryBehavior {
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_rollback(&self, fail: bool) {
        self.fail_rollback.store(fail, Ordering::Relaxed);
    }

    /// Make `is_closed` itself return an error.
    pub fn set_fail_liveness(&self, fail: bool) {
        self.fail_liveness.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_every(&self, n: u64) {
        self.fail_every.store(n, Ordering::Relaxed);
    }

    fn statement_fails(&self) -> bool {
        if self.fail_queries.load(Ordering::Relaxed) {
            return true;
        }
        let every = self.fail_every.load(Ordering::Relaxed);
        let seq = self.statements.fetch_add(1, Ordering::Relaxed) + 1;
        every > 0 && seq % every == 0
    }
}

/// Observable state of one opened connection.
#[derive(Debug)]
pub struct MemoryConnectionState {
    id: u64,
    url: String,
    properties: Properties,
    closed: AtomicBool,
    auto_commit: AtomicBool,
    rollbacks: AtomicU64,
    commits: AtomicU64,
    isolation: Mutex<Option<IsolationLevel>>,
    network_timeout: Mutex<Option<Duration>>,
    executed: Mutex<Vec<String>>,
}

impl MemoryConnectionState {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.properties.get(key).cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Simulate the server dropping the connection.
    pub fn kill(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn isolation(&self) -> Option<IsolationLevel> {
        *self.isolation.lock()
    }

    pub fn network_timeout(&self) -> Option<Duration> {
        *self.network_timeout.lock()
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }
}

/// A connection that lives entirely in memory.
#[derive(Debug)]
pub struct MemoryConnection {
    state: Arc<MemoryConnectionState>,
    behavior: Arc<MemoryBehavior>,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.state.is_closed() {
            return Err(ConnectionError::closed(format!(
                "memory connection {} is closed",
                self.state.id
            )));
        }
        Ok(())
    }
}

impl RawConnection for MemoryConnection {
    fn is_closed(&mut self) -> Result<bool, ConnectionError> {
        if self.behavior.fail_liveness.load(Ordering::Relaxed) {
            return Err(ConnectionError::other("liveness check failed"));
        }
        Ok(self.state.is_closed())
    }

    fn auto_commit(&mut self) -> Result<bool, ConnectionError> {
        self.ensure_open()?;
        Ok(self.state.auto_commit.load(Ordering::Relaxed))
    }

    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.state.auto_commit.store(auto_commit, Ordering::Relaxed);
        Ok(())
    }

    fn set_isolation(&mut self, level: IsolationLevel) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        *self.state.isolation.lock() = Some(level);
        Ok(())
    }

    fn set_network_timeout(&mut self, timeout: Duration) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        *self.state.network_timeout.lock() = Some(timeout);
        Ok(())
    }

    fn execute(&mut self, statement: &str) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.state.executed.lock().push(statement.to_string());
        if self.behavior.statement_fails() {
            return Err(ConnectionError::query(format!("statement failed: {statement}")));
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.state.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        if self.behavior.fail_rollback.load(Ordering::Relaxed) {
            return Err(ConnectionError::other("rollback failed"));
        }
        self.state.rollbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn close(&mut self) -> Result<(), ConnectionError> {
        self.state.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Driver producing [`MemoryConnection`]s. New connections start in
/// autocommit mode.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    behavior: Arc<MemoryBehavior>,
    next_id: AtomicU64,
    opened: Mutex<Vec<Arc<MemoryConnectionState>>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn behavior(&self) -> &MemoryBehavior {
        &self.behavior
    }

    /// Number of successful connects so far.
    pub fn connects(&self) -> usize {
        self.opened.lock().len()
    }

    /// State handles of every connection opened so far, in open order.
    pub fn opened(&self) -> Vec<Arc<MemoryConnectionState>> {
        self.opened.lock().clone()
    }

    /// Connections opened and not yet closed.
    pub fn open_count(&self) -> usize {
        self.opened.lock().iter().filter(|c| !c.is_closed()).count()
    }
}

impl Driver for MemoryDriver {
    fn connect(
        &self,
        url: &str,
        properties: &Properties,
    ) -> Result<Box<dyn RawConnection>, ConnectionError> {
        if self.behavior.fail_connect.load(Ordering::Relaxed) {
            return Err(ConnectionError::refused(format!("connection refused: {url}")));
        }
        let state = Arc::new(MemoryConnectionState {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            url: url.to_string(),
            properties: properties.clone(),
            closed: AtomicBool::new(false),
            auto_commit: AtomicBool::new(true),
            rollbacks: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            isolation: Mutex::new(None),
            network_timeout: Mutex::new(None),
            executed: Mutex::new(Vec::new()),
        });
        self.opened.lock().push(Arc::clone(&state));
        Ok(Box::new(MemoryConnection {
            state,
            behavior: Arc::clone(&self.behavior),
        }))
    }
}
