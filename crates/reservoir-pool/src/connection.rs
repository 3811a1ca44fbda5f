//! Pooled connection wrapper and the handle given to callers.
//!
//! A raw connection lives in a [`RawSlot`] for as long as the pool owns it.
//! Wrappers ([`PooledConnection`]) are short-lived bookkeeping records around
//! a slot: returning a connection to the pool or reclaiming an overdue one
//! builds a *new* wrapper around the same slot and invalidates the old one,
//! so a cleared validity flag never reads true again.
//!
//! The caller sees a [`PooledHandle`]. Every operation on it forwards to the
//! raw connection after checking the wrapper's validity under the slot lock;
//! `close` (or drop) hands the wrapper back to the pool instead of closing
//! the connection.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use crate::error::{ConnectionError, PoolError, PoolResult};
use crate::pool::Shared;
use crate::source::RawConnection;

static NEXT_WRAPPER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_RAW_ID: AtomicU64 = AtomicU64::new(1);

/// Hash of `(url, username, password)` identifying which configuration a
/// connection was made for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct TypeCode(u64);

impl TypeCode {
    pub fn new(url: &str, username: Option<&str>, password: Option<&str>) -> Self {
        let mut hasher = DefaultHasher::new();
        (url, username, password).hash(&mut hasher);
        Self(hasher.finish())
    }
}

/// One raw connection, shared by every wrapper built around it.
#[derive(Debug)]
pub(crate) struct RawSlot {
    id: u64,
    conn: Mutex<Box<dyn RawConnection>>,
}

impl RawSlot {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Box<dyn RawConnection>> {
        self.conn.lock()
    }
}

/// Pool bookkeeping around one raw connection.
#[derive(Debug)]
pub(crate) struct PooledConnection {
    id: u64,
    raw: Arc<RawSlot>,
    /// Shared with the caller's handle while checked out.
    valid: Arc<AtomicBool>,
    created_at: Instant,
    last_used_at: Instant,
    checkout_at: Instant,
    type_code: TypeCode,
}

impl PooledConnection {
    /// Wrap a connection fresh from the driver.
    pub(crate) fn new(conn: Box<dyn RawConnection>) -> Self {
        let now = Instant::now();
        Self {
            id: NEXT_WRAPPER_ID.fetch_add(1, Ordering::Relaxed),
            raw: Arc::new(RawSlot {
                id: NEXT_RAW_ID.fetch_add(1, Ordering::Relaxed),
                conn: Mutex::new(conn),
            }),
            valid: Arc::new(AtomicBool::new(true)),
            created_at: now,
            last_used_at: now,
            checkout_at: now,
            type_code: TypeCode::default(),
        }
    }

    /// A new wrapper around the same raw connection. Keeps the creation and
    /// last-use timestamps; identity and validity are fresh.
    pub(crate) fn rewrap(&self) -> Self {
        Self {
            id: NEXT_WRAPPER_ID.fetch_add(1, Ordering::Relaxed),
            raw: Arc::clone(&self.raw),
            valid: Arc::new(AtomicBool::new(true)),
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            checkout_at: Instant::now(),
            type_code: self.type_code,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn raw_id(&self) -> u64 {
        self.raw.id
    }

    pub(crate) fn raw(&self) -> &RawSlot {
        &self.raw
    }

    /// The validity flag alone, without a health check.
    pub(crate) fn is_flagged_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Permanently mark this wrapper unusable.
    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub(crate) fn type_code(&self) -> TypeCode {
        self.type_code
    }

    pub(crate) fn set_type_code(&mut self, code: TypeCode) {
        self.type_code = code;
    }

    /// Stamp checkout and last-use to now.
    pub(crate) fn mark_checked_out(&mut self) {
        let now = Instant::now();
        self.checkout_at = now;
        self.last_used_at = now;
    }

    /// How long the connection has been checked out.
    pub(crate) fn checkout_time(&self) -> Duration {
        self.checkout_at.elapsed()
    }

    pub(crate) fn time_since_last_use(&self) -> Duration {
        self.last_used_at.elapsed()
    }

    /// Close the raw connection, rolling back first if needed. Errors are
    /// swallowed: the connection is being thrown away.
    pub(crate) fn discard(&self) {
        let mut conn = self.raw.lock();
        self.invalidate();
        let _ = crate::source::rollback_if_manual(conn.as_mut());
        let _ = conn.close();
    }
}

/// A checked-out connection.
///
/// Dereferences nothing: use the forwarding methods or [`with_raw`]. Closing
/// (explicitly or by drop) returns the connection to its pool.
///
/// [`with_raw`]: PooledHandle::with_raw
pub struct PooledHandle {
    shared: Arc<Shared>,
    wrapper_id: u64,
    raw: Arc<RawSlot>,
    valid: Arc<AtomicBool>,
    created_at: Instant,
    last_used_at: Instant,
    checkout_at: Instant,
    released: bool,
}

impl PooledHandle {
    pub(crate) fn attach(shared: Arc<Shared>, conn: &PooledConnection) -> Self {
        Self {
            shared,
            wrapper_id: conn.id,
            raw: Arc::clone(&conn.raw),
            valid: Arc::clone(&conn.valid),
            created_at: conn.created_at,
            last_used_at: conn.last_used_at,
            checkout_at: conn.checkout_at,
            released: false,
        }
    }

    /// Wrapper identity; changes every time the connection cycles through the pool.
    pub fn id(&self) -> u64 {
        self.wrapper_id
    }

    /// Identity of the underlying raw connection; stable across rewraps.
    pub fn raw_id(&self) -> u64 {
        self.raw.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Last-use stamp taken when this handle was checked out.
    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    pub fn checkout_at(&self) -> Instant {
        self.checkout_at
    }

    /// Whether this handle may still be used. No health check is run.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Run `f` against the raw connection.
    ///
    /// Fails with [`PoolError::InvalidConnection`] once the handle has been
    /// invalidated, e.g. after the pool reclaimed it as overdue.
    pub fn with_raw<R>(
        &self,
        f: impl FnOnce(&mut dyn RawConnection) -> Result<R, ConnectionError>,
    ) -> PoolResult<R> {
        let mut conn = self.raw.lock();
        if !self.is_valid() {
            return Err(PoolError::InvalidConnection {
                id: self.wrapper_id,
            });
        }
        Ok(f(conn.as_mut())?)
    }

    pub fn execute(&self, statement: &str) -> PoolResult<()> {
        self.with_raw(|conn| conn.execute(statement))
    }

    pub fn commit(&self) -> PoolResult<()> {
        self.with_raw(|conn| conn.commit())
    }

    pub fn rollback(&self) -> PoolResult<()> {
        self.with_raw(|conn| conn.rollback())
    }

    pub fn auto_commit(&self) -> PoolResult<bool> {
        self.with_raw(|conn| conn.auto_commit())
    }

    pub fn set_auto_commit(&self, auto_commit: bool) -> PoolResult<()> {
        self.with_raw(|conn| conn.set_auto_commit(auto_commit))
    }

    pub fn is_closed(&self) -> PoolResult<bool> {
        self.with_raw(|conn| conn.is_closed())
    }

    /// Return the connection to the pool.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.release(self.wrapper_id);
        }
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for PooledHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledHandle")
            .field("id", &self.wrapper_id)
            .field("raw_id", &self.raw.id)
            .field("valid", &self.is_valid())
            .finish_non_exhaustive()
    }
}
