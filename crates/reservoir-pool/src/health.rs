//! Connection health check ("ping").
//!
//! A connection is healthy when the driver says it is open. If the pool has
//! probing enabled and the connection sat unused longer than the configured
//! threshold, the probe statement must also succeed; a failed probe closes
//! the raw connection.

use tracing::{debug, warn};

use crate::connection::PooledConnection;
use crate::pool::PoolConfig;
use crate::source::rollback_if_manual;

/// Liveness check plus, when due, the configured probe statement.
pub(crate) fn is_healthy(conn: &PooledConnection, config: &PoolConfig) -> bool {
    let mut raw = conn.raw().lock();

    let open = match raw.is_closed() {
        Ok(closed) => !closed,
        Err(e) => {
            debug!(raw_id = conn.raw_id(), error = %e, "connection is bad");
            false
        }
    };

    if !open || !config.ping_enabled {
        return open;
    }
    if conn.time_since_last_use() <= config.ping_connections_not_used_for {
        return true;
    }

    debug!(raw_id = conn.raw_id(), "testing connection");
    let probe = match raw.execute(&config.ping_query) {
        Ok(()) => rollback_if_manual(raw.as_mut()),
        Err(e) => Err(e),
    };
    match probe {
        Ok(()) => {
            debug!(raw_id = conn.raw_id(), "connection is good");
            true
        }
        Err(e) => {
            warn!(
                raw_id = conn.raw_id(),
                query = %config.ping_query,
                error = %e,
                "execution of ping query failed"
            );
            let _ = raw.close();
            false
        }
    }
}

/// Validity flag and health check together. The pool calls this before
/// handing a connection out or taking one back.
pub(crate) fn is_valid(conn: &PooledConnection, config: &PoolConfig) -> bool {
    conn.is_flagged_valid() && is_healthy(conn, config)
}
