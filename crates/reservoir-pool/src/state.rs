//! Pool state: the idle and active lists plus cumulative counters.
//!
//! Lives behind the pool's single lock. Counters only grow; they reset only
//! when a new pool is built.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::connection::PooledConnection;

/// Cumulative pool counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Counters {
    pub request_count: u64,
    pub accumulated_request_time: Duration,
    pub accumulated_checkout_time: Duration,
    pub claimed_overdue_count: u64,
    pub accumulated_overdue_checkout_time: Duration,
    pub accumulated_wait_time: Duration,
    pub had_to_wait_count: u64,
    pub bad_connection_count: u64,
}

#[derive(Debug, Default)]
pub(crate) struct PoolState {
    /// Available for reuse, in return order.
    pub idle: VecDeque<PooledConnection>,
    /// Checked out, in acquisition order (front = oldest checkout).
    pub active: VecDeque<PooledConnection>,
    pub counters: Counters,
}

impl PoolState {
    /// Take every wrapper out of both lists, active first.
    pub fn drain_all(&mut self) -> Vec<PooledConnection> {
        self.active.drain(..).chain(self.idle.drain(..)).collect()
    }

    /// Remove the active wrapper with the given id, if present.
    pub fn remove_active(&mut self, wrapper_id: u64) -> Option<PooledConnection> {
        let index = self.active.iter().position(|c| c.id() == wrapper_id)?;
        self.active.remove(index)
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.counters;
        PoolStats {
            active: self.active.len(),
            idle: self.idle.len(),
            request_count: c.request_count,
            had_to_wait_count: c.had_to_wait_count,
            bad_connection_count: c.bad_connection_count,
            claimed_overdue_count: c.claimed_overdue_count,
            average_request_time: average(c.accumulated_request_time, c.request_count),
            average_wait_time: average(c.accumulated_wait_time, c.had_to_wait_count),
            average_checkout_time: average(c.accumulated_checkout_time, c.request_count),
            average_overdue_checkout_time: average(
                c.accumulated_overdue_checkout_time,
                c.claimed_overdue_count,
            ),
        }
    }
}

fn average(total: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    let nanos = total.as_nanos() / u128::from(count);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

fn as_millis<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Point-in-time view of a pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Connections currently checked out.
    pub active: usize,
    /// Connections sitting idle in the pool.
    pub idle: usize,
    /// Successful acquisitions.
    pub request_count: u64,
    /// Acquisitions that had to wait at least once.
    pub had_to_wait_count: u64,
    pub bad_connection_count: u64,
    /// Overdue connections reclaimed from their holders.
    pub claimed_overdue_count: u64,
    #[serde(rename = "average_request_time_ms", serialize_with = "as_millis")]
    pub average_request_time: Duration,
    #[serde(rename = "average_wait_time_ms", serialize_with = "as_millis")]
    pub average_wait_time: Duration,
    #[serde(rename = "average_checkout_time_ms", serialize_with = "as_millis")]
    pub average_checkout_time: Duration,
    #[serde(rename = "average_overdue_checkout_time_ms", serialize_with = "as_millis")]
    pub average_overdue_checkout_time: Duration,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "activeConnections       {}", self.active)?;
        writeln!(f, "idleConnections         {}", self.idle)?;
        writeln!(f, "requestCount            {}", self.request_count)?;
        writeln!(f, "averageRequestTime      {:?}", self.average_request_time)?;
        writeln!(f, "averageCheckoutTime     {:?}", self.average_checkout_time)?;
        writeln!(f, "claimedOverdue          {}", self.claimed_overdue_count)?;
        writeln!(f, "averageOverdueCheckout  {:?}", self.average_overdue_checkout_time)?;
        writeln!(f, "hadToWait               {}", self.had_to_wait_count)?;
        writeln!(f, "averageWaitTime         {:?}", self.average_wait_time)?;
        write!(f, "badConnectionCount      {}", self.bad_connection_count)
    }
}
