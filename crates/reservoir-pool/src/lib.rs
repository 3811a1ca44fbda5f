//! reservoir-pool: bounded database connection pooling over an unpooled source.
//!
//! - **source**: `Driver` / `RawConnection` seams and the unpooled connection factory
//! - **connection**: pooled wrappers, type codes, and the `PooledHandle` callers hold
//! - **health**: liveness and ping-query checks
//! - **state**: idle/active lists, counters, `PoolStats`
//! - **pool**: `ConnectionPool` acquire/release, overdue reclamation, invalidation, shutdown
//! - **memory**: in-process driver for simulations and tests

pub mod connection;
pub mod error;
mod health;
pub mod memory;
pub mod pool;
pub mod source;
mod state;

pub use connection::{PooledHandle, TypeCode};
pub use error::{ConnectionError, ConnectionErrorKind, PoolError, PoolResult};
pub use memory::{MemoryBehavior, MemoryConnectionState, MemoryDriver};
pub use pool::{ConnectionPool, PoolConfig};
pub use source::{Driver, Properties, RawConnection, SourceConfig, UnpooledSource};
pub use state::PoolStats;
