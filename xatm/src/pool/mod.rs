//! Pooling of physical connections behind logical handles.
//!
//! A [`ConnectionPool`] hands out [`PooledHandle`]s bound to physical
//! connections created by a [`ConnectionFactory`]. Closing a handle returns
//! its connection to the idle set; only eviction closes the physical
//! connection.
//!
//! Every physical connection carries a validity token. Evicting a
//! connection (prune sweep, fatal error, explicit [`ConnectionPool::invalidate`])
//! bumps the token, and every handle issued before the bump fails its next
//! operation with [`XaError::StaleConnectionHandle`](xatm_core::XaError::StaleConnectionHandle).
//!
//! # Pruning
//!
//! Every `prune_interval` the pool collects the connections that have been
//! unused for at least `idle_timeout` and are not enlisted in an unfinished
//! transaction, and evicts `ceil(prune_factor * eligible)` of them, least
//! recently used first. A prune factor of `0.0` disables eviction.

use std::sync::atomic::{AtomicU64, Ordering};

mod factory;
mod handle;
mod manager;

pub use factory::{
    ConnectionFactory, ConnectionRequest, Credentials, IsolationLevel, PhysicalConnection,
};
pub use handle::PooledHandle;
pub use manager::ConnectionPool;

/// Unique identifier of a physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generates a new unique connection ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw ID value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lease state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// In the idle set, ready to be handed out.
    Idle,
    /// Held by a handle.
    Leased,
    /// Evicted; every handle to it is stale.
    Stale,
}

/// A snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Physical connections created since the pool started.
    pub created: u64,
    /// Physical connections evicted since the pool started.
    pub destroyed: u64,
    /// Connections currently idle.
    pub idle: usize,
    /// Connections currently leased to handles.
    pub leased: usize,
}

impl PoolStats {
    /// Returns the number of live physical connections.
    pub fn open(&self) -> usize {
        self.idle + self.leased
    }
}
