//! An embeddable XA transaction coordinator.
//!
//! `xatm` coordinates distributed transactions across any number of
//! resource managers that implement the [`XaResource`] capability. It
//! provides:
//!
//! - a [`TransactionDomain`] that begins, tracks and times out transactions,
//! - a two-phase-commit engine with the one-phase optimization, before/after
//!   completion [`Synchronization`]s, heuristic outcome reporting and
//!   asynchronous completion,
//! - an enlistment registry that groups resources sharing a resource manager
//!   into one branch,
//! - a [`ConnectionPool`] whose handles detect when their physical
//!   connection has been recycled underneath them.
//!
//! Everything is `async` and built on [Tokio](https://tokio.rs/); background
//! work goes through the [`Runtime`](runtime::Runtime) trait.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use xatm::{DomainConfig, TransactionDomain, XaResource};
//!
//! # async fn example(orders: Arc<dyn XaResource>, billing: Arc<dyn XaResource>) -> xatm::Result<()> {
//! let domain = TransactionDomain::create(DomainConfig::default());
//!
//! let tx = domain.begin().await?;
//! tx.enlist_resource(orders).await?;
//! tx.enlist_resource(billing).await?;
//! // ... work against both resources ...
//! tx.commit().await?;
//!
//! domain.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! ```rust
//! use std::time::Duration;
//! use xatm::DomainConfig;
//!
//! let config = DomainConfig::builder()
//!     .name("orders")
//!     .transaction(|t| t.default_timeout(Duration::from_secs(30)))
//!     .pool(|p| p.prune_factor(0.25).idle_timeout(Duration::from_secs(120)))
//!     .build()
//!     .expect("invalid config");
//! assert_eq!(config.name(), "orders");
//! ```
//!
//! With the `config-file` feature the same settings can be read from YAML or
//! TOML; [`DomainConfig::from_env`] is always available.
//!
//! # Error Handling
//!
//! Every fallible operation returns [`Result<T>`](Result), an alias for
//! `std::result::Result<T, XaError>`. [`XaError::is_rollback`] tells whether
//! an error means the transaction did not commit.
//!
//! # Logging
//!
//! The crate logs through [`tracing`](https://docs.rs/tracing) and never
//! installs a subscriber.

#![warn(missing_docs)]

pub mod config;
pub mod config_file;
pub mod domain;
pub mod pool;
pub mod resource;
pub mod runtime;
pub mod transaction;

#[cfg(test)]
mod testing;

pub use config::{
    ConfigError, DomainConfig, DomainConfigBuilder, PoolConfig, PoolConfigBuilder,
    TransactionConfig, TransactionConfigBuilder,
};
pub use domain::{TransactionDomain, TransactionEvent};
pub use pool::{
    ConnectionFactory, ConnectionId, ConnectionPool, ConnectionRequest, Credentials,
    IsolationLevel, LeaseState, PhysicalConnection, PoolStats, PooledHandle,
};
pub use resource::{Vote, XaResource};
pub use transaction::{
    CompletionCallback, DelistOutcome, EnlistmentState, Status, Synchronization, Transaction,
};
pub use xatm_core as core;
pub use xatm_core::{HeuristicKind, Result, TransactionIdentifier, XaError, Xid, XidKind};
