//! Runtime abstraction for background work.
//!
//! The coordinator spawns two kinds of background work: the timeout reaper
//! and the pool sweeper, plus one task per asynchronous completion. All of
//! them go through the [`Runtime`] trait so an embedding application can
//! route them onto its own executor. The default implementation,
//! [`TokioRuntime`], delegates to Tokio.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use xatm::runtime::{Runtime, TokioRuntime};
//!
//! let rt: Arc<dyn Runtime> = Arc::new(TokioRuntime);
//! // rt.spawn(Box::pin(async { /* background work */ }));
//! ```

use std::fmt;
use std::time::Duration;

use futures::future::BoxFuture;

/// Abstraction over an async runtime.
///
/// The trait is object safe so it can be shared as `Arc<dyn Runtime>` by the
/// transaction domain, every transaction it creates, and the pool.
pub trait Runtime: Send + Sync + fmt::Debug + 'static {
    /// Spawns a future as a detached background task.
    ///
    /// The future must run to completion even though no handle is returned.
    fn spawn(&self, future: BoxFuture<'static, ()>);

    /// Returns a future that completes after the given duration.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// The default [`Runtime`] implementation backed by Tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioRuntime;

impl Runtime for TokioRuntime {
    fn spawn(&self, future: BoxFuture<'static, ()>) {
        tokio::spawn(future);
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}
