//! Completion callbacks registered on a transaction.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use xatm_core::{Result, XaError};

use super::{Status, Transaction};

/// A before/after completion callback pair.
///
/// `before_completion` runs before any resource is prepared or rolled back;
/// an error from it forces the transaction to roll back. `after_completion`
/// runs once the outcome is final and receives the terminal status.
///
/// Callbacks run while the transaction is locked for completion. They may
/// call [`Transaction::status`] and [`Transaction::set_rollback_only`], but
/// must not enlist, delist or register further synchronizations on the same
/// transaction.
#[async_trait]
pub trait Synchronization: Send + Sync + fmt::Debug {
    /// Called before the two-phase-commit (or rollback) process starts.
    async fn before_completion(&self) -> Result<()>;

    /// Called after the transaction reached a terminal status.
    async fn after_completion(&self, status: Status) -> Result<()>;
}

/// Receives the outcome of [`Transaction::commit_async`] or
/// [`Transaction::rollback_async`].
///
/// Closures of the form `Fn(&Transaction, Result<(), &XaError>)` implement
/// this trait.
pub trait CompletionCallback: Send + Sync + 'static {
    /// The operation completed successfully.
    fn on_success(&self, tx: &Transaction);

    /// The operation failed.
    fn on_error(&self, tx: &Transaction, error: &XaError);
}

impl<F> CompletionCallback for F
where
    F: Fn(&Transaction, std::result::Result<(), &XaError>) + Send + Sync + 'static,
{
    fn on_success(&self, tx: &Transaction) {
        self(tx, Ok(()))
    }

    fn on_error(&self, tx: &Transaction, error: &XaError) {
        self(tx, Err(error))
    }
}

/// Runs every `before_completion`, stopping at the first failure.
pub(super) async fn before_completion_all(
    xid: &xatm_core::Xid,
    synchronizations: &[Arc<dyn Synchronization>],
) -> Result<()> {
    for sync in synchronizations {
        let outcome = AssertUnwindSafe(sync.before_completion())
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(xid = %xid, sync = ?sync, error = %e, "before_completion failed");
                return Err(e);
            }
            Err(_) => {
                tracing::warn!(xid = %xid, sync = ?sync, "before_completion panicked");
                return Err(XaError::IllegalStateTransition(format!(
                    "synchronization {:?} panicked in before_completion",
                    sync
                )));
            }
        }
    }
    Ok(())
}

/// Runs every `after_completion`; failures are logged and do not stop the
/// remaining callbacks.
pub(super) async fn after_completion_all(
    xid: &xatm_core::Xid,
    synchronizations: &[Arc<dyn Synchronization>],
    status: Status,
) {
    for sync in synchronizations {
        let outcome = AssertUnwindSafe(sync.after_completion(status))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(xid = %xid, sync = ?sync, error = %e, "after_completion failed");
            }
            Err(_) => {
                tracing::warn!(xid = %xid, sync = ?sync, "after_completion panicked");
            }
        }
    }
}
