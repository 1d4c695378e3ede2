use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use xatm_core::{Result, XaError};

use super::factory::PhysicalConnection;
use super::manager::{PoolShared, Validity};
use super::ConnectionId;
use crate::resource::XaResource;
use crate::transaction::{DelistOutcome, EnlistmentState, Status, Transaction};

/// A logical handle to a pooled physical connection.
///
/// Every operation first checks the handle against the connection's
/// validity token; once the connection has been evicted the handle fails
/// with [`XaError::StaleConnectionHandle`] and never reaches a different
/// physical connection.
///
/// Call [`close`](Self::close) to hand the connection back. Dropping a handle
/// without closing it still returns the connection, but logs a warning.
pub struct PooledHandle {
    pool: Arc<PoolShared>,
    id: ConnectionId,
    physical: Arc<dyn PhysicalConnection>,
    resource: Arc<dyn XaResource>,
    validity: Arc<Validity>,
    stamp: u64,
    transaction: Option<Transaction>,
    released: bool,
}

impl fmt::Debug for PooledHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledHandle")
            .field("id", &self.id)
            .field("stale", &self.is_stale())
            .field("transaction", &self.transaction.as_ref().map(|tx| tx.xid()))
            .finish()
    }
}

impl PooledHandle {
    pub(crate) fn new(
        pool: Arc<PoolShared>,
        id: ConnectionId,
        physical: Arc<dyn PhysicalConnection>,
        resource: Arc<dyn XaResource>,
        validity: Arc<Validity>,
    ) -> Self {
        let stamp = validity.token();
        Self {
            pool,
            id,
            physical,
            resource,
            validity,
            stamp,
            transaction: None,
            released: false,
        }
    }

    /// Returns the ID of the underlying physical connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn stamp(&self) -> u64 {
        self.stamp
    }

    /// Returns true if the connection was evicted after this handle was
    /// issued.
    pub fn is_stale(&self) -> bool {
        self.validity.token() != self.stamp
    }

    /// Returns the transaction this handle was last enlisted in.
    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    fn check(&self) -> Result<()> {
        if self.is_stale() {
            return Err(XaError::StaleConnectionHandle(format!(
                "{} was evicted after this handle was issued",
                self.id
            )));
        }
        if let Some(tx) = &self.transaction {
            if tx.is_timed_out() && !tx.status().is_terminal() {
                return Err(XaError::TransactionTimeout(format!(
                    "transaction {} using {} timed out",
                    tx.xid(),
                    self.id
                )));
            }
        }
        self.validity.touch();
        Ok(())
    }

    /// Returns the physical connection after revalidating the handle.
    pub fn connection(&self) -> Result<&dyn PhysicalConnection> {
        self.check()?;
        Ok(self.physical.as_ref())
    }

    /// Returns the transactional resource after revalidating the handle.
    pub fn xa_resource(&self) -> Result<Arc<dyn XaResource>> {
        self.check()?;
        Ok(Arc::clone(&self.resource))
    }

    /// Enlists the connection's resource in `tx`.
    ///
    /// While `tx` is unfinished the connection is exempt from pruning, even
    /// after the handle is closed.
    ///
    /// # Errors
    ///
    /// [`XaError::ResourceEnlistmentFailure`] if the handle is still enlisted
    /// in a different unfinished transaction, plus any error of
    /// [`Transaction::enlist_resource`].
    pub async fn enlist(&mut self, tx: &Transaction) -> Result<()> {
        self.check()?;
        if let Some(current) = &self.transaction {
            if current.xid() != tx.xid() && !current.status().is_terminal() {
                return Err(XaError::ResourceEnlistmentFailure(format!(
                    "Cannot enlist {} in {} while enlisted in {}",
                    self.id,
                    tx.xid(),
                    current.xid()
                )));
            }
        }
        tx.enlist_resource(Arc::clone(&self.resource)).await?;
        self.pool.track_enlistment(self.id, self.stamp, tx.clone());
        self.transaction = Some(tx.clone());
        Ok(())
    }

    /// Ends the association with the enlisted transaction.
    pub async fn delist(&mut self, outcome: DelistOutcome) -> Result<()> {
        if self.is_stale() {
            return Err(XaError::StaleConnectionHandle(format!(
                "{} was evicted after this handle was issued",
                self.id
            )));
        }
        let Some(tx) = &self.transaction else {
            return Err(XaError::IllegalStateTransition(format!(
                "Cannot delist {}: not enlisted",
                self.id
            )));
        };
        tx.delist_resource(&self.resource, outcome).await
    }

    /// Reports an error seen on the connection. A fatal error evicts it,
    /// making this and every other handle to it stale.
    pub async fn notify_error(&self, error: &XaError, fatal: bool) {
        if !fatal {
            tracing::debug!(connection = %self.id, error = %error, "connection error reported");
            return;
        }
        tracing::warn!(connection = %self.id, error = %error, "fatal connection error, evicting");
        if let Some(physical) = self.pool.evict(self.id, self.stamp) {
            self.pool.close_physical(self.id, physical, "fatal error").await;
        }
    }

    /// Returns the connection to the pool.
    ///
    /// If the handle's resource is still associated with an unfinished
    /// transaction, it is delisted with success first. Closing a stale
    /// handle does nothing.
    ///
    /// # Errors
    ///
    /// The delist error, in which case the connection is evicted instead of
    /// being returned.
    pub async fn close(mut self) -> Result<()> {
        self.released = true;
        if self.is_stale() {
            tracing::debug!(connection = %self.id, "closing stale handle");
            return Ok(());
        }
        let tx = self.transaction.take();
        let result = match &tx {
            Some(tx) => delist_on_close(tx, &self.resource).await,
            None => Ok(()),
        };
        match &result {
            Ok(()) => self.pool.release(self.id, self.stamp, tx),
            Err(e) => {
                tracing::warn!(connection = %self.id, error = %e, "delist on close failed, evicting");
                if let Some(physical) = self.pool.evict(self.id, self.stamp) {
                    self.pool.close_physical(self.id, physical, "delist failed").await;
                }
            }
        }
        result
    }
}

async fn delist_on_close(tx: &Transaction, resource: &Arc<dyn XaResource>) -> Result<()> {
    if !matches!(tx.status(), Status::Active | Status::MarkedRollback) {
        return Ok(());
    }
    match tx.enlistment_state(resource).await {
        Some(EnlistmentState::Active) | Some(EnlistmentState::Suspended) => {
            tx.delist_resource(resource, DelistOutcome::Success).await
        }
        _ => Ok(()),
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.is_stale() {
            return;
        }
        tracing::warn!(connection = %self.id, "pooled handle dropped without close");

        match self.transaction.take() {
            Some(tx) if !tx.status().is_terminal() => {
                if tokio::runtime::Handle::try_current().is_ok() {
                    let pool = Arc::clone(&self.pool);
                    let resource = Arc::clone(&self.resource);
                    let (id, stamp) = (self.id, self.stamp);
                    self.pool.runtime.spawn(Box::pin(async move {
                        if let Err(e) = delist_on_close(&tx, &resource).await {
                            tracing::warn!(connection = %id, error = %e, "delist of dropped handle failed");
                        }
                        pool.release(id, stamp, Some(tx));
                    }));
                } else if let Some(physical) = self.pool.evict(self.id, self.stamp) {
                    // No runtime to delist on; the branch is abandoned with the connection.
                    let closing =
                        self.pool
                            .close_physical(self.id, physical, "dropped outside runtime");
                    let outcome =
                        futures::executor::block_on(AssertUnwindSafe(closing).catch_unwind());
                    if outcome.is_err() {
                        tracing::warn!(
                            connection = %self.id,
                            "close of dropped connection panicked; connection leaked"
                        );
                    }
                }
            }
            tx => self.pool.release(self.id, self.stamp, tx),
        }
    }
}
