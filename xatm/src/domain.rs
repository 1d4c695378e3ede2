//! The transaction domain: registry of live transactions, timeout reaper,
//! lifecycle events and shutdown.
//!
//! A [`TransactionDomain`] is the context object every transaction belongs
//! to. There is no process-wide state: an application creates one domain
//! (or several, e.g. one per test) and passes it to the code that begins
//! transactions.
//!
//! # Example
//!
//! ```rust,no_run
//! use xatm::{DomainConfig, TransactionDomain};
//!
//! # async fn example() -> xatm::Result<()> {
//! let domain = TransactionDomain::create(DomainConfig::default());
//! let tx = domain.begin().await?;
//! // enlist resources, do work ...
//! tx.commit().await?;
//! domain.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, watch, RwLock};

use xatm_core::{Result, TransactionIdentifier, XaError, Xid};

use crate::config::DomainConfig;
use crate::pool::{ConnectionFactory, ConnectionPool};
use crate::resource::{XaResource, TMENDRSCAN, TMSTARTRSCAN};
use crate::runtime::{Runtime, TokioRuntime};
use crate::transaction::{Status, Transaction};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle events emitted by a [`TransactionDomain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionEvent {
    /// A transaction was begun or imported.
    Begun {
        /// The global identifier.
        xid: Xid,
    },
    /// The reaper marked a transaction rollback-only after its deadline.
    TimedOut {
        /// The global identifier.
        xid: Xid,
    },
    /// A transaction reached a terminal status and left the domain.
    Completed {
        /// The global identifier.
        xid: Xid,
        /// The final status.
        status: Status,
    },
}

pub(crate) struct DomainShared {
    config: DomainConfig,
    runtime: Arc<dyn Runtime>,
    transactions: RwLock<HashMap<Xid, Transaction>>,
    pools: parking_lot::Mutex<Vec<ConnectionPool>>,
    events: broadcast::Sender<TransactionEvent>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl DomainShared {
    pub(crate) async fn transaction_completed(&self, tx: &Transaction) {
        let removed = {
            let mut transactions = self.transactions.write().await;
            match transactions.get(tx.xid()) {
                Some(registered) if registered.status().is_terminal() => {
                    transactions.remove(tx.xid())
                }
                _ => None,
            }
        };
        if removed.is_some() {
            let _ = self.events.send(TransactionEvent::Completed {
                xid: tx.xid().clone(),
                status: tx.status(),
            });
        }
    }

    async fn reap(&self) {
        let live: Vec<Transaction> = self.transactions.read().await.values().cloned().collect();
        for tx in live {
            if tx.try_expire() {
                let _ = self.events.send(TransactionEvent::TimedOut {
                    xid: tx.xid().clone(),
                });
            }
            // Only the registry and this snapshot still refer to it: nobody
            // is left to complete the transaction.
            if tx.is_timed_out()
                && tx.handle_count() == 2
                && matches!(tx.status(), Status::Active | Status::MarkedRollback)
            {
                tracing::warn!(xid = %tx.xid(), "rolling back abandoned transaction");
                if let Err(e) = tx.rollback().await {
                    tracing::warn!(
                        xid = %tx.xid(),
                        error = %e,
                        "rollback of abandoned transaction failed"
                    );
                }
            }
        }
    }
}

/// Owns the transactions of one application and the background work that
/// keeps them honest.
///
/// Cloning yields another handle to the same domain.
#[derive(Clone)]
pub struct TransactionDomain {
    shared: Arc<DomainShared>,
}

impl fmt::Debug for TransactionDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionDomain")
            .field("name", &self.shared.config.name())
            .field("closed", &self.is_shutdown())
            .finish()
    }
}

impl TransactionDomain {
    /// Creates a domain whose reaper runs on Tokio.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn create(config: DomainConfig) -> Self {
        Self::with_runtime(config, Arc::new(TokioRuntime))
    }

    /// Creates a domain that spawns background work through `runtime`.
    pub fn with_runtime(config: DomainConfig, runtime: Arc<dyn Runtime>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(DomainShared {
            config,
            runtime,
            transactions: RwLock::new(HashMap::new()),
            pools: parking_lot::Mutex::new(Vec::new()),
            events,
            shutdown,
            closed: AtomicBool::new(false),
        });
        spawn_reaper(&shared);
        tracing::info!(domain = %shared.config.name(), "transaction domain created");
        Self { shared }
    }

    /// Returns the domain name.
    pub fn name(&self) -> &str {
        self.shared.config.name()
    }

    /// Returns the domain configuration.
    pub fn config(&self) -> &DomainConfig {
        &self.shared.config
    }

    /// Begins a transaction with the configured default timeout.
    pub async fn begin(&self) -> Result<Transaction> {
        self.begin_with_timeout(Duration::ZERO).await
    }

    /// Begins a transaction. A zero `timeout` selects the default; longer
    /// timeouts are clamped to the configured maximum.
    pub async fn begin_with_timeout(&self, timeout: Duration) -> Result<Transaction> {
        self.register(Xid::new_global(), timeout).await
    }

    /// Begins a transaction under an identifier issued by another
    /// transaction manager. A branch identifier is reduced to its global
    /// part.
    ///
    /// # Errors
    ///
    /// [`XaError::InvalidTransactionIdentifier`] for oversize identifiers,
    /// [`XaError::IllegalStateTransition`] if a transaction with the same
    /// identifier is already live in this domain.
    pub async fn import(
        &self,
        foreign: &dyn TransactionIdentifier,
        timeout: Duration,
    ) -> Result<Transaction> {
        let xid = Xid::import(foreign)?.to_global();
        self.register(xid, timeout).await
    }

    async fn register(&self, xid: Xid, timeout: Duration) -> Result<Transaction> {
        if self.is_shutdown() {
            return Err(XaError::IllegalStateTransition(format!(
                "Cannot begin a transaction: domain '{}' is shut down",
                self.name()
            )));
        }
        let timeout = self.shared.config.transaction().effective_timeout(timeout);
        let tx = Transaction::new(
            xid.clone(),
            timeout,
            Arc::clone(&self.shared.runtime),
            Arc::downgrade(&self.shared),
        );
        {
            let mut transactions = self.shared.transactions.write().await;
            if transactions.contains_key(&xid) {
                return Err(XaError::IllegalStateTransition(format!(
                    "Cannot begin transaction {}: already active",
                    xid
                )));
            }
            transactions.insert(xid.clone(), tx.clone());
        }
        tracing::info!(xid = %xid, timeout = ?timeout, "transaction begun");
        let _ = self.shared.events.send(TransactionEvent::Begun { xid });
        Ok(tx)
    }

    /// Returns the live transaction with the given global identifier.
    pub async fn lookup(&self, xid: &Xid) -> Option<Transaction> {
        self.shared.transactions.read().await.get(&xid.to_global()).cloned()
    }

    /// Returns every transaction that has not completed yet.
    pub async fn active_transactions(&self) -> Vec<Transaction> {
        self.shared.transactions.read().await.values().cloned().collect()
    }

    /// Asks `resource` for its in-doubt branches and returns those minted by
    /// this coordinator.
    pub async fn recover(&self, resource: &dyn XaResource) -> Result<Vec<Xid>> {
        let found = resource.recover(TMSTARTRSCAN | TMENDRSCAN).await?;
        let total = found.len();
        let ours: Vec<Xid> = found.into_iter().filter(Xid::is_internal).collect();
        tracing::info!(
            resource = resource.name(),
            in_doubt = ours.len(),
            foreign = total - ours.len(),
            "recovery scan finished"
        );
        Ok(ours)
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransactionEvent> {
        self.shared.events.subscribe()
    }

    /// Creates a connection pool configured from this domain. The pool is
    /// shut down together with the domain.
    pub fn connection_pool(&self, factory: Arc<dyn ConnectionFactory>) -> ConnectionPool {
        let pool = ConnectionPool::with_runtime(
            self.shared.config.pool().clone(),
            factory,
            Arc::clone(&self.shared.runtime),
        );
        self.shared.pools.lock().push(pool.clone());
        pool
    }

    /// Returns true once [`shutdown`](Self::shutdown) was called.
    pub fn is_shutdown(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stops the reaper, rolls back every transaction that has not reached
    /// its commit decision, and shuts down the domain's pools.
    ///
    /// Later calls to [`begin`](Self::begin) fail with
    /// [`XaError::IllegalStateTransition`].
    pub async fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shared.shutdown.send(true);

        for tx in self.active_transactions().await {
            if !matches!(tx.status(), Status::Active | Status::MarkedRollback) {
                continue;
            }
            if let Err(e) = tx.rollback().await {
                tracing::warn!(xid = %tx.xid(), error = %e, "rollback during shutdown failed");
            }
        }

        let pools = std::mem::take(&mut *self.shared.pools.lock());
        for pool in pools {
            pool.shutdown().await;
        }
        tracing::info!(domain = %self.name(), "transaction domain shut down");
    }
}

fn spawn_reaper(shared: &Arc<DomainShared>) {
    let weak: Weak<DomainShared> = Arc::downgrade(shared);
    let interval = shared.config.transaction().reaper_interval();
    let runtime = Arc::clone(&shared.runtime);
    let mut shutdown_rx = shared.shutdown.subscribe();

    shared.runtime.spawn(Box::pin(async move {
        loop {
            tokio::select! {
                _ = runtime.sleep(interval) => {
                    let Some(shared) = weak.upgrade() else {
                        break;
                    };
                    shared.reap().await;
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        tracing::debug!("timeout reaper shutting down");
                        break;
                    }
                }
            }
        }
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestResource;

    fn domain() -> TransactionDomain {
        TransactionDomain::create(DomainConfig::default())
    }

    #[test]
    fn test_domain_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TransactionDomain>();
        assert_send_sync::<TransactionEvent>();
    }

    #[tokio::test]
    async fn test_begin_registers_and_commit_deregisters() {
        let domain = domain();
        let mut events = domain.subscribe();
        let tx = domain.begin().await.unwrap();
        assert_eq!(tx.timeout(), Duration::from_secs(120));
        assert!(domain.lookup(tx.xid()).await.is_some());

        tx.commit().await.unwrap();
        assert!(domain.lookup(tx.xid()).await.is_none());
        assert_eq!(
            events.recv().await.unwrap(),
            TransactionEvent::Begun { xid: tx.xid().clone() }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            TransactionEvent::Completed {
                xid: tx.xid().clone(),
                status: Status::Committed
            }
        );
    }

    #[tokio::test]
    async fn test_timeout_is_clamped() {
        let config = DomainConfig::builder()
            .transaction(|t| t.max_timeout(Duration::from_secs(10)).default_timeout(Duration::from_secs(5)))
            .build()
            .unwrap();
        let domain = TransactionDomain::create(config);
        let tx = domain
            .begin_with_timeout(Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(tx.timeout(), Duration::from_secs(10));
    }

    fn short_lived_domain() -> TransactionDomain {
        let config = DomainConfig::builder()
            .transaction(|t| {
                t.default_timeout(Duration::from_secs(1))
                    .reaper_interval(Duration::from_secs(3600))
            })
            .build()
            .unwrap();
        TransactionDomain::create(config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_rolls_back_abandoned_transaction() {
        let domain = short_lived_domain();
        let resource = TestResource::new("a", "db");
        let tx = domain.begin().await.unwrap();
        tx.enlist_resource(resource.clone()).await.unwrap();
        drop(tx);

        tokio::time::advance(Duration::from_secs(2)).await;
        domain.shared.reap().await;

        assert!(domain.active_transactions().await.is_empty());
        assert_eq!(
            resource.count(|c| matches!(c, crate::testing::Call::Rollback(_))),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_leaves_held_transaction_to_its_owner() {
        let domain = short_lived_domain();
        let tx = domain.begin().await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        domain.shared.reap().await;

        assert_eq!(tx.status(), Status::MarkedRollback);
        assert!(domain.lookup(tx.xid()).await.is_some());
        assert!(matches!(
            tx.commit().await.unwrap_err(),
            XaError::TransactionTimeout(_)
        ));
    }

    #[tokio::test]
    async fn test_import_uses_global_part() {
        let domain = domain();
        let foreign = Xid::new(0x1234, b"global", b"branch").unwrap();
        let tx = domain.import(&foreign, Duration::ZERO).await.unwrap();
        assert_eq!(tx.xid().global_transaction_id(), b"global");
        assert!(tx.xid().branch_qualifier().is_empty());
        assert!(domain.lookup(&foreign).await.is_some());

        let err = domain.import(&foreign, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, XaError::IllegalStateTransition(_)));
    }

    #[tokio::test]
    async fn test_shutdown_rolls_back_and_rejects_begin() {
        let domain = domain();
        let tx = domain.begin().await.unwrap();
        let resource = TestResource::new("a", "db");
        tx.enlist_resource(resource.clone()).await.unwrap();

        domain.shutdown().await;
        assert_eq!(tx.status(), Status::RolledBack);
        assert!(domain.active_transactions().await.is_empty());
        assert!(matches!(
            domain.begin().await.unwrap_err(),
            XaError::IllegalStateTransition(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_marks_expired_transaction() {
        let config = DomainConfig::builder()
            .transaction(|t| {
                t.default_timeout(Duration::from_secs(2))
                    .reaper_interval(Duration::from_millis(500))
            })
            .build()
            .unwrap();
        let domain = TransactionDomain::create(config);
        let mut events = domain.subscribe();
        let tx = domain.begin().await.unwrap();
        let _ = events.recv().await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(tx.is_timed_out());
        assert_eq!(tx.status(), Status::MarkedRollback);
        assert_eq!(
            events.recv().await.unwrap(),
            TransactionEvent::TimedOut { xid: tx.xid().clone() }
        );
        assert!(matches!(
            tx.commit().await.unwrap_err(),
            XaError::TransactionTimeout(_)
        ));
    }
}
