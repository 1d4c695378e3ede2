//! Distributed transactions and their participants.
//!
//! A [`Transaction`] is created by a [`TransactionDomain`](crate::TransactionDomain)
//! and shared by cloning: every clone refers to the same transaction.
//! Resources are enlisted while the transaction is active, synchronizations
//! are registered alongside them, and [`Transaction::commit`] or
//! [`Transaction::rollback`] drives every participant to a common outcome.
//!
//! # Example
//!
//! ```ignore
//! use xatm::{DomainConfig, TransactionDomain};
//!
//! let domain = TransactionDomain::create(DomainConfig::default());
//! let tx = domain.begin().await?;
//!
//! tx.enlist_resource(orders_db.clone()).await?;
//! tx.enlist_resource(billing_queue.clone()).await?;
//!
//! // ... work against both resources ...
//!
//! tx.commit().await?;
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use xatm_core::{Result, XaError, Xid};

use crate::domain::DomainShared;
use crate::resource::XaResource;
use crate::runtime::Runtime;

mod completion;
mod enlistment;
mod synchronization;

pub use enlistment::{DelistOutcome, EnlistmentState};
pub use synchronization::{CompletionCallback, Synchronization};

use enlistment::EnlistmentRegistry;

// ============================================================================
// Transaction Status
// ============================================================================

/// The status of a transaction.
///
/// `Committed` and `RolledBack` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    /// Resources may be enlisted and work performed.
    Active = 0,
    /// The transaction can only roll back.
    MarkedRollback = 1,
    /// Branches are being prepared.
    Preparing = 2,
    /// Every branch voted; the commit decision is pending.
    Prepared = 3,
    /// Branches are being committed.
    Committing = 4,
    /// The transaction committed.
    Committed = 5,
    /// Branches are being rolled back.
    RollingBack = 6,
    /// The transaction rolled back.
    RolledBack = 7,
}

impl Status {
    /// Returns true if the transaction reached its final outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Active,
            1 => Self::MarkedRollback,
            2 => Self::Preparing,
            3 => Self::Prepared,
            4 => Self::Committing,
            5 => Self::Committed,
            6 => Self::RollingBack,
            _ => Self::RolledBack,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::MarkedRollback => "marked-rollback",
            Self::Preparing => "preparing",
            Self::Prepared => "prepared",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::RollingBack => "rolling-back",
            Self::RolledBack => "rolled-back",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// State that only changes while the completion lock is held.
#[derive(Debug, Default)]
struct TransactionState {
    registry: EnlistmentRegistry,
    synchronizations: Vec<Arc<dyn Synchronization>>,
    before_completion_fired: bool,
}

struct TransactionInner {
    xid: Xid,
    timeout: Duration,
    deadline: Instant,
    /// Mirror of the status, readable without the lock.
    status: AtomicU8,
    rollback_only: AtomicBool,
    timed_out: AtomicBool,
    /// Set once the commit decision is under way; rollback-only and timeout
    /// requests are refused from then on.
    decided: AtomicBool,
    state: Mutex<TransactionState>,
    runtime: Arc<dyn Runtime>,
    domain: Weak<DomainShared>,
}

/// A handle to a distributed transaction.
///
/// Handles are cheap to clone and safe to share between tasks. Enlistment,
/// delistment and completion serialize on a per-transaction lock; status
/// queries and [`set_rollback_only`](Self::set_rollback_only) do not take it.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("xid", &self.inner.xid)
            .field("status", &self.status())
            .field("rollback_only", &self.is_rollback_only())
            .finish()
    }
}

/// A non-owning reference to a transaction.
#[derive(Clone)]
pub(crate) struct WeakTransaction(Weak<TransactionInner>);

impl WeakTransaction {
    pub(crate) fn upgrade(&self) -> Option<Transaction> {
        self.0.upgrade().map(|inner| Transaction { inner })
    }
}

impl Transaction {
    pub(crate) fn new(
        xid: Xid,
        timeout: Duration,
        runtime: Arc<dyn Runtime>,
        domain: Weak<DomainShared>,
    ) -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                xid,
                timeout,
                deadline: Instant::now() + timeout,
                status: AtomicU8::new(Status::Active as u8),
                rollback_only: AtomicBool::new(false),
                timed_out: AtomicBool::new(false),
                decided: AtomicBool::new(false),
                state: Mutex::new(TransactionState::default()),
                runtime,
                domain,
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakTransaction {
        WeakTransaction(Arc::downgrade(&self.inner))
    }

    /// Number of live handles to this transaction, including the caller's.
    pub(crate) fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Returns the global identifier of this transaction.
    pub fn xid(&self) -> &Xid {
        &self.inner.xid
    }

    /// Returns the current status.
    pub fn status(&self) -> Status {
        Status::from_u8(self.inner.status.load(Ordering::Acquire))
    }

    /// Returns the timeout the transaction was started with.
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Returns the instant after which the transaction times out.
    pub fn deadline(&self) -> Instant {
        self.inner.deadline
    }

    /// Returns the time left before the deadline.
    pub fn remaining(&self) -> Duration {
        self.inner.deadline.saturating_duration_since(Instant::now())
    }

    /// Returns true once the transaction has been marked rollback-only.
    pub fn is_rollback_only(&self) -> bool {
        self.inner.rollback_only.load(Ordering::SeqCst)
    }

    /// Returns true if the transaction exceeded its deadline before the
    /// commit decision was made.
    pub fn is_timed_out(&self) -> bool {
        self.inner.timed_out.load(Ordering::Acquire)
    }

    /// Marks the transaction so that its only possible outcome is rollback.
    ///
    /// Idempotent. Fails once the commit decision is under way or the
    /// transaction has completed.
    pub fn set_rollback_only(&self) -> Result<()> {
        let status = self.status();
        if status.is_terminal() {
            return Err(self.rollback_only_refused(status));
        }
        // The flag is published before the decision is read; commit does the
        // reverse, so at least one side observes the other.
        self.inner.rollback_only.store(true, Ordering::SeqCst);
        if self.inner.decided.load(Ordering::SeqCst) {
            return Err(self.rollback_only_refused(self.status()));
        }
        self.mark_rollback_only();
        Ok(())
    }

    fn rollback_only_refused(&self, status: Status) -> XaError {
        XaError::IllegalStateTransition(format!(
            "Cannot mark transaction {} rollback-only in status {}",
            self.inner.xid, status
        ))
    }

    fn mark_rollback_only(&self) {
        self.inner.rollback_only.store(true, Ordering::SeqCst);
        let _ = self.inner.status.compare_exchange(
            Status::Active as u8,
            Status::MarkedRollback as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn set_status(&self, status: Status) {
        self.inner.status.store(status as u8, Ordering::Release);
    }

    /// Marks the transaction timed out if its deadline has passed and the
    /// commit decision has not been made. Returns true if this call did so.
    pub(crate) fn expire_if_due(&self) -> bool {
        if Instant::now() < self.inner.deadline
            || self.inner.decided.load(Ordering::SeqCst)
            || !matches!(self.status(), Status::Active | Status::MarkedRollback)
        {
            return false;
        }
        if self.inner.timed_out.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.mark_rollback_only();
        tracing::warn!(xid = %self.inner.xid, timeout = ?self.inner.timeout, "transaction timed out");
        true
    }

    /// Reaper entry point: expires the transaction unless another task holds
    /// its lock, in which case that task checks the deadline itself.
    pub(crate) fn try_expire(&self) -> bool {
        match self.inner.state.try_lock() {
            Ok(_guard) => self.expire_if_due(),
            Err(_) => false,
        }
    }

    fn timeout_error(&self) -> XaError {
        XaError::TransactionTimeout(format!(
            "transaction {} exceeded its timeout of {:?}",
            self.inner.xid, self.inner.timeout
        ))
    }

    // ------------------------------------------------------------------------
    // Enlistment
    // ------------------------------------------------------------------------

    /// Associates a resource with this transaction.
    ///
    /// Resources sharing a resource manager with an already enlisted
    /// resource join its branch; others start a new branch. Re-enlisting a
    /// suspended resource resumes it.
    ///
    /// # Errors
    ///
    /// [`XaError::ResourceEnlistmentFailure`] if the transaction is not
    /// active, the resource is already actively enlisted, or `start` fails.
    /// [`XaError::TransactionTimeout`] if the transaction timed out.
    pub async fn enlist_resource(&self, resource: Arc<dyn XaResource>) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        self.expire_if_due();
        match self.status() {
            Status::Active => {}
            _ if self.is_timed_out() => return Err(self.timeout_error()),
            status => {
                return Err(XaError::ResourceEnlistmentFailure(format!(
                    "Cannot enlist {} in transaction {} in status {}",
                    resource.name(),
                    self.inner.xid,
                    status
                )));
            }
        }
        let remaining = self.remaining();
        state
            .registry
            .enlist(&self.inner.xid, resource, remaining)
            .await
    }

    /// Ends the association of a resource with this transaction.
    ///
    /// [`DelistOutcome::Fail`], or an `end` call that fails, marks the
    /// transaction rollback-only.
    pub async fn delist_resource(
        &self,
        resource: &Arc<dyn XaResource>,
        outcome: DelistOutcome,
    ) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let status = self.status();
        if !matches!(status, Status::Active | Status::MarkedRollback) {
            return Err(XaError::IllegalStateTransition(format!(
                "Cannot delist {} from transaction {} in status {}",
                resource.name(),
                self.inner.xid,
                status
            )));
        }
        let result = state.registry.delist(resource, outcome).await;
        if outcome == DelistOutcome::Fail || result.is_err() {
            self.mark_rollback_only();
        }
        result
    }

    /// Registers a synchronization to be notified around completion.
    ///
    /// Synchronizations are invoked in registration order.
    pub async fn register_synchronization(&self, sync: Arc<dyn Synchronization>) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        self.expire_if_due();
        match self.status() {
            Status::Active => {
                state.synchronizations.push(sync);
                Ok(())
            }
            _ if self.is_timed_out() => Err(self.timeout_error()),
            Status::MarkedRollback => Err(XaError::TransactionRolledBack(format!(
                "transaction {} is marked rollback-only",
                self.inner.xid
            ))),
            status => Err(XaError::IllegalStateTransition(format!(
                "Cannot register synchronization on transaction {} in status {}",
                self.inner.xid, status
            ))),
        }
    }

    /// Returns true if the enlisted resources collapse to exactly one
    /// branch, so commit can skip the prepare phase.
    pub async fn can_use_one_phase_commit(&self) -> bool {
        self.inner.state.lock().await.registry.group_count() == 1
    }

    /// Returns the number of enlisted resources.
    pub async fn resource_count(&self) -> usize {
        self.inner.state.lock().await.registry.resource_count()
    }

    /// Returns the number of branches, one per distinct resource manager.
    pub async fn branch_count(&self) -> usize {
        self.inner.state.lock().await.registry.group_count()
    }

    /// Returns the association state of `resource`, if it was enlisted.
    pub async fn enlistment_state(&self, resource: &Arc<dyn XaResource>) -> Option<EnlistmentState> {
        self.inner.state.lock().await.registry.state_of(resource)
    }
}
