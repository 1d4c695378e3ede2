//! Commit and rollback of a transaction across its branches.

use std::sync::atomic::Ordering;

use tokio::time::Instant;
use tracing::instrument;

use xatm_core::{HeuristicKind, Result, XaError};

use super::enlistment::ResourceGroup;
use super::synchronization::{after_completion_all, before_completion_all, CompletionCallback};
use super::{Status, Transaction, TransactionState};
use crate::resource::{BranchOutcome, Vote, TMFAIL, TMSUCCESS};

/// A branch whose completion call did not end the way the coordinator asked.
#[derive(Debug)]
struct BranchFailure {
    resource: String,
    outcome: BranchOutcome,
    error: XaError,
}

impl Transaction {
    /// Commits the transaction.
    ///
    /// With a single branch the prepare phase is skipped and the resource is
    /// asked to commit in one phase. With several branches every branch is
    /// prepared first; a rollback vote or a prepare failure rolls everything
    /// back. Once every branch voted to commit, every branch is sent a commit
    /// even if some of them fail.
    ///
    /// # Errors
    ///
    /// - [`XaError::TransactionTimeout`] if the transaction timed out.
    /// - [`XaError::TransactionRolledBack`] if a single-branch transaction was
    ///   marked rollback-only; with several branches the rollback is reported
    ///   as [`XaError::Heuristic`] with [`HeuristicKind::Rollback`].
    /// - [`XaError::ResourceVoteRollback`] if a branch refused to prepare.
    /// - [`XaError::Heuristic`] if a synchronization forced a rollback, or if
    ///   branches disagreed about the outcome after the commit decision.
    /// - [`XaError::IllegalStateTransition`] if the transaction is not active.
    #[instrument(
        name = "transaction.commit",
        skip(self),
        fields(xid = %self.inner.xid)
    )]
    pub async fn commit(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        self.ensure_completable("commit")?;
        let result = self.commit_locked(&mut state).await;
        drop(state);
        self.report_completion(&result).await;
        result
    }

    /// Rolls back the transaction.
    ///
    /// Rollback failures of individual branches are logged and do not stop
    /// the remaining branches. A branch that reports it already committed
    /// heuristically is surfaced as [`XaError::Heuristic`].
    #[instrument(
        name = "transaction.rollback",
        skip(self),
        fields(xid = %self.inner.xid)
    )]
    pub async fn rollback(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        self.ensure_completable("roll back")?;
        let result = self.rollback_locked(&mut state).await;
        drop(state);
        self.report_completion(&result).await;
        result
    }

    /// Commits the transaction on a background task and reports the outcome
    /// to `callback`.
    ///
    /// The callback runs after every synchronization's `after_completion`.
    /// Once spawned the commit runs to completion.
    pub fn commit_async(&self, callback: impl CompletionCallback) {
        let tx = self.clone();
        self.inner.runtime.spawn(Box::pin(async move {
            match tx.commit().await {
                Ok(()) => callback.on_success(&tx),
                Err(e) => callback.on_error(&tx, &e),
            }
        }));
    }

    /// Rolls back the transaction on a background task and reports the
    /// outcome to `callback`.
    pub fn rollback_async(&self, callback: impl CompletionCallback) {
        let tx = self.clone();
        self.inner.runtime.spawn(Box::pin(async move {
            match tx.rollback().await {
                Ok(()) => callback.on_success(&tx),
                Err(e) => callback.on_error(&tx, &e),
            }
        }));
    }

    fn ensure_completable(&self, action: &str) -> Result<()> {
        match self.status() {
            Status::Active | Status::MarkedRollback => Ok(()),
            status => Err(XaError::IllegalStateTransition(format!(
                "Cannot {} transaction {} in status {}",
                action, self.inner.xid, status
            ))),
        }
    }

    async fn report_completion(&self, result: &Result<()>) {
        let status = self.status();
        match result {
            Ok(()) => tracing::info!(xid = %self.inner.xid, status = %status, "transaction completed"),
            Err(e) => tracing::warn!(
                xid = %self.inner.xid,
                status = %status,
                error = %e,
                "transaction completed with error"
            ),
        }
        if let Some(domain) = self.inner.domain.upgrade() {
            domain.transaction_completed(self).await;
        }
    }

    async fn commit_locked(&self, state: &mut TransactionState) -> Result<()> {
        self.expire_if_due();
        if self.is_rollback_only() {
            return self.refuse_commit(state).await;
        }

        if state.registry.group_count() <= 1 {
            self.commit_one_phase(state).await
        } else {
            self.commit_two_phase(state).await
        }
    }

    /// Commit of a transaction already marked rollback-only.
    ///
    /// A timed-out transaction rolls back and reports the timeout. Otherwise
    /// a multi-branch transaction enters the prepare phase far enough to run
    /// before-completion callbacks, then rolls back and reports a heuristic
    /// rollback; a single branch is rolled back directly.
    async fn refuse_commit(&self, state: &mut TransactionState) -> Result<()> {
        if self.is_timed_out() {
            self.rollback_locked(state).await?;
            return Err(self.timeout_error());
        }
        if state.registry.group_count() < 2 {
            self.rollback_locked(state).await?;
            return Err(XaError::TransactionRolledBack(format!(
                "transaction {} was marked rollback-only",
                self.inner.xid
            )));
        }

        self.set_status(Status::Preparing);
        // Failures are logged by the helper; the outcome is rollback either way.
        let _ = self.fire_before_completion(state).await;
        self.rollback_locked(state).await?;
        Err(XaError::heuristic(
            HeuristicKind::Rollback,
            format!(
                "transaction {} was marked rollback-only and rolled back",
                self.inner.xid
            ),
        ))
    }

    /// Runs before-completion callbacks and ends the open associations.
    /// On failure the transaction has been rolled back and the error to
    /// return is produced.
    async fn prepare_for_completion(&self, state: &mut TransactionState) -> Result<()> {
        if let Err(e) = self.fire_before_completion(state).await {
            self.rollback_locked(state).await?;
            return Err(XaError::heuristic(
                HeuristicKind::Rollback,
                format!("before_completion failed, transaction rolled back: {}", e),
            ));
        }

        let failures = state.registry.end_all(TMSUCCESS).await;
        if let Some((resource, e)) = failures.into_iter().next() {
            self.rollback_locked(state).await?;
            return Err(XaError::TransactionRolledBack(format!(
                "{} failed to end its branch: {}",
                resource, e
            )));
        }

        self.expire_if_due();
        self.inner.decided.store(true, Ordering::SeqCst);
        if self.is_rollback_only() {
            let timed_out = self.is_timed_out();
            self.rollback_locked(state).await?;
            return Err(if timed_out {
                self.timeout_error()
            } else {
                XaError::heuristic(
                    HeuristicKind::Rollback,
                    "rollback requested during before_completion",
                )
            });
        }
        Ok(())
    }

    async fn commit_one_phase(&self, state: &mut TransactionState) -> Result<()> {
        self.set_status(Status::Committing);
        self.prepare_for_completion(state).await?;

        let (status, result) = match state.registry.groups().first() {
            None => (Status::Committed, Ok(())),
            Some(group) => {
                tracing::debug!(resource = group.leader.name(), "one-phase commit");
                match group.leader.commit(&group.branch, true).await {
                    Ok(()) => (Status::Committed, Ok(())),
                    Err(e) => self.classify_one_phase_failure(group, e).await,
                }
            }
        };

        self.set_status(status);
        after_completion_all(&self.inner.xid, &state.synchronizations, status).await;
        result
    }

    async fn classify_one_phase_failure(
        &self,
        group: &ResourceGroup,
        error: XaError,
    ) -> (Status, Result<()>) {
        let outcome = BranchOutcome::from_error(&error);
        if BranchOutcome::needs_forget(&error) {
            self.forget_branch(group).await;
        }
        let name = group.leader.name();
        match outcome {
            BranchOutcome::Committed => (Status::Committed, Ok(())),
            BranchOutcome::RolledBack => (
                Status::RolledBack,
                Err(XaError::TransactionRolledBack(format!(
                    "{} rolled back during one-phase commit: {}",
                    name, error
                ))),
            ),
            BranchOutcome::Mixed => (
                Status::Committed,
                Err(XaError::heuristic(
                    HeuristicKind::Mixed,
                    format!("{} partially committed: {}", name, error),
                )),
            ),
            BranchOutcome::Unknown => (
                Status::Committed,
                Err(XaError::heuristic(
                    HeuristicKind::Hazard,
                    format!("outcome of {} is unknown: {}", name, error),
                )),
            ),
        }
    }

    async fn commit_two_phase(&self, state: &mut TransactionState) -> Result<()> {
        self.set_status(Status::Preparing);
        self.prepare_for_completion(state).await?;

        let mut veto = None;
        for group in state.registry.groups_mut() {
            match group.leader.prepare(&group.branch).await {
                Ok(vote) => {
                    tracing::debug!(
                        resource = group.leader.name(),
                        members = group.members,
                        vote = ?vote,
                        "prepared"
                    );
                    group.vote = Some(vote);
                    if vote == Vote::Rollback {
                        veto = Some(format!("{} voted rollback", group.leader.name()));
                        break;
                    }
                }
                Err(e) => {
                    if BranchOutcome::from_error(&e) == BranchOutcome::RolledBack {
                        group.vote = Some(Vote::Rollback);
                    }
                    veto = Some(format!("{} failed to prepare: {}", group.leader.name(), e));
                    break;
                }
            }
        }
        if let Some(reason) = veto {
            tracing::warn!(xid = %self.inner.xid, reason = %reason, "prepare phase failed");
            self.rollback_locked(state).await?;
            return Err(XaError::ResourceVoteRollback(reason));
        }

        self.set_status(Status::Prepared);
        let committing = state
            .registry
            .groups()
            .iter()
            .filter(|g| g.vote == Some(Vote::Commit))
            .count();
        if committing == 0 {
            tracing::debug!(xid = %self.inner.xid, "every branch was read-only");
            self.set_status(Status::Committed);
            after_completion_all(&self.inner.xid, &state.synchronizations, Status::Committed)
                .await;
            return Ok(());
        }

        if Instant::now() >= self.inner.deadline {
            self.inner.timed_out.store(true, Ordering::Release);
            tracing::warn!(xid = %self.inner.xid, "deadline passed after prepare, rolling back");
            self.rollback_locked(state).await?;
            return Err(self.timeout_error());
        }

        self.set_status(Status::Committing);
        let mut committed = 0usize;
        let mut failures = Vec::new();
        for group in state.registry.groups() {
            if group.vote != Some(Vote::Commit) {
                continue;
            }
            match group.leader.commit(&group.branch, false).await {
                Ok(()) => committed += 1,
                Err(error) => {
                    let outcome = BranchOutcome::from_error(&error);
                    if BranchOutcome::needs_forget(&error) {
                        self.forget_branch(group).await;
                    }
                    if outcome == BranchOutcome::Committed {
                        committed += 1;
                    } else {
                        tracing::warn!(
                            resource = group.leader.name(),
                            outcome = ?outcome,
                            error = %error,
                            "branch did not commit"
                        );
                        failures.push(BranchFailure {
                            resource: group.leader.name().to_string(),
                            outcome,
                            error,
                        });
                    }
                }
            }
        }

        self.set_status(Status::Committed);
        after_completion_all(&self.inner.xid, &state.synchronizations, Status::Committed).await;

        match summarize_commit_failures(committed, &failures) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Rolls back every branch that still needs it. Runs before-completion
    /// callbacks if commit has not already done so.
    async fn rollback_locked(&self, state: &mut TransactionState) -> Result<()> {
        self.set_status(Status::RollingBack);
        if !state.before_completion_fired {
            // Failures are logged by the helper; rollback proceeds regardless.
            let _ = self.fire_before_completion(state).await;
        }

        for (resource, e) in state.registry.end_all(TMFAIL).await {
            tracing::debug!(resource = %resource, error = %e, "end(TMFAIL) failed");
        }

        let mut rolled_back = 0usize;
        let mut mixed = false;
        let mut heuristically_committed = Vec::new();
        for group in state.registry.groups() {
            if !group.needs_rollback() {
                continue;
            }
            let error = match group.leader.rollback(&group.branch).await {
                Ok(()) => {
                    rolled_back += 1;
                    continue;
                }
                Err(error) => error,
            };
            if BranchOutcome::needs_forget(&error) {
                self.forget_branch(group).await;
            }
            match BranchOutcome::from_error(&error) {
                BranchOutcome::RolledBack => rolled_back += 1,
                BranchOutcome::Committed => {
                    heuristically_committed.push(group.leader.name().to_string())
                }
                BranchOutcome::Mixed => {
                    mixed = true;
                    heuristically_committed.push(group.leader.name().to_string());
                }
                BranchOutcome::Unknown => tracing::warn!(
                    resource = group.leader.name(),
                    branch = %group.branch,
                    error = %error,
                    "rollback failed, branch left for recovery"
                ),
            }
        }

        self.set_status(Status::RolledBack);
        after_completion_all(&self.inner.xid, &state.synchronizations, Status::RolledBack).await;

        if heuristically_committed.is_empty() {
            return Ok(());
        }
        let kind = if mixed || rolled_back > 0 {
            HeuristicKind::Mixed
        } else {
            HeuristicKind::Commit
        };
        Err(XaError::heuristic(
            kind,
            format!(
                "branches committed during rollback: {}",
                heuristically_committed.join(", ")
            ),
        ))
    }

    async fn fire_before_completion(&self, state: &mut TransactionState) -> Result<()> {
        state.before_completion_fired = true;
        before_completion_all(&self.inner.xid, &state.synchronizations).await
    }

    async fn forget_branch(&self, group: &ResourceGroup) {
        if let Err(e) = group.leader.forget(&group.branch).await {
            tracing::warn!(
                resource = group.leader.name(),
                branch = %group.branch,
                error = %e,
                "forget failed"
            );
        }
    }
}

/// Derives the error reported after a commit decision that not every branch
/// honored. Returns `None` when every branch committed.
fn summarize_commit_failures(committed: usize, failures: &[BranchFailure]) -> Option<XaError> {
    if failures.is_empty() {
        return None;
    }
    let rolled_back = failures
        .iter()
        .filter(|f| f.outcome == BranchOutcome::RolledBack)
        .count();
    let unknown = failures
        .iter()
        .filter(|f| f.outcome == BranchOutcome::Unknown)
        .count();
    let mixed = failures.iter().any(|f| f.outcome == BranchOutcome::Mixed);

    let kind = if mixed || (rolled_back > 0 && committed > 0) {
        HeuristicKind::Mixed
    } else if unknown > 0 {
        HeuristicKind::Hazard
    } else {
        HeuristicKind::Rollback
    };
    let detail = failures
        .iter()
        .map(|f| format!("{}: {}", f.resource, f.error))
        .collect::<Vec<_>>()
        .join("; ");
    Some(XaError::heuristic(
        kind,
        format!(
            "{} of {} branches did not commit ({})",
            failures.len(),
            failures.len() + committed,
            detail
        ),
    ))
}
