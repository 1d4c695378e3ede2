//! The resource capability interface driven by the coordinator.
//!
//! A [`XaResource`] is the coordinator's only view of a resource manager.
//! The coordinator never speaks a resource-manager wire protocol itself; it
//! calls `start`/`end` to associate work with a branch and
//! `prepare`/`commit`/`rollback` to complete it.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use xatm_core::{HeuristicKind, Result, XaError, Xid};

// ============================================================================
// XA Flags (from X/Open XA specification)
// ============================================================================

/// No flags set.
pub const TMNOFLAGS: i32 = 0x00000000;

/// Caller is joining existing transaction branch.
pub const TMJOIN: i32 = 0x00200000;

/// Caller is resuming association with suspended transaction branch.
pub const TMRESUME: i32 = 0x08000000;

/// Dissociate caller from transaction branch - successful.
pub const TMSUCCESS: i32 = 0x04000000;

/// Dissociate caller from transaction branch - failed.
pub const TMFAIL: i32 = 0x20000000;

/// Caller is suspending (not ending) its association with transaction branch.
pub const TMSUSPEND: i32 = 0x02000000;

/// Start a recovery scan.
pub const TMSTARTRSCAN: i32 = 0x01000000;

/// End a recovery scan.
pub const TMENDRSCAN: i32 = 0x00800000;

/// Use one-phase commit optimization.
pub const TMONEPHASE: i32 = 0x40000000;

// ============================================================================
// XA Return Codes
// ============================================================================

/// Normal execution.
pub const XA_OK: i32 = 0;

/// The transaction branch has been read-only and has been committed.
pub const XA_RDONLY: i32 = 3;

/// Routine returned with no effect and may be reissued.
pub const XA_RETRY: i32 = 4;

/// The transaction work was partially committed and partially rolled back (heuristic mixed).
pub const XA_HEURMIX: i32 = 5;

/// The transaction work was rolled back (heuristically).
pub const XA_HEURRB: i32 = 6;

/// The transaction work was committed (heuristically).
pub const XA_HEURCOM: i32 = 7;

/// The transaction work may have been committed or rolled back (heuristic hazard).
pub const XA_HEURHAZ: i32 = 8;

/// Lower bound of rollback error codes.
pub const XA_RBBASE: i32 = 100;

/// Rollback was caused by unspecified reason.
pub const XA_RBROLLBACK: i32 = XA_RBBASE;

/// Rollback was caused by communication failure.
pub const XA_RBCOMMFAIL: i32 = XA_RBBASE + 1;

/// A deadlock was detected.
pub const XA_RBDEADLOCK: i32 = XA_RBBASE + 2;

/// A condition that violates the integrity of the resource was detected.
pub const XA_RBINTEGRITY: i32 = XA_RBBASE + 3;

/// The resource manager rolled back for a reason not listed.
pub const XA_RBOTHER: i32 = XA_RBBASE + 4;

/// A protocol error occurred in the resource manager.
pub const XA_RBPROTO: i32 = XA_RBBASE + 5;

/// A transaction branch took too long.
pub const XA_RBTIMEOUT: i32 = XA_RBBASE + 6;

/// May retry the transaction branch.
pub const XA_RBTRANSIENT: i32 = XA_RBBASE + 7;

/// Upper bound of rollback error codes.
pub const XA_RBEND: i32 = XA_RBTRANSIENT;

/// Resource manager error.
pub const XAER_RMERR: i32 = -3;

/// The Xid is not valid for this resource manager.
pub const XAER_NOTA: i32 = -4;

/// Resource manager unavailable.
pub const XAER_RMFAIL: i32 = -7;

/// A resource manager's answer to `prepare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    /// Prepared; the branch must be committed or rolled back later.
    Commit,
    /// The branch did no updates and is already complete.
    ReadOnly,
    /// The branch cannot commit.
    Rollback,
}

impl Vote {
    /// Maps an XA return code to a vote.
    ///
    /// Codes in the `XA_RB*` range are rollback votes; unknown codes yield
    /// `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            XA_OK => Some(Vote::Commit),
            XA_RDONLY => Some(Vote::ReadOnly),
            XA_RBBASE..=XA_RBEND => Some(Vote::Rollback),
            _ => None,
        }
    }

    /// Returns the XA return code for this vote.
    pub fn code(&self) -> i32 {
        match self {
            Vote::Commit => XA_OK,
            Vote::ReadOnly => XA_RDONLY,
            Vote::Rollback => XA_RBROLLBACK,
        }
    }
}

/// What a completion call actually did to a branch, as far as the
/// coordinator can tell from the error it received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BranchOutcome {
    Committed,
    RolledBack,
    Mixed,
    Unknown,
}

impl BranchOutcome {
    /// Classifies an error returned by `commit` or `rollback`.
    pub(crate) fn from_error(err: &XaError) -> Self {
        match err.resource_code() {
            Some(XA_HEURCOM) => BranchOutcome::Committed,
            Some(XA_HEURRB) | Some(XA_RBBASE..=XA_RBEND) => BranchOutcome::RolledBack,
            Some(XA_HEURMIX) => BranchOutcome::Mixed,
            _ => match err.heuristic_kind() {
                Some(HeuristicKind::Commit) => BranchOutcome::Committed,
                Some(HeuristicKind::Rollback) => BranchOutcome::RolledBack,
                Some(HeuristicKind::Mixed) => BranchOutcome::Mixed,
                _ => BranchOutcome::Unknown,
            },
        }
    }

    /// Returns true if the resource reported a heuristic decision that must
    /// be forgotten once the coordinator has recorded it.
    pub(crate) fn needs_forget(err: &XaError) -> bool {
        matches!(
            err.resource_code(),
            Some(XA_HEURCOM) | Some(XA_HEURRB) | Some(XA_HEURMIX) | Some(XA_HEURHAZ)
        ) || err.heuristic_kind().is_some()
    }
}

// ============================================================================
// XA Resource Trait
// ============================================================================

/// XA Resource interface following the X/Open XA specification.
///
/// Implementations wrap one connection to a resource manager. They must be
/// internally synchronized: the coordinator shares them across tasks.
#[async_trait]
pub trait XaResource: Send + Sync + fmt::Debug {
    /// Returns a label identifying the resource manager, used in logs.
    fn name(&self) -> &str;

    /// Starts work on behalf of a transaction branch.
    ///
    /// `flags` is one of [`TMNOFLAGS`], [`TMJOIN`] or [`TMRESUME`].
    async fn start(&self, xid: &Xid, flags: i32) -> Result<()>;

    /// Ends work on behalf of a transaction branch.
    ///
    /// `flags` is one of [`TMSUCCESS`], [`TMFAIL`] or [`TMSUSPEND`].
    async fn end(&self, xid: &Xid, flags: i32) -> Result<()>;

    /// Prepares the transaction branch for commit.
    async fn prepare(&self, xid: &Xid) -> Result<Vote>;

    /// Commits the transaction branch.
    ///
    /// With `one_phase` set the branch was never prepared and the resource
    /// manager decides the outcome itself.
    async fn commit(&self, xid: &Xid, one_phase: bool) -> Result<()>;

    /// Rolls back the transaction branch.
    async fn rollback(&self, xid: &Xid) -> Result<()>;

    /// Forgets about a heuristically completed transaction branch.
    async fn forget(&self, _xid: &Xid) -> Result<()> {
        Ok(())
    }

    /// Obtains a list of prepared transaction branches.
    ///
    /// `flags` is a combination of [`TMSTARTRSCAN`] and [`TMENDRSCAN`], or
    /// [`TMNOFLAGS`].
    async fn recover(&self, flags: i32) -> Result<Vec<Xid>>;

    /// Determines if this resource manager is the same as another.
    fn is_same_rm(&self, other: &dyn XaResource) -> bool;

    /// Sets the transaction timeout value.
    ///
    /// Returns true if the resource accepted the timeout.
    fn set_transaction_timeout(&self, _timeout: Duration) -> bool {
        false
    }

    /// Returns true if a branch this resource ended with [`TMSUCCESS`] may be
    /// rejoined with [`TMJOIN`] before the transaction completes.
    fn supports_rejoin(&self) -> bool {
        false
    }
}

/// Compares two resources in both directions.
///
/// Resources that disagree about whether they share a resource manager are
/// treated as distinct.
pub(crate) fn same_resource_manager(a: &dyn XaResource, b: &dyn XaResource) -> bool {
    let forward = a.is_same_rm(b);
    let backward = b.is_same_rm(a);
    if forward != backward {
        tracing::warn!(
            left = a.name(),
            right = b.name(),
            forward,
            backward,
            "asymmetric is_same_rm result, treating resources as distinct"
        );
        return false;
    }
    forward
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Labelled {
        rm: &'static str,
        claims_everything: bool,
    }

    #[async_trait]
    impl XaResource for Labelled {
        fn name(&self) -> &str {
            self.rm
        }

        async fn start(&self, _xid: &Xid, _flags: i32) -> Result<()> {
            Ok(())
        }

        async fn end(&self, _xid: &Xid, _flags: i32) -> Result<()> {
            Ok(())
        }

        async fn prepare(&self, _xid: &Xid) -> Result<Vote> {
            Ok(Vote::Commit)
        }

        async fn commit(&self, _xid: &Xid, _one_phase: bool) -> Result<()> {
            Ok(())
        }

        async fn rollback(&self, _xid: &Xid) -> Result<()> {
            Ok(())
        }

        async fn recover(&self, _flags: i32) -> Result<Vec<Xid>> {
            Ok(Vec::new())
        }

        fn is_same_rm(&self, other: &dyn XaResource) -> bool {
            self.claims_everything || other.name() == self.rm
        }
    }

    #[test]
    fn test_xa_flags_values() {
        assert_eq!(TMNOFLAGS, 0x00000000);
        assert_eq!(TMJOIN, 0x00200000);
        assert_eq!(TMRESUME, 0x08000000);
        assert_eq!(TMSUCCESS, 0x04000000);
        assert_eq!(TMFAIL, 0x20000000);
        assert_eq!(TMSUSPEND, 0x02000000);
        assert_eq!(TMSTARTRSCAN, 0x01000000);
        assert_eq!(TMENDRSCAN, 0x00800000);
        assert_eq!(TMONEPHASE, 0x40000000);
    }

    #[test]
    fn test_xa_return_codes() {
        assert_eq!(XA_OK, 0);
        assert_eq!(XA_RDONLY, 3);
        assert_eq!(XA_HEURRB, 6);
        assert_eq!(XA_HEURCOM, 7);
        assert_eq!(XA_HEURHAZ, 8);
        assert_eq!(XA_HEURMIX, 5);
        assert_eq!(XA_RETRY, 4);
        assert_eq!(XA_RBEND, 107);
    }

    #[test]
    fn test_vote_from_code() {
        assert_eq!(Vote::from_code(XA_OK), Some(Vote::Commit));
        assert_eq!(Vote::from_code(XA_RDONLY), Some(Vote::ReadOnly));
        assert_eq!(Vote::from_code(XA_RBDEADLOCK), Some(Vote::Rollback));
        assert_eq!(Vote::from_code(XA_RBEND), Some(Vote::Rollback));
        assert_eq!(Vote::from_code(XA_RETRY), None);
        assert_eq!(Vote::from_code(Vote::Rollback.code()), Some(Vote::Rollback));
    }

    #[test]
    fn test_branch_outcome_classification() {
        assert_eq!(
            BranchOutcome::from_error(&XaError::resource(XA_HEURCOM, "x")),
            BranchOutcome::Committed
        );
        assert_eq!(
            BranchOutcome::from_error(&XaError::resource(XA_HEURRB, "x")),
            BranchOutcome::RolledBack
        );
        assert_eq!(
            BranchOutcome::from_error(&XaError::resource(XA_RBTIMEOUT, "x")),
            BranchOutcome::RolledBack
        );
        assert_eq!(
            BranchOutcome::from_error(&XaError::resource(XA_HEURMIX, "x")),
            BranchOutcome::Mixed
        );
        assert_eq!(
            BranchOutcome::from_error(&XaError::resource(XAER_RMFAIL, "x")),
            BranchOutcome::Unknown
        );
        assert_eq!(
            BranchOutcome::from_error(&XaError::Connection("reset".into())),
            BranchOutcome::Unknown
        );
    }

    #[test]
    fn test_needs_forget() {
        assert!(BranchOutcome::needs_forget(&XaError::resource(XA_HEURHAZ, "x")));
        assert!(!BranchOutcome::needs_forget(&XaError::resource(XAER_RMFAIL, "x")));
    }

    #[test]
    fn test_same_resource_manager_symmetric() {
        let a = Labelled { rm: "db-1", claims_everything: false };
        let b = Labelled { rm: "db-1", claims_everything: false };
        let c = Labelled { rm: "db-2", claims_everything: false };
        assert!(same_resource_manager(&a, &b));
        assert!(!same_resource_manager(&a, &c));
    }

    #[test]
    fn test_same_resource_manager_asymmetric_is_distinct() {
        let greedy = Labelled { rm: "db-1", claims_everything: true };
        let other = Labelled { rm: "db-2", claims_everything: false };
        assert!(greedy.is_same_rm(&other));
        assert!(!same_resource_manager(&greedy, &other));
        assert!(!same_resource_manager(&other, &greedy));
    }
}
