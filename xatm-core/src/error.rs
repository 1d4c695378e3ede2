//! Error types for transaction coordination.

use std::fmt;
use std::io;
use thiserror::Error;

/// How the participants of a transaction disagreed on its final outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeuristicKind {
    /// Work was committed although the decision was to roll back.
    Commit,
    /// Work was rolled back although the decision was to commit.
    Rollback,
    /// Some work was committed and some was rolled back.
    Mixed,
    /// The outcome of some work is unknown.
    Hazard,
}

impl fmt::Display for HeuristicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HeuristicKind::Commit => "heuristic-commit",
            HeuristicKind::Rollback => "heuristic-rollback",
            HeuristicKind::Mixed => "heuristic-mixed",
            HeuristicKind::Hazard => "heuristic-hazard",
        };
        f.write_str(name)
    }
}

/// The main error type for transaction coordination.
#[derive(Debug, Error)]
pub enum XaError {
    /// Malformed or oversize transaction identifier text or bytes.
    #[error("invalid transaction identifier: {0}")]
    InvalidTransactionIdentifier(String),

    /// A resource could not be enlisted or delisted.
    #[error("resource enlistment failure: {0}")]
    ResourceEnlistmentFailure(String),

    /// A resource voted to roll back during prepare.
    #[error("resource vetoed commit: {0}")]
    ResourceVoteRollback(String),

    /// Participants disagreed on the final outcome.
    #[error("{kind}: {message}")]
    Heuristic {
        /// What kind of disagreement was observed.
        kind: HeuristicKind,
        /// Details about the participants involved.
        message: String,
    },

    /// The transaction deadline passed.
    #[error("transaction timed out: {0}")]
    TransactionTimeout(String),

    /// The transaction was rolled back instead of committed.
    #[error("transaction rolled back: {0}")]
    TransactionRolledBack(String),

    /// A pooled handle outlived the physical connection it was issued for.
    #[error("stale connection handle: {0}")]
    StaleConnectionHandle(String),

    /// The operation is not valid in the current transaction status.
    #[error("illegal state transition: {0}")]
    IllegalStateTransition(String),

    /// A resource manager reported a failure with an XA return code.
    #[error("resource error (code {code}): {message}")]
    Resource {
        /// XA return or error code.
        code: i32,
        /// Resource supplied details.
        message: String,
    },

    /// Physical connection errors.
    #[error("connection error: {0}")]
    Connection(String),

    /// Configuration errors (invalid settings).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// I/O errors from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl XaError {
    /// Creates a resource error carrying an XA code.
    pub fn resource(code: i32, message: impl Into<String>) -> Self {
        XaError::Resource {
            code,
            message: message.into(),
        }
    }

    /// Creates a heuristic outcome error.
    pub fn heuristic(kind: HeuristicKind, message: impl Into<String>) -> Self {
        XaError::Heuristic {
            kind,
            message: message.into(),
        }
    }

    /// Returns the heuristic kind if this is a heuristic outcome.
    pub fn heuristic_kind(&self) -> Option<HeuristicKind> {
        match self {
            XaError::Heuristic { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Returns the XA code if this error came from a resource manager.
    pub fn resource_code(&self) -> Option<i32> {
        match self {
            XaError::Resource { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns true if the error tells the caller that nothing was committed.
    pub fn is_rollback(&self) -> bool {
        matches!(
            self,
            XaError::ResourceVoteRollback(_)
                | XaError::TransactionTimeout(_)
                | XaError::TransactionRolledBack(_)
                | XaError::Heuristic {
                    kind: HeuristicKind::Rollback,
                    ..
                }
        )
    }
}

/// A specialized `Result` type for transaction coordination.
pub type Result<T> = std::result::Result<T, XaError>;
