//! Core types for the xatm transaction coordinator: transaction identifiers
//! and the shared error type.

#![warn(missing_docs)]

pub mod error;
pub mod xid;

pub use error::{HeuristicKind, Result, XaError};
pub use xid::{
    TransactionIdentifier, Xid, XidKind, GLOBAL_FORMAT_ID, LOCAL_FORMAT_ID, XID_PREFIX,
};
