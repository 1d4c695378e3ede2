//! Transaction identifiers (Xids).
//!
//! An [`Xid`] names a global transaction and, optionally, one branch of it:
//!
//! | Variant  | Global id | Branch qualifier |
//! |----------|-----------|------------------|
//! | Local    | empty     | non-empty        |
//! | Global   | non-empty | empty            |
//! | Branch   | non-empty | non-empty        |
//!
//! Identifiers minted here carry one of the internal format ids
//! ([`LOCAL_FORMAT_ID`], [`GLOBAL_FORMAT_ID`]). Identifiers produced by other
//! transaction managers are brought in with [`Xid::import`] and classify as
//! external.
//!
//! # Example
//!
//! ```
//! use xatm_core::Xid;
//!
//! let global = Xid::new_global();
//! let branch = global.new_branch();
//! assert!(branch.is_branch());
//! assert_eq!(branch.global_transaction_id(), global.global_transaction_id());
//!
//! let parsed: Xid = branch.to_string().parse().unwrap();
//! assert_eq!(parsed, branch);
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{Result, XaError};

mod binary;
mod text;

pub use text::XID_PREFIX;

/// Format id of locally generated transaction identifiers.
pub const LOCAL_FORMAT_ID: i32 = 0x5841_4c43;

/// Format id of globally generated transaction identifiers and their branches.
pub const GLOBAL_FORMAT_ID: i32 = 0x5841_474c;

/// Read access to the three parts of a transaction identifier.
///
/// Implemented by [`Xid`]; identifiers from other transaction managers
/// implement it so they can be passed to [`Xid::import`].
pub trait TransactionIdentifier {
    /// Returns the format identifier.
    fn format_id(&self) -> i32;

    /// Returns the global transaction identifier bytes.
    fn global_transaction_id(&self) -> &[u8];

    /// Returns the branch qualifier bytes.
    fn branch_qualifier(&self) -> &[u8];
}

/// Classification of an [`Xid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XidKind {
    /// Empty global id, non-empty branch qualifier.
    Local,
    /// Non-empty global id, empty branch qualifier.
    Global,
    /// Non-empty global id and branch qualifier.
    Branch,
    /// Not minted by this coordinator.
    External,
}

/// A transaction identifier.
///
/// Equality and hashing consider only the format id, the global id bytes and
/// the branch qualifier bytes. The canonical text form is computed once at
/// construction and returned by [`Xid::as_str`] and `Display`.
#[derive(Clone)]
pub struct Xid {
    format_id: i32,
    global_transaction_id: Vec<u8>,
    branch_qualifier: Vec<u8>,
    text: Arc<str>,
}

impl Xid {
    /// Maximum length for global transaction ID.
    pub const MAXGTRIDSIZE: usize = 64;
    /// Maximum length for branch qualifier.
    pub const MAXBQUALSIZE: usize = 64;

    /// Creates a transaction identifier from its parts.
    ///
    /// # Errors
    ///
    /// Returns [`XaError::InvalidTransactionIdentifier`] if either part
    /// exceeds its maximum size.
    pub fn new(
        format_id: i32,
        global_transaction_id: &[u8],
        branch_qualifier: &[u8],
    ) -> Result<Self> {
        if global_transaction_id.len() > Self::MAXGTRIDSIZE {
            return Err(XaError::InvalidTransactionIdentifier(format!(
                "global transaction id is {} bytes, maximum is {}",
                global_transaction_id.len(),
                Self::MAXGTRIDSIZE
            )));
        }
        if branch_qualifier.len() > Self::MAXBQUALSIZE {
            return Err(XaError::InvalidTransactionIdentifier(format!(
                "branch qualifier is {} bytes, maximum is {}",
                branch_qualifier.len(),
                Self::MAXBQUALSIZE
            )));
        }
        Ok(Self::from_parts(
            format_id,
            global_transaction_id.to_vec(),
            branch_qualifier.to_vec(),
        ))
    }

    fn from_parts(format_id: i32, global: Vec<u8>, branch: Vec<u8>) -> Self {
        let text = text::format(format_id, &global, &branch);
        Self {
            format_id,
            global_transaction_id: global,
            branch_qualifier: branch,
            text: Arc::from(text),
        }
    }

    /// Generates a new local identifier: empty global id, random branch.
    pub fn new_local() -> Self {
        Self::from_parts(LOCAL_FORMAT_ID, Vec::new(), random_part())
    }

    /// Generates a new global identifier: random global id, empty branch.
    pub fn new_global() -> Self {
        Self::from_parts(GLOBAL_FORMAT_ID, random_part(), Vec::new())
    }

    /// Generates a branch of this identifier.
    ///
    /// The format id and global id are copied verbatim; the branch qualifier
    /// is freshly generated and never empty.
    pub fn new_branch(&self) -> Self {
        Self::from_parts(
            self.format_id,
            self.global_transaction_id.clone(),
            random_part(),
        )
    }

    /// Wraps an identifier issued by another transaction manager.
    ///
    /// The result compares equal to any identifier with the same parts.
    ///
    /// # Errors
    ///
    /// Returns [`XaError::InvalidTransactionIdentifier`] if either part
    /// exceeds its maximum size.
    pub fn import(foreign: &dyn TransactionIdentifier) -> Result<Self> {
        Self::new(
            foreign.format_id(),
            foreign.global_transaction_id(),
            foreign.branch_qualifier(),
        )
    }

    /// Parses the canonical text form.
    ///
    /// # Errors
    ///
    /// Returns [`XaError::InvalidTransactionIdentifier`] for malformed text.
    pub fn parse(s: &str) -> Result<Self> {
        text::parse(s)
    }

    /// Returns the format identifier.
    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    /// Returns the global transaction identifier.
    pub fn global_transaction_id(&self) -> &[u8] {
        &self.global_transaction_id
    }

    /// Returns the branch qualifier.
    pub fn branch_qualifier(&self) -> &[u8] {
        &self.branch_qualifier
    }

    /// Returns the canonical text form.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Returns the identifier of the global transaction this one belongs to.
    ///
    /// For a branch this strips the branch qualifier; global and local
    /// identifiers are returned unchanged.
    pub fn to_global(&self) -> Self {
        if self.is_branch() {
            Self::from_parts(self.format_id, self.global_transaction_id.clone(), Vec::new())
        } else {
            self.clone()
        }
    }

    /// Returns true if the format id is one this coordinator mints.
    pub fn is_internal(&self) -> bool {
        self.format_id == LOCAL_FORMAT_ID || self.format_id == GLOBAL_FORMAT_ID
    }

    /// Returns true if this identifier came from another transaction manager.
    pub fn is_external(&self) -> bool {
        !self.is_internal()
    }

    /// Empty global id and non-empty branch qualifier.
    pub fn is_local(&self) -> bool {
        self.global_transaction_id.is_empty() && !self.branch_qualifier.is_empty()
    }

    /// Non-empty global id and empty branch qualifier.
    pub fn is_global(&self) -> bool {
        !self.global_transaction_id.is_empty() && self.branch_qualifier.is_empty()
    }

    /// Non-empty global id and non-empty branch qualifier.
    pub fn is_branch(&self) -> bool {
        !self.global_transaction_id.is_empty() && !self.branch_qualifier.is_empty()
    }

    /// Classifies the identifier.
    pub fn kind(&self) -> XidKind {
        if self.is_external() {
            XidKind::External
        } else if self.is_branch() {
            XidKind::Branch
        } else if self.is_global() {
            XidKind::Global
        } else {
            XidKind::Local
        }
    }
}

fn random_part() -> Vec<u8> {
    Uuid::new_v4().as_bytes().to_vec()
}

impl TransactionIdentifier for Xid {
    fn format_id(&self) -> i32 {
        self.format_id
    }

    fn global_transaction_id(&self) -> &[u8] {
        &self.global_transaction_id
    }

    fn branch_qualifier(&self) -> &[u8] {
        &self.branch_qualifier
    }
}

impl PartialEq for Xid {
    fn eq(&self, other: &Self) -> bool {
        self.format_id == other.format_id
            && self.global_transaction_id == other.global_transaction_id
            && self.branch_qualifier == other.branch_qualifier
    }
}

impl Eq for Xid {}

impl Hash for Xid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.format_id.hash(state);
        self.global_transaction_id.hash(state);
        self.branch_qualifier.hash(state);
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl fmt::Debug for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Xid").field(&&*self.text).finish()
    }
}

impl std::str::FromStr for Xid {
    type Err = XaError;

    fn from_str(s: &str) -> Result<Self> {
        text::parse(s)
    }
}
