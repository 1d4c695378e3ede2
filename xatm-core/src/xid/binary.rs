//! Binary form of transaction identifiers, used when identifiers are handed
//! to resource managers or written to recovery records.
//!
//! Layout (little endian): format id (i32), global id length (i32), global id
//! bytes, branch qualifier length (i32), branch qualifier bytes.

use bytes::{Buf, BufMut, BytesMut};

use super::Xid;
use crate::error::{Result, XaError};

impl Xid {
    /// Serializes the Xid to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(
            4 + 4 + self.global_transaction_id.len() + 4 + self.branch_qualifier.len(),
        );
        buf.put_i32_le(self.format_id);
        buf.put_i32_le(self.global_transaction_id.len() as i32);
        buf.put_slice(&self.global_transaction_id);
        buf.put_i32_le(self.branch_qualifier.len() as i32);
        buf.put_slice(&self.branch_qualifier);
        buf.to_vec()
    }

    /// Deserializes an Xid from bytes produced by [`Xid::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns [`XaError::InvalidTransactionIdentifier`] if the input is
    /// truncated, carries trailing bytes, or declares an invalid length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut buf = bytes;

        if buf.remaining() < 8 {
            return Err(XaError::InvalidTransactionIdentifier(
                "Xid data too short".to_string(),
            ));
        }
        let format_id = buf.get_i32_le();
        let global = read_part(&mut buf, "global transaction id", Xid::MAXGTRIDSIZE)?;

        if buf.remaining() < 4 {
            return Err(XaError::InvalidTransactionIdentifier(
                "Xid data too short for branch qualifier".to_string(),
            ));
        }
        let branch = read_part(&mut buf, "branch qualifier", Xid::MAXBQUALSIZE)?;

        if buf.has_remaining() {
            return Err(XaError::InvalidTransactionIdentifier(format!(
                "{} trailing bytes after Xid",
                buf.remaining()
            )));
        }

        Ok(Xid::from_parts(format_id, global, branch))
    }
}

fn read_part(buf: &mut &[u8], what: &str, max: usize) -> Result<Vec<u8>> {
    let len = buf.get_i32_le();
    if len < 0 || len as usize > max {
        return Err(XaError::InvalidTransactionIdentifier(format!(
            "{} length {} outside 0..={}",
            what, len, max
        )));
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(XaError::InvalidTransactionIdentifier(format!(
            "Xid data too short for {}",
            what
        )));
    }
    let part = (*buf)[..len].to_vec();
    buf.advance(len);
    Ok(part)
}
