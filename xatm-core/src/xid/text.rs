//! Canonical text form of transaction identifiers.
//!
//! ```text
//! xid:<format id, 8 lowercase hex digits>-<hex global id>[-<hex branch qualifier>]
//! ```
//!
//! The branch segment is omitted when the branch qualifier is empty. The
//! parser accepts an explicitly empty branch segment as well.

use super::Xid;
use crate::error::{Result, XaError};

/// Prefix of every canonical identifier string.
pub const XID_PREFIX: &str = "xid:";

const FORMAT_ID_DIGITS: usize = 8;

pub(super) fn format(format_id: i32, global: &[u8], branch: &[u8]) -> String {
    let mut text = String::with_capacity(
        XID_PREFIX.len() + FORMAT_ID_DIGITS + 2 + 2 * (global.len() + branch.len()),
    );
    text.push_str(XID_PREFIX);
    text.push_str(&format!("{:08x}", format_id as u32));
    text.push('-');
    text.push_str(&hex::encode(global));
    if !branch.is_empty() {
        text.push('-');
        text.push_str(&hex::encode(branch));
    }
    text
}

pub(super) fn parse(s: &str) -> Result<Xid> {
    let body = s
        .strip_prefix(XID_PREFIX)
        .ok_or_else(|| invalid(format!("'{}' does not start with '{}'", s, XID_PREFIX)))?;

    let mut segments = body.split('-');
    let format_segment = segments.next().unwrap_or_default();
    let global_segment = segments
        .next()
        .ok_or_else(|| invalid(format!("'{}' has no global id segment", s)))?;
    let branch_segment = segments.next().unwrap_or_default();
    if segments.next().is_some() {
        return Err(invalid(format!("'{}' has too many segments", s)));
    }

    if format_segment.len() != FORMAT_ID_DIGITS {
        return Err(invalid(format!(
            "format id must be {} hex digits, got '{}'",
            FORMAT_ID_DIGITS, format_segment
        )));
    }
    let format_bytes = decode_segment(format_segment, "format id")?;
    let format_id = i32::from_be_bytes([
        format_bytes[0],
        format_bytes[1],
        format_bytes[2],
        format_bytes[3],
    ]);

    let global = decode_segment(global_segment, "global id")?;
    if global.len() > Xid::MAXGTRIDSIZE {
        return Err(invalid(format!(
            "global id is {} bytes, maximum is {}",
            global.len(),
            Xid::MAXGTRIDSIZE
        )));
    }

    let branch = decode_segment(branch_segment, "branch qualifier")?;
    if branch.len() > Xid::MAXBQUALSIZE {
        return Err(invalid(format!(
            "branch qualifier is {} bytes, maximum is {}",
            branch.len(),
            Xid::MAXBQUALSIZE
        )));
    }

    Ok(Xid::from_parts(format_id, global, branch))
}

fn decode_segment(segment: &str, what: &str) -> Result<Vec<u8>> {
    if segment.len() % 2 != 0 {
        return Err(invalid(format!(
            "{} has an odd number of hex digits: '{}'",
            what, segment
        )));
    }
    if let Some(c) = segment
        .chars()
        .find(|c| !matches!(c, '0'..='9' | 'a'..='f'))
    {
        return Err(invalid(format!(
            "{} contains non-hex character '{}'",
            what, c
        )));
    }
    hex::decode(segment).map_err(|e| invalid(format!("{}: {}", what, e)))
}

fn invalid(message: String) -> XaError {
    XaError::InvalidTransactionIdentifier(message)
}
