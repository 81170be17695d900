//! Client identities and the allocator that hands them out.

use std::{
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::message::FrameError;

/// Identity assigned to a connected client. Never zero, never reused.
pub type Identity = u64;

/// Monotonic identity allocator.
///
/// The first call to [`IdSequence::next`] returns 1 and every later call
/// returns exactly one more than the call before it, no matter which task
/// makes the call.
#[derive(Debug)]
pub struct IdSequence {
    next: AtomicU64,
}

impl IdSequence {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> Identity {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses a comma separated list of decimal identities such as `1,2, 3`.
///
/// Each token is trimmed before parsing. An empty token anywhere in the list
/// (including an entirely empty input) is rejected.
pub fn parse_id_list(input: &str) -> Result<Vec<Identity>, FrameError> {
    input
        .split(',')
        .map(|token| {
            let token = token.trim();
            parse_decimal(token).ok_or_else(|| FrameError::InvalidIdentity(token.to_string()))
        })
        .collect()
}

/// Parses a plain unsigned decimal: ASCII digits only, no sign or whitespace.
pub(crate) fn parse_decimal<T: FromStr>(token: &str) -> Option<T> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}

/// Joins identities with `sep`, e.g. `[1, 3]` and `","` become `1,3`.
pub fn join_ids(ids: &[Identity], sep: &str) -> String {
    ids.iter()
        .map(Identity::to_string)
        .collect::<Vec<_>>()
        .join(sep)
}
