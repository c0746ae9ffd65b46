//! Optimistic concurrency: ETags, `If-Match` preconditions and the write clock.
//!
//! The guard only compares tokens. Mutual exclusion between writers is provided by
//! the storage engine, which runs [`check_precondition`] under its write lock.

use std::sync::atomic::{AtomicI64, Ordering};

use percent_encoding::utf8_percent_encode;

use crate::entity::Timestamp;
use crate::odata::URI_COMPONENT;

/// Wildcard `If-Match` value: matches any existing entity.
pub const MATCH_ANY: &str = "*";

/// ETag for a last-modified timestamp: `W/"datetime'<encoded timestamp>'"`.
///
/// Equal iff the timestamps are equal, since the tick-precision rendering is injective.
pub fn new_etag(timestamp: Timestamp) -> String {
    format!(
        "W/\"datetime'{}'\"",
        utf8_percent_encode(&timestamp.to_rfc3339(), URI_COMPONENT)
    )
}

/// Mutation kinds that carry a precondition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Replace,
    Merge,
    Delete,
}

/// Parsed `If-Match` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfMatch<'a> {
    Absent,
    Empty,
    Any,
    ETag(&'a str),
}

impl<'a> IfMatch<'a> {
    pub fn parse(header: Option<&'a str>) -> Self {
        match header {
            None => IfMatch::Absent,
            Some("") => IfMatch::Empty,
            Some(MATCH_ANY) => IfMatch::Any,
            Some(etag) => IfMatch::ETag(etag),
        }
    }
}

/// Whether a write may create the entity or must find it in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// No precondition: insert-or-replace / insert-or-merge
    Upsert,
    /// Precondition present: the entity must exist (and match)
    Conditional,
}

pub fn classify(if_match: Option<&str>) -> Intent {
    match IfMatch::parse(if_match) {
        IfMatch::Absent => Intent::Upsert,
        _ => Intent::Conditional,
    }
}

/// Precondition failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PreconditionError {
    #[error("The update condition specified in the request was not satisfied")]
    Failed,
    #[error("The specified entity does not exist")]
    NotFound,
}

/// Validate `If-Match` against the currently stored ETag (`None` if no entity).
///
/// | If-Match | replace / merge              | delete                       |
/// |----------|------------------------------|------------------------------|
/// | absent   | proceed (upsert)             | `Failed`                     |
/// | `""`     | `Failed`                     | `Failed`                     |
/// | `*`      | proceed if stored, else `NotFound` | same                   |
/// | `etag`   | proceed if equal, `Failed` if different, `NotFound` if missing |
pub fn check_precondition(
    if_match: Option<&str>,
    stored_etag: Option<&str>,
    kind: WriteKind,
) -> Result<(), PreconditionError> {
    match IfMatch::parse(if_match) {
        IfMatch::Absent if kind == WriteKind::Delete => Err(PreconditionError::Failed),
        IfMatch::Absent => Ok(()),
        IfMatch::Empty => Err(PreconditionError::Failed),
        IfMatch::Any => stored_etag.map(|_| ()).ok_or(PreconditionError::NotFound),
        IfMatch::ETag(expected) => match stored_etag {
            None => Err(PreconditionError::NotFound),
            Some(stored) if stored == expected => Ok(()),
            Some(_) => Err(PreconditionError::Failed),
        },
    }
}

/// Issues strictly increasing write timestamps.
///
/// Follows the wall clock, but never repeats or goes backwards, so two writes never
/// share an ETag unless they are stamped together (one batch).
#[derive(Debug, Default)]
pub struct TimestampClock {
    last: AtomicI64,
}

impl TimestampClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> Timestamp {
        let now = Timestamp::now().ticks();
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Timestamp::from_ticks(candidate),
                Err(actual) => last = actual,
            }
        }
    }
}
