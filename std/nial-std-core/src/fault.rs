//!
//! Fault Values
//!
//! Primitives never raise: a failed operation returns a fault value carrying
//! a short machine-readable reason, and the caller branches on the tag.
//! Faults print with a leading `?`, e.g. `?invalid ref`.
//!

use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    reason: Arc<str>,
}

impl Fault {
    pub fn new(reason: impl Into<Arc<str>>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// The reason without the leading `?`
    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn is(&self, reason: &str) -> bool {
        &*self.reason == reason
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "?{}", self.reason)
    }
}
