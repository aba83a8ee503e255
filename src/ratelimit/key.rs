//! Bucket key generation and handling.

use std::fmt;

/// A key that uniquely identifies a bucket within a bin.
///
/// The key is composed of a scope (e.g. the guild) and a subject inside that
/// scope (e.g. a user or a channel).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey<S, K> {
    /// The outer scope this bucket belongs to
    pub scope: S,
    /// The subject being throttled within the scope
    pub subject: K,
}

impl<S, K> BucketKey<S, K> {
    /// Create a new bucket key.
    pub fn new(scope: S, subject: K) -> Self {
        Self { scope, subject }
    }
}

impl<S: fmt::Display, K: fmt::Display> fmt::Display for BucketKey<S, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.subject)
    }
}
