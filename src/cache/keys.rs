//! Cache key construction.

use std::fmt::{Display, Formatter};

use crate::domain::identity::SubjectId;
use crate::domain::types::Scope;

/// Key of one cached records snapshot: `records:<subject>:<scope segment>`.
///
/// The immediate and the deferred delete of an invalidation round are issued
/// against this exact string, so it must be a pure function of its inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn records(subject: &SubjectId, scope: &Scope) -> Self {
        Self(format!("records:{}:{}", subject.as_str(), scope.segment()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
