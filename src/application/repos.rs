//! Repository and credential-source traits describing the adapters the
//! services run against.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::identity::{Identity, SubjectId};
use crate::domain::records::DomainRecord;
use crate::domain::types::Scope;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
    #[error("scope holds {count} relations, cap is {limit}")]
    CapExceeded { limit: u32, count: u64 },
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// One record plus the relation-level attributes to link it with.
#[derive(Debug, Clone)]
pub struct UpsertEntry {
    pub record: DomainRecord,
    /// Manual rows are user-curated and survive full resyncs.
    pub manual: bool,
    pub note: Option<String>,
    /// Relation-level credit override, mutable without forking the fact.
    pub credit: Option<f64>,
}

impl UpsertEntry {
    /// Entry as produced by the sync pipeline: not manual, no annotations.
    pub fn scraped(record: DomainRecord) -> Self {
        Self {
            record,
            manual: false,
            note: None,
            credit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub facts_inserted: u64,
    pub relations_inserted: u64,
    pub relations_updated: u64,
}

/// A relation row joined with its fact, as read back from the store.
#[derive(Debug, Clone)]
pub struct PersistedRecord {
    pub record: DomainRecord,
    pub fact_key: String,
    pub manual: bool,
    pub note: Option<String>,
    pub credit: Option<f64>,
}

#[async_trait]
pub trait RecordsRepo: Send + Sync {
    /// Writes facts and relations in one transaction. Facts are
    /// insert-on-conflict-do-nothing by natural key; a conflicting
    /// relation updates its mutable columns instead.
    async fn upsert(
        &self,
        subject: &SubjectId,
        scope: &Scope,
        entries: &[UpsertEntry],
    ) -> Result<UpsertOutcome, RepoError>;

    /// Full resync: deletes every non-manual relation for the subject and
    /// scope, then inserts the freshly scraped entries, all in one
    /// transaction. Reconciles additions and removals without a diff.
    async fn replace_scope(
        &self,
        subject: &SubjectId,
        scope: &Scope,
        entries: &[UpsertEntry],
    ) -> Result<UpsertOutcome, RepoError>;

    /// Lists live (non-recycled) relations with their facts, in insertion
    /// order.
    async fn list_scope(
        &self,
        subject: &SubjectId,
        scope: &Scope,
    ) -> Result<Vec<PersistedRecord>, RepoError>;

    /// Soft-deletes one relation. `NotFound` when no live row matches.
    async fn recycle(
        &self,
        subject: &SubjectId,
        scope: &Scope,
        fact_key: &str,
    ) -> Result<(), RepoError>;
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credentials on file for subject `{subject}`")]
    Unknown { subject: String },
    #[error("credential source error: {0}")]
    Source(String),
}

#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Yields login credentials for the subject. The secret inside is
    /// request-scoped; callers must never persist it.
    async fn credentials(&self, subject: &SubjectId) -> Result<Identity, CredentialError>;
}
