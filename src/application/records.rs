//! Record queries: cache-first reads, coalesced refreshes, and the
//! write operations that keep cache and store in step.
//!
//! The read path is cache, then store, then portal. A cached snapshot
//! (including a confirmed-empty one) answers immediately. On a miss with
//! persisted history the store answers and a refresh runs in the
//! background; with no history the caller waits on the refresh itself.
//! Concurrent refreshes of one key collapse into a single portal round
//! trip, and a refresh that fails transiently falls back to the last
//! persisted snapshot before giving up.

use std::sync::Arc;

use metrics::counter;
use tracing::warn;

use crate::application::error::AppError;
use crate::application::repos::{RecordsRepo, UpsertEntry, UpsertOutcome};
use crate::application::sync::SyncService;
use crate::cache::{CacheKey, FlightGroup, Invalidator, Lookup, SnapshotCache};
use crate::domain::identity::SubjectId;
use crate::domain::records::DomainRecord;
use crate::domain::types::Scope;

#[derive(Clone)]
pub struct RecordsService {
    repo: Arc<dyn RecordsRepo>,
    cache: Arc<SnapshotCache>,
    invalidator: Invalidator,
    flights: Arc<FlightGroup<Vec<DomainRecord>, AppError>>,
    sync: Arc<SyncService>,
}

impl RecordsService {
    pub fn new(
        repo: Arc<dyn RecordsRepo>,
        cache: Arc<SnapshotCache>,
        invalidator: Invalidator,
        sync: Arc<SyncService>,
    ) -> Self {
        Self {
            repo,
            cache,
            invalidator,
            flights: Arc::new(FlightGroup::new()),
            sync,
        }
    }

    /// Answers a record query for one subject and scope. `force` wipes
    /// the cached snapshot and waits for a fresh portal round trip.
    pub async fn get_records(
        &self,
        subject: &SubjectId,
        scope: &Scope,
        force: bool,
    ) -> Result<Vec<DomainRecord>, AppError> {
        let key = CacheKey::records(subject, scope);
        if force {
            self.invalidator.invalidate(&key).await;
            return self.refresh_through(subject, scope, &key).await;
        }

        match self.cache.get(&key).await {
            Lookup::Hit(records) => Ok(records),
            Lookup::Empty => Ok(Vec::new()),
            Lookup::Miss => self.answer_miss(subject, scope, &key).await,
        }
    }

    /// Persists caller-provided entries (manual rows included) and
    /// invalidates the scope's snapshot.
    pub async fn save(
        &self,
        subject: &SubjectId,
        scope: &Scope,
        entries: &[UpsertEntry],
    ) -> Result<UpsertOutcome, AppError> {
        let outcome = self.repo.upsert(subject, scope, entries).await?;
        self.invalidator
            .invalidate(&CacheKey::records(subject, scope))
            .await;
        Ok(outcome)
    }

    /// Soft-deletes one relation and invalidates the scope's snapshot.
    pub async fn recycle(
        &self,
        subject: &SubjectId,
        scope: &Scope,
        fact_key: &str,
    ) -> Result<(), AppError> {
        self.repo.recycle(subject, scope, fact_key).await?;
        self.invalidator
            .invalidate(&CacheKey::records(subject, scope))
            .await;
        Ok(())
    }

    /// Cache miss: serve persisted history right away and refresh behind
    /// the caller's back, or block on the refresh when there is nothing
    /// to serve.
    async fn answer_miss(
        &self,
        subject: &SubjectId,
        scope: &Scope,
        key: &CacheKey,
    ) -> Result<Vec<DomainRecord>, AppError> {
        match self.repo.list_scope(subject, scope).await {
            Ok(persisted) if !persisted.is_empty() => {
                counter!("ateneo_refresh_stale_served_total").increment(1);
                self.spawn_refresh(subject, scope, key);
                Ok(persisted.into_iter().map(|p| p.record).collect())
            }
            Ok(_) => self.refresh_through(subject, scope, key).await,
            Err(error) => {
                warn!(
                    subject = %subject,
                    scope = %scope,
                    error = %error,
                    "store read failed, falling through to refresh"
                );
                self.refresh_through(subject, scope, key).await
            }
        }
    }

    /// Blocking refresh with the stale-snapshot fallback: a transient
    /// failure is answered from the store when it holds anything, and
    /// only an empty store turns it into `NotFound`.
    async fn refresh_through(
        &self,
        subject: &SubjectId,
        scope: &Scope,
        key: &CacheKey,
    ) -> Result<Vec<DomainRecord>, AppError> {
        match self.coalesced_refresh(subject, scope, key).await {
            Ok(records) => Ok(records),
            Err(error) if error.is_terminal() => Err(error),
            Err(error) => {
                let persisted = self.repo.list_scope(subject, scope).await?;
                if persisted.is_empty() {
                    warn!(subject = %subject, scope = %scope, error = %error, "refresh failed with nothing persisted");
                    return Err(AppError::NotFound);
                }
                warn!(subject = %subject, scope = %scope, error = %error, "refresh failed, serving persisted snapshot");
                counter!("ateneo_refresh_fallback_total").increment(1);
                Ok(persisted.into_iter().map(|p| p.record).collect())
            }
        }
    }

    /// Runs (or joins) the single in-flight refresh for the key. The
    /// winner writes the snapshot before publishing, so joiners observe
    /// a cache already brought up to date.
    async fn coalesced_refresh(
        &self,
        subject: &SubjectId,
        scope: &Scope,
        key: &CacheKey,
    ) -> Result<Vec<DomainRecord>, AppError> {
        let sync = self.sync.clone();
        let cache = self.cache.clone();
        let owned_subject = subject.clone();
        let owned_scope = *scope;
        let owned_key = key.clone();
        self.flights
            .run(key.as_str(), move || async move {
                let records = sync.refresh(&owned_subject, &owned_scope).await?;
                cache.put(&owned_key, &records).await;
                Ok(records)
            })
            .await
            .map_err(unshare)
    }

    fn spawn_refresh(&self, subject: &SubjectId, scope: &Scope, key: &CacheKey) {
        let service = self.clone();
        let subject = subject.clone();
        let scope = *scope;
        let key = key.clone();
        tokio::spawn(async move {
            if let Err(error) = service.coalesced_refresh(&subject, &scope, &key).await {
                warn!(subject = %subject, scope = %scope, error = %error, "background refresh failed");
            }
        });
    }
}

/// Unwraps a coalesced failure when this caller holds the only copy.
fn unshare(error: Arc<AppError>) -> AppError {
    Arc::try_unwrap(error).unwrap_or_else(AppError::Shared)
}
