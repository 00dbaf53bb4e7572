//! Session brokering and the portal refresh pipeline.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::application::error::AppError;
use crate::application::repos::{CredentialSource, RecordsRepo, UpsertEntry};
use crate::config::RetrySettings;
use crate::domain::identity::{SessionCredential, SubjectId};
use crate::domain::records::DomainRecord;
use crate::domain::types::{AccountKind, Scope};
use crate::portal::acquirer::{AcquireError, SessionAcquirer};
use crate::portal::{FetchError, PortalGateway};
use crate::portal::sessions::SessionPool;
use crate::util::retry::{RetryError, RetryFailure, retry};

/// Hands out portal sessions, logging in at most once per subject at a
/// time. The pooled slot's mutex is held across the whole login, so
/// concurrent callers for the same subject queue up and reuse the
/// credential the first one minted.
pub struct SessionService {
    credentials: Arc<dyn CredentialSource>,
    pool: Arc<SessionPool>,
    acquirer: Arc<SessionAcquirer>,
}

impl SessionService {
    pub fn new(
        credentials: Arc<dyn CredentialSource>,
        pool: Arc<SessionPool>,
        acquirer: Arc<SessionAcquirer>,
    ) -> Self {
        Self {
            credentials,
            pool,
            acquirer,
        }
    }

    /// Returns the subject's pooled session, logging in if the slot is
    /// empty.
    pub async fn authenticated(&self, subject: &SubjectId) -> Result<SessionCredential, AppError> {
        let slot = self.pool.lease(subject.as_str());
        let mut held = slot.lock().await;
        if let Some(credential) = held.as_ref() {
            return Ok(credential.clone());
        }

        let identity = self.credentials.credentials(subject).await?;
        let credential = self
            .acquirer
            .acquire(&identity)
            .await
            .map_err(map_acquire_error)?;
        *held = Some(credential.clone());
        debug!(subject = %subject, "pooled fresh portal session");
        Ok(credential)
    }

    /// Drops the subject's pooled session so the next call logs in again.
    pub fn discard(&self, subject: &SubjectId) {
        self.pool.discard(subject.as_str());
    }
}

fn map_acquire_error(error: AcquireError) -> AppError {
    match error {
        AcquireError::BadCredentials => AppError::CredentialsRejected,
        AcquireError::Exhausted { attempts, source } => AppError::PortalUnavailable {
            attempts,
            reason: source.to_string(),
        },
        other => AppError::PortalUnavailable {
            attempts: 1,
            reason: other.to_string(),
        },
    }
}

/// One refresh step failure, split by where it happened so the retry
/// loop can tell dead-end session problems from flaky fetches.
#[derive(Debug, Error)]
enum StepError {
    #[error(transparent)]
    Session(AppError),
    #[error(transparent)]
    Fetch(FetchError),
}

/// Pulls a scope from the portal and persists it.
///
/// A refresh is fetch-then-replace: the freshly scraped records overwrite
/// the subject's non-manual relations in one transaction. Lapsed sessions
/// are discarded and retried within the same budget; the whole pipeline
/// runs under a deadline so a wedged portal cannot hold a caller forever.
pub struct SyncService {
    sessions: Arc<SessionService>,
    gateway: Arc<PortalGateway>,
    repo: Arc<dyn RecordsRepo>,
    retry: RetrySettings,
    pipeline_timeout: Duration,
}

impl SyncService {
    pub fn new(
        sessions: Arc<SessionService>,
        gateway: Arc<PortalGateway>,
        repo: Arc<dyn RecordsRepo>,
        retry: RetrySettings,
        pipeline_timeout: Duration,
    ) -> Self {
        Self {
            sessions,
            gateway,
            repo,
            retry,
            pipeline_timeout,
        }
    }

    /// Fetches the scope from the portal, persists it, and returns the
    /// fresh records.
    pub async fn refresh(
        &self,
        subject: &SubjectId,
        scope: &Scope,
    ) -> Result<Vec<DomainRecord>, AppError> {
        match tokio::time::timeout(self.pipeline_timeout, self.refresh_inner(subject, scope)).await
        {
            Ok(result) => result,
            Err(_) => Err(AppError::DeadlineExceeded(self.pipeline_timeout)),
        }
    }

    async fn refresh_inner(
        &self,
        subject: &SubjectId,
        scope: &Scope,
    ) -> Result<Vec<DomainRecord>, AppError> {
        let account = AccountKind::resolve(subject)?;

        let fetched = retry(
            self.retry.attempts.get(),
            self.retry.backoff_unit,
            || async {
                self.fetch_step(subject, account, scope)
                    .await
                    .map_err(|error| match &error {
                        // The acquirer has already spent its own retry
                        // budget; looping on its verdict gains nothing.
                        StepError::Session(_) => RetryError::Permanent(error),
                        StepError::Fetch(_) => RetryError::Transient(error),
                    })
            },
        )
        .await;

        let records = match fetched {
            Ok(records) => records,
            Err(RetryFailure::Aborted(StepError::Session(error))) => return Err(error),
            Err(RetryFailure::Aborted(StepError::Fetch(error))) => {
                return Err(AppError::unexpected(error.to_string()));
            }
            Err(RetryFailure::Exhausted { attempts, last }) => {
                return Err(AppError::PortalUnavailable {
                    attempts,
                    reason: last.to_string(),
                });
            }
        };

        let entries: Vec<UpsertEntry> = records
            .iter()
            .cloned()
            .map(UpsertEntry::scraped)
            .collect();
        let outcome = self.repo.replace_scope(subject, scope, &entries).await?;
        debug!(
            subject = %subject,
            scope = %scope,
            fetched = records.len(),
            facts_inserted = outcome.facts_inserted,
            relations_inserted = outcome.relations_inserted,
            "refreshed scope from portal"
        );
        Ok(records)
    }

    async fn fetch_step(
        &self,
        subject: &SubjectId,
        account: AccountKind,
        scope: &Scope,
    ) -> Result<Vec<DomainRecord>, StepError> {
        let credential = self
            .sessions
            .authenticated(subject)
            .await
            .map_err(StepError::Session)?;
        match self.gateway.fetch_records(account, scope, &credential).await {
            Ok(records) => Ok(records),
            Err(error) => {
                if matches!(error, FetchError::SessionExpired) {
                    warn!(subject = %subject, "portal session lapsed, discarding");
                    self.sessions.discard(subject);
                }
                Err(StepError::Fetch(error))
            }
        }
    }
}
