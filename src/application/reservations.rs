//! Reservation actions against the portal.

use std::sync::Arc;

use crate::application::error::AppError;
use crate::application::sync::SessionService;
use crate::cache::{CacheKey, Invalidator};
use crate::domain::identity::SubjectId;
use crate::domain::records::{Confirmation, ReservationWindow};
use crate::domain::types::{AccountKind, Scope};
use crate::portal::{FetchError, PortalGateway};

enum Action<'a> {
    Reserve {
        target: &'a str,
        window: &'a ReservationWindow,
    },
    Cancel {
        reference: &'a str,
    },
}

/// Places and cancels reservations under the subject's pooled session,
/// invalidating the scopes the action just changed.
pub struct ReservationService {
    sessions: Arc<SessionService>,
    gateway: Arc<PortalGateway>,
    invalidator: Invalidator,
}

impl ReservationService {
    pub fn new(
        sessions: Arc<SessionService>,
        gateway: Arc<PortalGateway>,
        invalidator: Invalidator,
    ) -> Self {
        Self {
            sessions,
            gateway,
            invalidator,
        }
    }

    pub async fn reserve(
        &self,
        subject: &SubjectId,
        target: &str,
        window: &ReservationWindow,
    ) -> Result<Confirmation, AppError> {
        self.perform(subject, Action::Reserve { target, window })
            .await
    }

    pub async fn cancel(
        &self,
        subject: &SubjectId,
        reference: &str,
    ) -> Result<Confirmation, AppError> {
        self.perform(subject, Action::Cancel { reference }).await
    }

    async fn perform(
        &self,
        subject: &SubjectId,
        action: Action<'_>,
    ) -> Result<Confirmation, AppError> {
        let account = AccountKind::resolve(subject)?;

        // One in-place relogin covers a session that lapsed between the
        // lease and the action; anything further is a portal problem.
        let mut relogged = false;
        let confirmation = loop {
            let credential = self.sessions.authenticated(subject).await?;
            let result = match &action {
                Action::Reserve { target, window } => {
                    self.gateway
                        .reserve(account, &credential, target, window)
                        .await
                }
                Action::Cancel { reference } => {
                    self.gateway.cancel(account, &credential, reference).await
                }
            };
            match result {
                Ok(confirmation) => break confirmation,
                Err(FetchError::SessionExpired) if !relogged => {
                    relogged = true;
                    self.sessions.discard(subject);
                }
                Err(error) => return Err(map_fetch_error(error)),
            }
        };

        if !confirmation.accepted {
            let reason = if confirmation.message.is_empty() {
                "portal declined the action".to_string()
            } else {
                confirmation.message.clone()
            };
            return Err(AppError::Validation(reason));
        }

        for scope in [Scope::Reservations, Scope::History] {
            self.invalidator
                .invalidate(&CacheKey::records(subject, &scope))
                .await;
        }
        Ok(confirmation)
    }
}

fn map_fetch_error(error: FetchError) -> AppError {
    match error {
        FetchError::SessionExpired => AppError::PortalUnavailable {
            attempts: 2,
            reason: "portal session expired twice in a row".to_string(),
        },
        FetchError::Transport(transport) => AppError::PortalUnavailable {
            attempts: 1,
            reason: transport.to_string(),
        },
        FetchError::Extract(extract) => AppError::unexpected(extract.to_string()),
    }
}
