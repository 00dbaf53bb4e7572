//! Portal-facing layer: login handshake, session pooling, fetching and
//! scraping of authenticated pages.

pub mod acquirer;
pub mod extract;
pub mod http;
pub mod sessions;

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::PortalSettings;
use crate::domain::identity::SessionCredential;
use crate::domain::records::{Confirmation, DomainRecord, ReservationWindow};
use crate::domain::types::{AccountKind, Scope};
use crate::portal::extract::ExtractError;
use crate::portal::http::{PortalHttp, PortalResponse, TransportError};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The portal answered with its login page instead of the resource,
    /// meaning the pooled credential is no longer honored.
    #[error("portal session expired")]
    SessionExpired,
    #[error(transparent)]
    Extract(#[from] ExtractError),
}

/// Authenticated portal access for record pages and reservation actions.
/// URLs are rooted per account population; the portal serves students and
/// staff from parallel trees.
pub struct PortalGateway {
    http: Arc<dyn PortalHttp>,
    settings: PortalSettings,
}

impl PortalGateway {
    pub fn new(http: Arc<dyn PortalHttp>, settings: PortalSettings) -> Self {
        Self { http, settings }
    }

    /// Fetches and extracts one record family under the given session.
    pub async fn fetch_records(
        &self,
        account: AccountKind,
        scope: &Scope,
        credential: &SessionCredential,
    ) -> Result<Vec<DomainRecord>, FetchError> {
        let url = self.records_url(account, scope)?;
        let response = self
            .http
            .get(&url, Some(&credential.header_value()))
            .await?;
        let body = checked_body(response)?;

        let records = match scope {
            Scope::Courses { year, term } => extract::course_entries(&body, *year, *term)?,
            Scope::Seats => extract::seat_timeslots(&body)?,
            Scope::Reservations => extract::reservation_records(&body)?,
            Scope::Credits { year, term } => extract::credit_records(&body, *year, *term)?,
            Scope::History => extract::history_records(&body)?,
        };
        debug!(scope = %scope, count = records.len(), "extracted portal records");
        Ok(records)
    }

    /// Requests a reservation for `target` in the given window.
    pub async fn reserve(
        &self,
        account: AccountKind,
        credential: &SessionCredential,
        target: &str,
        window: &ReservationWindow,
    ) -> Result<Confirmation, FetchError> {
        let url = self.action_url(account, "reserve.json")?;
        let form = vec![
            ("target".to_string(), target.to_string()),
            ("date".to_string(), window.date.clone()),
            ("start".to_string(), window.start.clone()),
            ("end".to_string(), window.end.clone()),
        ];
        let response = self
            .http
            .post_form(&url, &form, Some(&credential.header_value()))
            .await?;
        let body = checked_body(response)?;
        Ok(extract::confirmation(&body)?)
    }

    /// Cancels a reservation by its portal reference.
    pub async fn cancel(
        &self,
        account: AccountKind,
        credential: &SessionCredential,
        reference: &str,
    ) -> Result<Confirmation, FetchError> {
        let url = self.action_url(account, "cancel.json")?;
        let form = vec![("reference".to_string(), reference.to_string())];
        let response = self
            .http
            .post_form(&url, &form, Some(&credential.header_value()))
            .await?;
        let body = checked_body(response)?;
        Ok(extract::confirmation(&body)?)
    }

    fn records_url(&self, account: AccountKind, scope: &Scope) -> Result<Url, FetchError> {
        let leaf = match scope {
            Scope::Courses { .. } => "timetable",
            Scope::Seats => "seats.json",
            Scope::Reservations => "reservations.json",
            Scope::Credits { .. } => "credits.json",
            Scope::History => "history.json",
        };
        let mut url = self.join(account, leaf)?;
        if let Scope::Courses { year, term } | Scope::Credits { year, term } = scope {
            url.query_pairs_mut()
                .append_pair("year", &year.to_string())
                .append_pair("term", term.portal_code());
        }
        Ok(url)
    }

    fn action_url(&self, account: AccountKind, leaf: &str) -> Result<Url, FetchError> {
        self.join(account, leaf)
    }

    fn join(&self, account: AccountKind, leaf: &str) -> Result<Url, FetchError> {
        let root = match account {
            AccountKind::Student => &self.settings.student_root,
            AccountKind::Staff => &self.settings.staff_root,
        };
        self.settings
            .base_url
            .join(&format!("{root}/{leaf}"))
            .map_err(|error| TransportError::Http(error.to_string()).into())
    }
}

/// Applies the checks shared by every authenticated exchange: a 200, and
/// not the login form the portal serves once the session lapses.
fn checked_body(response: PortalResponse) -> Result<String, FetchError> {
    if response.status != 200 {
        return Err(TransportError::UnexpectedStatus {
            status: response.status,
        }
        .into());
    }
    if response.body.contains(r#"type="password""#) {
        return Err(FetchError::SessionExpired);
    }
    Ok(response.body)
}
