//! Two-step form login against the portal.
//!
//! The portal runs a classic HTML login: GET the form page, echo its
//! hidden handshake fields back together with the credentials, and read
//! the session out of `Set-Cookie`. Rejected credentials come back as
//! HTTP 200 with a failure phrase in the markup, so the body is checked
//! before the status code.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::{PortalSettings, RetrySettings};
use crate::domain::identity::{Identity, SessionCredential};
use crate::portal::http::{PortalHttp, TransportError};
use crate::util::retry::{RetryError, RetryFailure, retry};

const USERNAME_FIELD: &str = "username";
const PASSWORD_FIELD: &str = "password";

static HIDDEN_INPUTS: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"input[type="hidden"]"#).expect("invalid selector"));

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("login page is missing the hidden form field `{field}`")]
    ParamsNotFound { field: String },
    #[error("portal rejected the credentials")]
    BadCredentials,
    #[error("portal issued no session cookie after login")]
    NoCookieIssued,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("session acquisition failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: Box<AcquireError>,
    },
}

impl AcquireError {
    /// Credential rejections are final. Retrying a bad password only
    /// feeds the portal's lockout counter.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::BadCredentials)
    }
}

/// Performs the login handshake and retries transient failures with
/// linear backoff.
pub struct SessionAcquirer {
    http: Arc<dyn PortalHttp>,
    portal: PortalSettings,
    retry: RetrySettings,
}

impl SessionAcquirer {
    pub fn new(http: Arc<dyn PortalHttp>, portal: PortalSettings, retry: RetrySettings) -> Self {
        Self {
            http,
            portal,
            retry,
        }
    }

    /// Runs the handshake until it yields a session, a permanent
    /// rejection, or the retry budget runs out.
    pub async fn acquire(&self, identity: &Identity) -> Result<SessionCredential, AcquireError> {
        let result = retry(
            self.retry.attempts.get(),
            self.retry.backoff_unit,
            || async {
                self.acquire_once(identity).await.map_err(|error| {
                    if error.is_permanent() {
                        RetryError::Permanent(error)
                    } else {
                        RetryError::Transient(error)
                    }
                })
            },
        )
        .await;

        match result {
            Ok(credential) => Ok(credential),
            Err(RetryFailure::Aborted(error)) => Err(error),
            Err(RetryFailure::Exhausted { attempts, last }) => Err(AcquireError::Exhausted {
                attempts,
                source: Box::new(last),
            }),
        }
    }

    async fn acquire_once(&self, identity: &Identity) -> Result<SessionCredential, AcquireError> {
        let login_url = self.login_url()?;
        let page = self.http.get(&login_url, None).await?;
        if page.status != 200 {
            return Err(TransportError::UnexpectedStatus { status: page.status }.into());
        }

        let mut credential = SessionCredential::default();
        for (name, value) in &page.cookies {
            credential.store(name, value);
        }

        let hidden = hidden_fields(&page.body);
        let mut form: Vec<(String, String)> =
            Vec::with_capacity(self.portal.handshake_fields.len() + 2);
        form.push((USERNAME_FIELD.to_string(), identity.account.clone()));
        form.push((
            PASSWORD_FIELD.to_string(),
            identity.secret.reveal().to_string(),
        ));
        for field in &self.portal.handshake_fields {
            let value =
                hidden
                    .get(field.as_str())
                    .ok_or_else(|| AcquireError::ParamsNotFound {
                        field: field.clone(),
                    })?;
            form.push((field.clone(), value.clone()));
        }

        let post_url = self.affinity_url(&login_url, &credential);
        let cookie_header = header_for(&credential);
        let response = self
            .http
            .post_form(&post_url, &form, cookie_header.as_deref())
            .await?;

        if response.body.contains(&self.portal.failure_phrase) {
            return Err(AcquireError::BadCredentials);
        }
        if response.status >= 400 {
            return Err(TransportError::UnexpectedStatus {
                status: response.status,
            }
            .into());
        }
        if response.cookies.is_empty() {
            return Err(AcquireError::NoCookieIssued);
        }
        for (name, value) in &response.cookies {
            credential.store(name, value);
        }

        debug!(account = %identity.account, "portal session established");
        Ok(credential)
    }

    fn login_url(&self) -> Result<Url, AcquireError> {
        self.portal
            .base_url
            .join(&self.portal.login_path)
            .map_err(|error| TransportError::Http(error.to_string()).into())
    }

    /// Pins the POST to the node that served the form by echoing the
    /// affinity cookie servlet-style inside the URL path.
    fn affinity_url(&self, login_url: &Url, credential: &SessionCredential) -> Url {
        let mut url = login_url.clone();
        if let Some(value) = credential.get(&self.portal.affinity_cookie) {
            let path = format!("{};{}={}", url.path(), self.portal.affinity_cookie, value);
            url.set_path(&path);
        }
        url
    }
}

fn header_for(credential: &SessionCredential) -> Option<String> {
    if credential.is_empty() {
        None
    } else {
        Some(credential.header_value())
    }
}

fn hidden_fields(body: &str) -> HashMap<String, String> {
    let document = Html::parse_document(body);
    let mut fields = HashMap::new();
    for input in document.select(&HIDDEN_INPUTS) {
        let Some(name) = input.value().attr("name") else {
            continue;
        };
        let value = input.value().attr("value").unwrap_or_default();
        fields.insert(name.to_string(), value.to_string());
    }
    fields
}
