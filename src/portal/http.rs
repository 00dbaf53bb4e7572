//! HTTP transport seam for the academic portal.
//!
//! Redirects are never followed: the login flow reads meaning out of
//! intermediate responses (cookies, failure markup) that auto-following
//! would swallow.

use async_trait::async_trait;
use reqwest::header;
use reqwest::redirect;
use thiserror::Error;
use url::Url;

use crate::config::PortalSettings;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("portal request timed out")]
    Timeout,
    #[error("portal returned status {status}")]
    UnexpectedStatus { status: u16 },
    #[error("portal transport error: {0}")]
    Http(String),
}

/// One portal exchange, reduced to what the scraping layer needs.
#[derive(Debug, Clone)]
pub struct PortalResponse {
    pub status: u16,
    pub body: String,
    /// `Set-Cookie` pairs in response order, first segment only.
    pub cookies: Vec<(String, String)>,
}

#[async_trait]
pub trait PortalHttp: Send + Sync {
    async fn get(
        &self,
        url: &Url,
        cookie_header: Option<&str>,
    ) -> Result<PortalResponse, TransportError>;

    async fn post_form(
        &self,
        url: &Url,
        form: &[(String, String)],
        cookie_header: Option<&str>,
    ) -> Result<PortalResponse, TransportError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(settings: &PortalSettings) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(settings.request_timeout)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|error| TransportError::Http(error.to_string()))?;
        Ok(Self { client })
    }

    async fn run(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<PortalResponse, TransportError> {
        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let cookies = response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(parse_set_cookie)
            .collect();
        let body = response.text().await.map_err(map_reqwest_error)?;
        Ok(PortalResponse {
            status,
            body,
            cookies,
        })
    }
}

#[async_trait]
impl PortalHttp for ReqwestTransport {
    async fn get(
        &self,
        url: &Url,
        cookie_header: Option<&str>,
    ) -> Result<PortalResponse, TransportError> {
        let mut request = self.client.get(url.clone());
        if let Some(cookies) = cookie_header {
            request = request.header(header::COOKIE, cookies);
        }
        self.run(request).await
    }

    async fn post_form(
        &self,
        url: &Url,
        form: &[(String, String)],
        cookie_header: Option<&str>,
    ) -> Result<PortalResponse, TransportError> {
        let mut request = self.client.post(url.clone()).form(form);
        if let Some(cookies) = cookie_header {
            request = request.header(header::COOKIE, cookies);
        }
        self.run(request).await
    }
}

fn map_reqwest_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Http(error.to_string())
    }
}

/// Extracts `name=value` from the first `;`-separated segment of a
/// `Set-Cookie` header. Attribute-only headers yield nothing.
fn parse_set_cookie(header: &str) -> Option<(String, String)> {
    let first = header.split(';').next()?.trim();
    let (name, value) = first.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}
