//! Credential lookup backed by static configuration.
//!
//! A deployment serves the account named in `[portal]`; anything else is
//! reported as unknown rather than silently logged in with the wrong
//! identity.

use async_trait::async_trait;

use crate::application::repos::{CredentialError, CredentialSource};
use crate::config::PortalSettings;
use crate::domain::identity::{Identity, SubjectId};

pub struct StaticCredentialSource {
    identity: Option<Identity>,
}

impl StaticCredentialSource {
    pub fn from_settings(portal: &PortalSettings) -> Self {
        let identity = match (&portal.account, &portal.secret) {
            (Some(account), Some(secret)) => Some(Identity::new(account.clone(), secret.clone())),
            _ => None,
        };
        Self { identity }
    }
}

#[async_trait]
impl CredentialSource for StaticCredentialSource {
    async fn credentials(&self, subject: &SubjectId) -> Result<Identity, CredentialError> {
        let identity = self.identity.as_ref().ok_or_else(|| {
            CredentialError::Source("portal credentials are not configured".to_string())
        })?;
        if identity.account != subject.as_str() {
            return Err(CredentialError::Unknown {
                subject: subject.to_string(),
            });
        }
        Ok(identity.clone())
    }
}
