//! Subject identity and the session material minted for it.
//!
//! Secrets are request-scoped: they live only as long as the login call that
//! needs them and never reach logs or storage in plaintext.

use std::fmt::{self, Display, Formatter};

/// Opaque identifier of the person whose records are being synchronized.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SubjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A login secret. `Debug` and `Display` are deliberately not derived; the
/// only way to read the value is an explicit [`Secret::reveal`] call at the
/// point a request body is built.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn reveal(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

/// Login credentials for one subject.
#[derive(Debug, Clone)]
pub struct Identity {
    pub account: String,
    pub secret: Secret,
}

impl Identity {
    pub fn new(account: impl Into<String>, secret: Secret) -> Self {
        Self {
            account: account.into(),
            secret,
        }
    }
}

/// Hidden form fields scraped from the login page. The portal rejects a POST
/// that does not echo them back verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeParams {
    pub fields: Vec<(String, String)>,
}

/// An authenticated portal session: the cookies issued across the login
/// handshake, in the order the portal set them.
#[derive(Clone, Default)]
pub struct SessionCredential {
    cookies: Vec<(String, String)>,
}

impl SessionCredential {
    /// Stores a cookie, replacing any earlier value under the same name.
    pub fn store(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.cookies.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.cookies.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Renders the jar as a `Cookie` request header value.
    pub fn header_value(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.cookies.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("SessionCredential")
            .field("cookies", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_debug_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{secret:?}"), "Secret(****)");
        assert_eq!(secret.reveal(), "hunter2");
    }

    #[test]
    fn identity_debug_does_not_leak_the_secret() {
        let identity = Identity::new("20230114", Secret::new("hunter2"));
        let rendered = format!("{identity:?}");
        assert!(rendered.contains("20230114"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn jar_replaces_same_name_and_keeps_order() {
        let mut credential = SessionCredential::default();
        credential.store("JSESSIONID", "first");
        credential.store("route", "edge-2");
        credential.store("JSESSIONID", "second");
        assert_eq!(credential.get("JSESSIONID"), Some("second"));
        assert_eq!(credential.header_value(), "JSESSIONID=second; route=edge-2");
    }

    #[test]
    fn session_debug_lists_cookie_names_only() {
        let mut credential = SessionCredential::default();
        credential.store("JSESSIONID", "topsecretvalue");
        let rendered = format!("{credential:?}");
        assert!(rendered.contains("JSESSIONID"));
        assert!(!rendered.contains("topsecretvalue"));
    }
}
