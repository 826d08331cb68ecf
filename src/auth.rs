//! Authentication providers.
//!
//! Only the challenge/response step of the handshake lives in the session.
//! Transport-level providers (anonymous, cookie, TLS) authenticate below the
//! session and are never asked to answer a CHALLENGE.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{Result, WampError};
use crate::protocol::Dict;

/// Answer to a CHALLENGE
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChallengeResponse {
    /// Signature sent in AUTHENTICATE
    pub signature: String,
    /// Extra AUTHENTICATE details
    pub extra: Dict,
}

impl ChallengeResponse {
    /// Response carrying only a signature
    pub fn new(signature: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            extra: Dict::new(),
        }
    }
}

/// Supplies credentials for the HELLO and answers challenges.
pub trait AuthProvider: Send + Sync {
    /// Authentication id sent in HELLO
    fn auth_id(&self) -> &str;

    /// Authentication method sent in HELLO `authmethods`
    fn auth_method(&self) -> &str;

    /// Authentication happens below the session; no CHALLENGE expected
    fn is_transport_level(&self) -> bool;

    /// Optional `authextra` for HELLO
    fn auth_extra(&self) -> Option<Dict> {
        None
    }

    /// Compute the response to a CHALLENGE's `extra`.
    fn compute_challenge(&self, extra: Dict) -> BoxFuture<'static, Result<ChallengeResponse>>;
}

fn transport_level(method: &str) -> BoxFuture<'static, Result<ChallengeResponse>> {
    let err = WampError::Authentication(format!(
        "{} authentication is handled by the transport",
        method
    ));
    Box::pin(async move { Err(err) })
}

/// No authentication
#[derive(Debug, Clone)]
pub struct AnonymousAuthProvider {
    auth_id: String,
}

impl AnonymousAuthProvider {
    /// Anonymous with authid `anonymous`
    pub fn new() -> Self {
        Self {
            auth_id: "anonymous".to_string(),
        }
    }

    /// Anonymous with a custom authid
    pub fn with_auth_id(auth_id: impl Into<String>) -> Self {
        Self {
            auth_id: auth_id.into(),
        }
    }
}

impl Default for AnonymousAuthProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthProvider for AnonymousAuthProvider {
    fn auth_id(&self) -> &str {
        &self.auth_id
    }

    fn auth_method(&self) -> &str {
        "anonymous"
    }

    fn is_transport_level(&self) -> bool {
        true
    }

    fn compute_challenge(&self, _extra: Dict) -> BoxFuture<'static, Result<ChallengeResponse>> {
        transport_level(self.auth_method())
    }
}

/// Session established on a cookie the transport already presented
#[derive(Debug, Clone, Default)]
pub struct CookieAuthProvider;

impl AuthProvider for CookieAuthProvider {
    fn auth_id(&self) -> &str {
        ""
    }

    fn auth_method(&self) -> &str {
        "cookie"
    }

    fn is_transport_level(&self) -> bool {
        true
    }

    fn compute_challenge(&self, _extra: Dict) -> BoxFuture<'static, Result<ChallengeResponse>> {
        transport_level(self.auth_method())
    }
}

/// Session established on a TLS client certificate
#[derive(Debug, Clone)]
pub struct TlsAuthProvider {
    auth_id: String,
}

impl TlsAuthProvider {
    /// TLS authentication claiming `auth_id` (empty to let the router decide)
    pub fn new(auth_id: impl Into<String>) -> Self {
        Self {
            auth_id: auth_id.into(),
        }
    }
}

impl AuthProvider for TlsAuthProvider {
    fn auth_id(&self) -> &str {
        &self.auth_id
    }

    fn auth_method(&self) -> &str {
        "tls"
    }

    fn is_transport_level(&self) -> bool {
        true
    }

    fn compute_challenge(&self, _extra: Dict) -> BoxFuture<'static, Result<ChallengeResponse>> {
        transport_level(self.auth_method())
    }
}

type TicketFn = Arc<dyn Fn(Dict) -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// Ticket authentication: the signature is a ticket, fixed or computed per challenge
#[derive(Clone)]
pub struct TicketAuthProvider {
    auth_id: String,
    ticket: TicketFn,
}

impl TicketAuthProvider {
    /// Answer every challenge with the same ticket
    pub fn new(auth_id: impl Into<String>, ticket: impl Into<String>) -> Self {
        let ticket = ticket.into();
        Self::with_callback(auth_id, move |_extra| {
            let ticket = ticket.clone();
            async move { Ok(ticket) }
        })
    }

    /// Compute the ticket from the challenge's `extra`
    pub fn with_callback<F, Fut>(auth_id: impl Into<String>, callback: F) -> Self
    where
        F: Fn(Dict) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        Self {
            auth_id: auth_id.into(),
            ticket: Arc::new(move |extra| callback(extra).boxed()),
        }
    }
}

impl std::fmt::Debug for TicketAuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketAuthProvider")
            .field("auth_id", &self.auth_id)
            .finish_non_exhaustive()
    }
}

impl AuthProvider for TicketAuthProvider {
    fn auth_id(&self) -> &str {
        &self.auth_id
    }

    fn auth_method(&self) -> &str {
        "ticket"
    }

    fn is_transport_level(&self) -> bool {
        false
    }

    fn compute_challenge(&self, extra: Dict) -> BoxFuture<'static, Result<ChallengeResponse>> {
        let ticket = (self.ticket)(extra);
        Box::pin(async move { ticket.await.map(ChallengeResponse::new) })
    }
}

/// HELLO auth details for `provider`, with `authid` overridden when given.
pub fn hello_auth_details(provider: &dyn AuthProvider, authid: Option<&str>) -> Dict {
    let mut details = Dict::new();
    let authid = authid.unwrap_or_else(|| provider.auth_id());
    details.insert("authid".into(), authid.into());
    details.insert(
        "authmethods".into(),
        vec![serde_json::Value::from(provider.auth_method())].into(),
    );
    if let Some(extra) = provider.auth_extra() {
        details.insert("authextra".into(), serde_json::Value::Object(extra));
    }
    details
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_transport_level_providers_refuse_challenges() {
        let providers: Vec<Box<dyn AuthProvider>> = vec![
            Box::new(AnonymousAuthProvider::new()),
            Box::new(CookieAuthProvider),
            Box::new(TlsAuthProvider::new("client-cert")),
        ];
        for provider in providers {
            assert!(provider.is_transport_level());
            assert!(matches!(
                provider.compute_challenge(Dict::new()).await,
                Err(WampError::Authentication(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_ticket_provider() {
        let provider = TicketAuthProvider::new("joe", "secret!!!");
        assert!(!provider.is_transport_level());
        assert_eq!(provider.auth_method(), "ticket");
        let response = provider.compute_challenge(Dict::new()).await.unwrap();
        assert_eq!(response.signature, "secret!!!");
    }

    #[tokio::test]
    async fn test_ticket_callback_sees_extra() {
        let provider = TicketAuthProvider::with_callback("joe", |extra: Dict| async move {
            Ok(format!("ticket-for-{}", extra["nonce"].as_str().unwrap_or("")))
        });
        let extra = json!({"nonce": "abc"}).as_object().cloned().unwrap();
        let response = provider.compute_challenge(extra).await.unwrap();
        assert_eq!(response.signature, "ticket-for-abc");
    }

    #[test]
    fn test_hello_auth_details() {
        let details = hello_auth_details(&AnonymousAuthProvider::new(), None);
        assert_eq!(
            serde_json::Value::Object(details),
            json!({"authid": "anonymous", "authmethods": ["anonymous"]})
        );

        let details = hello_auth_details(&CookieAuthProvider, Some("override"));
        assert_eq!(details["authid"], json!("override"));
        assert_eq!(details["authmethods"], json!(["cookie"]));
    }
}
