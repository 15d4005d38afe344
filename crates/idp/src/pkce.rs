//! Authorization URL construction with PKCE (RFC 7636)
//!
//! Login and re-consent both send the user to the provider's authorization
//! endpoint. Each URL carries an opaque `state` for CSRF protection and an
//! S256 code challenge; the matching verifier is redeemed with the code at
//! the token endpoint.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use reqwest::Url;
use sha2::{Digest, Sha256};

use crate::endpoints::ClientApp;
use crate::error::{Error, Result};
use crate::token::scope_param;

/// `prompt` parameter values the broker uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prompt {
    /// Let the user pick an account (normal login)
    SelectAccount,
    /// Force the consent screen for newly requested scopes
    Consent,
    /// Force credential entry
    Login,
}

impl Prompt {
    pub fn as_str(&self) -> &'static str {
        match self {
            Prompt::SelectAccount => "select_account",
            Prompt::Consent => "consent",
            Prompt::Login => "login",
        }
    }
}

/// Random PKCE code verifier: 64 bytes, URL-safe base64 without padding
/// (86 characters, inside the RFC's 43-128 range).
pub fn generate_verifier() -> String {
    let mut bytes = [0u8; 64];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// `BASE64URL(SHA256(verifier))`
pub fn compute_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Random opaque `state` value (16 bytes, URL-safe).
pub fn generate_state() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Build an authorization URL for `scopes`.
///
/// The reserved OpenID scopes are always added so the code redeems into an
/// ID token and a refresh token.
pub fn build_authorization_url(
    app: &ClientApp,
    scopes: &[String],
    state: &str,
    challenge: &str,
    prompt: Option<Prompt>,
) -> Result<String> {
    let scope = scope_param(scopes, true);
    let mut params: Vec<(&str, &str)> = vec![
        ("client_id", app.client_id.as_str()),
        ("response_type", "code"),
        ("redirect_uri", app.redirect_uri.as_str()),
        ("response_mode", "query"),
        ("scope", scope.as_str()),
        ("state", state),
        ("code_challenge", challenge),
        ("code_challenge_method", "S256"),
    ];
    if let Some(prompt) = prompt {
        params.push(("prompt", prompt.as_str()));
    }

    Url::parse_with_params(&app.endpoints.authorize, &params)
        .map(String::from)
        .map_err(|e| Error::InvalidEndpoint(format!("{}: {e}", app.endpoints.authorize)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoints::{DEFAULT_AUTHORITY_HOST, ProviderEndpoints};
    use common::Secret;
    use std::collections::HashMap;

    fn app() -> ClientApp {
        ClientApp {
            client_id: "client-1".into(),
            client_secret: Secret::from("s"),
            redirect_uri: "http://localhost:8000/auth/callback".into(),
            api_audience: "client-1".into(),
            endpoints: ProviderEndpoints::for_tenant(DEFAULT_AUTHORITY_HOST, "t1"),
        }
    }

    fn query(url: &str) -> HashMap<String, String> {
        Url::parse(url).unwrap().query_pairs().into_owned().collect()
    }

    #[test]
    fn verifier_length_is_within_rfc_range() {
        let verifier = generate_verifier();
        assert_eq!(verifier.len(), 86);
        assert!(
            verifier
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
            "verifier must be URL-safe base64: {verifier}"
        );
    }

    #[test]
    fn states_are_unique() {
        assert_ne!(generate_state(), generate_state());
    }

    #[test]
    fn challenge_matches_known_value() {
        // SHA256("hello") base64url-encoded
        assert_eq!(
            compute_challenge("hello"),
            "LPJNul-wow4m6DsqxbninhsWHlwfp0JecwQzYpOLmCQ"
        );
    }

    #[test]
    fn login_url_carries_required_params() {
        let url = build_authorization_url(
            &app(),
            &["email".to_string(), "api://app/access".to_string()],
            "state-123",
            "challenge-abc",
            Some(Prompt::SelectAccount),
        )
        .unwrap();

        assert!(url.starts_with(
            "https://login.microsoftonline.com/t1/oauth2/v2.0/authorize?"
        ));
        let q = query(&url);
        assert_eq!(q["client_id"], "client-1");
        assert_eq!(q["response_type"], "code");
        assert_eq!(q["redirect_uri"], "http://localhost:8000/auth/callback");
        assert_eq!(q["scope"], "email api://app/access openid profile offline_access");
        assert_eq!(q["state"], "state-123");
        assert_eq!(q["code_challenge"], "challenge-abc");
        assert_eq!(q["code_challenge_method"], "S256");
        assert_eq!(q["prompt"], "select_account");
    }

    #[test]
    fn consent_url_sets_prompt_consent() {
        let url = build_authorization_url(
            &app(),
            &["User.Read".to_string()],
            "s",
            "c",
            Some(Prompt::Consent),
        )
        .unwrap();
        let q = query(&url);
        assert_eq!(q["prompt"], "consent");
        assert!(q["scope"].starts_with("User.Read"));
    }

    #[test]
    fn invalid_authorize_endpoint_is_an_error() {
        let mut app = app();
        app.endpoints.authorize = "not a url".into();
        let err = build_authorization_url(&app, &[], "s", "c", None).unwrap_err();
        assert!(matches!(err, Error::InvalidEndpoint(_)));
    }
}
