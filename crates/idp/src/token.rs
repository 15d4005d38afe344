//! Token endpoint grants
//!
//! Handles the three token endpoint interactions the broker performs:
//! 1. Authorization code exchange (login callback)
//! 2. Refresh token redemption (silent refresh)
//! 3. On-behalf-of exchange (downstream resource tokens)
//!
//! All three POST a form to the tenant's token endpoint as a confidential
//! client. Error responses are parsed into `ProviderErrorBody` so callers can
//! branch on structured error codes instead of message text.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::endpoints::{CONSENT_REQUIRED_CODE, ClientApp, RESERVED_SCOPES};
use crate::error::{Error, Result};

const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";
const GRANT_REFRESH_TOKEN: &str = "refresh_token";
const GRANT_JWT_BEARER: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Successful token endpoint response.
///
/// `expires_in` is a delta in seconds from the response time. Callers convert
/// it to an absolute epoch timestamp when caching the access token.
#[derive(Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
    #[serde(default)]
    pub ext_expires_in: Option<u64>,
    /// Space-separated scopes actually granted
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("has_id_token", &self.id_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Error document returned by the token endpoint on a non-2xx response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProviderErrorBody {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub error_codes: Vec<u32>,
    #[serde(default)]
    pub suberror: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl ProviderErrorBody {
    /// Parse an error response body. Non-JSON bodies are kept as the description.
    pub fn parse(status: u16, text: &str) -> Self {
        serde_json::from_str(text).unwrap_or_else(|_| Self {
            error: format!("http_{status}"),
            error_description: Some(text.to_string()),
            ..Default::default()
        })
    }

    /// Numeric code leading the description, e.g. `65001` for `"AADSTS65001: ..."`.
    pub fn description_code(&self) -> Option<u32> {
        self.error_description
            .as_deref()?
            .split(':')
            .next()?
            .trim()
            .strip_prefix("AADSTS")?
            .parse()
            .ok()
    }

    /// Whether the provider reported `code`, either in `error_codes` or as the
    /// description's leading code.
    pub fn has_code(&self, code: u32) -> bool {
        self.error_codes.contains(&code) || self.description_code() == Some(code)
    }

    pub fn is_consent_required(&self) -> bool {
        self.has_code(CONSENT_REQUIRED_CODE) || self.suberror.as_deref() == Some("consent_required")
    }

    pub fn is_invalid_grant(&self) -> bool {
        self.error == "invalid_grant"
    }
}

impl fmt::Display for ProviderErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_description {
            Some(description) => write!(f, "{}: {}", self.error, description),
            None => write!(f, "{}", self.error),
        }
    }
}

/// Join `scopes` into a space-separated `scope` parameter, optionally adding
/// the reserved OpenID scopes. Duplicates are dropped, order is kept.
pub fn scope_param(scopes: &[String], with_reserved: bool) -> String {
    let mut out: Vec<&str> = Vec::new();
    let reserved: &[&str] = if with_reserved { RESERVED_SCOPES } else { &[] };
    for scope in scopes.iter().map(String::as_str).chain(reserved.iter().copied()) {
        if !scope.is_empty() && !out.contains(&scope) {
            out.push(scope);
        }
    }
    out.join(" ")
}

/// Token endpoint client for one confidential client registration.
#[derive(Clone)]
pub struct TokenClient {
    http: reqwest::Client,
    app: ClientApp,
}

impl TokenClient {
    pub fn new(http: reqwest::Client, app: ClientApp) -> Self {
        Self { http, app }
    }

    pub fn app(&self) -> &ClientApp {
        &self.app
    }

    /// Redeem an authorization code (login callback).
    ///
    /// `verifier` is the PKCE code verifier generated when the login URL was
    /// built; the provider checks it against the challenge it saw then.
    pub async fn exchange_code(
        &self,
        code: &str,
        verifier: &str,
        scopes: &[String],
    ) -> Result<TokenResponse> {
        let scope = scope_param(scopes, true);
        self.post_form(
            GRANT_AUTHORIZATION_CODE,
            &[
                ("code", code),
                ("code_verifier", verifier),
                ("redirect_uri", self.app.redirect_uri.as_str()),
                ("scope", scope.as_str()),
            ],
        )
        .await
    }

    /// Redeem a refresh token for a new access/ID token pair.
    pub async fn refresh(&self, refresh_token: &str, scopes: &[String]) -> Result<TokenResponse> {
        let scope = scope_param(scopes, true);
        self.post_form(
            GRANT_REFRESH_TOKEN,
            &[("refresh_token", refresh_token), ("scope", scope.as_str())],
        )
        .await
    }

    /// Exchange the user's access token for one scoped to a downstream resource.
    pub async fn on_behalf_of(&self, assertion: &str, scopes: &[String]) -> Result<TokenResponse> {
        let scope = scope_param(scopes, false);
        self.post_form(
            GRANT_JWT_BEARER,
            &[
                ("assertion", assertion),
                ("requested_token_use", "on_behalf_of"),
                ("scope", scope.as_str()),
            ],
        )
        .await
    }

    async fn post_form(&self, grant_type: &str, params: &[(&str, &str)]) -> Result<TokenResponse> {
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", grant_type),
            ("client_id", self.app.client_id.as_str()),
            ("client_secret", self.app.client_secret.expose().as_str()),
        ];
        form.extend_from_slice(params);

        debug!(grant_type, endpoint = %self.app.endpoints.token, "calling token endpoint");
        let response = self
            .http
            .post(&self.app.endpoints.token)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Http(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            let body = ProviderErrorBody::parse(status.as_u16(), &text);
            warn!(
                grant_type,
                status = status.as_u16(),
                error = %body.error,
                codes = ?body.error_codes,
                "token endpoint rejected request"
            );
            return Err(Error::Provider {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoints::ProviderEndpoints;
    use axum::Router;
    use axum::extract::Form;
    use axum::http::StatusCode;
    use axum::routing::post;
    use common::Secret;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    type Captured = Arc<Mutex<Vec<HashMap<String, String>>>>;

    /// Token endpoint double: records forms, answers with `status` + `body`.
    async fn start_token_server(status: StatusCode, body: serde_json::Value) -> (String, Captured) {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        let app = Router::new().route(
            "/t1/oauth2/v2.0/token",
            post(move |Form(form): Form<HashMap<String, String>>| {
                let sink = sink.clone();
                let body = body.clone();
                async move {
                    sink.lock().unwrap().push(form);
                    (status, axum::Json(body))
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), captured)
    }

    fn client(host: &str) -> TokenClient {
        TokenClient::new(
            reqwest::Client::new(),
            ClientApp {
                client_id: "client-1".into(),
                client_secret: Secret::from("s3cret"),
                redirect_uri: "http://localhost:8000/auth/callback".into(),
                api_audience: "client-1".into(),
                endpoints: ProviderEndpoints::for_tenant(host, "t1"),
            },
        )
    }

    fn ok_body() -> serde_json::Value {
        serde_json::json!({
            "token_type": "Bearer",
            "access_token": "at_new",
            "id_token": "idt_new",
            "refresh_token": "rt_new",
            "expires_in": 3599,
            "scope": "User.Read openid profile"
        })
    }

    #[test]
    fn token_response_deserializes_minimal() {
        let json = r#"{"access_token":"at_abc","expires_in":3600}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.access_token, "at_abc");
        assert!(token.refresh_token.is_none());
        assert!(token.id_token.is_none());
    }

    #[test]
    fn token_response_debug_hides_secrets() {
        let token: TokenResponse = serde_json::from_value(ok_body()).unwrap();
        let debug = format!("{token:?}");
        assert!(!debug.contains("at_new"), "got: {debug}");
        assert!(!debug.contains("rt_new"), "got: {debug}");
    }

    #[test]
    fn consent_detected_from_error_codes() {
        let body = ProviderErrorBody::parse(
            400,
            r#"{"error":"invalid_grant","error_description":"AADSTS65001: The user or administrator has not consented","error_codes":[65001],"suberror":"consent_required"}"#,
        );
        assert!(body.is_consent_required());
        assert!(body.is_invalid_grant());
    }

    #[test]
    fn consent_detected_from_description_code_alone() {
        let body = ProviderErrorBody {
            error: "invalid_grant".into(),
            error_description: Some("AADSTS65001: consent missing".into()),
            ..Default::default()
        };
        assert_eq!(body.description_code(), Some(65001));
        assert!(body.is_consent_required());
    }

    #[test]
    fn code_mentioned_mid_description_is_not_consent() {
        // Only the leading code counts; a later mention is not a match.
        let body = ProviderErrorBody {
            error: "invalid_request".into(),
            error_description: Some("AADSTS50013: see also AADSTS65001".into()),
            ..Default::default()
        };
        assert_eq!(body.description_code(), Some(50013));
        assert!(!body.is_consent_required());
    }

    #[test]
    fn non_json_error_body_is_preserved() {
        let body = ProviderErrorBody::parse(502, "<html>bad gateway</html>");
        assert_eq!(body.error, "http_502");
        assert_eq!(body.error_description.as_deref(), Some("<html>bad gateway</html>"));
    }

    #[test]
    fn scope_param_adds_reserved_once() {
        let scopes = vec!["User.Read".to_string(), "openid".to_string()];
        assert_eq!(scope_param(&scopes, true), "User.Read openid profile offline_access");
        assert_eq!(scope_param(&scopes, false), "User.Read openid");
    }

    #[tokio::test]
    async fn on_behalf_of_posts_jwt_bearer_grant() {
        let (host, captured) = start_token_server(StatusCode::OK, ok_body()).await;
        let response = client(&host)
            .on_behalf_of("user-assertion", &["User.Read".to_string()])
            .await
            .unwrap();
        assert_eq!(response.access_token, "at_new");

        let forms = captured.lock().unwrap();
        let form = &forms[0];
        assert_eq!(form["grant_type"], GRANT_JWT_BEARER);
        assert_eq!(form["requested_token_use"], "on_behalf_of");
        assert_eq!(form["assertion"], "user-assertion");
        assert_eq!(form["scope"], "User.Read");
        assert_eq!(form["client_id"], "client-1");
        assert_eq!(form["client_secret"], "s3cret");
    }

    #[tokio::test]
    async fn refresh_posts_refresh_grant_with_reserved_scopes() {
        let (host, captured) = start_token_server(StatusCode::OK, ok_body()).await;
        client(&host)
            .refresh("rt_old", &["api://app/access".to_string()])
            .await
            .unwrap();

        let forms = captured.lock().unwrap();
        assert_eq!(forms[0]["grant_type"], "refresh_token");
        assert_eq!(forms[0]["refresh_token"], "rt_old");
        assert_eq!(forms[0]["scope"], "api://app/access openid profile offline_access");
    }

    #[tokio::test]
    async fn exchange_code_sends_verifier_and_redirect() {
        let (host, captured) = start_token_server(StatusCode::OK, ok_body()).await;
        client(&host)
            .exchange_code("auth-code", "pkce-verifier", &["email".to_string()])
            .await
            .unwrap();

        let forms = captured.lock().unwrap();
        assert_eq!(forms[0]["grant_type"], "authorization_code");
        assert_eq!(forms[0]["code"], "auth-code");
        assert_eq!(forms[0]["code_verifier"], "pkce-verifier");
        assert_eq!(forms[0]["redirect_uri"], "http://localhost:8000/auth/callback");
    }

    #[tokio::test]
    async fn provider_error_is_structured() {
        let (host, _) = start_token_server(
            StatusCode::BAD_REQUEST,
            serde_json::json!({
                "error": "invalid_grant",
                "error_description": "AADSTS65001: The user or administrator has not consented to use the application",
                "error_codes": [65001],
                "suberror": "consent_required"
            }),
        )
        .await;

        let err = client(&host)
            .on_behalf_of("assertion", &["User.Read".to_string()])
            .await
            .unwrap_err();
        assert!(err.is_consent_required(), "got: {err}");
        match err {
            Error::Provider { status, .. } => assert_eq!(status, 400),
            other => panic!("expected provider error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_http_error() {
        let err = client("http://127.0.0.1:1")
            .refresh("rt", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http(_)), "got: {err:?}");
    }
}
