//! Identity provider endpoints and client registration
//!
//! Endpoint URLs follow the Microsoft identity platform v2.0 layout. They are
//! derived from an authority host and a tenant so a deployment only configures
//! those two values. The client secret is carried as a `Secret` and never
//! appears in Debug output.

use common::Secret;

/// Default authority host for the Microsoft identity platform.
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Provider error code: the user or admin has not consented to the scope.
pub const CONSENT_REQUIRED_CODE: u32 = 65001;

/// Scopes the token endpoint always receives on interactive and refresh
/// grants so an ID token and refresh token come back alongside the access token.
pub const RESERVED_SCOPES: &[&str] = &["openid", "profile", "offline_access"];

/// Fully resolved endpoint set for one tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoints {
    /// `{host}/{tenant}`
    pub authority: String,
    pub authorize: String,
    pub token: String,
    /// JSON Web Key Set location
    pub jwks: String,
    /// Expected `iss` claim on tokens issued by this tenant
    pub issuer: String,
    /// Host name recorded as `environment` on cached credentials
    pub environment: String,
}

impl ProviderEndpoints {
    /// Derive the v2.0 endpoints for `tenant_id` under `authority_host`.
    pub fn for_tenant(authority_host: &str, tenant_id: &str) -> Self {
        let host = authority_host.trim_end_matches('/');
        let authority = format!("{host}/{tenant_id}");
        let environment = host
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(host)
            .to_string();
        Self {
            authorize: format!("{authority}/oauth2/v2.0/authorize"),
            token: format!("{authority}/oauth2/v2.0/token"),
            jwks: format!("{authority}/discovery/v2.0/keys"),
            issuer: format!("{authority}/v2.0"),
            environment,
            authority,
        }
    }
}

/// Confidential client registration for this application.
#[derive(Debug, Clone)]
pub struct ClientApp {
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub redirect_uri: String,
    /// Audience expected on inbound access tokens for this service's own API.
    pub api_audience: String,
    pub endpoints: ProviderEndpoints,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_follow_v2_layout() {
        let e = ProviderEndpoints::for_tenant(DEFAULT_AUTHORITY_HOST, "contoso-tenant");
        assert_eq!(e.authority, "https://login.microsoftonline.com/contoso-tenant");
        assert_eq!(
            e.authorize,
            "https://login.microsoftonline.com/contoso-tenant/oauth2/v2.0/authorize"
        );
        assert_eq!(
            e.token,
            "https://login.microsoftonline.com/contoso-tenant/oauth2/v2.0/token"
        );
        assert_eq!(
            e.jwks,
            "https://login.microsoftonline.com/contoso-tenant/discovery/v2.0/keys"
        );
        assert_eq!(e.issuer, "https://login.microsoftonline.com/contoso-tenant/v2.0");
        assert_eq!(e.environment, "login.microsoftonline.com");
    }

    #[test]
    fn trailing_slash_on_host_is_ignored() {
        let e = ProviderEndpoints::for_tenant("http://127.0.0.1:8080/", "t1");
        assert_eq!(e.authority, "http://127.0.0.1:8080/t1");
        assert_eq!(e.environment, "127.0.0.1:8080");
    }

    #[test]
    fn client_secret_is_not_printed() {
        let app = ClientApp {
            client_id: "app-id".into(),
            client_secret: Secret::from("very-secret"),
            redirect_uri: "http://localhost:8000/auth/callback".into(),
            api_audience: "app-id".into(),
            endpoints: ProviderEndpoints::for_tenant(DEFAULT_AUTHORITY_HOST, "t1"),
        };
        let debug = format!("{app:?}");
        assert!(!debug.contains("very-secret"), "got: {debug}");
    }
}
