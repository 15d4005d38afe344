//! Silent refresh
//!
//! Redeems cached refresh tokens at the token endpoint and turns token
//! endpoint responses into cache records. Every ID token the provider
//! returns is verified before anything is cached.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use idp::{ClientApp, TokenClient, TokenResponse, TokenVerifier, VerifiedClaims};
use token_cache::{IdTokenValidator, NewTokens, RefreshToken, resource_scopes};
use tracing::{debug, info, warn};

use crate::error::{BrokerError, Result};
use crate::login::LoginFlows;
use crate::metrics;
use crate::outcome::TokenPair;

/// Re-verifies cached ID tokens against this client's audience and issuer.
pub struct IdTokenCheck<'a> {
    pub verifier: &'a TokenVerifier,
    pub app: &'a ClientApp,
}

impl IdTokenValidator for IdTokenCheck<'_> {
    fn is_valid<'a>(&'a self, id_token: &'a str) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            verify_id_token(self.verifier, self.app, id_token)
                .await
                .inspect_err(|e| debug!(error = %e, "cached ID token rejected"))
                .is_ok()
        })
    }
}

pub(crate) async fn verify_id_token(
    verifier: &TokenVerifier,
    app: &ClientApp,
    id_token: &str,
) -> Result<VerifiedClaims> {
    Ok(verifier
        .verify(id_token, &app.client_id, &app.endpoints.issuer)
        .await?)
}

/// A token endpoint response whose ID token verified.
#[derive(Debug)]
pub struct Redeemed {
    pub response: TokenResponse,
    pub claims: VerifiedClaims,
}

impl Redeemed {
    /// Cache records for this response.
    ///
    /// Granted scopes come from the response when present, otherwise from
    /// the request. Identity scopes are not recorded on the access token.
    pub fn new_tokens(&self, app: &ClientApp, requested: &[String], now: u64) -> Result<NewTokens> {
        let oid = self.claims.oid().ok_or(BrokerError::MissingIdentityClaims)?;
        let tid = self.claims.tid().ok_or(BrokerError::MissingIdentityClaims)?;
        let granted: Vec<String> = self
            .response
            .scope
            .as_deref()
            .map(|s| s.split_whitespace().map(String::from).collect())
            .unwrap_or_default();
        let mut scopes = resource_scopes(&granted);
        if scopes.is_empty() {
            scopes = resource_scopes(requested);
        }

        Ok(NewTokens {
            oid: oid.to_string(),
            tid: tid.to_string(),
            environment: app.endpoints.environment.clone(),
            client_id: app.client_id.clone(),
            username: self
                .claims
                .preferred_username()
                .or(self.claims.email())
                .unwrap_or_default()
                .to_string(),
            access_token: self.response.access_token.clone(),
            scopes,
            expires_on: now.saturating_add(self.response.expires_in),
            extended_expires_on: self.response.ext_expires_in.map(|ext| now.saturating_add(ext)),
            id_token: self.response.id_token.clone(),
            refresh_token: self.response.refresh_token.clone(),
            cached_at: now,
        })
    }

    /// The pair handed back to the caller.
    pub fn token_pair(&self, tokens: &NewTokens) -> TokenPair {
        TokenPair {
            access_token: self.response.access_token.clone(),
            id_token: self.response.id_token.clone(),
            expires_on: tokens.expires_on,
            scopes: tokens.scopes.clone(),
        }
    }
}

/// Verify the ID token in a code or refresh response.
pub(crate) async fn verify_response(
    verifier: &TokenVerifier,
    app: &ClientApp,
    response: TokenResponse,
) -> Result<Redeemed> {
    let id_token = response
        .id_token
        .as_deref()
        .ok_or_else(|| BrokerError::ExchangeFailed("token response has no ID token".into()))?;
    let claims = verify_id_token(verifier, app, id_token).await?;
    Ok(Redeemed { response, claims })
}

/// Redeems refresh tokens for one client registration.
pub struct Refresher {
    client: TokenClient,
    verifier: Arc<TokenVerifier>,
    flows: Arc<LoginFlows>,
}

impl Refresher {
    pub fn new(client: TokenClient, verifier: Arc<TokenVerifier>, flows: Arc<LoginFlows>) -> Self {
        Self {
            client,
            verifier,
            flows,
        }
    }

    /// Try `candidates` in order until one yields a verified response.
    ///
    /// Consent errors surface a consent URL. A candidate the provider rejects
    /// as `invalid_grant` (revoked, expired) moves on to the next one; when
    /// all are rejected the user must log in again. Any other failure stops
    /// immediately.
    pub async fn redeem(&self, candidates: &[RefreshToken], scopes: &[String]) -> Result<Redeemed> {
        let app = self.client.app();
        for (i, candidate) in candidates.iter().enumerate() {
            match self.client.refresh(&candidate.secret, scopes).await {
                Ok(response) => {
                    let redeemed = verify_response(&self.verifier, app, response).await?;
                    metrics::record_refresh("success");
                    info!(
                        home_account_id = %candidate.home_account_id,
                        candidate = i,
                        "refreshed tokens"
                    );
                    return Ok(redeemed);
                }
                // Consent errors also carry `invalid_grant`, so they are matched first
                Err(e) if e.is_consent_required() => {
                    metrics::record_refresh("consent_required");
                    return Err(self.flows.consent_required(app, scopes).await);
                }
                Err(e) if e.is_invalid_grant() => {
                    metrics::record_refresh("invalid_grant");
                    warn!(
                        home_account_id = %candidate.home_account_id,
                        candidate = i,
                        error = %e,
                        "refresh token rejected"
                    );
                }
                Err(e) => {
                    metrics::record_refresh("error");
                    return Err(BrokerError::ExchangeFailed(e.to_string()));
                }
            }
        }
        Err(BrokerError::LoginRequired)
    }
}
