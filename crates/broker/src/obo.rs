//! On-behalf-of exchange
//!
//! Trades the caller's verified access token for a token scoped to a
//! downstream resource. Runs on every downstream call and is never cached:
//! there is no OBO expiry window or per-resource sub-cache to track.
//!
//! Consent-required is decided from the provider's structured error codes
//! (`ProviderErrorBody::is_consent_required`) and yields a re-consent URL;
//! every other failure is an opaque `ExchangeFailed`.

use std::sync::Arc;

use common::now_secs;
use idp::TokenClient;
use tracing::{info, warn};

use crate::error::{BrokerError, Result};
use crate::login::LoginFlows;
use crate::metrics;
use crate::outcome::TokenPair;

pub struct OboExchanger {
    client: TokenClient,
    flows: Arc<LoginFlows>,
}

impl OboExchanger {
    pub fn new(client: TokenClient, flows: Arc<LoginFlows>) -> Self {
        Self { client, flows }
    }

    /// Exchange `user_access_token` for a token carrying `scopes`.
    pub async fn exchange(&self, user_access_token: &str, scopes: &[String]) -> Result<TokenPair> {
        match self.client.on_behalf_of(user_access_token, scopes).await {
            Ok(response) => {
                metrics::record_obo("success");
                info!(scopes = ?scopes, expires_in = response.expires_in, "on-behalf-of token issued");
                let granted = response
                    .scope
                    .as_deref()
                    .map(|s| s.split_whitespace().map(String::from).collect())
                    .unwrap_or_else(|| scopes.to_vec());
                Ok(TokenPair {
                    access_token: response.access_token,
                    id_token: None,
                    expires_on: now_secs().saturating_add(response.expires_in),
                    scopes: granted,
                })
            }
            Err(e) if e.is_consent_required() => {
                metrics::record_obo("consent_required");
                warn!(scopes = ?scopes, "on-behalf-of exchange needs user consent");
                Err(self.flows.consent_required(self.client.app(), scopes).await)
            }
            Err(e) => {
                metrics::record_obo("error");
                Err(BrokerError::ExchangeFailed(e.to_string()))
            }
        }
    }
}
