//! Pending interactive logins
//!
//! Login and re-consent redirect the user to the provider with a random
//! `state` and a PKCE challenge. The verifier and requested scopes are kept
//! here, keyed by `state`, until the callback redeems the code. An unknown
//! or reused `state` is rejected, which is the CSRF check for the callback.
//! Entries expire after `LOGIN_FLOW_EXPIRY` and are swept lazily. At most
//! `MAX_PENDING_LOGINS` are kept; starting another evicts the oldest.

use std::collections::HashMap;
use std::time::Duration;

use idp::{ClientApp, Prompt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{BrokerError, Result};
use crate::outcome::LoginRequest;

/// Maximum age of a pending login before its `state` is refused.
pub const LOGIN_FLOW_EXPIRY: Duration = Duration::from_secs(600);

/// Upper bound on logins awaiting their callback.
pub const MAX_PENDING_LOGINS: usize = 10_000;

struct PendingLogin {
    verifier: String,
    scopes: Vec<String>,
    created_at: Instant,
}

/// A login redeemed by its callback `state`.
#[derive(Debug)]
pub struct PendingFlow {
    pub verifier: String,
    pub scopes: Vec<String>,
}

pub struct LoginFlows {
    pending: Mutex<HashMap<String, PendingLogin>>,
    capacity: usize,
}

impl Default for LoginFlows {
    fn default() -> Self {
        Self::with_capacity(MAX_PENDING_LOGINS)
    }
}

impl LoginFlows {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `capacity` pending logins (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Start a login for `scopes` and return the authorization URL.
    pub async fn begin(
        &self,
        app: &ClientApp,
        scopes: &[String],
        prompt: Prompt,
    ) -> Result<LoginRequest> {
        let state = idp::generate_state();
        let verifier = idp::generate_verifier();
        let challenge = idp::compute_challenge(&verifier);
        let url = idp::build_authorization_url(app, scopes, &state, &challenge, Some(prompt))
            .map_err(|e| BrokerError::ExchangeFailed(e.to_string()))?;

        let mut pending = self.pending.lock().await;
        // Lazy cleanup: drop expired entries while holding the lock
        pending.retain(|_, p| p.created_at.elapsed() < LOGIN_FLOW_EXPIRY);
        while pending.len() >= self.capacity {
            let oldest = pending
                .iter()
                .min_by_key(|(_, p)| p.created_at)
                .map(|(key, _)| key.clone());
            let Some(oldest) = oldest else { break };
            pending.remove(&oldest);
            warn!(capacity = self.capacity, "pending login limit reached, evicted oldest");
        }
        pending.insert(
            state.clone(),
            PendingLogin {
                verifier,
                scopes: scopes.to_vec(),
                created_at: Instant::now(),
            },
        );

        info!(prompt = prompt.as_str(), scopes = ?scopes, "login flow started");
        Ok(LoginRequest { url, state })
    }

    /// Consume the pending login for `state`. Each state redeems once.
    pub async fn take(&self, state: &str) -> Result<PendingFlow> {
        let entry = self.pending.lock().await.remove(state);
        match entry {
            Some(p) if p.created_at.elapsed() < LOGIN_FLOW_EXPIRY => Ok(PendingFlow {
                verifier: p.verifier,
                scopes: p.scopes,
            }),
            Some(_) => {
                warn!("login state expired");
                Err(BrokerError::UnknownLoginState)
            }
            None => {
                warn!("callback with unknown login state");
                Err(BrokerError::UnknownLoginState)
            }
        }
    }

    /// Build the outcome for a consent-required provider error: a re-consent
    /// URL (`prompt=consent`) for `scopes`, registered like any other login.
    pub async fn consent_required(&self, app: &ClientApp, scopes: &[String]) -> BrokerError {
        match self.begin(app, scopes, Prompt::Consent).await {
            Ok(request) => BrokerError::ConsentRequired {
                consent_url: request.url,
            },
            Err(e) => e,
        }
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Secret;
    use idp::ProviderEndpoints;
    use idp::endpoints::DEFAULT_AUTHORITY_HOST;

    fn app() -> ClientApp {
        ClientApp {
            client_id: "client".into(),
            client_secret: Secret::from("s"),
            redirect_uri: "http://localhost:8000/auth/callback".into(),
            api_audience: "api://client".into(),
            endpoints: ProviderEndpoints::for_tenant(DEFAULT_AUTHORITY_HOST, "t1"),
        }
    }

    #[tokio::test]
    async fn state_redeems_once() {
        let flows = LoginFlows::new();
        let request = flows
            .begin(&app(), &["api://x/read".into()], Prompt::SelectAccount)
            .await
            .unwrap();
        assert!(request.url.contains(&format!("state={}", request.state)));
        assert!(request.url.contains("prompt=select_account"));

        let flow = flows.take(&request.state).await.unwrap();
        assert_eq!(flow.scopes, vec!["api://x/read".to_string()]);
        assert!(request.url.contains(&idp::compute_challenge(&flow.verifier)));

        assert!(matches!(
            flows.take(&request.state).await,
            Err(BrokerError::UnknownLoginState)
        ));
    }

    #[tokio::test]
    async fn unknown_state_is_rejected() {
        let flows = LoginFlows::new();
        assert!(matches!(
            flows.take("forged").await,
            Err(BrokerError::UnknownLoginState)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_state_is_rejected_and_swept() {
        let flows = LoginFlows::new();
        let old = flows.begin(&app(), &[], Prompt::SelectAccount).await.unwrap();
        tokio::time::advance(LOGIN_FLOW_EXPIRY + Duration::from_secs(1)).await;

        let _fresh = flows.begin(&app(), &[], Prompt::SelectAccount).await.unwrap();
        assert_eq!(flows.len().await, 1, "expired entry swept on next begin");
        assert!(flows.take(&old.state).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_logins_are_capped_oldest_first() {
        let flows = LoginFlows::with_capacity(2);
        let mut states = vec![];
        for _ in 0..3 {
            let request = flows.begin(&app(), &[], Prompt::SelectAccount).await.unwrap();
            states.push(request.state);
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        assert_eq!(flows.len().await, 2);
        assert!(matches!(
            flows.take(&states[0]).await,
            Err(BrokerError::UnknownLoginState)
        ));
        assert!(flows.take(&states[1]).await.is_ok());
        assert!(flows.take(&states[2]).await.is_ok());
    }

    #[tokio::test]
    async fn consent_required_carries_consent_url() {
        let flows = LoginFlows::new();
        let err = flows.consent_required(&app(), &["User.Read".into()]).await;
        match err {
            BrokerError::ConsentRequired { consent_url } => {
                assert!(consent_url.contains("prompt=consent"), "got: {consent_url}");
                assert!(consent_url.starts_with(
                    "https://login.microsoftonline.com/t1/oauth2/v2.0/authorize?"
                ));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(flows.len().await, 1);
    }
}
