//! Token lifecycle orchestration
//!
//! `TokenBroker` owns every long-lived handle (token client, verifier and
//! its key cache, credential store, per-user locks, pending logins) and
//! composes them into the four operations callers use:
//!
//! 1. `authenticate()` verifies the inbound access token and ID token
//! 2. `complete_login()` redeems an authorization code and persists the tokens
//! 3. `fresh_tokens()` serves a cached pair or silently refreshes it
//! 4. `exchange_for_downstream()` performs an on-behalf-of exchange
//!
//! Cache load → match/refresh → save runs under the user's lock. The cache
//! is only mutated after the provider has answered, so a request dropped
//! mid-exchange leaves nothing half-written.

use std::sync::Arc;

use common::{Secret, now_secs};
use idp::{ClientApp, Prompt, TokenClient, TokenVerifier};
use token_cache::{CredentialStoreAdapter, LoadedCache, RefreshPlan, StoreError, plan};
use tracing::{debug, info, warn};

use crate::error::{BrokerError, Result};
use crate::locks::UserLocks;
use crate::login::LoginFlows;
use crate::metrics;
use crate::obo::OboExchanger;
use crate::outcome::{AuthenticatedUser, InboundTokens, LoginRequest, LoginResult, TokenPair};
use crate::refresh::{IdTokenCheck, Redeemed, Refresher, verify_response};

pub struct TokenBroker {
    client: TokenClient,
    verifier: Arc<TokenVerifier>,
    store: CredentialStoreAdapter,
    locks: UserLocks,
    flows: Arc<LoginFlows>,
    refresher: Refresher,
    obo: OboExchanger,
    login_scopes: Vec<String>,
}

impl TokenBroker {
    pub fn new(client: TokenClient, verifier: TokenVerifier, store: CredentialStoreAdapter) -> Self {
        let verifier = Arc::new(verifier);
        let flows = Arc::new(LoginFlows::new());
        Self {
            refresher: Refresher::new(client.clone(), verifier.clone(), flows.clone()),
            obo: OboExchanger::new(client.clone(), flows.clone()),
            client,
            verifier,
            store,
            locks: UserLocks::new(),
            flows,
            login_scopes: Vec::new(),
        }
    }

    /// Scopes requested by `begin_login` when the caller names none.
    pub fn with_login_scopes(mut self, scopes: Vec<String>) -> Self {
        self.login_scopes = scopes;
        self
    }

    pub fn app(&self) -> &ClientApp {
        self.client.app()
    }

    pub fn login_flows(&self) -> &LoginFlows {
        &self.flows
    }

    /// Verify both inbound tokens and identify the user.
    ///
    /// The access token must be addressed to this service's API and the ID
    /// token to this client; both must name the same `oid`/`tid`.
    pub async fn authenticate(&self, inbound: &InboundTokens) -> Result<AuthenticatedUser> {
        let access_token = inbound
            .access_token
            .as_deref()
            .ok_or(BrokerError::MissingTokens("x-access-token"))?;
        let id_token = inbound
            .id_token
            .as_deref()
            .ok_or(BrokerError::MissingTokens("x-id-token"))?;
        let app = self.app();

        let access_claims = self
            .verifier
            .verify(access_token, &app.api_audience, &app.endpoints.issuer)
            .await
            .inspect_err(|e| warn!(error = %e, "inbound access token rejected"))?;
        let id_claims = self
            .verifier
            .verify(id_token, &app.client_id, &app.endpoints.issuer)
            .await
            .inspect_err(|e| warn!(error = %e, "inbound ID token rejected"))?;

        let user_key = id_claims
            .user_key()
            .ok_or(BrokerError::MissingIdentityClaims)?;
        if access_claims.user_key().as_deref() != Some(user_key.as_str()) {
            warn!(user_key, "access token belongs to another user");
            return Err(BrokerError::IdentityMismatch);
        }

        debug!(user_key, "request authenticated");
        Ok(AuthenticatedUser {
            user_key,
            id_claims,
            access_claims,
            assertion: Secret::from(access_token),
        })
    }

    /// Start an interactive login. `scopes` defaults to the configured login scopes.
    pub async fn begin_login(&self, scopes: Option<&[String]>, prompt: Prompt) -> Result<LoginRequest> {
        let scopes = scopes.unwrap_or(&self.login_scopes);
        self.flows.begin(self.app(), scopes, prompt).await
    }

    /// Redeem the authorization code from the login callback.
    pub async fn complete_login(&self, code: &str, state: &str) -> Result<LoginResult> {
        let flow = self.flows.take(state).await?;
        let app = self.app();

        let response = match self.client.exchange_code(code, &flow.verifier, &flow.scopes).await {
            Ok(response) => response,
            Err(e) if e.is_consent_required() => {
                return Err(self.flows.consent_required(app, &flow.scopes).await);
            }
            Err(e) => return Err(BrokerError::ExchangeFailed(e.to_string())),
        };
        let redeemed = verify_response(&self.verifier, app, response).await?;
        let user_key = redeemed
            .claims
            .user_key()
            .ok_or(BrokerError::MissingIdentityClaims)?;

        let tokens = {
            let _guard = self.locks.lock(&user_key).await;
            let mut loaded = self.store.load_or_empty(&user_key).await?;
            self.record(&user_key, &mut loaded, &redeemed, &flow.scopes).await?
        };

        info!(user_key, "login completed");
        Ok(LoginResult {
            email: redeemed.claims.email().map(String::from),
            display_name: redeemed.claims.name().map(String::from),
            user_key,
            tokens,
        })
    }

    /// A valid access/ID token pair for `scopes`, from cache or by silent refresh.
    pub async fn fresh_tokens(&self, user_key: &str, scopes: &[String]) -> Result<TokenPair> {
        let app = self.app();
        let _guard = self.locks.lock(user_key).await;
        let mut loaded = self.store.load_or_empty(user_key).await?;

        let check = IdTokenCheck {
            verifier: &self.verifier,
            app,
        };
        let decision = plan(
            &loaded.cache,
            user_key,
            &app.client_id,
            scopes,
            &check,
            now_secs(),
        )
        .await;

        match decision {
            RefreshPlan::CacheHit(pair) => {
                metrics::record_cache_lookup("hit");
                debug!(user_key, "serving cached tokens");
                Ok(TokenPair {
                    scopes: pair.access_token.scopes(),
                    expires_on: pair.access_token.expires_on,
                    access_token: pair.access_token.secret,
                    id_token: Some(pair.id_token.secret),
                })
            }
            RefreshPlan::Refresh { candidates } => {
                metrics::record_cache_lookup("refresh");
                let redeemed = self.refresher.redeem(&candidates, scopes).await?;
                if redeemed.claims.user_key().as_deref() != Some(user_key) {
                    return Err(BrokerError::IdentityMismatch);
                }
                self.record(user_key, &mut loaded, &redeemed, scopes).await
            }
            RefreshPlan::LoginRequired => {
                metrics::record_cache_lookup("login_required");
                info!(user_key, "no usable cached credentials");
                Err(BrokerError::LoginRequired)
            }
        }
    }

    /// On-behalf-of token for a downstream resource. Never cached.
    pub async fn exchange_for_downstream(
        &self,
        user: &AuthenticatedUser,
        scopes: &[String],
    ) -> Result<TokenPair> {
        debug!(user_key = %user.user_key, scopes = ?scopes, "exchanging for downstream token");
        self.obo.exchange(user.assertion.expose(), scopes).await
    }

    /// Re-consent URL (`prompt=consent`) for `scopes`.
    pub async fn consent_url(&self, scopes: &[String]) -> Result<String> {
        Ok(self.begin_login(Some(scopes), Prompt::Consent).await?.url)
    }

    /// Merge a verified response into the user's cache and persist it.
    ///
    /// If another process wrote the cache since it was loaded, the tokens are
    /// merged into the newer copy and saved once more.
    async fn record(
        &self,
        user_key: &str,
        loaded: &mut LoadedCache,
        redeemed: &Redeemed,
        requested: &[String],
    ) -> Result<TokenPair> {
        let tokens = redeemed.new_tokens(self.app(), requested, now_secs())?;
        let pair = redeemed.token_pair(&tokens);
        loaded.cache.add_tokens(tokens.clone());

        let written = match self.store.save(user_key, loaded).await {
            Err(token_cache::Error::Store(StoreError::Conflict(_))) => {
                warn!(user_key, "token cache changed concurrently, merging into latest copy");
                let mut latest = self.store.load_or_empty(user_key).await?;
                latest.cache.add_tokens(tokens);
                let written = self.store.save(user_key, &mut latest).await?;
                *loaded = latest;
                written
            }
            other => other?,
        };
        if written {
            metrics::record_store_write();
        }
        Ok(pair)
    }
}
