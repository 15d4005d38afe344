//! HTTP handlers
//!
//! Token routes authenticate the caller from the `x-access-token` and
//! `x-id-token` headers and answer with a `TokenOutcome` document. The
//! status code mirrors the outcome so plain HTTP clients can branch on it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Redirect, Response};
use broker::{BrokerError, InboundTokens, TokenBroker, TokenOutcome};
use idp::Prompt;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use tracing::{Instrument, error, info, info_span, warn};

use crate::metrics;

pub const ACCESS_TOKEN_HEADER: &str = "x-access-token";
pub const ID_TOKEN_HEADER: &str = "x-id-token";

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<TokenBroker>,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
    pub requests_total: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(broker: Arc<TokenBroker>, prometheus: PrometheusHandle) -> Self {
        Self {
            broker,
            prometheus,
            started_at: Instant::now(),
            requests_total: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginParams {
    /// Space-separated scopes; defaults to the configured login scopes
    pub scopes: Option<String>,
    pub prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScopeRequest {
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Health endpoint: status, uptime, requests served, logins in flight.
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = json!({
        "status": "healthy",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "requests_served": state.requests_total.load(Ordering::Relaxed),
        "pending_logins": state.broker.login_flows().len().await,
    });
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint, text exposition format.
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

/// Start an interactive login by redirecting to the provider.
pub async fn login_handler(
    State(state): State<AppState>,
    Query(params): Query<LoginParams>,
) -> Response {
    let started = begin(&state);
    let scopes = params.scopes.as_deref().map(split_scopes);
    let prompt = parse_prompt(params.prompt.as_deref());

    let response = match state.broker.begin_login(scopes.as_deref(), prompt).await {
        Ok(request) => Redirect::to(&request.url).into_response(),
        Err(e) => error_response(e),
    };
    finish("/auth/login", started, response)
}

/// Login redirect target: redeem the authorization code.
pub async fn callback_handler(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let started = begin(&state);
    let response = match params {
        CallbackParams {
            error: Some(error),
            error_description,
            ..
        } => {
            warn!(error = %error, ?error_description, "provider returned an error to the callback");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "outcome": "login_failed",
                    "error": error,
                    "error_description": error_description,
                })),
            )
                .into_response()
        }
        CallbackParams {
            code: Some(code),
            state: Some(login_state),
            ..
        } => match state.broker.complete_login(&code, &login_state).await {
            Ok(result) => (StatusCode::OK, Json(result)).into_response(),
            Err(e) => error_response(e),
        },
        _ => (
            StatusCode::BAD_REQUEST,
            Json(json!({"outcome": "login_failed", "error": "missing code or state"})),
        )
            .into_response(),
    };
    finish("/auth/callback", started, response)
}

/// Cached or refreshed tokens for the calling user.
pub async fn token_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ScopeRequest>,
) -> Response {
    let started = begin(&state);
    let request_id = request_id();
    let span = info_span!("token_request", %request_id);

    let response = async {
        let user = match state.broker.authenticate(&inbound_tokens(&headers)).await {
            Ok(user) => user,
            Err(e) => return error_response(e),
        };
        match state.broker.fresh_tokens(&user.user_key, &body.scopes).await {
            Ok(pair) => {
                info!(user_key = %user.user_key, "tokens issued");
                outcome_response(TokenOutcome::TokenReady(pair))
            }
            Err(e) => error_response(e),
        }
    }
    .instrument(span)
    .await;
    finish("/auth/token", started, response)
}

/// On-behalf-of token for a downstream resource.
pub async fn obo_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ScopeRequest>,
) -> Response {
    let started = begin(&state);
    let request_id = request_id();
    let span = info_span!("obo_request", %request_id);

    let response = async {
        if body.scopes.is_empty() {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"outcome": "exchange_failed", "reason": "no scopes requested"})),
            )
                .into_response();
        }
        let user = match state.broker.authenticate(&inbound_tokens(&headers)).await {
            Ok(user) => user,
            Err(e) => return error_response(e),
        };
        match state.broker.exchange_for_downstream(&user, &body.scopes).await {
            Ok(pair) => outcome_response(TokenOutcome::TokenReady(pair)),
            Err(e) => error_response(e),
        }
    }
    .instrument(span)
    .await;
    finish("/auth/obo", started, response)
}

fn request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

fn begin(state: &AppState) -> Instant {
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    Instant::now()
}

fn finish(route: &'static str, started: Instant, response: Response) -> Response {
    metrics::record_request(route, response.status().as_u16(), started.elapsed().as_secs_f64());
    response
}

/// Header value with an optional `Bearer ` prefix removed.
fn inbound_tokens(headers: &HeaderMap) -> InboundTokens {
    let token = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim().to_string())
            .filter(|v| !v.is_empty())
    };
    InboundTokens {
        access_token: token(ACCESS_TOKEN_HEADER),
        id_token: token(ID_TOKEN_HEADER),
    }
}

fn split_scopes(scopes: &str) -> Vec<String> {
    scopes.split_whitespace().map(String::from).collect()
}

fn parse_prompt(prompt: Option<&str>) -> Prompt {
    match prompt {
        Some("consent") => Prompt::Consent,
        Some("login") => Prompt::Login,
        _ => Prompt::SelectAccount,
    }
}

pub fn outcome_status(outcome: &TokenOutcome) -> StatusCode {
    match outcome {
        TokenOutcome::TokenReady(_) => StatusCode::OK,
        TokenOutcome::LoginRequired | TokenOutcome::VerificationFailed { .. } => {
            StatusCode::UNAUTHORIZED
        }
        TokenOutcome::ConsentRequired { .. } => StatusCode::FORBIDDEN,
        TokenOutcome::ExchangeFailed { .. } => StatusCode::BAD_GATEWAY,
    }
}

fn outcome_response(outcome: TokenOutcome) -> Response {
    (outcome_status(&outcome), Json(outcome)).into_response()
}

fn error_response(err: BrokerError) -> Response {
    match err.into_outcome() {
        Ok(outcome) => outcome_response(outcome),
        Err(e) => {
            error!(error = %e, "token store failure");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"outcome": "error", "reason": "token store unavailable"})),
            )
                .into_response()
        }
    }
}
