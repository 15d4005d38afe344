//! Provider double and fixtures shared by this crate's tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Form, State};
use axum::http::StatusCode;
use axum::routing::post;
use common::{Secret, now_secs};
use idp::testutil::{self, TEST_API_AUDIENCE, TEST_CLIENT_ID, TEST_ISSUER, TEST_TENANT};
use idp::{ClientApp, ProviderEndpoints, TokenVerifier};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

#[derive(Default)]
struct Script {
    responses: VecDeque<(StatusCode, Value, Duration)>,
    forms: Vec<HashMap<String, String>>,
}

/// Token endpoint double. Answers requests with queued responses in order
/// and records every form it receives; an empty queue answers 500. A
/// response queued with `respond_after` is held back for its delay.
#[derive(Clone)]
pub struct MockProvider {
    pub base_url: String,
    script: Arc<Mutex<Script>>,
}

impl MockProvider {
    pub async fn start() -> Self {
        let script = Arc::new(Mutex::new(Script::default()));
        let app = Router::new()
            .route(
                &format!("/{TEST_TENANT}/oauth2/v2.0/token"),
                post(token_endpoint),
            )
            .with_state(script.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base_url: format!("http://{addr}"),
            script,
        }
    }

    pub async fn respond(&self, status: StatusCode, body: Value) {
        self.respond_after(status, body, Duration::ZERO).await;
    }

    pub async fn respond_after(&self, status: StatusCode, body: Value, delay: Duration) {
        self.script
            .lock()
            .await
            .responses
            .push_back((status, body, delay));
    }

    pub async fn forms(&self) -> Vec<HashMap<String, String>> {
        self.script.lock().await.forms.clone()
    }
}

async fn token_endpoint(
    State(script): State<Arc<Mutex<Script>>>,
    Form(form): Form<HashMap<String, String>>,
) -> (StatusCode, axum::Json<Value>) {
    let (status, body, delay) = {
        let mut script = script.lock().await;
        script.forms.push(form);
        script.responses.pop_front().unwrap_or((
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": "unexpected_request"}),
            Duration::ZERO,
        ))
    };
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    (status, axum::Json(body))
}

/// Client registration pointed at `base_url`, issuing tokens as the test tenant.
pub fn test_app(base_url: &str) -> ClientApp {
    let mut endpoints = ProviderEndpoints::for_tenant(base_url, TEST_TENANT);
    endpoints.issuer = TEST_ISSUER.to_string();
    ClientApp {
        client_id: TEST_CLIENT_ID.to_string(),
        client_secret: Secret::from("test-secret"),
        redirect_uri: "http://localhost:8000/auth/callback".to_string(),
        api_audience: TEST_API_AUDIENCE.to_string(),
        endpoints,
    }
}

pub fn test_verifier() -> TokenVerifier {
    TokenVerifier::new(testutil::test_resolver())
}

/// Successful code/refresh response for user `oid` in the test tenant.
pub fn token_body(oid: &str, access_token: &str, refresh_token: Option<&str>, scope: &str) -> Value {
    let mut body = json!({
        "token_type": "Bearer",
        "access_token": access_token,
        "id_token": testutil::id_token(oid, TEST_TENANT, now_secs() + 3600),
        "expires_in": 3600,
        "ext_expires_in": 3600,
        "scope": scope,
    });
    if let Some(rt) = refresh_token {
        body["refresh_token"] = json!(rt);
    }
    body
}
