//! Token verification
//!
//! Verifies RS256-signed ID tokens and access tokens issued by the provider.
//! Signature, expiry, audience and issuer are all checked and all required;
//! there is no optional check and no partial success. Callers verify the
//! inbound access token and the ID token independently, each against its own
//! audience.

use std::sync::Arc;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Validation};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::VerifyError;
use crate::keys::KeyResolver;

/// Claims of a token that passed verification.
///
/// Only `TokenVerifier::verify` constructs this type, so holding one is proof
/// the token was valid at verification time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct VerifiedClaims {
    claims: Map<String, Value>,
}

impl VerifiedClaims {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }

    fn str_claim(&self, name: &str) -> Option<&str> {
        self.claims.get(name).and_then(Value::as_str)
    }

    /// Object id of the user (`oid`)
    pub fn oid(&self) -> Option<&str> {
        self.str_claim("oid")
    }

    /// Tenant id (`tid`)
    pub fn tid(&self) -> Option<&str> {
        self.str_claim("tid")
    }

    pub fn email(&self) -> Option<&str> {
        self.str_claim("email")
    }

    /// Display name (`name`)
    pub fn name(&self) -> Option<&str> {
        self.str_claim("name")
    }

    pub fn preferred_username(&self) -> Option<&str> {
        self.str_claim("preferred_username")
    }

    /// `exp` as epoch seconds
    pub fn expires_at(&self) -> Option<u64> {
        self.claims.get("exp").and_then(Value::as_u64)
    }

    /// Per-user partition key `"{oid}.{tid}"`, if both claims are present.
    pub fn user_key(&self) -> Option<String> {
        match (self.oid(), self.tid()) {
            (Some(oid), Some(tid)) if !oid.is_empty() && !tid.is_empty() => {
                Some(format!("{oid}.{tid}"))
            }
            _ => None,
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.claims
    }
}

/// Verifies tokens against the provider's signing keys.
pub struct TokenVerifier {
    keys: Arc<KeyResolver>,
    leeway_secs: u64,
}

impl TokenVerifier {
    pub fn new(keys: Arc<KeyResolver>) -> Self {
        Self {
            keys,
            leeway_secs: 0,
        }
    }

    /// Tolerate this much clock skew on `exp`.
    pub fn with_leeway(mut self, leeway_secs: u64) -> Self {
        self.leeway_secs = leeway_secs;
        self
    }

    pub fn keys(&self) -> &Arc<KeyResolver> {
        &self.keys
    }

    /// Verify `token` and return its claims.
    ///
    /// Fails if the signature, expiry, audience or issuer check fails, or if
    /// the signing key cannot be resolved. Never retry on failure.
    pub async fn verify(
        &self,
        token: &str,
        expected_audience: &str,
        expected_issuer: &str,
    ) -> Result<VerifiedClaims, VerifyError> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| VerifyError::Malformed(e.to_string()))?;
        if header.alg != Algorithm::RS256 {
            return Err(VerifyError::UnsupportedAlgorithm(format!("{:?}", header.alg)));
        }
        let kid = header.kid.ok_or(VerifyError::MissingKeyId)?;
        let key = self.keys.resolve(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[expected_audience]);
        validation.set_issuer(&[expected_issuer]);
        validation.set_required_spec_claims(&["exp", "aud", "iss"]);
        validation.validate_exp = true;
        validation.leeway = self.leeway_secs;

        let data = jsonwebtoken::decode::<Map<String, Value>>(
            token,
            key.decoding_key(),
            &validation,
        )
        .map_err(|e| {
            let err = match e.kind() {
                ErrorKind::InvalidSignature => VerifyError::InvalidSignature,
                ErrorKind::ExpiredSignature => VerifyError::Expired,
                ErrorKind::InvalidAudience => VerifyError::AudienceMismatch {
                    expected: expected_audience.to_string(),
                },
                ErrorKind::InvalidIssuer => VerifyError::IssuerMismatch {
                    expected: expected_issuer.to_string(),
                },
                other => VerifyError::Malformed(format!("{other:?}")),
            };
            debug!(kid, error = %err, "token rejected");
            err
        })?;

        Ok(VerifiedClaims {
            claims: data.claims,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, TEST_AUDIENCE, TEST_ISSUER};
    use common::now_secs;

    fn verifier() -> TokenVerifier {
        TokenVerifier::new(testutil::test_resolver())
    }

    fn valid_claims() -> Value {
        testutil::claims("user-oid", "tenant-id", TEST_AUDIENCE, TEST_ISSUER, now_secs() + 3600)
    }

    #[tokio::test]
    async fn valid_token_returns_payload_claims() {
        let payload = valid_claims();
        let token = testutil::sign(&payload);

        let claims = verifier()
            .verify(&token, TEST_AUDIENCE, TEST_ISSUER)
            .await
            .unwrap();

        assert_eq!(serde_json::to_value(&claims).unwrap(), payload);
        assert_eq!(claims.oid(), Some("user-oid"));
        assert_eq!(claims.tid(), Some("tenant-id"));
        assert_eq!(claims.user_key().as_deref(), Some("user-oid.tenant-id"));
        assert_eq!(claims.email(), Some("user-oid@example.com"));
    }

    #[tokio::test]
    async fn altered_signature_byte_is_rejected() {
        let token = testutil::sign(&valid_claims());
        let (head, sig) = token.rsplit_once('.').unwrap();
        let mut sig: Vec<char> = sig.chars().collect();
        let mid = sig.len() / 2;
        sig[mid] = if sig[mid] == 'A' { 'B' } else { 'A' };
        let tampered = format!("{head}.{}", sig.into_iter().collect::<String>());

        let err = verifier()
            .verify(&tampered, TEST_AUDIENCE, TEST_ISSUER)
            .await
            .unwrap_err();
        assert_eq!(err, VerifyError::InvalidSignature);
    }

    #[tokio::test]
    async fn token_signed_by_other_key_is_rejected() {
        let token = testutil::sign_with(
            testutil::OTHER_RSA_PRIVATE_PEM,
            testutil::TEST_KID,
            &valid_claims(),
        );
        let err = verifier()
            .verify(&token, TEST_AUDIENCE, TEST_ISSUER)
            .await
            .unwrap_err();
        assert_eq!(err, VerifyError::InvalidSignature);
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let payload = testutil::claims("u", "t", TEST_AUDIENCE, TEST_ISSUER, now_secs() - 120);
        let err = verifier()
            .verify(&testutil::sign(&payload), TEST_AUDIENCE, TEST_ISSUER)
            .await
            .unwrap_err();
        assert_eq!(err, VerifyError::Expired);
    }

    #[tokio::test]
    async fn leeway_accepts_recently_expired_token() {
        let payload = testutil::claims("u", "t", TEST_AUDIENCE, TEST_ISSUER, now_secs() - 30);
        let claims = verifier()
            .with_leeway(120)
            .verify(&testutil::sign(&payload), TEST_AUDIENCE, TEST_ISSUER)
            .await;
        assert!(claims.is_ok());
    }

    #[tokio::test]
    async fn wrong_audience_is_rejected() {
        let token = testutil::sign(&valid_claims());
        let err = verifier()
            .verify(&token, "api://someone-else", TEST_ISSUER)
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::AudienceMismatch { .. }), "got: {err:?}");
    }

    #[tokio::test]
    async fn wrong_issuer_is_rejected() {
        let token = testutil::sign(&valid_claims());
        let err = verifier()
            .verify(&token, TEST_AUDIENCE, "https://evil.example/v2.0")
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::IssuerMismatch { .. }), "got: {err:?}");
    }

    #[tokio::test]
    async fn unknown_kid_is_rejected() {
        let token =
            testutil::sign_with(testutil::RSA_PRIVATE_PEM, "unknown-kid", &valid_claims());
        let err = verifier()
            .verify(&token, TEST_AUDIENCE, TEST_ISSUER)
            .await
            .unwrap_err();
        assert_eq!(err, VerifyError::KeyNotFound("unknown-kid".into()));
    }

    #[tokio::test]
    async fn missing_exp_is_rejected() {
        let mut payload = valid_claims();
        payload.as_object_mut().unwrap().remove("exp");
        let err = verifier()
            .verify(&testutil::sign(&payload), TEST_AUDIENCE, TEST_ISSUER)
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::Malformed(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn garbage_is_malformed() {
        let err = verifier()
            .verify("not-a-jwt", TEST_AUDIENCE, TEST_ISSUER)
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::Malformed(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn user_key_requires_both_claims() {
        let mut payload = valid_claims();
        payload.as_object_mut().unwrap().remove("tid");
        let claims = verifier()
            .verify(&testutil::sign(&payload), TEST_AUDIENCE, TEST_ISSUER)
            .await
            .unwrap();
        assert!(claims.user_key().is_none());
    }
}
