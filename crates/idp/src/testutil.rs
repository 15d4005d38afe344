//! Test fixtures: an RSA key pair, its JWKS and a token signer.
//!
//! Enabled for this crate's tests and, through the `test-util` feature, for
//! the test suites of crates that depend on `idp`.

use std::sync::Arc;

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{Value, json};

use crate::keys::KeyResolver;

pub const TEST_KID: &str = "test-key-1";
pub const TEST_CLIENT_ID: &str = "11111111-2222-3333-4444-555555555555";
pub const TEST_AUDIENCE: &str = TEST_CLIENT_ID;
pub const TEST_API_AUDIENCE: &str = "api://token-broker-test";
pub const TEST_TENANT: &str = "tenant-id";
pub const TEST_ISSUER: &str = "https://login.microsoftonline.com/tenant-id/v2.0";

/// PKCS#1 private key whose public half is published as `TEST_KID`.
pub const RSA_PRIVATE_PEM: &str = include_str!("../fixtures/rsa-private.pem");

/// Unrelated private key, for forged-signature tests.
pub const OTHER_RSA_PRIVATE_PEM: &str = include_str!("../fixtures/rsa-other.pem");

/// Base64url modulus of `RSA_PRIVATE_PEM`'s public key.
pub const RSA_MODULUS: &str = "p1DWy7K48TMk4w3AZpNf1akeJH0ZGa34DDzJWCvwplT3YYOTL_wmWwPdNHV5GCtoGQo4lfw8kH0iv3nJQeeKjcNJwVqIbrvo5V1eXEUb8oWl4GS65ZMJ2jSKX9if0cHuOIpsd9ZR3k5lFEWcthIPkMCcV8S96UGgRqKqoY26opKb-KCrWe5a0qUnf3arTn3r_0MkpqqsRwBzkh5da7Tel6yq1y4jORmZbrX-0G7UacHeVqjU-Rc2EiRqTREwlXqQcV3ySVHY4eafETSa40jxlt7sLDACAAnHUK5H-SQdlgjGTWxBiSt7uzFhtTctwFNoOiji3_JyxAM6USwa2IF0cQ";
pub const RSA_EXPONENT: &str = "AQAB";

/// Key set document as the provider's keys endpoint serves it.
pub fn jwks_json() -> Value {
    json!({
        "keys": [{
            "kty": "RSA",
            "use": "sig",
            "alg": "RS256",
            "kid": TEST_KID,
            "n": RSA_MODULUS,
            "e": RSA_EXPONENT,
        }]
    })
}

pub fn jwk_set() -> JwkSet {
    serde_json::from_value(jwks_json()).unwrap()
}

/// Resolver pre-loaded with the test key.
pub fn test_resolver() -> Arc<KeyResolver> {
    Arc::new(KeyResolver::from_jwks(&jwk_set()))
}

/// Standard claim set for user `oid` in tenant `tid`.
pub fn claims(oid: &str, tid: &str, aud: &str, iss: &str, exp: u64) -> Value {
    json!({
        "aud": aud,
        "iss": iss,
        "exp": exp,
        "iat": exp.saturating_sub(3600),
        "sub": format!("sub-{oid}"),
        "oid": oid,
        "tid": tid,
        "email": format!("{oid}@example.com"),
        "name": format!("User {oid}"),
    })
}

/// ID token for the test client, expiring at `exp`.
pub fn id_token(oid: &str, tid: &str, exp: u64) -> String {
    sign(&claims(oid, tid, TEST_CLIENT_ID, TEST_ISSUER, exp))
}

/// Inbound access token for this service's own API, expiring at `exp`.
pub fn api_access_token(oid: &str, tid: &str, exp: u64) -> String {
    sign(&claims(oid, tid, TEST_API_AUDIENCE, TEST_ISSUER, exp))
}

/// Sign `claims` with the test key under `TEST_KID`.
pub fn sign(claims: &Value) -> String {
    sign_with(RSA_PRIVATE_PEM, TEST_KID, claims)
}

pub fn sign_with(pem: &str, kid: &str, claims: &Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    let key = EncodingKey::from_rsa_pem(pem.as_bytes()).unwrap();
    jsonwebtoken::encode(&header, claims, &key).unwrap()
}
