use aliri::Jwks;
#[cfg(feature = "hmac")]
use aliri::{jwa, jwk, jwt, Jwk, Jwt};
use serde_json::json;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

#[cfg(feature = "hmac")]
use crate::Claims;
use crate::DEFAULT_DISCOVERY_PATH;

pub(crate) const KID: &str = "test-key";
pub(crate) const AUDIENCE: &str = "https://api.example.com";

#[cfg(feature = "hmac")]
pub(crate) fn hmac_key(kid: &'static str) -> Jwk {
    Jwk::from(jwa::Hmac::new(aliri_base64::Base64Url::from_raw(
        b"a-shared-secret-for-tests-only".to_vec(),
    )))
    .with_key_id(jwk::KeyId::from_static(kid))
    .with_algorithm(jwa::Algorithm::HS256)
}

#[cfg(feature = "hmac")]
pub(crate) fn sign(key: &Jwk, kid: &'static str, claims: &Claims) -> Jwt {
    let alg = key.algorithm().unwrap_or(jwa::Algorithm::HS256);
    let headers = jwt::BasicHeaders::with_key_id(alg, jwk::KeyId::from_static(kid));
    Jwt::try_from_parts_with_signature(&headers, claims, key).unwrap()
}

/// Serves a discovery document at the default path pointing to the key set
pub(crate) async fn serve_issuer(jwks: &Jwks) -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(DEFAULT_DISCOVERY_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "issuer": server.uri(),
            "jwks_uri": format!("{}/keys", server.uri()),
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/keys"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks))
        .mount(&server)
        .await;

    server
}
