//! Mocked identity provider JWKS endpoint.

use crate::crypto_fixtures::{jwks_document, TestKeypair};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const JWKS_PATH: &str = "/.well-known/jwks.json";

/// Start a server publishing `keys` at [`JWKS_PATH`].
pub async fn mock_jwks_server(keys: &[&TestKeypair]) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(JWKS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks_document(keys)))
        .mount(&server)
        .await;
    server
}

/// Start a server whose JWKS endpoint answers 503.
pub async fn unavailable_jwks_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(JWKS_PATH))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    server
}

pub fn jwks_url(server: &MockServer) -> String {
    format!("{}{JWKS_PATH}", server.uri())
}
