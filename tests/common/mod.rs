//! Shared helpers for the integration tests.

use pylon::Config;
use pylon::request::Client;
use pylon::session::Session;
use wiremock::MockServer;

/// Builds a configuration pointing at a mock server.
pub fn config_for(server: &MockServer) -> Config {
    let address = server.address();
    Config {
        protocol: "http".to_string(),
        host: address.ip().to_string(),
        port: address.port(),
        session: Some("test-session".to_string()),
        ..Config::default()
    }
}

/// Builds a client bound to a mock server.
pub fn client_for(server: &MockServer) -> Client {
    Client::new(config_for(server), Session::new("test-session"))
}
