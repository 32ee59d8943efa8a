//! Session token handling.
//!
//! Persistent credential storage is out of scope; a session is just a
//! bearer token sourced from the environment, the config file, or a
//! machine-token exchange.

use serde_json::Value;
use serde_json::json;
use tracing::debug;

use crate::config::Config;
use crate::error::Error;
use crate::error::Result;
use crate::request::Client;
use crate::request::RequestOptions;

/// Environment variable holding the session token.
const SESSION_ENV_VAR: &str = "PYLON_SESSION";

/// A bearer token for the platform API.
#[derive(Debug, Clone, Default)]
pub struct Session {
    /// The raw token value.
    token: String,
}

impl Session {
    /// Creates a session from a raw token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// The bearer token.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Loads the session token from `$PYLON_SESSION` or the config file.
    pub fn load(config: &Config) -> Result<Self> {
        if let Ok(token) = std::env::var(SESSION_ENV_VAR)
            && !token.is_empty()
        {
            return Ok(Self::new(token));
        }
        match &config.session {
            Some(token) if !token.is_empty() => Ok(Self::new(token.clone())),
            _ => Err(Error::MissingSession),
        }
    }

    /// Exchanges a machine token for a session token.
    ///
    /// The machine-token endpoint is the one API call that goes out without
    /// a bearer header; the transport handles that exemption.
    pub async fn from_machine_token(client: &Client, machine_token: &str) -> Result<Self> {
        let response = client
            .send(
                "authorize/machine-token",
                RequestOptions::post(json!({
                    "machine_token": machine_token,
                    "client": "pylon",
                })),
            )
            .await?;

        if response.is_error() {
            return Err(Error::AuthFailed {
                reason: response.reason,
            });
        }

        let token = response
            .data
            .get("session")
            .and_then(Value::as_str)
            .ok_or(Error::AuthFailed {
                reason: "response carried no session token".to_string(),
            })?;

        debug!("machine token exchanged for a session");
        Ok(Self::new(token))
    }
}
