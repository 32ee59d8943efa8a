//! HTTP transport for the Pylon API.
//!
//! The [`Client`] builds and sends authenticated requests against the
//! platform API, retrying transient failures on a linear backoff schedule,
//! decoding JSON bodies, and mapping 409 conflict responses onto the
//! unsupported-site error. Sensitive values are redacted from trace output
//! without ever touching the outbound request.

use std::path::Path;
use std::sync::LazyLock;
use std::sync::OnceLock;

use indexmap::IndexMap;
use reqwest::Method;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderName;
use reqwest::header::HeaderValue;
use serde_json::Value;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use url::Url;
use uuid::Uuid;

use crate::config::Config;
use crate::error::Error;
use crate::error::Result;
use crate::request::retry::Decision;
use crate::request::retry::Outcome;
use crate::request::retry::RetryPolicy;
use crate::session::Session;

pub mod retry;

/// Default number of entries per page for paged requests.
pub const PAGED_REQUEST_ENTRY_LIMIT: usize = 100;

/// Replacement marker for sensitive values in trace output.
pub const HIDDEN_VALUE_REPLACEMENT: &str = "**HIDDEN**";

/// Maximum length of the JSON command descriptor header.
pub const MAX_HEADER_LENGTH: usize = 4096;

/// Generic message for 409 responses that carry a `reason` but no `message`.
pub const UNSUPPORTED_SITE_MESSAGE: &str = "This is not supported for this site.";

/// Keys whose values are stripped from trace output.
const SENSITIVE_KEYS: &[&str] = &["machine_token", "Authorization", "session"];

/// The endpoint segment that is exempt from bearer authentication.
const MACHINE_TOKEN_SEGMENT: &str = "machine-token";

/// Process-wide trace id attached to every request.
static TRACE_ID: LazyLock<String> = LazyLock::new(|| Uuid::new_v4().to_string());

/// Options for a single API request.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// The HTTP method (GET by default).
    pub method: Method,
    /// Additional headers merged over the defaults.
    pub headers: Vec<(String, String)>,
    /// Query parameters appended to the path.
    pub query: Vec<(String, String)>,
    /// A JSON body, sent with `Content-Type: application/json`.
    pub form_params: Option<Value>,
}

impl RequestOptions {
    /// Options for a POST request with the given JSON parameters.
    pub fn post(form_params: Value) -> Self {
        Self {
            method: Method::POST,
            form_params: Some(form_params),
            ..Default::default()
        }
    }

    /// Options for a GET request with the given query parameters.
    pub fn query(query: Vec<(String, String)>) -> Self {
        Self {
            query,
            ..Default::default()
        }
    }
}

/// A decoded API response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// The decoded JSON body; a raw string when the body was not JSON, and
    /// null when it was empty.
    pub data: Value,
    /// The response headers.
    pub headers: HeaderMap,
    /// The response status code.
    pub status_code: StatusCode,
    /// The status reason phrase.
    pub reason: String,
}

impl ApiResponse {
    /// Whether the response carries an error status.
    pub fn is_error(&self) -> bool {
        self.status_code.is_client_error() || self.status_code.is_server_error()
    }
}

/// An HTTP client bound to one API base URI.
///
/// Stateless across calls apart from the lazily-constructed underlying
/// connection pool, which is memoized for the life of the client.
#[derive(Debug)]
pub struct Client {
    /// The CLI configuration.
    config: Config,
    /// The session providing the bearer token.
    session: Session,
    /// The retry schedule for transient failures.
    retry: RetryPolicy,
    /// The memoized underlying HTTP client.
    http: OnceLock<reqwest::Client>,
}

impl Client {
    /// Creates a client from configuration and a session.
    pub fn new(config: Config, session: Session) -> Self {
        let retry = config.retry_policy();
        Self {
            config,
            session,
            retry,
            http: OnceLock::new(),
        }
    }

    /// The configuration this client was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the underlying HTTP client, constructing it on first use.
    fn http(&self) -> Result<&reqwest::Client> {
        if let Some(client) = self.http.get() {
            return Ok(client);
        }
        let client = reqwest::Client::builder().build()?;
        Ok(self.http.get_or_init(|| client))
    }

    /// Sends a request to the API and decodes the response.
    ///
    /// Relative paths are resolved against `<base>/api/`; absolute URLs pass
    /// through untouched. Every request except the machine-token exchange
    /// carries the session bearer token.
    pub async fn send(&self, path: &str, options: RequestOptions) -> Result<ApiResponse> {
        let url = self.build_url(path, &options.query)?;

        let mut headers = self.default_headers();
        for (name, value) in &options.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<HeaderName>(),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
        if requires_authorization(path) {
            let bearer = format!("Bearer {token}", token = self.session.token());
            if let Ok(value) = HeaderValue::from_str(&bearer) {
                headers.insert(reqwest::header::AUTHORIZATION, value);
            }
        }

        let body = match &options.form_params {
            Some(params) => {
                headers.insert(
                    reqwest::header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                Some(serde_json::to_string(params)?)
            }
            None => None,
        };

        // Trace the request with sensitive values redacted; the redaction
        // operates on a copy and never alters what goes on the wire.
        let redacted_body = options
            .form_params
            .as_ref()
            .map(strip_sensitive)
            .unwrap_or(Value::Null);
        debug!(
            method = %options.method,
            uri = %url,
            headers = %strip_sensitive(&headers_to_json(&headers)),
            body = %redacted_body,
            "sending API request"
        );

        if self.config.test_mode {
            info!(method = %options.method, uri = %url, "test mode: request diverted");
            return Ok(ApiResponse {
                data: Value::Null,
                headers: HeaderMap::new(),
                status_code: StatusCode::OK,
                reason: "OK".to_string(),
            });
        }

        self.execute(options.method, url, headers, body).await
    }

    /// Executes a request, retrying transient failures per the policy.
    async fn execute(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: Option<String>,
    ) -> Result<ApiResponse> {
        let mut attempt = 0u32;
        loop {
            let mut request = self
                .http()?
                .request(method.clone(), url.clone())
                .headers(headers.clone());
            if let Some(body) = &body {
                request = request.body(body.clone());
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    match self.retry.decide(attempt, Outcome::Status(status)) {
                        Decision::Return => return self.interpret(response).await,
                        Decision::RetryAfter(delay) => {
                            let body = response.text().await.unwrap_or_default();
                            warn!(
                                method = %method,
                                uri = %url,
                                status = %status,
                                attempt = attempt + 1,
                                max = self.retry.max_retries(),
                                delay_secs = delay.as_secs(),
                                "retrying after error status"
                            );
                            debug!(body, "response body");
                            tokio::time::sleep(delay).await;
                        }
                        Decision::Fail => {
                            error!(
                                method = %method,
                                uri = %url,
                                status = %status,
                                "request failed after exhausting retries"
                            );
                            return Err(Error::RetriesExhausted);
                        }
                    }
                }
                Err(err) if err.is_connect() || err.is_timeout() => {
                    match self.retry.decide(attempt, Outcome::ConnectionFailed) {
                        Decision::RetryAfter(delay) => {
                            warn!(
                                method = %method,
                                uri = %url,
                                error = %err,
                                attempt = attempt + 1,
                                max = self.retry.max_retries(),
                                delay_secs = delay.as_secs(),
                                "retrying after connection failure"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        _ => {
                            error!(
                                method = %method,
                                uri = %url,
                                error = %err,
                                "request failed after exhausting retries"
                            );
                            return Err(Error::RetriesExhausted);
                        }
                    }
                }
                // Anything else at the transport level is fatal immediately.
                Err(err) => return Err(Error::Request(err)),
            }

            attempt += 1;
        }
    }

    /// Decodes a response body and applies the 409 unsupported-site mapping.
    async fn interpret(&self, response: reqwest::Response) -> Result<ApiResponse> {
        let status_code = response.status();
        let reason = status_code.canonical_reason().unwrap_or_default().to_string();
        let headers = response.headers().clone();
        let body = response.text().await?;

        let data = if body.is_empty() {
            Value::Null
        } else {
            match serde_json::from_str(&body) {
                Ok(value) => value,
                Err(err) => {
                    debug!(error = %err, "response body is not JSON");
                    Value::String(body)
                }
            }
        };

        if status_code == StatusCode::CONFLICT {
            if let Some(message) = non_empty_str(&data, "message") {
                // The request is expected to fail for an unsupported site.
                return Err(Error::UnsupportedSite {
                    message: message.to_string(),
                });
            }
            if non_empty_str(&data, "reason").is_some() {
                return Err(Error::UnsupportedSite {
                    message: UNSUPPORTED_SITE_MESSAGE.to_string(),
                });
            }
        }

        debug!(status = %status_code, reason, "received API response");

        Ok(ApiResponse {
            data,
            headers,
            status_code,
            reason,
        })
    }

    /// Fetches a large collection page by page, keyed by item identity.
    ///
    /// Stops when a page comes back short, empty, or ending with an id that
    /// was already collected; the last case guards against a server
    /// returning overlapping pages and causing non-termination.
    pub async fn paged_request(
        &self,
        path: &str,
        options: RequestOptions,
        limit: Option<usize>,
    ) -> Result<IndexMap<String, Value>> {
        let limit = limit.unwrap_or(PAGED_REQUEST_ENTRY_LIMIT);

        let mut results: IndexMap<String, Value> = IndexMap::new();
        let mut start: Option<String> = None;

        loop {
            let mut page_options = options.clone();
            page_options.query.push(("limit".to_string(), limit.to_string()));
            if let Some(start) = &start {
                page_options.query.push(("start".to_string(), start.clone()));
            }

            let response = self.send(path, page_options).await?;
            let data = match response.data.as_array() {
                Some(items) if !items.is_empty() => items.clone(),
                _ => break,
            };

            let short_page = data.len() < limit;
            let last_id = data
                .last()
                .and_then(|item| item.get("id"))
                .and_then(Value::as_str)
                .map(str::to_owned);

            // If the last item of the page has previously been received,
            // there are no more pages to fetch.
            if let Some(id) = &last_id
                && results.contains_key(id)
            {
                break;
            }

            for item in data {
                if let Some(id) = item.get("id").and_then(Value::as_str) {
                    results.entry(id.to_owned()).or_insert(item);
                }
            }

            if short_page || last_id.is_none() {
                break;
            }
            start = last_id;
        }

        Ok(results)
    }

    /// Downloads a file from the given URL to a local target.
    ///
    /// When the target is a directory, the URL's basename (query stripped)
    /// is appended. Refuses to clobber an existing file unless `overwrite`.
    pub async fn download(&self, url: &str, target: &Path, overwrite: bool) -> Result<()> {
        let mut target = target.to_path_buf();
        if target.is_dir() {
            let basename = url
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .split('?')
                .next()
                .unwrap_or_default();
            target.push(basename);
        }

        info!(url, target = %target.display(), "downloading");

        if !overwrite && target.exists() {
            return Err(Error::TargetExists { path: target });
        }

        let mut response = self.http()?.get(url).send().await?.error_for_status()?;
        let mut file = tokio::fs::File::create(&target).await?;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    /// Builds the full request URL for a path.
    fn build_url(&self, path: &str, query: &[(String, String)]) -> Result<Url> {
        let mut url = if path.contains("://") {
            Url::parse(path)?
        } else {
            Url::parse(&format!("{base}/api/{path}", base = self.config.base_url()))?
        };
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    /// The default headers attached to every request.
    fn default_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            HeaderValue::from_str(&format!("pylon/{}", env!("CARGO_PKG_VERSION")))
                .unwrap_or(HeaderValue::from_static("pylon")),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("application/json"),
        );
        if let Ok(value) = HeaderValue::from_str(&TRACE_ID) {
            headers.insert("X-Pylon-Trace-Id", value);
        }
        let args: Vec<String> = std::env::args().collect();
        if let Ok(value) = HeaderValue::from_str(&command_descriptor(&args)) {
            headers.insert("X-Pylon-Command", value);
        }
        if let Ok(value) = HeaderValue::from_str(&environment_descriptor()) {
            headers.insert("X-Pylon-Environment", value);
        }
        headers
    }
}

/// Whether a path gets the session bearer token attached.
///
/// Absolute URLs and the machine-token exchange endpoint are exempt.
fn requires_authorization(path: &str) -> bool {
    if path.contains("://") {
        return false;
    }
    let path = path.split('?').next().unwrap_or_default();
    path.rsplit('/').next() != Some(MACHINE_TOKEN_SEGMENT)
}

/// Returns a copy of `data` with sensitive top-level keys replaced by the
/// redaction marker.
///
/// Matching is case-insensitive: header names arrive canonicalized to
/// lowercase while body keys keep their original casing.
fn strip_sensitive(data: &Value) -> Value {
    let mut data = data.clone();
    if let Value::Object(map) = &mut data {
        for (key, value) in map.iter_mut() {
            if SENSITIVE_KEYS
                .iter()
                .any(|sensitive| sensitive.eq_ignore_ascii_case(key))
            {
                *value = Value::String(HIDDEN_VALUE_REPLACEMENT.to_string());
            }
        }
    }
    data
}

/// Renders a header map as a JSON object for trace output.
fn headers_to_json(headers: &HeaderMap) -> Value {
    let map: serde_json::Map<String, Value> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                Value::String(value.to_str().unwrap_or("<binary>").to_string()),
            )
        })
        .collect();
    Value::Object(map)
}

/// Gives the invoked command as JSON, truncated past the header limit.
fn command_descriptor(args: &[String]) -> String {
    let command = args.get(1).cloned().unwrap_or_default();
    let candidate = json!({
        "command": command,
        "arguments": args.get(2..).unwrap_or_default(),
        "truncated": false,
    })
    .to_string();

    if candidate.len() > MAX_HEADER_LENGTH {
        return json!({
            "command": command,
            "truncated": true,
        })
        .to_string();
    }

    candidate
}

/// Gives the execution environment as JSON.
fn environment_descriptor() -> String {
    let ci = std::env::var("CI").map(Value::from).unwrap_or(Value::Bool(false));
    json!({
        "CI": ci,
        "OS": std::env::consts::OS,
    })
    .to_string()
}

/// Gets a non-empty string field from a JSON object, if present.
fn non_empty_str<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
}
