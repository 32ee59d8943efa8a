//! Error types used by the crate.

use std::path::PathBuf;

use thiserror::Error;

/// A [`std::result::Result`] with the error type fixed to [`enum@Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Represents an error from the Pylon CLI.
#[derive(Error, Debug)]
pub enum Error {
    /// A commit argument is not a valid full or shortened SHA.
    #[error("`{commit}` is not a valid commit SHA")]
    InvalidCommitSha {
        /// The rejected commit argument.
        commit: String,
    },

    /// A site could not be resolved by name.
    #[error("site `{site}` was not found")]
    SiteNotFound {
        /// The site name that failed to resolve.
        site: String,
    },

    /// An environment does not exist for a site.
    #[error("environment `{env}` was not found for site `{site}`")]
    EnvironmentNotFound {
        /// The site name.
        site: String,
        /// The environment name.
        env: String,
    },

    /// The description search hit its attempt ceiling.
    #[error("workflow not found after {attempts} attempts")]
    SearchExhausted {
        /// The number of attempts made.
        attempts: u32,
    },

    /// The by-commit search hit its attempt ceiling.
    #[error("no workflow found for commit `{commit}` after {attempts} attempts")]
    CommitSearchExhausted {
        /// The commit being searched for.
        commit: String,
        /// The number of attempts made.
        attempts: u32,
    },

    /// A workflow being polled vanished from the server's log.
    #[error("workflow `{id}` disappeared while waiting for it to complete")]
    WorkflowDisappeared {
        /// The id of the vanished workflow.
        id: String,
    },

    /// The wait deadline elapsed.
    #[error("exceeded maximum wait time of {timeout} seconds")]
    WaitTimeout {
        /// The configured maximum wait in seconds.
        timeout: u64,
    },

    /// The wait deadline elapsed while searching for a commit's workflow.
    #[error("workflow for commit `{commit}` did not appear within {timeout} seconds")]
    CommitWaitTimeout {
        /// The commit being searched for.
        commit: String,
        /// The configured maximum wait in seconds.
        timeout: u64,
    },

    /// The server reported the operation is unsupported for the site.
    #[error("{message}")]
    UnsupportedSite {
        /// The server-provided (or generic) message.
        message: String,
    },

    /// A transport-level request failure.
    #[error(transparent)]
    Request(#[from] reqwest::Error),

    /// Transient failures persisted past the retry budget.
    #[error("request failed after exhausting retries")]
    RetriesExhausted,

    /// A workflow reached a terminal state other than success.
    #[error("{message}")]
    WorkflowFailed {
        /// The failure message derived from the workflow.
        message: String,
    },

    /// The server refused to create a workflow.
    #[error("workflow creation failed: {reason}")]
    WorkflowCreationFailed {
        /// The response status reason.
        reason: String,
    },

    /// The API returned an unexpected error status.
    #[error("request to `{path}` failed: {status} {reason}")]
    Api {
        /// The request path.
        path: String,
        /// The response status code.
        status: u16,
        /// The status reason phrase.
        reason: String,
    },

    /// No session token is available.
    #[error("no session found; set PYLON_SESSION or add a token to the config file")]
    MissingSession,

    /// A machine-token exchange was rejected.
    #[error("authorization failed: {reason}")]
    AuthFailed {
        /// Why the exchange failed.
        reason: String,
    },

    /// A download target already exists.
    #[error("target file `{}` already exists", .path.display())]
    TargetExists {
        /// The existing path.
        path: PathBuf,
    },

    /// An I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A JSON decoding error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// A URL parsing error.
    #[error(transparent)]
    Url(#[from] url::ParseError),
}
