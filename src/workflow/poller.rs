//! Workflow polling.
//!
//! The poller locates a specific workflow for a site, either by description
//! or by target commit, and then blocks until it reaches a terminal state.
//! Both phases check a wall-clock deadline at the top of every iteration;
//! all suspension points are explicit sleeps between sequential requests.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tokio::time::Instant;
use tokio::time::sleep;
use tracing::debug;
use tracing::info;

use crate::error::Error;
use crate::error::Result;
use crate::request::Client;
use crate::request::RequestOptions;
use crate::site::Site;
use crate::workflow::WorkflowOwner;
use crate::workflow::Workflows;
use crate::workflow::epoch_seconds;

/// Delay between search attempts.
const SEARCH_INTERVAL: Duration = Duration::from_secs(5);

/// Hard cap on by-commit search attempts.
const COMMIT_SEARCH_MAX_ATTEMPTS: u32 = 10;

/// Terminal statuses in the workflow log read path.
const TERMINAL_LOG_STATUSES: &[&str] = &["Success", "Failed", "Aborted"];

/// Matches a full or shortened commit SHA.
static COMMIT_SHA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{7,40}$").unwrap());

/// Options for a wait operation.
#[derive(Debug, Clone, Copy)]
pub struct WaitOptions {
    /// Ignore workflows started or created before this time (epoch seconds).
    pub start_time: i64,
    /// Maximum seconds to wait; 0 means unbounded.
    pub max_wait: u64,
    /// Optional ceiling on description-search attempts.
    pub max_not_found_attempts: Option<u32>,
}

/// One entry of the `sites/{id}/logs/workflows` read path.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowLogEntry {
    /// The nested workflow record.
    pub workflow: WorkflowLogRecord,
}

/// The workflow record nested in a log entry.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowLogRecord {
    /// The workflow id.
    pub id: String,
    /// The environment the workflow ran against.
    #[serde(default)]
    pub environment: Option<String>,
    /// The commit the workflow targets.
    #[serde(default)]
    pub target_commit: Option<String>,
    /// When the workflow started (epoch seconds).
    #[serde(default, deserialize_with = "epoch_seconds")]
    pub started_at: i64,
    /// The workflow status as reported by the log endpoint.
    #[serde(default)]
    pub status: Option<String>,
    /// The workflow description.
    #[serde(default)]
    pub description: Option<String>,
}

/// Drives fetch/inspect cycles until a workflow terminates.
#[derive(Debug)]
pub struct Poller<'a> {
    /// The transport client.
    client: &'a Client,
}

impl<'a> Poller<'a> {
    /// Creates a poller over a client.
    pub fn new(client: &'a Client) -> Self {
        Self { client }
    }

    /// Waits for a workflow matching a description to complete.
    ///
    /// With no description, waits for the code-sync workflow of the
    /// environment. Search and polling are separate phases with distinct
    /// timeout messages; the deadline is deliberately re-armed when the
    /// search hands off to polling.
    pub async fn wait_for_workflow(
        &self,
        site: &Site,
        env_name: &str,
        description: Option<&str>,
        options: &WaitOptions,
    ) -> Result<()> {
        let expected = match description {
            Some(d) if !d.is_empty() => d.to_string(),
            _ => format!("Sync code on {env_name}"),
        };

        let deadline = deadline_for(options.max_wait);
        let mut not_found_attempts = 0u32;
        let mut workflows = Workflows::new(WorkflowOwner::Site {
            site_id: site.id.clone(),
        });

        let mut found = loop {
            if let Some(max) = options.max_not_found_attempts
                && not_found_attempts == max
            {
                return Err(Error::SearchExhausted { attempts: max });
            }
            if deadline_passed(deadline) {
                return Err(Error::WaitTimeout {
                    timeout: options.max_wait,
                });
            }

            workflows.clear();
            workflows.fetch(self.client).await?;

            let mut matched = None;
            for workflow in workflows.all() {
                // The server returns workflows newest-first; once we cross
                // the start time there is nothing older worth scanning. If
                // that ordering were ever violated, matching workflows past
                // this point would be missed.
                if workflow.created_at() < options.start_time {
                    break;
                }
                let description = workflow.description().replace('"', "");
                if description == expected {
                    matched = Some(workflow.clone());
                    break;
                }
            }

            if let Some(mut workflow) = matched {
                workflow.fetch(self.client).await?;
                info!(
                    description = %expected,
                    status = %workflow.status(),
                    "workflow found"
                );
                break workflow;
            }

            not_found_attempts += 1;
            sleep(SEARCH_INTERVAL).await;
        };

        // The search may have consumed most of the budget; be forgiving and
        // give the polling phase the whole wait again.
        let deadline = deadline_for(options.max_wait);
        let interval = self.client.config().polling_interval();
        loop {
            if deadline_passed(deadline) {
                return Err(Error::WaitTimeout {
                    timeout: options.max_wait,
                });
            }
            found.fetch(self.client).await?;
            if found.is_finished() {
                break;
            }
            sleep(interval).await;
        }

        if !found.is_successful() {
            return Err(Error::WorkflowFailed {
                message: found.message(),
            });
        }
        info!("Workflow succeeded");
        Ok(())
    }

    /// Waits for the workflow that carries a given target commit.
    ///
    /// The commit SHA is validated before any request goes out. Matching
    /// and polling both go through the site's workflow log read path.
    pub async fn wait_for_commit(
        &self,
        site: &Site,
        env_name: &str,
        commit: &str,
        options: &WaitOptions,
    ) -> Result<()> {
        if !COMMIT_SHA.is_match(commit) {
            return Err(Error::InvalidCommitSha {
                commit: commit.to_string(),
            });
        }

        info!(commit, env = env_name, "waiting for workflow with commit");

        let deadline = deadline_for(options.max_wait);
        let log_path = format!("sites/{id}/logs/workflows", id = site.id);
        let mut attempts = 0u32;

        let found = loop {
            if deadline_passed(deadline) {
                return Err(Error::CommitWaitTimeout {
                    commit: commit.to_string(),
                    timeout: options.max_wait,
                });
            }

            let logs = self.fetch_workflow_logs(&log_path).await?;
            debug!(count = logs.len(), "fetched workflow logs");

            let mut matching: Vec<WorkflowLogEntry> = logs
                .into_iter()
                .filter(|entry| {
                    entry.workflow.environment.as_deref() == Some(env_name)
                        && entry
                            .workflow
                            .target_commit
                            .as_deref()
                            .is_some_and(|target| target.starts_with(commit))
                        && entry.workflow.started_at >= options.start_time
                })
                .collect();
            debug!(
                count = matching.len(),
                commit,
                env = env_name,
                "matching workflows"
            );

            if !matching.is_empty() {
                // The most recently started match wins.
                matching.sort_by(|a, b| b.workflow.started_at.cmp(&a.workflow.started_at));
                let entry = matching.remove(0);
                info!(
                    id = %entry.workflow.id,
                    description = entry.workflow.description.as_deref().unwrap_or("N/A"),
                    commit,
                    "found workflow"
                );
                break entry;
            }

            attempts += 1;
            if attempts >= COMMIT_SEARCH_MAX_ATTEMPTS {
                return Err(Error::CommitSearchExhausted {
                    commit: commit.to_string(),
                    attempts,
                });
            }
            debug!(
                attempt = attempts,
                max = COMMIT_SEARCH_MAX_ATTEMPTS,
                "workflow not found, retrying"
            );
            sleep(SEARCH_INTERVAL).await;
        };

        info!(id = %found.workflow.id, "waiting for workflow to complete");
        let interval = self.client.config().polling_interval();
        let mut current = found;
        loop {
            if deadline_passed(deadline) {
                return Err(Error::WaitTimeout {
                    timeout: options.max_wait,
                });
            }

            let logs = self.fetch_workflow_logs(&log_path).await?;
            let updated = logs
                .into_iter()
                .find(|entry| entry.workflow.id == current.workflow.id);
            current = updated.ok_or(Error::WorkflowDisappeared {
                id: current.workflow.id.clone(),
            })?;

            let status = current.workflow.status.as_deref().unwrap_or("unknown");
            debug!(id = %current.workflow.id, status, "workflow status");
            if TERMINAL_LOG_STATUSES.contains(&status) {
                break;
            }

            sleep(interval).await;
        }

        let status = current.workflow.status.as_deref().unwrap_or("unknown");
        if status != "Success" {
            return Err(Error::WorkflowFailed {
                message: format!(
                    "workflow {id} failed with status: {status}",
                    id = current.workflow.id
                ),
            });
        }

        info!(
            id = %current.workflow.id,
            commit,
            "workflow completed successfully"
        );
        Ok(())
    }

    /// Fetches and decodes the workflow log read path.
    async fn fetch_workflow_logs(&self, path: &str) -> Result<Vec<WorkflowLogEntry>> {
        let response = self.client.send(path, RequestOptions::default()).await?;
        if response.is_error() {
            return Err(Error::Api {
                path: path.to_string(),
                status: response.status_code.as_u16(),
                reason: response.reason,
            });
        }
        match response.data.get("data") {
            Some(data) => Ok(serde_json::from_value(data.clone())?),
            None => Ok(Vec::new()),
        }
    }
}

/// Arms a deadline `max_wait` seconds out; 0 means unbounded.
fn deadline_for(max_wait: u64) -> Option<Instant> {
    (max_wait > 0).then(|| Instant::now() + Duration::from_secs(max_wait))
}

/// Whether an armed deadline has elapsed.
fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}
