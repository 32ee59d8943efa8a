//! Workflow watching.
//!
//! A long-running loop that re-fetches a site's workflow collection at a
//! fixed interval and announces started and finished workflows. The local
//! clock may drift from the server's, so timestamp comparisons alone could
//! announce the same workflow twice; the watcher therefore also remembers
//! every id it has announced, for the life of the session.

use std::time::Duration;

use chrono::DateTime;
use tokio::time::sleep;
use tracing::info;

use crate::error::Result;
use crate::request::Client;
use crate::workflow::Workflow;
use crate::workflow::WorkflowOwner;
use crate::workflow::Workflows;

/// Delay between collection refreshes.
pub const WATCH_INTERVAL: Duration = Duration::from_secs(5);

/// Streams start and finish notices for a site's workflows.
#[derive(Debug)]
pub struct Watcher<'a> {
    /// The transport client.
    client: &'a Client,
    /// The watched collection.
    workflows: Workflows,
    /// Ids a start notice has been emitted for; grows monotonically.
    started: Vec<String>,
    /// Ids a finish notice has been emitted for; grows monotonically.
    finished: Vec<String>,
}

impl<'a> Watcher<'a> {
    /// Creates a watcher for a site's workflows.
    pub fn new(client: &'a Client, site_id: impl Into<String>) -> Self {
        Self {
            client,
            workflows: Workflows::new(WorkflowOwner::Site {
                site_id: site_id.into(),
            }),
            started: Vec::new(),
            finished: Vec::new(),
        }
    }

    /// Ids a start notice has been emitted for, in emission order.
    pub fn started_ids(&self) -> &[String] {
        &self.started
    }

    /// Ids a finish notice has been emitted for, in emission order.
    pub fn finished_ids(&self) -> &[String] {
        &self.finished
    }

    /// Watches until the optional check budget is exhausted, or forever.
    pub async fn watch(&mut self, checks: Option<i64>) -> Result<()> {
        info!("Watching workflows...");
        self.workflows.fetch_with_operations(self.client).await?;

        let mut remaining = checks;
        loop {
            let last_created_at = self.workflows.last_created_at().unwrap_or_default();
            let last_finished_at = self.workflows.last_finished_at().unwrap_or_default();

            sleep(WATCH_INTERVAL).await;

            self.workflows.clear();
            self.workflows.fetch_with_operations(self.client).await?;

            let current: Vec<Workflow> = self.workflows.all().cloned().collect();
            for workflow in &current {
                if workflow.was_created_after(last_created_at)
                    && !self.started.iter().any(|id| id == workflow.id())
                {
                    self.emit_started_notice(workflow);
                }

                if workflow.was_finished_after(last_finished_at)
                    && !self.finished.iter().any(|id| id == workflow.id())
                {
                    self.emit_finished_notice(workflow);
                    if workflow.data().has_operation_log_output {
                        self.emit_operation_logs(workflow.clone()).await?;
                    }
                }
            }

            if let Some(remaining) = remaining.as_mut() {
                *remaining -= 1;
                if *remaining < 1 {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Emits a workflow-started notice and records the id.
    fn emit_started_notice(&mut self, workflow: &Workflow) {
        info!(
            id = %workflow.id(),
            description = workflow.description(),
            env = workflow.environment(),
            time = %format_timestamp(workflow.started_at()),
            "Started workflow"
        );
        self.started.push(workflow.id().to_string());
    }

    /// Emits a workflow-finished notice and records the id.
    fn emit_finished_notice(&mut self, workflow: &Workflow) {
        info!(
            id = %workflow.id(),
            description = workflow.description(),
            env = workflow.environment(),
            time = %format_timestamp(workflow.finished_at()),
            "Finished workflow"
        );
        self.finished.push(workflow.id().to_string());
    }

    /// Re-fetches a workflow hydrated with logs and emits its operation
    /// output.
    async fn emit_operation_logs(&self, mut workflow: Workflow) -> Result<()> {
        workflow.fetch_with_logs(self.client).await?;
        for operation in &workflow.data().operations {
            if let Some(log_output) = operation.log_output.as_deref() {
                info!(
                    operation = operation.description.as_deref().unwrap_or_default(),
                    "{log_output}"
                );
            }
        }
        Ok(())
    }
}

/// Formats an epoch timestamp for notice output.
fn format_timestamp(timestamp: i64) -> String {
    DateTime::from_timestamp(timestamp, 0)
        .map(|time| time.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}
