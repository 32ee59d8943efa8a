//! Workflow model and collection.
//!
//! A workflow is one asynchronous server-side job. It is discovered by
//! listing, mutated only by re-fetching from the server, and owned by
//! exactly one entity (environment, organization, site, or user) that
//! determines its API address.

pub mod poller;
pub mod watcher;

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Deserializer;
use serde_json::Value;
use serde_json::json;

use crate::error::Error;
use crate::error::Result;
use crate::request::Client;
use crate::request::RequestOptions;

/// The `result` value that marks a successful workflow.
const RESULT_SUCCEEDED: &str = "succeeded";

/// Deserializes an epoch-seconds timestamp that the server may send as an
/// integer, a float, a numeric string, or not at all.
pub(crate) fn epoch_seconds<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or_default() as i64,
        Some(Value::String(s)) => s.parse::<f64>().unwrap_or_default() as i64,
        _ => 0,
    })
}

/// Structured failure detail attached to a finished workflow.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FinalTask {
    /// The failure reason, when the server provides one.
    #[serde(default)]
    pub reason: Option<String>,
    /// Messages emitted by the final task.
    #[serde(default)]
    pub messages: Vec<TaskMessage>,
}

/// One message emitted by a workflow task.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskMessage {
    /// The message payload; usually a string, but not guaranteed.
    #[serde(default)]
    pub message: Value,
}

/// One sub-step of a workflow.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Operation {
    /// The operation type.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    /// A human-readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// The operation result.
    #[serde(default)]
    pub result: Option<String>,
    /// Captured log output, when hydrated.
    #[serde(default)]
    pub log_output: Option<String>,
}

/// The raw attributes of a workflow as returned by the server.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkflowData {
    /// The workflow id.
    #[serde(default)]
    pub id: String,
    /// The workflow description.
    #[serde(default)]
    pub description: Option<String>,
    /// The environment the workflow ran against, if any.
    #[serde(default)]
    pub environment: Option<String>,
    /// The terminal result; absent while the workflow is running.
    #[serde(default)]
    pub result: Option<String>,
    /// The description shown for a successful workflow.
    #[serde(default)]
    pub active_description: Option<String>,
    /// When the workflow was created (epoch seconds).
    #[serde(default, deserialize_with = "epoch_seconds")]
    pub created_at: i64,
    /// When the workflow started (epoch seconds).
    #[serde(default, deserialize_with = "epoch_seconds")]
    pub started_at: i64,
    /// When the workflow finished (epoch seconds).
    #[serde(default, deserialize_with = "epoch_seconds")]
    pub finished_at: i64,
    /// The commit a code-sync workflow targets.
    #[serde(default)]
    pub target_commit: Option<String>,
    /// Failure detail for a finished workflow.
    #[serde(default)]
    pub final_task: Option<FinalTask>,
    /// The workflow's ordered sub-steps.
    #[serde(default)]
    pub operations: Vec<Operation>,
    /// Whether any operation captured log output.
    #[serde(default)]
    pub has_operation_log_output: bool,
}

/// The derived status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatus {
    /// No `result` yet.
    Running,
    /// Finished with `result == "succeeded"`.
    Succeeded,
    /// Finished with any other result.
    Failed,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Succeeded => write!(f, "succeeded"),
            WorkflowStatus::Failed => write!(f, "failed"),
        }
    }
}

/// The entity a workflow is addressed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowOwner {
    /// An environment of a site.
    Environment {
        /// The owning site id.
        site_id: String,
        /// The environment name.
        name: String,
    },
    /// An organization, addressed through the acting user.
    Organization {
        /// The acting user id.
        user_id: String,
        /// The organization id.
        organization_id: String,
    },
    /// A site.
    Site {
        /// The site id.
        site_id: String,
    },
    /// A user.
    User {
        /// The user id.
        user_id: String,
    },
}

impl WorkflowOwner {
    /// The collection URL for this owner's workflows.
    pub fn workflows_url(&self) -> String {
        match self {
            WorkflowOwner::Environment { site_id, name } => {
                format!("sites/{site_id}/environments/{name}/workflows")
            }
            WorkflowOwner::Organization {
                user_id,
                organization_id,
            } => format!("users/{user_id}/organizations/{organization_id}/workflows"),
            WorkflowOwner::Site { site_id } => format!("sites/{site_id}/workflows"),
            WorkflowOwner::User { user_id } => format!("users/{user_id}/workflows"),
        }
    }

    /// The URL for a single workflow of this owner.
    ///
    /// Environment-owned workflows are fetched at site scope; the server
    /// does not expose them under the environment path.
    pub fn workflow_url(&self, id: &str) -> String {
        match self {
            WorkflowOwner::Environment { site_id, .. } | WorkflowOwner::Site { site_id } => {
                format!("sites/{site_id}/workflows/{id}")
            }
            WorkflowOwner::Organization {
                user_id,
                organization_id,
            } => format!("users/{user_id}/organizations/{organization_id}/workflows/{id}"),
            WorkflowOwner::User { user_id } => format!("users/{user_id}/workflows/{id}"),
        }
    }
}

/// A single server-side asynchronous job.
#[derive(Debug, Clone)]
pub struct Workflow {
    /// The last-fetched attributes.
    data: WorkflowData,
    /// The owning entity; assigned at construction, never reassigned.
    owner: WorkflowOwner,
}

impl Workflow {
    /// Creates a workflow model from fetched attributes and its owner.
    pub fn new(data: WorkflowData, owner: WorkflowOwner) -> Self {
        Self { data, owner }
    }

    /// The workflow id.
    pub fn id(&self) -> &str {
        &self.data.id
    }

    /// The last-fetched attributes.
    pub fn data(&self) -> &WorkflowData {
        &self.data
    }

    /// The owning entity.
    pub fn owner(&self) -> &WorkflowOwner {
        &self.owner
    }

    /// The workflow description, or the empty string.
    pub fn description(&self) -> &str {
        self.data.description.as_deref().unwrap_or_default()
    }

    /// The environment name, or the empty string.
    pub fn environment(&self) -> &str {
        self.data.environment.as_deref().unwrap_or_default()
    }

    /// When the workflow was created (epoch seconds).
    pub fn created_at(&self) -> i64 {
        self.data.created_at
    }

    /// When the workflow started (epoch seconds).
    pub fn started_at(&self) -> i64 {
        self.data.started_at
    }

    /// When the workflow finished (epoch seconds).
    pub fn finished_at(&self) -> i64 {
        self.data.finished_at
    }

    /// Whether the workflow has reached a terminal state.
    ///
    /// A workflow is finished iff its `result` field is present; one with
    /// no `result` is running regardless of elapsed time.
    pub fn is_finished(&self) -> bool {
        self.data.result.is_some()
    }

    /// Whether the workflow finished successfully.
    pub fn is_successful(&self) -> bool {
        self.data.result.as_deref() == Some(RESULT_SUCCEEDED)
    }

    /// The derived status.
    pub fn status(&self) -> WorkflowStatus {
        if !self.is_finished() {
            WorkflowStatus::Running
        } else if self.is_successful() {
            WorkflowStatus::Succeeded
        } else {
            WorkflowStatus::Failed
        }
    }

    /// Whether the workflow was created strictly after the given timestamp.
    pub fn was_created_after(&self, timestamp: i64) -> bool {
        self.data.created_at > timestamp
    }

    /// Whether the workflow finished strictly after the given timestamp.
    pub fn was_finished_after(&self, timestamp: i64) -> bool {
        self.data.finished_at > timestamp
    }

    /// The message to show the user for this workflow.
    ///
    /// For a failed workflow: the final task's reason, else the last of the
    /// final task's messages, else a generic failure string. For a
    /// successful one: the active description.
    pub fn message(&self) -> String {
        if self.is_successful() {
            return self.data.active_description.clone().unwrap_or_default();
        }

        if let Some(task) = &self.data.final_task {
            if let Some(reason) = task.reason.as_deref().filter(|r| !r.is_empty()) {
                return reason.to_string();
            }
            if let Some(last) = task.messages.last() {
                return match &last.message {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
            }
        }

        "Workflow failed.".to_string()
    }

    /// The API URL for this workflow.
    pub fn url(&self) -> String {
        self.owner.workflow_url(&self.data.id)
    }

    /// Re-synchronizes the workflow's state from the server.
    pub async fn fetch(&mut self, client: &Client) -> Result<()> {
        self.fetch_with(client, RequestOptions::default()).await
    }

    /// Re-synchronizes the workflow's state, hydrating operation logs.
    pub async fn fetch_with_logs(&mut self, client: &Client) -> Result<()> {
        let options = RequestOptions::query(vec![(
            "hydrate".to_string(),
            "operations_with_logs".to_string(),
        )]);
        self.fetch_with(client, options).await
    }

    /// Fetches this workflow's URL and replaces the local attributes.
    async fn fetch_with(&mut self, client: &Client, options: RequestOptions) -> Result<()> {
        let path = self.url();
        let response = client.send(&path, options).await?;
        if response.is_error() {
            return Err(Error::Api {
                path,
                status: response.status_code.as_u16(),
                reason: response.reason,
            });
        }
        self.data = serde_json::from_value(response.data)?;
        Ok(())
    }
}

/// The collection of workflows belonging to one owner.
#[derive(Debug, Clone)]
pub struct Workflows {
    /// The owning entity.
    owner: WorkflowOwner,
    /// Fetched models, keyed by workflow id in fetch order.
    models: IndexMap<String, Workflow>,
}

impl Workflows {
    /// Creates an empty collection for an owner.
    pub fn new(owner: WorkflowOwner) -> Self {
        Self {
            owner,
            models: IndexMap::new(),
        }
    }

    /// The owning entity.
    pub fn owner(&self) -> &WorkflowOwner {
        &self.owner
    }

    /// Drops all cached models.
    pub fn clear(&mut self) {
        self.models.clear();
    }

    /// Fetches the full collection in a single unpaged request.
    pub async fn fetch(&mut self, client: &Client) -> Result<()> {
        let path = self.owner.workflows_url();
        let response = client.send(&path, RequestOptions::default()).await?;
        if response.is_error() {
            return Err(Error::Api {
                path,
                status: response.status_code.as_u16(),
                reason: response.reason,
            });
        }
        let items = response.data.as_array().cloned().unwrap_or_default();
        self.replace(items)
    }

    /// Fetches the collection page by page.
    pub async fn fetch_paged(&mut self, client: &Client) -> Result<()> {
        let items = client
            .paged_request(&self.owner.workflows_url(), RequestOptions::default(), None)
            .await?;
        self.replace(items.into_values().collect())
    }

    /// Fetches the collection page by page, hydrated with operations.
    pub async fn fetch_with_operations(&mut self, client: &Client) -> Result<()> {
        let options = RequestOptions::query(vec![(
            "hydrate".to_string(),
            "operations".to_string(),
        )]);
        let items = client
            .paged_request(&self.owner.workflows_url(), options, None)
            .await?;
        self.replace(items.into_values().collect())
    }

    /// Replaces the cached models with freshly fetched items.
    fn replace(&mut self, items: Vec<Value>) -> Result<()> {
        self.models.clear();
        for item in items {
            let data: WorkflowData = serde_json::from_value(item)?;
            let workflow = Workflow::new(data, self.owner.clone());
            self.models.insert(workflow.id().to_string(), workflow);
        }
        Ok(())
    }

    /// All fetched workflows, in fetch order.
    pub fn all(&self) -> impl Iterator<Item = &Workflow> {
        self.models.values()
    }

    /// Looks up a fetched workflow by id.
    pub fn get(&self, id: &str) -> Option<&Workflow> {
        self.models.get(id)
    }

    /// The number of fetched workflows.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether the collection holds no fetched workflows.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// All fetched workflows that have finished.
    pub fn all_finished(&self) -> impl Iterator<Item = &Workflow> {
        self.all().filter(|workflow| workflow.is_finished())
    }

    /// All finished workflows that captured operation log output.
    pub fn all_with_logs(&self) -> impl Iterator<Item = &Workflow> {
        self.all_finished()
            .filter(|workflow| workflow.data().has_operation_log_output)
    }

    /// The most recently finished workflow that captured log output.
    pub fn find_latest_with_logs(&self) -> Option<&Workflow> {
        self.all_with_logs().max_by_key(|workflow| workflow.finished_at())
    }

    /// The creation time of the most recently created workflow.
    pub fn last_created_at(&self) -> Option<i64> {
        self.all().map(Workflow::created_at).max()
    }

    /// The finish time of the most recently finished workflow.
    pub fn last_finished_at(&self) -> Option<i64> {
        self.all().map(Workflow::finished_at).max()
    }

    /// Creates a new workflow on the server and adds it to the collection.
    ///
    /// Unsupported-site conflicts are raised by the transport; any other
    /// error status becomes a workflow-creation error.
    pub async fn create(
        &mut self,
        client: &Client,
        kind: &str,
        params: Value,
    ) -> Result<Workflow> {
        let response = client
            .send(
                &self.owner.workflows_url(),
                RequestOptions::post(json!({
                    "type": kind,
                    "params": params,
                })),
            )
            .await?;
        if response.is_error() {
            return Err(Error::WorkflowCreationFailed {
                reason: response.reason,
            });
        }

        let data: WorkflowData = serde_json::from_value(response.data)?;
        let workflow = Workflow::new(data, self.owner.clone());
        self.models
            .insert(workflow.id().to_string(), workflow.clone());
        Ok(workflow)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    /// Builds a workflow from a JSON payload with a site owner.
    fn workflow(payload: Value) -> Workflow {
        Workflow::new(
            serde_json::from_value(payload).unwrap(),
            WorkflowOwner::Site {
                site_id: "site-1".to_string(),
            },
        )
    }

    #[test]
    fn missing_result_means_running() {
        let wf = workflow(json!({ "id": "wf-1", "description": "Deploy to live" }));
        assert!(!wf.is_finished());
        assert!(!wf.is_successful());
        assert_eq!(wf.status(), WorkflowStatus::Running);
    }

    #[test]
    fn succeeded_result() {
        let wf = workflow(json!({ "id": "wf-1", "result": "succeeded" }));
        assert!(wf.is_finished());
        assert!(wf.is_successful());
        assert_eq!(wf.status(), WorkflowStatus::Succeeded);
    }

    #[test]
    fn other_results_are_failures() {
        for result in ["failed", "aborted", "anything"] {
            let wf = workflow(json!({ "id": "wf-1", "result": result }));
            assert!(wf.is_finished());
            assert!(!wf.is_successful());
            assert_eq!(wf.status(), WorkflowStatus::Failed);
        }
    }

    #[test]
    fn message_prefers_final_task_reason() {
        let wf = workflow(json!({
            "id": "wf-1",
            "result": "failed",
            "final_task": {
                "reason": "Conversion to git mode failed",
                "messages": [{ "message": "ignored" }],
            },
        }));
        assert_eq!(wf.message(), "Conversion to git mode failed");
    }

    #[test]
    fn message_falls_back_to_last_task_message() {
        let wf = workflow(json!({
            "id": "wf-1",
            "result": "failed",
            "final_task": {
                "messages": [
                    { "message": "first" },
                    { "message": "second" },
                ],
            },
        }));
        assert_eq!(wf.message(), "second");
    }

    #[test]
    fn message_stringifies_non_string_payloads() {
        let wf = workflow(json!({
            "id": "wf-1",
            "result": "failed",
            "final_task": {
                "messages": [{ "message": { "code": 42 } }],
            },
        }));
        assert_eq!(wf.message(), r#"{"code":42}"#);
    }

    #[test]
    fn message_defaults_to_generic_failure() {
        let wf = workflow(json!({ "id": "wf-1", "result": "failed" }));
        assert_eq!(wf.message(), "Workflow failed.");
    }

    #[test]
    fn message_of_success_is_active_description() {
        let wf = workflow(json!({
            "id": "wf-1",
            "result": "succeeded",
            "active_description": "Deployed code to dev",
        }));
        assert_eq!(wf.message(), "Deployed code to dev");
    }

    #[test]
    fn timestamp_comparisons_are_strict() {
        let wf = workflow(json!({
            "id": "wf-1",
            "created_at": 100,
            "finished_at": 200,
        }));
        assert!(wf.was_created_after(99));
        assert!(!wf.was_created_after(100));
        assert!(wf.was_finished_after(199));
        assert!(!wf.was_finished_after(200));
    }

    #[test]
    fn timestamps_tolerate_floats_and_strings() {
        let wf = workflow(json!({
            "id": "wf-1",
            "created_at": 100.7,
            "started_at": "150",
            "finished_at": null,
        }));
        assert_eq!(wf.created_at(), 100);
        assert_eq!(wf.started_at(), 150);
        assert_eq!(wf.finished_at(), 0);
    }

    #[test]
    fn owner_urls() {
        let env = WorkflowOwner::Environment {
            site_id: "s1".to_string(),
            name: "dev".to_string(),
        };
        assert_eq!(env.workflows_url(), "sites/s1/environments/dev/workflows");
        assert_eq!(env.workflow_url("w1"), "sites/s1/workflows/w1");

        let org = WorkflowOwner::Organization {
            user_id: "u1".to_string(),
            organization_id: "o1".to_string(),
        };
        assert_eq!(org.workflows_url(), "users/u1/organizations/o1/workflows");
        assert_eq!(
            org.workflow_url("w1"),
            "users/u1/organizations/o1/workflows/w1"
        );

        let site = WorkflowOwner::Site {
            site_id: "s1".to_string(),
        };
        assert_eq!(site.workflows_url(), "sites/s1/workflows");
        assert_eq!(site.workflow_url("w1"), "sites/s1/workflows/w1");

        let user = WorkflowOwner::User {
            user_id: "u1".to_string(),
        };
        assert_eq!(user.workflows_url(), "users/u1/workflows");
        assert_eq!(user.workflow_url("w1"), "users/u1/workflows/w1");
    }

    #[test]
    fn collection_timestamps() {
        let mut workflows = Workflows::new(WorkflowOwner::Site {
            site_id: "s1".to_string(),
        });
        assert_eq!(workflows.last_created_at(), None);
        assert_eq!(workflows.last_finished_at(), None);

        workflows
            .replace(vec![
                json!({ "id": "w1", "created_at": 100, "finished_at": 180, "result": "succeeded" }),
                json!({ "id": "w2", "created_at": 150 }),
                json!({ "id": "w3", "created_at": 120, "finished_at": 140, "result": "failed" }),
            ])
            .unwrap();

        assert_eq!(workflows.last_created_at(), Some(150));
        assert_eq!(workflows.last_finished_at(), Some(180));
        assert_eq!(workflows.all_finished().count(), 2);
    }

    #[test]
    fn latest_with_logs() {
        let mut workflows = Workflows::new(WorkflowOwner::Site {
            site_id: "s1".to_string(),
        });
        workflows
            .replace(vec![
                json!({
                    "id": "w1",
                    "finished_at": 140,
                    "result": "succeeded",
                    "has_operation_log_output": true,
                }),
                json!({
                    "id": "w2",
                    "finished_at": 180,
                    "result": "failed",
                    "has_operation_log_output": true,
                }),
                json!({ "id": "w3", "has_operation_log_output": true }),
            ])
            .unwrap();

        let latest = workflows.find_latest_with_logs().unwrap();
        assert_eq!(latest.id(), "w2");
    }
}
