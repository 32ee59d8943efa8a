//! Integration tests for workflow waiting and watching.

mod common;

use pylon::Config;
use pylon::Error;
use pylon::request::Client;
use pylon::session::Session;
use pylon::site::Site;
use pylon::workflow::WorkflowOwner;
use pylon::workflow::Workflows;
use pylon::workflow::poller::Poller;
use pylon::workflow::poller::WaitOptions;
use pylon::workflow::watcher::Watcher;
use serde_json::Value;
use serde_json::json;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::matchers::query_param;

/// A fixed reference time for the fixtures.
const START: i64 = 1_700_000_000;

/// A resolved site; name resolution is covered by the transport tests.
fn site() -> Site {
    Site {
        id: "s1".to_string(),
        name: "demo".to_string(),
        label: "Demo Site".to_string(),
    }
}

fn wait_options(max_wait: u64) -> WaitOptions {
    WaitOptions {
        start_time: START,
        max_wait,
        max_not_found_attempts: None,
    }
}

/// A workflow log response with a single entry in the given status.
fn commit_log(status: &str) -> Value {
    json!({
        "data": [
            {
                "workflow": {
                    "id": "wf-9",
                    "environment": "dev",
                    "target_commit": "abcdef1234567890abcd",
                    "started_at": START + 5,
                    "status": status,
                    "description": "Sync code on dev",
                },
            },
        ],
    })
}

#[tokio::test(start_paused = true)]
async fn wait_finds_the_sync_workflow_and_polls_to_success() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/sites/s1/workflows"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": "wf-1", "description": "Sync code on dev", "created_at": START + 1 },
        ])))
        .expect(1)
        .named("collection listing")
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/sites/s1/workflows/wf-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "wf-1",
            "description": "Sync code on dev",
            "created_at": START + 1,
        })))
        .up_to_n_times(1)
        .expect(1)
        .named("still running")
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/sites/s1/workflows/wf-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "wf-1",
            "description": "Sync code on dev",
            "created_at": START + 1,
            "result": "succeeded",
            "active_description": "Deployed code to dev",
        })))
        .expect(1)
        .named("succeeded")
        .mount(&server)
        .await;

    let client = common::client_for(&server);
    Poller::new(&client)
        .wait_for_workflow(&site(), "dev", None, &wait_options(180))
        .await
        .unwrap();

    server.verify().await;
}

#[tokio::test(start_paused = true)]
async fn wait_matches_descriptions_ignoring_quotes() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/sites/s1/workflows"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "id": "wf-3",
                "description": "Deploy code to \"live\"",
                "created_at": START + 1,
                "result": "succeeded",
            },
        ])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/sites/s1/workflows/wf-3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "wf-3",
            "description": "Deploy code to \"live\"",
            "created_at": START + 1,
            "result": "succeeded",
        })))
        .expect(2)
        .mount(&server)
        .await;

    let client = common::client_for(&server);
    Poller::new(&client)
        .wait_for_workflow(
            &site(),
            "live",
            Some("Deploy code to live"),
            &wait_options(180),
        )
        .await
        .unwrap();

    server.verify().await;
}

#[tokio::test(start_paused = true)]
async fn wait_surfaces_the_failure_reason() {
    let server = MockServer::start().await;

    let failed = json!({
        "id": "wf-2",
        "description": "Sync code on dev",
        "created_at": START + 1,
        "result": "failed",
        "final_task": { "reason": "Conversion to git mode failed" },
    });
    Mock::given(method("GET"))
        .and(path("/api/sites/s1/workflows"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([failed.clone()])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/sites/s1/workflows/wf-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(failed))
        .expect(2)
        .mount(&server)
        .await;

    let config = Config {
        workflow_polling_delay_ms: 1000,
        ..common::config_for(&server)
    };
    let client = Client::new(config, Session::new("test-session"));

    let err = Poller::new(&client)
        .wait_for_workflow(&site(), "dev", None, &wait_options(180))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::WorkflowFailed { .. }));
    assert_eq!(err.to_string(), "Conversion to git mode failed");
}

#[tokio::test(start_paused = true)]
async fn wait_times_out_while_searching() {
    let server = MockServer::start().await;

    // Seven seconds admits exactly two searches five seconds apart.
    Mock::given(method("GET"))
        .and(path("/api/sites/s1/workflows"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(2)
        .mount(&server)
        .await;

    let client = common::client_for(&server);
    let err = Poller::new(&client)
        .wait_for_workflow(&site(), "dev", None, &wait_options(7))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::WaitTimeout { timeout: 7 }));
    server.verify().await;
}

#[tokio::test(start_paused = true)]
async fn wait_stops_at_the_search_attempt_ceiling() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/sites/s1/workflows"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(2)
        .mount(&server)
        .await;

    let client = common::client_for(&server);
    let options = WaitOptions {
        start_time: START,
        max_wait: 0,
        max_not_found_attempts: Some(2),
    };
    let err = Poller::new(&client)
        .wait_for_workflow(&site(), "dev", None, &options)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::SearchExhausted { attempts: 2 }));
    server.verify().await;
}

#[tokio::test(start_paused = true)]
async fn wait_ignores_workflows_older_than_the_start_time() {
    let server = MockServer::start().await;

    // The listing is newest-first; a matching workflow created before the
    // start time must not be picked up.
    Mock::given(method("GET"))
        .and(path("/api/sites/s1/workflows"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": "wf-new", "description": "Deploy to test", "created_at": START + 5 },
            { "id": "wf-old", "description": "Sync code on dev", "created_at": START - 10 },
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let client = common::client_for(&server);
    let options = WaitOptions {
        start_time: START,
        max_wait: 0,
        max_not_found_attempts: Some(1),
    };
    let err = Poller::new(&client)
        .wait_for_workflow(&site(), "dev", None, &options)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::SearchExhausted { attempts: 1 }));
    server.verify().await;
}

#[tokio::test(start_paused = true)]
async fn commit_wait_polls_the_workflow_log_to_success() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/sites/s1/logs/workflows"))
        .respond_with(ResponseTemplate::new(200).set_body_json(commit_log("Running")))
        .up_to_n_times(1)
        .expect(1)
        .named("still running")
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/sites/s1/logs/workflows"))
        .respond_with(ResponseTemplate::new(200).set_body_json(commit_log("Success")))
        .expect(1)
        .named("succeeded")
        .mount(&server)
        .await;

    let client = common::client_for(&server);
    Poller::new(&client)
        .wait_for_commit(&site(), "dev", "abcdef1", &wait_options(180))
        .await
        .unwrap();

    server.verify().await;
}

#[tokio::test(start_paused = true)]
async fn commit_wait_reports_terminal_failure_statuses() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/sites/s1/logs/workflows"))
        .respond_with(ResponseTemplate::new(200).set_body_json(commit_log("Running")))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/sites/s1/logs/workflows"))
        .respond_with(ResponseTemplate::new(200).set_body_json(commit_log("Failed")))
        .mount(&server)
        .await;

    let client = common::client_for(&server);
    let err = Poller::new(&client)
        .wait_for_commit(&site(), "dev", "abcdef1", &wait_options(180))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::WorkflowFailed { .. }));
    assert_eq!(
        err.to_string(),
        "workflow wf-9 failed with status: Failed"
    );
}

#[tokio::test(start_paused = true)]
async fn commit_wait_notices_a_vanished_workflow() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/sites/s1/logs/workflows"))
        .respond_with(ResponseTemplate::new(200).set_body_json(commit_log("Running")))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/sites/s1/logs/workflows"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .mount(&server)
        .await;

    let client = common::client_for(&server);
    let err = Poller::new(&client)
        .wait_for_commit(&site(), "dev", "abcdef1", &wait_options(180))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::WorkflowDisappeared { id } if id == "wf-9"));
}

#[tokio::test]
async fn commit_wait_rejects_bad_shas_before_any_request() {
    let server = MockServer::start().await;
    let client = common::client_for(&server);
    let poller = Poller::new(&client);

    for commit in ["", "abc123", "xyzzyxz", "ABCDEF1", "abcdef1 "] {
        let err = poller
            .wait_for_commit(&site(), "dev", commit, &wait_options(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCommitSha { .. }));
    }

    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn commit_wait_gives_up_after_ten_searches() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/sites/s1/logs/workflows"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .expect(10)
        .mount(&server)
        .await;

    let client = common::client_for(&server);
    let err = Poller::new(&client)
        .wait_for_commit(&site(), "dev", "abcdef1", &wait_options(0))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::CommitSearchExhausted { attempts: 10, .. }));
    server.verify().await;
}

#[tokio::test(start_paused = true)]
async fn commit_wait_ignores_other_environments() {
    let server = MockServer::start().await;

    // The only entry carries the right commit but ran on another
    // environment, so the search times out.
    Mock::given(method("GET"))
        .and(path("/api/sites/s1/logs/workflows"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {
                    "workflow": {
                        "id": "wf-9",
                        "environment": "live",
                        "target_commit": "abcdef1234567890abcd",
                        "started_at": START + 5,
                        "status": "Success",
                    },
                },
            ],
        })))
        .expect(2)
        .mount(&server)
        .await;

    let client = common::client_for(&server);
    let err = Poller::new(&client)
        .wait_for_commit(&site(), "dev", "abcdef1", &wait_options(7))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::CommitWaitTimeout { timeout: 7, .. }
    ));
    server.verify().await;
}

#[tokio::test]
async fn fetch_paged_fills_the_collection() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/sites/s1/workflows"))
        .and(query_param("limit", "100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": "wf-1", "created_at": START, "result": "succeeded" },
            { "id": "wf-2", "created_at": START + 10 },
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let client = common::client_for(&server);
    let mut workflows = Workflows::new(WorkflowOwner::Site {
        site_id: "s1".to_string(),
    });
    workflows.fetch_paged(&client).await.unwrap();

    assert_eq!(workflows.len(), 2);
    assert!(workflows.get("wf-2").is_some());
    assert_eq!(workflows.last_created_at(), Some(START + 10));
}

#[tokio::test]
async fn creating_a_workflow_posts_to_the_owner() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/sites/s1/environments/dev/workflows"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "wf-new",
            "description": "Deploy code to \"dev\"",
            "created_at": START,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = common::client_for(&server);
    let mut workflows = Workflows::new(WorkflowOwner::Environment {
        site_id: "s1".to_string(),
        name: "dev".to_string(),
    });
    let workflow = workflows
        .create(&client, "deploy", json!({ "annotation": "release" }))
        .await
        .unwrap();

    assert_eq!(workflow.id(), "wf-new");
    assert_eq!(workflows.len(), 1);

    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["type"], "deploy");
    assert_eq!(body["params"]["annotation"], "release");
}

#[tokio::test]
async fn rejected_workflow_creation_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/sites/s1/workflows"))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&server)
        .await;

    let client = common::client_for(&server);
    let mut workflows = Workflows::new(WorkflowOwner::Site {
        site_id: "s1".to_string(),
    });
    let err = workflows
        .create(&client, "deploy", json!({}))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::WorkflowCreationFailed { .. }));
    assert!(workflows.is_empty());
}

#[tokio::test(start_paused = true)]
async fn watcher_announces_each_workflow_once_despite_timestamp_drift() {
    let server = MockServer::start().await;

    let quiet = json!({
        "id": "wf-a",
        "description": "Deploy to live",
        "environment": "live",
        "created_at": START,
        "started_at": START,
    });
    let fresh = json!({
        "id": "wf-b",
        "description": "Sync code on dev",
        "environment": "dev",
        "created_at": START + 50,
        "started_at": START + 50,
        "finished_at": START + 60,
        "result": "succeeded",
        "has_operation_log_output": true,
    });

    // The new workflow appears on the first check, drops out of the
    // listing on the second (regressing the high-water timestamps), and
    // reappears on the third. It must be announced exactly once.
    let pages = [
        json!([quiet]),
        json!([quiet, fresh]),
        json!([quiet]),
        json!([quiet, fresh]),
    ];
    for (index, page) in pages.iter().enumerate() {
        Mock::given(method("GET"))
            .and(path("/api/sites/s1/workflows"))
            .and(query_param("hydrate", "operations"))
            .and(query_param("limit", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page))
            .up_to_n_times(1)
            .expect(1)
            .named(format!("refresh {index}"))
            .mount(&server)
            .await;
    }

    // The finish notice hydrates operation logs; expecting one request
    // here also proves the log fetch is not repeated.
    Mock::given(method("GET"))
        .and(path("/api/sites/s1/workflows/wf-b"))
        .and(query_param("hydrate", "operations_with_logs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "wf-b",
            "description": "Sync code on dev",
            "environment": "dev",
            "created_at": START + 50,
            "started_at": START + 50,
            "finished_at": START + 60,
            "result": "succeeded",
            "has_operation_log_output": true,
            "operations": [
                {
                    "type": "platform",
                    "description": "Sync code",
                    "result": "succeeded",
                    "log_output": "Updated to abcdef1",
                },
            ],
        })))
        .expect(1)
        .named("operation logs")
        .mount(&server)
        .await;

    let client = common::client_for(&server);
    let mut watcher = Watcher::new(&client, "s1");
    watcher.watch(Some(3)).await.unwrap();

    assert_eq!(watcher.started_ids(), ["wf-b"]);
    assert_eq!(watcher.finished_ids(), ["wf-b"]);
    server.verify().await;
}
