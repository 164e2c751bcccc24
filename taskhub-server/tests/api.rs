//! REST route tests. Requests go through the full router with
//! `tower::ServiceExt::oneshot`; commit broadcasts are observed on a hub
//! connection registered directly with the shared hub.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use taskhub_core::TaskStore;
use taskhub_server::{router, AppState};
use taskhub_sync::{BroadcastHub, Envelope, MessageKind, Outbound};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

struct TestApp {
    app: Router,
    hub: Arc<BroadcastHub>,
}

fn test_app() -> TestApp {
    let hub = Arc::new(BroadcastHub::new(64));
    let state = AppState::new(Arc::new(TaskStore::new()), hub.clone());
    TestApp {
        app: router(state),
        hub,
    }
}

impl TestApp {
    async fn call(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        self.call_with(method, uri, body, None).await
    }

    async fn call_with(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        correlation: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(id) = correlation {
            builder = builder.header("x-correlation-id", id);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    /// Register a listener and swallow its INITIAL_STATE.
    async fn listener(&self) -> mpsc::Receiver<Outbound> {
        let mut accepted = self.hub.accept(Some("observer")).await.unwrap();
        let first = next_envelope(&mut accepted.outbound).expect("initial state");
        assert_eq!(first.kind, MessageKind::InitialState);
        accepted.outbound
    }

    async fn owner(&self, name: &str, email: &str) -> i64 {
        let (status, body) = self
            .call(
                Method::POST,
                "/api/owners",
                Some(json!({"name": name, "email": email})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_i64().unwrap()
    }
}

fn next_envelope(rx: &mut mpsc::Receiver<Outbound>) -> Option<Envelope> {
    match rx.try_recv() {
        Ok(Outbound::Frame(text)) => Envelope::decode(&text).ok(),
        _ => None,
    }
}

#[tokio::test]
async fn test_health_reports_connections() {
    let app = test_app();
    let _rx = app.listener().await;

    let (status, body) = app.call(Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 1);
}

#[tokio::test]
async fn test_create_task_broadcasts_to_every_connection() {
    let app = test_app();
    let owner_id = app.owner("Ada", "ada@example.com").await;
    let mut first = app.listener().await;
    let mut second = app.listener().await;

    let (status, task) = app
        .call(
            Method::POST,
            "/api/tasks",
            Some(json!({"name": "Write report", "owner_id": owner_id})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(task["completion_percentage"], 0);
    assert_eq!(task["custom_fields"], json!({}));

    for rx in [&mut first, &mut second] {
        let env = next_envelope(rx).expect("TASK_CREATED");
        assert_eq!(env.kind, MessageKind::TaskCreated);
        assert_eq!(env.payload, task);
        assert_eq!(env.correlation_id, None);
    }
}

#[tokio::test]
async fn test_update_echoes_correlation_header() {
    let app = test_app();
    let owner_id = app.owner("Ada", "ada@example.com").await;
    let (_, task) = app
        .call(
            Method::POST,
            "/api/tasks",
            Some(json!({"name": "Plan", "owner_id": owner_id})),
        )
        .await;
    let mut rx = app.listener().await;

    let correlation = Uuid::new_v4();
    let uri = format!("/api/tasks/{}", task["id"]);
    let (status, updated) = app
        .call_with(
            Method::PUT,
            &uri,
            Some(json!({"name": "Plan", "owner_id": owner_id, "completion_percentage": 75})),
            Some(correlation.to_string().as_str()),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["completion_percentage"], 75);

    let env = next_envelope(&mut rx).expect("TASK_UPDATED");
    assert_eq!(env.kind, MessageKind::TaskUpdated);
    assert_eq!(env.correlation_id, Some(correlation));
}

#[tokio::test]
async fn test_malformed_correlation_header_is_ignored() {
    let app = test_app();
    let mut rx = app.listener().await;

    let (status, _) = app
        .call_with(
            Method::POST,
            "/api/owners",
            Some(json!({"name": "Ada", "email": "ada@example.com"})),
            Some("not-a-uuid"),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let env = next_envelope(&mut rx).expect("OWNER_CREATED");
    assert_eq!(env.kind, MessageKind::OwnerCreated);
    assert_eq!(env.correlation_id, None);
}

#[tokio::test]
async fn test_task_validation_errors() {
    let app = test_app();
    let owner_id = app.owner("Ada", "ada@example.com").await;
    let mut rx = app.listener().await;

    let (status, body) = app
        .call(Method::POST, "/api/tasks", Some(json!({"owner_id": owner_id})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Task name is required");

    let (status, body) = app
        .call(Method::POST, "/api/tasks", Some(json!({"name": "x"})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Owner ID is required");

    let (status, _) = app
        .call(
            Method::POST,
            "/api/tasks",
            Some(json!({"name": "x", "owner_id": 999})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Nothing committed, nothing broadcast.
    assert!(next_envelope(&mut rx).is_none());
}

#[tokio::test]
async fn test_unparseable_body_is_bad_request() {
    let app = test_app();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/owners")
        .header("content-type", "application/json")
        .body(Body::from("{nope"))
        .unwrap();
    let response = app.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_missing_task_is_not_found() {
    let app = test_app();
    let owner_id = app.owner("Ada", "ada@example.com").await;

    let (status, body) = app.call(Method::GET, "/api/tasks/41", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Task not found");

    let (status, _) = app
        .call(
            Method::PUT,
            "/api/tasks/41",
            Some(json!({"name": "x", "owner_id": owner_id})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_tasks_includes_owner_name_and_subtasks() {
    let app = test_app();
    let owner_id = app.owner("Ada", "ada@example.com").await;
    let (_, parent) = app
        .call(
            Method::POST,
            "/api/tasks",
            Some(json!({"name": "Release", "owner_id": owner_id})),
        )
        .await;
    let (status, child) = app
        .call(
            Method::POST,
            "/api/tasks",
            Some(json!({"name": "Changelog", "owner_id": owner_id, "parent_id": parent["id"]})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (_, listed) = app.call(Method::GET, "/api/tasks", None).await;
    let listed = listed.as_array().unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().all(|t| t["owner_name"] == "Ada"));

    let uri = format!("/api/tasks/{}/subtasks", parent["id"]);
    let (status, subtasks) = app.call(Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(subtasks, json!([child]));
}

#[tokio::test]
async fn test_owner_routes() {
    let app = test_app();
    let id = app.owner("Ada", "ada@example.com").await;
    app.owner("Grace", "grace@example.com").await;

    let (status, body) = app
        .call(
            Method::POST,
            "/api/owners",
            Some(json!({"name": "Dup", "email": "ada@example.com"})),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("ada@example.com"));

    let (status, body) = app
        .call(Method::POST, "/api/owners", Some(json!({"name": "No mail"})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Valid email is required");

    let mut rx = app.listener().await;
    let (status, updated) = app
        .call(
            Method::PUT,
            &format!("/api/owners/{id}"),
            Some(json!({"name": "Ada Lovelace", "email": "ada@example.com"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["name"], "Ada Lovelace");
    assert_eq!(next_envelope(&mut rx).unwrap().kind, MessageKind::OwnerUpdated);

    let (_, owners) = app.call(Method::GET, "/api/owners", None).await;
    assert_eq!(owners[0]["name"], "Ada Lovelace");
    assert_eq!(owners[1]["name"], "Grace");

    let (status, _) = app
        .call(
            Method::PUT,
            "/api/owners/99",
            Some(json!({"name": "Nobody", "email": "nobody@example.com"})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_custom_field_routes() {
    let app = test_app();
    let mut rx = app.listener().await;

    let (status, body) = app
        .call(
            Method::POST,
            "/api/custom-fields",
            Some(json!({"name": "Priority", "field_type": "select"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["error"],
        "Options array is required for select/multiselect fields"
    );

    let (status, body) = app
        .call(
            Method::POST,
            "/api/custom-fields",
            Some(json!({"name": "Done", "field_type": "checkbox"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["validTypes"],
        json!(["text", "number", "date", "select", "multiselect"])
    );

    let (status, field) = app
        .call(
            Method::POST,
            "/api/custom-fields",
            Some(json!({"name": "Priority", "field_type": "select", "options": ["low", "high"]})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(
        next_envelope(&mut rx).unwrap().kind,
        MessageKind::CustomFieldCreated
    );

    let uri = format!("/api/custom-fields/{}", field["id"]);
    let (status, updated) = app
        .call(
            Method::PUT,
            &uri,
            Some(json!({"name": "Estimate", "field_type": "number"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["field_type"], "number");
    assert_eq!(
        next_envelope(&mut rx).unwrap().kind,
        MessageKind::CustomFieldUpdated
    );

    let (status, body) = app.call(Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Custom field deleted successfully");
    let deleted = next_envelope(&mut rx).unwrap();
    assert_eq!(deleted.kind, MessageKind::CustomFieldDeleted);
    assert_eq!(deleted.payload, json!({"id": field["id"]}));

    let (status, _) = app.call(Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, listed) = app.call(Method::GET, "/api/custom-fields", None).await;
    assert_eq!(listed, json!([]));
}

#[tokio::test]
async fn test_non_numeric_id_is_bad_request() {
    let app = test_app();
    let (status, body) = app.call(Method::GET, "/api/tasks/abc", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}
