use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use rapport_api::auth::AppStateInner;
use rapport_db::Database;
use rapport_gateway::dispatcher::Dispatcher;

fn app() -> Router {
    let state = Arc::new(AppStateInner {
        db: Database::open_in_memory().unwrap(),
        jwt_secret: "integration-test-secret".into(),
        dispatcher: Dispatcher::default(),
    });
    rapport_api::router(state)
}

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn register(app: &Router, username: &str) -> (String, String) {
    let (status, body) = call(
        app,
        Method::POST,
        "/auth/register",
        None,
        Some(json!({ "username": username, "password": "correct horse battery" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    (
        body["user_id"].as_str().unwrap().to_string(),
        body["token"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn direct_message_read_on_view_and_reaction_toggle() {
    let app = app();
    let (_alice_id, alice) = register(&app, "alice").await;
    let (bob_id, bob) = register(&app, "bob").await;

    let (status, conversation) = call(
        &app,
        Method::POST,
        "/conversations",
        Some(&alice),
        Some(json!({ "type": "direct", "participant_ids": [bob_id] })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let conversation_id = conversation["id"].as_str().unwrap().to_string();

    // Same pair again returns the same conversation without creating one.
    let (status, again) = call(
        &app,
        Method::POST,
        "/conversations",
        Some(&bob),
        Some(json!({ "type": "direct", "participant_ids": [conversation["created_by"]] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["id"], conversation["id"]);

    let (status, message) = call(
        &app,
        Method::POST,
        "/messages/send",
        Some(&alice),
        Some(json!({ "conversation_id": conversation_id, "content": "hello" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let message_id = message["id"].as_str().unwrap().to_string();

    let (_, fetched) = call(
        &app,
        Method::GET,
        &format!("/conversations/{}", conversation_id),
        Some(&bob),
        None,
    )
    .await;
    assert_eq!(fetched["last_message_preview"], "hello");
    assert_eq!(fetched["participants"].as_array().unwrap().len(), 2);

    // Alice viewing her own message leaves no receipt.
    let (_, listed) = call(
        &app,
        Method::GET,
        &format!("/conversations/{}/messages", conversation_id),
        Some(&alice),
        None,
    )
    .await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
    let (_, receipts) = call(
        &app,
        Method::GET,
        &format!("/messages/{}/read-by", message_id),
        Some(&alice),
        None,
    )
    .await;
    assert!(receipts.as_array().unwrap().is_empty());

    // Bob viewing it creates his receipt.
    let (_, unread) = call(
        &app,
        Method::GET,
        &format!("/conversations/{}/unread", conversation_id),
        Some(&bob),
        None,
    )
    .await;
    assert_eq!(unread["unread_count"], 1);

    let (status, listed) = call(
        &app,
        Method::GET,
        &format!("/conversations/{}/messages?limit=20", conversation_id),
        Some(&bob),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed[0]["content"], "hello");
    assert_eq!(listed[0]["sender"]["handle"], "alice");

    let (_, receipts) = call(
        &app,
        Method::GET,
        &format!("/messages/{}/read-by", message_id),
        Some(&alice),
        None,
    )
    .await;
    assert_eq!(receipts.as_array().unwrap().len(), 1);
    assert_eq!(receipts[0]["user"]["id"], bob_id);

    // React twice with the same emoji.
    let react = format!("/messages/{}/react", message_id);
    let (_, first) = call(&app, Method::POST, &react, Some(&alice), Some(json!({ "emoji": "👍" }))).await;
    assert_eq!(first["action"], "added");
    assert_eq!(first["reactions"]["👍"].as_array().unwrap().len(), 1);

    let (_, second) = call(&app, Method::POST, &react, Some(&alice), Some(json!({ "emoji": "👍" }))).await;
    assert_eq!(second["action"], "removed");
    assert_eq!(second["reactions"], json!({}));
}

#[tokio::test]
async fn edits_and_deletes_follow_ownership() {
    let app = app();
    let (_, alice) = register(&app, "alice").await;
    let (bob_id, bob) = register(&app, "bob").await;

    let (_, conversation) = call(
        &app,
        Method::POST,
        "/conversations",
        Some(&alice),
        Some(json!({ "type": "direct", "participant_ids": [bob_id] })),
    )
    .await;
    let (_, message) = call(
        &app,
        Method::POST,
        "/messages/send",
        Some(&alice),
        Some(json!({ "conversation_id": conversation["id"], "content": "typo" })),
    )
    .await;
    let uri = format!("/messages/{}", message["id"].as_str().unwrap());

    let (status, body) = call(&app, Method::PATCH, &uri, Some(&bob), Some(json!({ "content": "hijack" }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");

    let (status, edited) = call(&app, Method::PATCH, &uri, Some(&alice), Some(json!({ "content": "fixed" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(edited["edited"], true);

    let (status, deleted) = call(&app, Method::DELETE, &uri, Some(&alice), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deleted["content"], Value::Null);

    let (status, body) = call(&app, Method::PATCH, &uri, Some(&alice), Some(json!({ "content": "again" }))).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["error"], "message_deleted");
}

#[tokio::test]
async fn protected_routes_need_a_token() {
    let app = app();
    let (status, body) = call(&app, Method::GET, "/conversations", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthenticated");

    let (status, _) = call(&app, Method::GET, "/conversations", Some("not-a-jwt"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn outsiders_cannot_read_or_type() {
    let app = app();
    let (_, alice) = register(&app, "alice").await;
    let (bob_id, _) = register(&app, "bob").await;
    let (_, eve) = register(&app, "eve").await;

    let (_, conversation) = call(
        &app,
        Method::POST,
        "/conversations",
        Some(&alice),
        Some(json!({ "type": "direct", "participant_ids": [bob_id] })),
    )
    .await;
    let id = conversation["id"].as_str().unwrap();

    let (status, body) = call(&app, Method::GET, &format!("/conversations/{}/messages", id), Some(&eve), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "not_a_participant");

    let (status, _) = call(&app, Method::POST, &format!("/conversations/{}/typing", id), Some(&eve), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, marker) = call(&app, Method::POST, &format!("/conversations/{}/typing", id), Some(&alice), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(marker["user"]["handle"], "alice");

    let (status, _) = call(&app, Method::DELETE, &format!("/conversations/{}/typing", id), Some(&alice), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn duplicate_usernames_conflict() {
    let app = app();
    register(&app, "alice").await;
    let (status, body) = call(
        &app,
        Method::POST,
        "/auth/register",
        None,
        Some(json!({ "username": "alice", "password": "another password" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "conflict");
}
