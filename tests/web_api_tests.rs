//! Integration tests for the virtual panel web API.
//!
//! These tests drive the controller through the HTTP endpoints and check
//! what reaches the mock link.

#![cfg(feature = "web")]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt;

use rs_knobcab::config::ThrottleConfig;
use rs_knobcab::hal::{LinkCommand, MockLink};
use rs_knobcab::jmri_json::{JmriJsonClient, JsonClientOptions};
use rs_knobcab::services::{build_router, WebServerConfig, WebState};
use rs_knobcab::{AddressType, LocoAddress, Roster, RosterEntry, ThrottleController};

fn create_test_app() -> (axum::Router, Arc<MockLink>, Arc<ThrottleController<MockLink>>) {
    let link = Arc::new(MockLink::new());
    let controller = Arc::new(ThrottleController::new(
        Arc::clone(&link),
        &ThrottleConfig::default(),
    ));
    let power = Arc::new(JmriJsonClient::new(JsonClientOptions::default(), "main"));
    let state = Arc::new(WebState::new(Arc::clone(&controller), power));
    let router = build_router(state, &WebServerConfig::default());
    (router, link, controller)
}

async fn send(app: &axum::Router, method: &str, uri: &str, body: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_owned()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

async fn load_roster(controller: &ThrottleController<MockLink>) {
    let (roster, _) = Roster::from_entries([
        RosterEntry::new("LocoA", 3, AddressType::Short),
        RosterEntry::new("LocoB", 40, AddressType::Long),
    ]);
    controller.on_roster(roster).await.unwrap();
}

#[tokio::test]
async fn test_list_throttles() {
    let (app, _link, _controller) = create_test_app();

    let (status, json) = send(&app, "GET", "/api/throttles", "").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    let throttles = json["data"].as_array().unwrap();
    assert_eq!(throttles.len(), 4);
    assert_eq!(throttles[0]["state"], "unallocated");
    assert_eq!(throttles[0]["speed"], 0);
    assert_eq!(throttles[0]["direction"], "forward");
}

#[tokio::test]
async fn test_touch_browse_press_rotate() {
    let (app, link, controller) = create_test_app();
    load_roster(&controller).await;

    let (status, json) = send(&app, "POST", "/api/throttles/1/touch", r#"{"knob": 0}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["result"], "assigned");
    assert_eq!(json["data"]["knob"], "selecting");

    let (_, json) = send(&app, "POST", "/api/knobs/0/rotate", r#"{"delta": 1}"#).await;
    assert_eq!(json["data"]["index"], 1);

    let (_, json) = send(&app, "GET", "/api/selection", "").await;
    assert_eq!(json["data"]["active"], true);
    assert_eq!(json["data"]["entry"]["name"], "LocoB");

    let (_, json) = send(&app, "POST", "/api/knobs/0/press", "").await;
    assert_eq!(json["data"]["result"], "acquired");

    let (_, json) = send(&app, "POST", "/api/knobs/0/rotate", r#"{"delta": 3}"#).await;
    assert_eq!(json["data"]["speed"], 12);

    assert_eq!(
        link.commands(),
        vec![
            LinkCommand::Acquire(1, LocoAddress::long(40)),
            LinkCommand::Speed(1, 12),
        ]
    );
}

#[tokio::test]
async fn test_release_endpoint() {
    let (app, link, controller) = create_test_app();
    load_roster(&controller).await;
    controller.on_knob_touch(0, 1).await.unwrap();
    controller.on_knob_press(1).await.unwrap();
    link.take_commands();

    let (status, json) = send(&app, "POST", "/api/throttles/0/release", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["result"], "released");
    assert_eq!(json["data"]["knob"], 1);
    assert_eq!(link.commands(), vec![LinkCommand::Release(0)]);
}

#[tokio::test]
async fn test_function_toggle_and_set() {
    let (app, link, controller) = create_test_app();
    load_roster(&controller).await;
    controller.on_knob_touch(2, 0).await.unwrap();
    controller.on_knob_press(0).await.unwrap();
    link.take_commands();

    let (status, json) = send(&app, "POST", "/api/throttles/2/functions/0", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"], true);

    let (_, json) = send(&app, "POST", "/api/throttles/2/functions/0", r#"{"on": false}"#).await;
    assert_eq!(json["data"], false);

    let (_, json) = send(&app, "GET", "/api/throttles/2/functions", "").await;
    assert_eq!(json["data"].as_array().unwrap().len(), 29);

    assert_eq!(
        link.commands(),
        vec![LinkCommand::Function(2, 0, true), LinkCommand::Function(2, 0, false)]
    );
}

#[tokio::test]
async fn test_function_on_empty_throttle_conflicts() {
    let (app, _link, _controller) = create_test_app();
    let (status, json) = send(&app, "POST", "/api/throttles/0/functions/1", "{}").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["success"], false);
}

#[tokio::test]
async fn test_invalid_requests() {
    let (app, _link, _controller) = create_test_app();

    let (status, json) = send(&app, "POST", "/api/knobs/0/rotate", "not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "invalid parameter: Invalid rotate request");

    let (status, _) = send(&app, "GET", "/api/throttles/7", "").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, "POST", "/api/knobs/5/press", "").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_power_without_connection() {
    let (app, _link, _controller) = create_test_app();

    let (status, json) = send(&app, "GET", "/api/power", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["name"], "main");
    assert_eq!(json["data"]["state"], "unknown");
    assert_eq!(json["data"]["connection"], "disconnected");

    let (status, json) = send(&app, "POST", "/api/power", r#"{"on": true}"#).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["success"], false);
}

#[tokio::test]
async fn test_not_found() {
    let (app, _link, _controller) = create_test_app();
    let (status, json) = send(&app, "GET", "/nope", "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "Not found");
}
