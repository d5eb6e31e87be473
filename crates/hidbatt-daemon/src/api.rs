//! REST API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use hidbatt_core::DeviceId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::state::AppState;

/// API error response
#[derive(Serialize)]
struct ApiError {
    error: String,
}

impl ApiError {
    fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}

fn error_response(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ApiError::new(msg))).into_response()
}

fn parse_id(raw: &str) -> Result<DeviceId, Response> {
    raw.parse::<DeviceId>().map_err(|e| {
        error_response(StatusCode::BAD_REQUEST, format!("Invalid device id: {}", e))
    })
}

/// List all devices, stubs included
pub async fn list_devices(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.devices().await)
}

/// Get a specific device by ID
pub async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.registry.get(&id).await {
        Some(device) => Json(device).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Device not found"),
    }
}

/// Selection request body
#[derive(Deserialize)]
pub struct SelectRequest {
    selected: bool,
}

/// Toggle and persist the selection flag of a device
pub async fn select_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<SelectRequest>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    if !state.registry.set_selected(&id, req.selected).await {
        return error_response(StatusCode::NOT_FOUND, "Device not found");
    }
    info!(device = %id, selected = req.selected, "Selection changed");

    match state.registry.get(&id).await {
        Some(device) => Json(device).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Device not found"),
    }
}

/// Ask the G HUB session to forget its devices and list them again
pub async fn rescan(State(state): State<Arc<AppState>>) -> Response {
    let Some(ghub) = &state.ghub else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "G HUB source is disabled");
    };

    if ghub.rescan().await {
        info!("Rescan requested");
        (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "rescan requested" })),
        )
            .into_response()
    } else {
        error_response(StatusCode::SERVICE_UNAVAILABLE, "G HUB session has stopped")
    }
}

#[cfg(test)]
mod tests {
    use crate::server::router;
    use crate::state::tests::{mouse_init, offline_state};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    async fn call(app: axum::Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_list_and_get_devices() {
        let state = offline_state(Vec::new()).await;
        state
            .registry
            .apply(mouse_init("4a1b2c3d", "MX Master 3"))
            .await;
        let app = router(state);

        let (status, body) = call(app.clone(), get("/api/devices")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["id"], "native:4a1b2c3d");

        let (status, body) = call(app.clone(), get("/api/devices/native:4a1b2c3d")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "MX Master 3");
        assert_eq!(body["battery_percent"], -1);

        let (status, _) = call(app.clone(), get("/api/devices/native:ffffffff")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(app, get("/api/devices/bluetooth:1")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("Invalid device id"));
    }

    #[tokio::test]
    async fn test_select_device() {
        let state = offline_state(Vec::new()).await;
        state
            .registry
            .apply(mouse_init("4a1b2c3d", "MX Master 3"))
            .await;
        let app = router(state.clone());

        let (status, body) = call(
            app.clone(),
            post_json(
                "/api/devices/native:4a1b2c3d/select",
                serde_json::json!({ "selected": true }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["selected"], true);

        let (status, _) = call(
            app,
            post_json(
                "/api/devices/native:00000000/select",
                serde_json::json!({ "selected": true }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_rescan_without_ghub() {
        let state = offline_state(Vec::new()).await;
        let (status, body) = call(
            router(state),
            Request::post("/api/rescan").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "G HUB source is disabled");
    }
}
