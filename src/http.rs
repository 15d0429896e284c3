//! HTTP surface of the gateway. API replies are always `200` with a JSON body;
//! paths that match no API route fall back to files under the web root.

use crate::gateway::{ApiError, DEFAULT_DELAY_SECS, DEFAULT_SWITCH, Gateway, help};
use axum::extract::{Path, Request, State};
use axum::http::{Uri, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use log::debug;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Component, Path as FsPath};
use std::sync::Arc;
use std::time::Instant;

type Gw = State<Arc<Gateway>>;
type Params = Path<HashMap<String, String>>;

/// Verbs that get a syntax error, rather than "invalid command", when their
/// URL does not match a route.
const KNOWN_VERBS: &[&str] = &[
    "device",
    "status",
    "set",
    "turnon",
    "turnoff",
    "delayoff",
    "cloudconfig",
];

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/devices", get(devices))
        .route("/device/{token}", get(device))
        .route("/numdevices", get(num_devices))
        .route("/status/{token}", get(status))
        .route("/set/{token}/{dp}/{value}", get(set_value))
        .route("/turnon/{token}", get(turn_on))
        .route("/turnon/{token}/{switch}", get(turn_on))
        .route("/turnoff/{token}", get(turn_off))
        .route("/turnoff/{token}/{switch}", get(turn_off))
        .route("/delayoff/{token}", get(delay_off))
        .route("/delayoff/{token}/{switch}/{seconds}", get(delay_off))
        .route("/sync", get(sync))
        .route(
            "/cloudconfig/{api_key}/{api_secret}/{api_region}/{api_device_id}",
            get(cloud_config),
        )
        .route("/offline", get(offline))
        .route("/help", get(help_handler))
        .route("/stats", get(stats))
        .fallback(fallback)
        .method_not_allowed_fallback(method_not_allowed)
        .layer(middleware::from_fn(access_log))
        .with_state(gateway)
}

async fn access_log(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let started = Instant::now();
    let response = next.run(req).await;
    debug!(
        "{} {} -> {} in {:?}",
        method,
        uri,
        response.status(),
        started.elapsed()
    );
    response
}

fn param<'a>(params: &'a HashMap<String, String>, name: &str, default: &'a str) -> &'a str {
    params.get(name).map(String::as_str).unwrap_or(default)
}

async fn devices(State(gw): Gw) -> Json<Value> {
    Json(gw.finish(gw.devices()))
}

async fn device(State(gw): Gw, Path(token): Path<String>) -> Json<Value> {
    Json(gw.finish(gw.device(&token)))
}

async fn num_devices(State(gw): Gw) -> Json<Value> {
    Json(gw.finish(gw.num_devices()))
}

async fn status(State(gw): Gw, Path(token): Path<String>) -> Json<Value> {
    let result = gw.status(&token).await;
    Json(gw.finish(result))
}

async fn set_value(
    State(gw): Gw,
    Path((token, dp, value)): Path<(String, String, String)>,
) -> Json<Value> {
    let result = gw.set_value(&token, &dp, &value).await;
    Json(gw.finish(result))
}

async fn turn_on(State(gw): Gw, Path(params): Params) -> Json<Value> {
    let switch = param(&params, "switch", DEFAULT_SWITCH);
    let result = gw.switch(param(&params, "token", ""), switch, true).await;
    Json(gw.finish(result))
}

async fn turn_off(State(gw): Gw, Path(params): Params) -> Json<Value> {
    let switch = param(&params, "switch", DEFAULT_SWITCH);
    let result = gw.switch(param(&params, "token", ""), switch, false).await;
    Json(gw.finish(result))
}

async fn delay_off(State(gw): Gw, Path(params): Params, uri: Uri) -> Json<Value> {
    let result = gw.delay_off(
        param(&params, "token", ""),
        param(&params, "switch", DEFAULT_SWITCH),
        param(&params, "seconds", DEFAULT_DELAY_SECS),
        uri.path(),
    );
    Json(gw.finish(result))
}

async fn sync(State(gw): Gw) -> Json<Value> {
    let result = gw.sync().await;
    Json(gw.finish(result))
}

async fn cloud_config(
    State(gw): Gw,
    Path((api_key, api_secret, api_region, api_device_id)): Path<(String, String, String, String)>,
) -> Json<Value> {
    let result = gw
        .cloud_config(&api_key, &api_secret, &api_region, &api_device_id)
        .await;
    Json(gw.finish(result))
}

async fn offline(State(gw): Gw) -> Json<Value> {
    Json(gw.finish(gw.offline()))
}

async fn help_handler(State(gw): Gw) -> Json<Value> {
    Json(gw.finish(Ok(help())))
}

async fn stats(State(gw): Gw) -> Json<Value> {
    Json(gw.finish(gw.stats_report()))
}

async fn method_not_allowed(State(gw): Gw, uri: Uri) -> Json<Value> {
    Json(gw.finish(Err(ApiError::InvalidCommand {
        url: uri.path().to_string(),
    })))
}

/// Serve a web asset when one exists, otherwise report the bad command.
async fn fallback(State(gw): Gw, uri: Uri) -> Response {
    let path = uri.path();
    if let Some(asset) = static_asset(gw.web_root(), path).await {
        return asset;
    }

    let verb = path.trim_start_matches('/').split('/').next().unwrap_or("");
    let error = if KNOWN_VERBS.contains(&verb) {
        ApiError::Syntax {
            command: verb.to_string(),
            url: path.to_string(),
        }
    } else {
        ApiError::InvalidCommand {
            url: path.to_string(),
        }
    };
    Json(gw.finish(Err(error))).into_response()
}

async fn static_asset(root: &FsPath, uri_path: &str) -> Option<Response> {
    let relative = match uri_path.trim_start_matches('/') {
        "" => "index.html",
        other => other,
    };
    if !FsPath::new(relative)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        debug!("Refusing asset path {}", uri_path);
        return None;
    }
    let body = tokio::fs::read(root.join(relative)).await.ok()?;
    Some(([(header::CONTENT_TYPE, content_type(relative))], body).into_response())
}

fn content_type(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "js" => "text/javascript; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "json" => "application/json; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        _ => "text/plain; charset=utf-8",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::tests::{Fixture, fixture_serving};
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, StatusCode};
    use serde_json::json;
    use tower::ServiceExt;

    fn app(f: &Fixture) -> Router {
        router(f.gateway.clone())
    }

    async fn call(app: Router, method: Method, uri: &str) -> (StatusCode, Option<String>, Vec<u8>) {
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, content_type, body.to_vec())
    }

    async fn get_json(app: Router, uri: &str) -> Value {
        let (status, content_type, body) = call(app, Method::GET, uri).await;
        assert_eq!(status, StatusCode::OK, "{}", uri);
        assert_eq!(content_type.as_deref(), Some("application/json"));
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn unknown_device_is_a_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture_serving(dir.path());
        assert_eq!(
            get_json(app(&f), "/turnoff/unknownid").await,
            json!({"Error": "Device ID not found.", "id": "unknownid"})
        );
        assert!(f.connector.entries().is_empty());
    }

    #[tokio::test]
    async fn set_maps_code_and_coerces_value() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture_serving(dir.path());
        assert_eq!(
            get_json(app(&f), "/set/Plug1/switch_1/true").await,
            json!({"status": "OK"})
        );
        assert_eq!(
            f.connector.entries(),
            vec!["open abc123", "set abc123 1=true", "close abc123"]
        );
    }

    #[tokio::test]
    async fn switch_defaults_and_explicit_switch() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture_serving(dir.path());
        get_json(app(&f), "/turnon/abc123").await;
        get_json(app(&f), "/turnoff/Plug1/3").await;
        let log = f.connector.entries();
        assert!(log.contains(&"set abc123 1=true".to_string()));
        assert!(log.contains(&"set abc123 3=false".to_string()));
    }

    #[tokio::test]
    async fn status_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture_serving(dir.path());
        let status = get_json(app(&f), "/status/Plug1").await;
        assert_eq!(status["dps"]["1"], true);
        assert!(status.get("dps_mapping").is_some());

        assert_eq!(
            get_json(app(&f), "/numdevices").await,
            json!({"found": 1, "registered": 2})
        );
        let devices = get_json(app(&f), "/devices").await;
        assert_eq!(devices["abc123"]["name"], "Plug1");
    }

    #[tokio::test]
    async fn malformed_and_unknown_commands() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture_serving(dir.path());
        assert_eq!(
            get_json(app(&f), "/set/Plug1").await,
            json!({"Error": "Syntax error in set command URL.", "url": "/set/Plug1"})
        );
        assert_eq!(
            get_json(app(&f), "/bogus").await,
            json!({"Error": "Invalid command.", "url": "/bogus"})
        );
        let (_, _, body) = call(app(&f), Method::POST, "/devices").await;
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["Error"], "Invalid command.");
    }

    #[tokio::test]
    async fn serves_web_assets_without_counting_them() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>gateway</h1>").unwrap();
        std::fs::write(dir.path().join("app.js"), "let x = 1;").unwrap();
        let f = fixture_serving(dir.path());

        let (status, content_type, body) = call(app(&f), Method::GET, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("text/html; charset=utf-8"));
        assert_eq!(body, b"<h1>gateway</h1>");

        let (_, content_type, _) = call(app(&f), Method::GET, "/app.js").await;
        assert_eq!(
            content_type.as_deref(),
            Some("text/javascript; charset=utf-8")
        );
        assert_eq!(f.gateway.stats().snapshot().gets, 0);
    }

    #[tokio::test]
    async fn delay_off_acknowledges_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture_serving(dir.path());
        let reply = get_json(app(&f), "/delayoff/Plug1").await;
        assert_eq!(
            reply,
            json!({"OK": "Turning off in 10 seconds.", "url": "/delayoff/Plug1"})
        );
        assert!(f.connector.entries().is_empty());
        assert_eq!(f.gateway.scheduler().len(), 1);
        f.token.cancel();
    }

    #[tokio::test]
    async fn delay_off_needs_both_switch_and_seconds() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture_serving(dir.path());
        assert_eq!(
            get_json(app(&f), "/delayoff/Plug1/2").await,
            json!({"Error": "Syntax error in delayoff command URL.", "url": "/delayoff/Plug1/2"})
        );
        assert!(f.gateway.scheduler().is_empty());

        let reply = get_json(app(&f), "/delayoff/Plug1/2/5").await;
        assert_eq!(reply["OK"], "Turning off in 5 seconds.");
        f.token.cancel();
    }

    #[tokio::test]
    async fn help_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture_serving(dir.path());
        let help = get_json(app(&f), "/help").await;
        assert!(help.as_array().unwrap().len() >= 10);
        get_json(app(&f), "/bogus").await;

        let stats = get_json(app(&f), "/stats").await;
        assert_eq!(stats["gets"], 2);
        assert_eq!(stats["errors"], 1);
    }

    #[test]
    fn content_types_by_extension() {
        assert_eq!(content_type("a/b/style.CSS"), "text/css; charset=utf-8");
        assert_eq!(content_type("logo.png"), "image/png");
        assert_eq!(content_type("LICENSE"), "text/plain; charset=utf-8");
    }
}
