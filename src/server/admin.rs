use super::AppState;
use crate::body::{full_body, json_body};
use bytes::Bytes;
use hyper::body::Incoming;
use hyper::{Request, Response};
use serde_json::json;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn handle_admin(req: Request<Incoming>, state: AppState) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .header("content-type", "application/json")
            .body(json_body(&json!({"status": "ok"})))
            .unwrap()),

        "/ready" | "/readyz" => {
            let snapshot = state.snapshot();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(json_body(&json!({
                    "status": "ready",
                    "registries": snapshot.registries.len(),
                })))
                .unwrap())
        }

        "/metrics" => {
            let body = state.metrics.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(Bytes::from(body)))
                .unwrap())
        }

        _ => Ok(Response::builder()
            .status(404)
            .header("content-type", "application/json")
            .body(json_body(&json!({"error": "not found"})))
            .unwrap()),
    }
}
