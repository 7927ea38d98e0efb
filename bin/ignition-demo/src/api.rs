//! HTTP APIs served by the demo.

use std::time::Instant;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

/// Builds the public API.
pub fn public_router() -> Router {
    Router::new()
        .route("/", get(|| async { "Hello from ignition!" }))
        .route("/health", get(|| async { "ok" }))
}

#[derive(Serialize)]
struct StatusResponse {
    version: &'static str,
    uptime_secs: u64,
}

async fn status(State(started): State<Instant>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: started.elapsed().as_secs(),
    })
}

/// Builds the admin API.
pub fn admin_router(started: Instant) -> Router {
    Router::new().route("/status", get(status)).with_state(started)
}

#[cfg(test)]
mod tests {
    use http::{Request, StatusCode};
    use http_body_util::BodyExt as _;
    use tower::ServiceExt as _;

    use super::*;

    async fn get_body(router: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = router
            .oneshot(Request::get(uri).body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn public_routes() {
        let (status, body) = get_body(public_router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");

        let (status, _) = get_body(public_router(), "/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn admin_status_reports_version() {
        let (status, body) = get_body(admin_router(Instant::now()), "/status").await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(json["uptime_secs"], 0);
    }
}
