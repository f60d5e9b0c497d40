//! API layer -- axum routes, handlers, and middleware.

mod routes;
pub mod state;

use self::state::AppState;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

/// Build the application router: the REST API plus the control socket.
pub fn router(state: AppState) -> Router {
    let ws_path = state.ws_path.clone();
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .route(&ws_path, get(routes::control_socket))
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn fallback() -> (axum::http::StatusCode, &'static str) {
    (axum::http::StatusCode::NOT_FOUND, "not found")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::config::{PayloadFill, TestConfig};
    use crate::control::ControlContext;
    use crate::throughput::payload::PayloadGenerator;

    fn state() -> AppState {
        let control = ControlContext {
            test: TestConfig::default(),
            bulk_target: "127.0.0.1:3001".parse().unwrap(),
            generator: Arc::new(PayloadGenerator::new(1024, PayloadFill::Zero)),
        };
        AppState::new(control, "/ws")
    }

    async fn get(uri: &str) -> axum::response::Response {
        router(state())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let resp = get("/api/v1/health").await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["data"]["status"], "ok");
        assert_eq!(json["data"]["version"], env!("CARGO_PKG_VERSION"));
        assert!(json["meta"]["timestamp"].is_string());
        assert_eq!(json["meta"]["strategy"], "pull");
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let resp = get("/api/v1/nope").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_control_path_requires_upgrade() {
        let resp = get("/ws").await;
        assert!(resp.status().is_client_error());
        assert_ne!(resp.status(), StatusCode::NOT_FOUND);
    }
}
