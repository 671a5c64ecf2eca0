use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderValue, Request, header},
    middleware,
    middleware::Next,
    response::IntoResponse,
    routing::get,
};

use super::{AppState, StatusSnapshot};

pub(crate) fn build_status_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/health", get(health))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

async fn banner(State(state): State<AppState>) -> impl IntoResponse {
    format!("{} is running.", state.bot_name)
}

async fn health(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.snapshot())
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::supervisor::tests::FakeTransport;
    use crate::core::supervisor::{ConnectionSupervisor, ReconnectPolicy};
    use axum::http::{Method, StatusCode};
    use std::sync::Arc;
    use std::time::Instant;
    use tower::util::ServiceExt;

    fn state() -> AppState {
        let fake = Arc::new(FakeTransport::default());
        AppState {
            bot_name: "ChatBridge".to_string(),
            booted: Instant::now(),
            supervisors: vec![ConnectionSupervisor::new(
                fake,
                ReconnectPolicy::exponential(),
            )],
        }
    }

    async fn get_path(path: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let app = build_status_router(state());
        let req = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, headers, body.to_vec())
    }

    #[tokio::test]
    async fn root_reports_running() {
        let (status, headers, body) = get_path("/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(String::from_utf8(body).unwrap(), "ChatBridge is running.");
        assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
    }

    #[tokio::test]
    async fn health_lists_transport_status() {
        let (status, _, body) = get_path("/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "running");
        assert!(json["uptime"].is_u64());
        assert!(json["timestamp"].as_str().unwrap().contains('T'));

        let transport = &json["transports"][0];
        assert_eq!(transport["platform"], "whatsapp");
        assert_eq!(transport["state"], "disconnected");
        assert_eq!(transport["healthy"], false);
        assert_eq!(transport["reconnectAttempts"], 0);
        assert_eq!(transport["lastActivity"], "never");
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let (status, _, _) = get_path("/api/agents").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
