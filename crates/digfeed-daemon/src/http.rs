use crate::logs::LogRing;
use crate::session::{FeedSession, SessionSnapshot};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use digfeed_engine::window::{PositionOutOfRange, WindowSnapshot};
use digfeed_engine::FeedError;
use digfeed_proto::protocol::CatalogFilter;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
pub struct HttpState {
    pub session: Arc<FeedSession>,
    pub logs: Arc<LogRing>,
}

#[derive(Serialize)]
struct SessionStarted {
    generation: u64,
}

#[derive(Serialize)]
struct ApiError {
    error: &'static str,
    message: String,
}

#[derive(Serialize)]
struct LogLines {
    lines: Vec<String>,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/feed/catalog", post(start_catalog))
        .route("/api/feed/channels", post(start_channels))
        .route("/api/feed/stop", post(stop))
        .route("/api/feed/next", get(next_record))
        .route("/api/window/position/:idx", post(set_position))
        .route("/api/window/ended/:idx", post(playback_ended))
        .route("/api/logs", get(get_logs))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
}

pub fn start_server(bind_address: String, port: u16, state: HttpState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn get_state(State(state): State<HttpState>) -> Json<SessionSnapshot> {
    Json(state.session.snapshot().await)
}

async fn start_catalog(
    State(state): State<HttpState>,
    Json(filter): Json<CatalogFilter>,
) -> Json<SessionStarted> {
    info!("HTTP API: Start catalog feed {}", filter.key());
    let generation = state.session.start_catalog(filter).await;
    Json(SessionStarted { generation })
}

async fn start_channels(State(state): State<HttpState>) -> Response {
    info!("HTTP API: Start channel feed");
    match state.session.start_channels().await {
        Ok(generation) => Json(SessionStarted { generation }).into_response(),
        Err(e) => {
            let status = match e {
                FeedError::SourcesUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_GATEWAY,
            };
            error!("Channel feed unavailable: {}", e);
            let body = ApiError {
                error: e.as_str(),
                message: e.to_string(),
            };
            (status, Json(body)).into_response()
        }
    }
}

async fn stop(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Stop");
    state.session.stop().await;
    StatusCode::OK
}

async fn next_record(State(state): State<HttpState>) -> Response {
    match state.session.next_record().await {
        Some(record) => Json(record).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn set_position(State(state): State<HttpState>, Path(idx): Path<usize>) -> Response {
    window_response(state.session.set_position(idx).await)
}

async fn playback_ended(State(state): State<HttpState>, Path(idx): Path<usize>) -> Response {
    info!("HTTP API: Playback ended at {}", idx);
    window_response(state.session.playback_ended(idx).await)
}

fn window_response(result: Result<WindowSnapshot, PositionOutOfRange>) -> Response {
    match result {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => {
            let body = ApiError {
                error: "position_out_of_range",
                message: e.to_string(),
            };
            (StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response()
        }
    }
}

async fn get_logs(State(state): State<HttpState>) -> Json<LogLines> {
    Json(LogLines {
        lines: state.logs.lines(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use digfeed_proto::config::Config;
    use digfeed_proto::state::FeedStore;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn app() -> (Router, Arc<LogRing>) {
        let session = FeedSession::new(&Config::default(), Arc::new(FeedStore::in_memory()))
            .await
            .unwrap();
        let logs = Arc::new(LogRing::new(10));
        let state = HttpState {
            session: Arc::new(session),
            logs: Arc::clone(&logs),
        };
        (router(state), logs)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_state_reports_idle_session() {
        let (app, _) = app().await;
        let response = app
            .oneshot(Request::builder().uri("/api/state").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["pipeline_state"], "idle");
        assert_eq!(json["generation"], 0);
        assert!(json["criteria"].is_null());
    }

    #[tokio::test]
    async fn test_next_on_idle_pipeline_is_no_content() {
        let (app, _) = app().await;
        let response = app
            .oneshot(Request::builder().uri("/api/feed/next").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_channels_without_sources_is_503() {
        let (app, _) = app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/feed/channels")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["error"], "sources_unavailable");
    }

    #[tokio::test]
    async fn test_catalog_rejects_malformed_filter() {
        let (app, _) = app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/feed/catalog")
                    .header("content-type", "application/json")
                    .body(Body::from("{\"genre\": 42}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_position_beyond_feed_is_422() {
        let (app, _) = app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/window/position/{}", usize::MAX))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = body_json(response).await;
        assert_eq!(json["error"], "position_out_of_range");
    }

    #[tokio::test]
    async fn test_logs_are_served() {
        let (app, logs) = app().await;
        logs.push("12:00:00 [WARN] [retry] page failed".into());
        let response = app
            .oneshot(Request::builder().uri("/api/logs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["lines"][0], "12:00:00 [WARN] [retry] page failed");
    }
}
