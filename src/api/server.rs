//! Axum server setup and configuration

use crate::api::routes;
use crate::api::ws::ws_handler;
use crate::services::Runner;
use axum::{
    http::{header, Method},
    routing::get,
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<Runner>,
}

impl AppState {
    pub fn new(runner: Arc<Runner>) -> Self {
        Self { runner }
    }
}

/// Create the Axum application with all routes
pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    let api_routes = Router::new()
        .route("/dashboard", get(routes::dashboard::get_dashboard))
        .route("/alerts/recent", get(routes::dashboard::recent_alerts))
        .route("/wallets/:wallet", get(routes::wallets::get_wallet));

    Router::new()
        .nest("/api", api_routes)
        .route("/ws", get(ws_handler))
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::services::LogSink;
    use crate::storage::BlobStorage;
    use crate::venue::StaticVenue;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn app() -> Router {
        let runner = Runner::new(
            Config::default(),
            Arc::new(BlobStorage::disabled()),
            Arc::new(StaticVenue::new()),
            vec![Arc::new(LogSink)],
        );
        create_app(AppState::new(Arc::new(runner)))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let (status, _) = get(app(), "/health").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_dashboard_snapshot() {
        let (status, json) = get(app(), "/api/dashboard").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total_alerts"], 0);
        assert_eq!(json["hourly"].as_array().unwrap().len(), 24);
    }

    #[tokio::test]
    async fn test_wallet_lookup() {
        let (status, json) = get(app(), "/api/wallets/0xABCDEFabcdef0000000000000000000000000000").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["wallet"], "0xabcdefabcdef0000000000000000000000000000");
        assert_eq!(json["copy_count"], 0);

        let (status, _) = get(app(), "/api/wallets/not-a-wallet").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_recent_alerts_empty() {
        let (status, json) = get(app(), "/api/alerts/recent?limit=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["alerts"].as_array().unwrap().len(), 0);
    }
}
