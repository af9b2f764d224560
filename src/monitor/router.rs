//! 查看接口路由

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json},
    routing::{get, post},
};

use crate::common::auth;

use super::capture::CaptureMonitor;
use super::handlers::{
    clear_records, delete_record, get_capture, get_record, get_stats, list_records,
    purge_records, record_events, set_capture,
};

/// 查看接口状态
#[derive(Clone)]
pub struct MonitorState {
    /// 未配置时接口不做认证
    pub admin_api_key: Option<String>,
    pub monitor: Arc<CaptureMonitor>,
}

/// 查看接口认证中间件
async fn monitor_auth_middleware(
    State(state): State<MonitorState>,
    request: Request<Body>,
    next: Next,
) -> axum::response::Response {
    let Some(expected) = state.admin_api_key.as_deref() else {
        return next.run(request).await;
    };
    match auth::extract_api_key(&request) {
        Some(key) if auth::constant_time_eq(&key, expected) => next.run(request).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "error": {"type": "authentication_error", "message": "Invalid API key"}
            })),
        )
            .into_response(),
    }
}

/// 创建查看接口路由
///
/// 返回 Router<()>，可直接 nest 到主应用
pub fn create_monitor_router(admin_api_key: Option<String>, monitor: Arc<CaptureMonitor>) -> Router {
    let state = MonitorState {
        admin_api_key,
        monitor,
    };

    Router::new()
        .route("/records", get(list_records).delete(clear_records))
        .route("/records/stats", get(get_stats))
        .route("/records/purge", post(purge_records))
        .route("/records/{id}", get(get_record).delete(delete_record))
        .route("/capture", get(get_capture).put(set_capture))
        .route("/events", get(record_events))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            monitor_auth_middleware,
        ))
        .with_state(state)
}

/// CORS 中间件层
pub fn cors_layer() -> tower_http::cors::CorsLayer {
    use tower_http::cors::{Any, CorsLayer};

    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::Config;
    use crate::model::record::{CaptureRecord, RecordKind};
    use axum::http::Method;
    use tower::ServiceExt;

    fn monitor() -> Arc<CaptureMonitor> {
        CaptureMonitor::new(Config {
            debounce_ms: 10,
            ..Config::default()
        })
        .unwrap()
    }

    fn request(method: Method, uri: &str, key: Option<&str>, body: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header("x-api-key", key);
        }
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_rejects_missing_key_when_configured() {
        let app = create_monitor_router(Some("secret".to_string()), monitor());
        let response = app
            .clone()
            .oneshot(request(Method::GET, "/records", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(request(Method::GET, "/records", Some("secret"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_list_get_delete_record() {
        let m = monitor();
        let id = m.insert_record(CaptureRecord::new(
            RecordKind::Http,
            "GET",
            "https://api.test/a",
            Default::default(),
            None,
            "N/A",
        ));
        let app = create_monitor_router(None, m.clone());

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/records?kind=http", None, None))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["records"][0]["url"], "https://api.test/a");

        let uri = format!("/records/{}", id);
        let response = app
            .clone()
            .oneshot(request(Method::GET, &uri, None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["method"], "GET");

        let response = app
            .clone()
            .oneshot(request(Method::DELETE, &uri, None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(m.list_records().is_empty());

        let response = app
            .clone()
            .oneshot(request(Method::GET, &uri, None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(request(Method::GET, "/records/not-a-uuid", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_capture_toggle_and_stats() {
        let m = monitor();
        let app = create_monitor_router(None, m.clone());

        let response = app
            .clone()
            .oneshot(request(Method::PUT, "/capture", None, Some(r#"{"enabled":false}"#)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!m.is_capture_enabled());

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/capture", None, None))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["enabled"], false);

        let response = app
            .oneshot(request(Method::GET, "/records/stats", None, None))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["count"], 0);
    }
}
