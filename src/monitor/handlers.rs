//! 查看接口处理器

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use futures::Stream;
use tokio::sync::mpsc;

use crate::model::record::RecordId;
use crate::notification::Subscription;

use super::capture::CaptureMonitor;
use super::router::MonitorState;
use super::types::{CaptureToggle, RecordListResponse, RecordQuery, RecordSummary};

fn error_response(status: StatusCode, error_type: &str, message: String) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": {"type": error_type, "message": message}
        })),
    )
        .into_response()
}

fn parse_id(id: &str) -> Result<RecordId, Response> {
    id.parse().map_err(|_| {
        error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            format!("无效的记录 ID: {}", id),
        )
    })
}

/// GET /records
pub async fn list_records(
    State(state): State<MonitorState>,
    Query(query): Query<RecordQuery>,
) -> impl IntoResponse {
    let records = state.monitor.query(&query);
    Json(RecordListResponse {
        total: records.len(),
        records: records.iter().map(RecordSummary::from).collect(),
    })
}

/// GET /records/stats
pub async fn get_stats(State(state): State<MonitorState>) -> impl IntoResponse {
    Json(state.monitor.stats())
}

/// GET /records/{id}
pub async fn get_record(
    State(state): State<MonitorState>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.monitor.get_record(&id) {
        Some(record) => Json(record).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            "not_found_error",
            format!("记录不存在: {}", id),
        ),
    }
}

/// DELETE /records/{id}
pub async fn delete_record(
    State(state): State<MonitorState>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    if state.monitor.remove_record(&id) {
        Json(serde_json::json!({"success": true})).into_response()
    } else {
        error_response(
            StatusCode::NOT_FOUND,
            "not_found_error",
            format!("记录不存在: {}", id),
        )
    }
}

/// DELETE /records
pub async fn clear_records(State(state): State<MonitorState>) -> impl IntoResponse {
    let count = state.monitor.clear_all();
    Json(serde_json::json!({
        "success": true,
        "message": format!("已清除 {} 条记录", count)
    }))
}

/// POST /records/purge
pub async fn purge_records(State(state): State<MonitorState>) -> impl IntoResponse {
    let count = state.monitor.apply_preset_filter();
    Json(serde_json::json!({
        "success": true,
        "message": format!("预设过滤已清除 {} 条记录", count)
    }))
}

/// GET /capture
pub async fn get_capture(State(state): State<MonitorState>) -> impl IntoResponse {
    Json(CaptureToggle {
        enabled: state.monitor.is_capture_enabled(),
    })
}

/// PUT /capture
pub async fn set_capture(
    State(state): State<MonitorState>,
    Json(toggle): Json<CaptureToggle>,
) -> impl IntoResponse {
    state.monitor.set_capture_enabled(toggle.enabled);
    Json(toggle)
}

/// 连接断开（事件流被丢弃）时取消订阅
struct SubscriptionGuard(Option<Subscription>);

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(subscription) = self.0.take() {
            subscription.unsubscribe();
        }
    }
}

/// GET /events
///
/// 每次（防抖后的）变更通知推送一条 `changed` 事件，数据为当前统计
pub async fn record_events(
    State(state): State<MonitorState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::unbounded_channel::<()>();
    let subscription = state.monitor.subscribe(move || {
        let _ = tx.send(());
    });
    let guard = SubscriptionGuard(Some(subscription));
    tracing::debug!("查看端已订阅变更事件");

    let stream = futures::stream::unfold(
        (rx, guard, state.monitor.clone()),
        |(mut rx, guard, monitor): (_, SubscriptionGuard, Arc<CaptureMonitor>)| async move {
            rx.recv().await?;
            let event = Event::default()
                .event("changed")
                .json_data(monitor.stats())
                .unwrap_or_else(|e| {
                    tracing::error!("序列化变更事件失败: {}", e);
                    Event::default().event("changed")
                });
            Some((Ok(event), (rx, guard, monitor)))
        },
    );

    Sse::new(stream).keep_alive(KeepAlive::default())
}
