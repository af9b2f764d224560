//! 查看接口请求/响应类型

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::record::{CaptureRecord, RecordId, RecordKind, RecordStatus};

/// 排序字段
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
    #[default]
    Time,
    Size,
    Duration,
}

/// 排序方向
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// 查询过滤器
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordQuery {
    pub kind: Option<RecordKind>,
    pub status: Option<RecordStatus>,
    /// URL 关键字（不区分大小写）
    pub search: Option<String>,
    #[serde(default)]
    pub sort: SortField,
    #[serde(default)]
    pub order: SortOrder,
}

impl RecordQuery {
    pub fn matches(&self, record: &CaptureRecord) -> bool {
        if self.kind.is_some_and(|kind| kind != record.kind) {
            return false;
        }
        if self.status.is_some_and(|status| status != record.status) {
            return false;
        }
        match self.search.as_deref().map(str::trim) {
            Some(term) if !term.is_empty() => record
                .url
                .to_lowercase()
                .contains(&term.to_lowercase()),
            _ => true,
        }
    }
}

/// 列表响应
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordListResponse {
    pub total: usize,
    pub records: Vec<RecordSummary>,
}

/// 单条记录摘要
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSummary {
    pub id: RecordId,
    pub kind: RecordKind,
    pub status: RecordStatus,
    pub method: String,
    pub url: String,
    pub started_at: String,
    pub duration_ms: Option<i64>,
    pub size_bytes: Option<u64>,
    pub response_status: Option<u16>,
    pub message_count: usize,
    pub error: Option<String>,
}

impl From<&CaptureRecord> for RecordSummary {
    fn from(record: &CaptureRecord) -> Self {
        Self {
            id: record.id,
            kind: record.kind,
            status: record.status,
            method: record.method.clone(),
            url: record.url.clone(),
            started_at: record.started_at.to_rfc3339(),
            duration_ms: record.duration().map(|d| d.num_milliseconds()),
            size_bytes: record.size_bytes,
            response_status: record.response_status,
            message_count: record.messages.len(),
            error: record.error.clone(),
        }
    }
}

/// 统计响应
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordStatsResponse {
    pub count: usize,
    pub total_size_bytes: u64,
    /// 所有记录序列化后的字符数
    pub total_chars: usize,
    pub streaming_count: usize,
    pub error_count: usize,
    pub by_kind: BTreeMap<String, usize>,
}

/// 抓包开关
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureToggle {
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: RecordKind, url: &str) -> CaptureRecord {
        CaptureRecord::new(kind, "GET", url, Default::default(), None, "N/A")
    }

    #[test]
    fn test_query_matches_kind_and_search() {
        let query = RecordQuery {
            kind: Some(RecordKind::Socket),
            search: Some("  CHAT ".to_string()),
            ..Default::default()
        };
        assert!(query.matches(&record(RecordKind::Socket, "wss://example.com/chat")));
        assert!(!query.matches(&record(RecordKind::Http, "https://example.com/chat")));
        assert!(!query.matches(&record(RecordKind::Socket, "wss://example.com/feed")));
    }

    #[test]
    fn test_query_deserialize() {
        let query: RecordQuery =
            serde_json::from_str(r#"{"kind":"server-push","sort":"size","order":"asc"}"#).unwrap();
        assert_eq!(query.kind, Some(RecordKind::ServerPush));
        assert_eq!(query.sort, SortField::Size);
        assert_eq!(query.order, SortOrder::Asc);

        let empty: RecordQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.sort, SortField::Time);
        assert_eq!(empty.order, SortOrder::Desc);
        assert!(empty.matches(&record(RecordKind::Http, "https://x")));
    }
}
