//! 抓包记录数据模型
//!
//! 字段名即导出契约：序列化时保持 camelCase 字段名不变，下游工具依赖这些字段。

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 记录唯一 ID（创建时分配，永不复用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// 记录类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordKind {
    Http,
    ServerPush,
    Socket,
}

impl RecordKind {
    /// 唯一允许的类型转换：http → server-push
    pub fn confirm_streaming(self) -> Self {
        match self {
            RecordKind::Http => RecordKind::ServerPush,
            other => other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Http => "http",
            RecordKind::ServerPush => "server-push",
            RecordKind::Socket => "socket",
        }
    }
}

impl std::str::FromStr for RecordKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(RecordKind::Http),
            "server-push" | "sse" => Ok(RecordKind::ServerPush),
            "socket" | "wss" | "ws" => Ok(RecordKind::Socket),
            other => anyhow::bail!("未知的记录类型: {}", other),
        }
    }
}

/// 响应类型判定：根据 content-type 单向地从"假定为 HTTP"转换到"已确认为流"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamDetection {
    #[default]
    AssumedHttp,
    ConfirmedStreaming,
}

impl StreamDetection {
    /// 检查响应头；返回 true 表示本次调用完成了转换（至多发生一次）
    pub fn inspect(&mut self, content_type: Option<&str>) -> bool {
        match self {
            StreamDetection::ConfirmedStreaming => false,
            StreamDetection::AssumedHttp => {
                if content_type.is_some_and(is_event_stream) {
                    *self = StreamDetection::ConfirmedStreaming;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, StreamDetection::ConfirmedStreaming)
    }
}

/// content-type 是否表示连续事件流
pub fn is_event_stream(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains("text/event-stream")
}

/// 记录状态：pending → streaming → complete | error，终态不可离开
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Streaming,
    Complete,
    Error,
}

impl RecordStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordStatus::Complete | RecordStatus::Error)
    }

    pub fn can_transition_to(&self, next: RecordStatus) -> bool {
        match (self, next) {
            (RecordStatus::Pending, RecordStatus::Streaming) => true,
            (RecordStatus::Pending | RecordStatus::Streaming, RecordStatus::Complete) => true,
            (RecordStatus::Pending | RecordStatus::Streaming, RecordStatus::Error) => true,
            _ => false,
        }
    }
}

/// 流消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Data,
    End,
    Raw,
    Sent,
    Received,
    System,
}

/// 流中的一条消息（事件流帧或 socket 帧）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMessage {
    pub kind: MessageKind,
    pub raw_line: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decoded_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decoded_envelope: Option<serde_json::Value>,
}

impl StreamMessage {
    pub fn new(kind: MessageKind, raw_line: impl Into<String>) -> Self {
        Self {
            kind,
            raw_line: raw_line.into(),
            decoded_content: None,
            decoded_envelope: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(MessageKind::System, text)
    }

    pub fn sent(payload: impl Into<String>) -> Self {
        Self::new(MessageKind::Sent, payload)
    }

    pub fn received(payload: impl Into<String>) -> Self {
        Self::new(MessageKind::Received, payload)
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.decoded_content = Some(content.into());
        self
    }

    pub fn with_envelope(mut self, envelope: serde_json::Value) -> Self {
        self.decoded_envelope = Some(envelope);
        self
    }
}

/// 捕获到的请求/响应体
///
/// 能解析为 JSON 的响应体保存为 JSON 值，其余保存为文本
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CapturedBody {
    Json(serde_json::Value),
    Text(String),
}

impl CapturedBody {
    /// 按文本保存（非 UTF-8 字节有损替换）
    pub fn text(bytes: &[u8]) -> Self {
        CapturedBody::Text(String::from_utf8_lossy(bytes).into_owned())
    }

    /// 优先按 JSON 解析，失败时回退为文本
    pub fn parse(bytes: &[u8]) -> Self {
        match serde_json::from_slice::<serde_json::Value>(bytes) {
            Ok(value) => CapturedBody::Json(value),
            Err(_) => Self::text(bytes),
        }
    }
}

/// 一次网络操作的统一记录
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRecord {
    pub id: RecordId,
    pub kind: RecordKind,
    pub status: RecordStatus,
    pub method: String,
    pub url: String,
    pub started_at: DateTime<Utc>,
    pub first_byte_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub request_headers: BTreeMap<String, String>,
    pub request_body: Option<CapturedBody>,
    pub response_headers: Option<BTreeMap<String, String>>,
    pub response_status: Option<u16>,
    pub response_status_text: Option<String>,
    pub response_body: Option<CapturedBody>,
    pub messages: Vec<StreamMessage>,
    aggregated_text: String,
    pub size_bytes: Option<u64>,
    pub initiator: String,
    pub error: Option<String>,
}

impl CaptureRecord {
    pub fn new(
        kind: RecordKind,
        method: impl Into<String>,
        url: impl Into<String>,
        request_headers: BTreeMap<String, String>,
        request_body: Option<CapturedBody>,
        initiator: impl Into<String>,
    ) -> Self {
        Self {
            id: RecordId::new(),
            kind,
            status: RecordStatus::Pending,
            method: method.into().to_uppercase(),
            url: url.into(),
            started_at: Utc::now(),
            first_byte_at: None,
            ended_at: None,
            request_headers,
            request_body,
            response_headers: None,
            response_status: None,
            response_status_text: None,
            response_body: None,
            messages: Vec::new(),
            aggregated_text: String::new(),
            size_bytes: None,
            initiator: initiator.into(),
            error: None,
        }
    }

    /// 按到达顺序拼接的解码文本
    pub fn aggregated_text(&self) -> &str {
        &self.aggregated_text
    }

    /// 状态迁移；非法迁移（包括离开终态）被忽略并返回 false
    pub fn set_status(&mut self, next: RecordStatus) -> bool {
        if self.status == next {
            return false;
        }
        if !self.status.can_transition_to(next) {
            tracing::debug!(
                record_id = %self.id,
                from = ?self.status,
                to = ?next,
                "忽略非法的状态迁移"
            );
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.stamp_end();
        }
        true
    }

    /// 确认为事件流：kind 单向转换，状态进入 streaming
    pub fn confirm_streaming(&mut self) {
        self.kind = self.kind.confirm_streaming();
        self.set_status(RecordStatus::Streaming);
    }

    /// 记录首字节时间（至多一次）
    pub fn mark_first_byte(&mut self) {
        if self.first_byte_at.is_none() {
            self.first_byte_at = Some(self.clamped_now());
        }
    }

    /// 记录结束时间（至多一次）
    pub fn stamp_end(&mut self) {
        if self.ended_at.is_none() {
            self.ended_at = Some(self.clamped_now());
        }
    }

    pub fn complete(&mut self) -> bool {
        self.set_status(RecordStatus::Complete)
    }

    /// 标记失败并记录原因；已处于终态时原因也不会被覆盖
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        let changed = self.set_status(RecordStatus::Error);
        if changed {
            self.error = Some(reason.into());
        }
        changed
    }

    /// 设置大小（至多一次）
    pub fn set_size(&mut self, size: u64) {
        if self.size_bytes.is_none() {
            self.size_bytes = Some(size);
        }
    }

    /// 追加一条消息；data 消息的文本内容同时追加到 aggregated_text
    pub fn push_message(&mut self, message: StreamMessage) {
        if message.kind == MessageKind::Data {
            if let Some(content) = &message.decoded_content {
                self.aggregated_text.push_str(content);
            }
        }
        self.messages.push(message);
    }

    /// 应用解码引擎输出的一批消息；遇到 end 消息时记录完成
    pub fn ingest(&mut self, messages: Vec<StreamMessage>) {
        for message in messages {
            let is_end = message.kind == MessageKind::End;
            self.push_message(message);
            if is_end {
                self.complete();
            }
        }
    }

    /// 耗时（未结束时为 None）
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn clamped_now(&self) -> DateTime<Utc> {
        Utc::now().max(self.started_at)
    }
}
