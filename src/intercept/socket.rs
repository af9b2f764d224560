//! 双向 socket 原语的抓包包装

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;

use crate::common::headers::resolve_url;
use crate::common::{capture_initiator, payload_preview};
use crate::model::record::{CaptureRecord, RecordId, RecordKind, RecordStatus, StreamMessage};
use crate::monitor::CaptureMonitor;

/// socket 帧负载
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketPayload {
    Text(String),
    Binary(Bytes),
}

impl SocketPayload {
    /// 记录中保存的原始文本：文本帧原样保存，二进制帧保存为 base64
    pub fn to_raw_line(&self) -> String {
        match self {
            SocketPayload::Text(text) => text.clone(),
            SocketPayload::Binary(bytes) => base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }
}

impl From<String> for SocketPayload {
    fn from(text: String) -> Self {
        SocketPayload::Text(text)
    }
}

impl From<&str> for SocketPayload {
    fn from(text: &str) -> Self {
        SocketPayload::Text(text.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Open,
    Message(SocketPayload),
    Error(String),
    Close { code: u16, reason: String },
}

/// 已建立（或正在建立）的 socket 连接
#[async_trait]
pub trait SocketHandle: Send {
    fn url(&self) -> &str;

    fn send(&mut self, payload: SocketPayload) -> anyhow::Result<()>;

    fn close(&mut self, code: Option<u16>, reason: Option<&str>) -> anyhow::Result<()>;

    /// 下一个连接事件；Close 之后返回 None
    async fn next_event(&mut self) -> Option<SocketEvent>;
}

/// socket 原语：发起连接立即返回句柄，连接结果通过事件报告
pub trait SocketConnector: Send + Sync {
    type Socket: SocketHandle;

    fn connect(&self, url: &str, protocols: &[String]) -> anyhow::Result<Self::Socket>;
}

/// 带抓包的 socket
pub struct CapturingSocket<S> {
    inner: S,
    monitor: Arc<CaptureMonitor>,
    id: Option<RecordId>,
    closed: bool,
}

impl<S: SocketHandle> CapturingSocket<S> {
    pub fn record_id(&self) -> Option<RecordId> {
        self.id
    }

    fn observe(&mut self, event: Option<&SocketEvent>) {
        let Some(id) = self.id else {
            return;
        };
        if self.closed {
            return;
        }

        match event {
            Some(SocketEvent::Open) => {
                tracing::debug!(record_id = %id, "socket 已连接");
                self.monitor.update_record(&id, |r| {
                    r.mark_first_byte();
                    r.set_status(RecordStatus::Streaming);
                    r.push_message(StreamMessage::system("连接已建立"));
                });
            }
            Some(SocketEvent::Message(payload)) => {
                let raw = payload.to_raw_line();
                self.monitor
                    .update_record(&id, |r| r.push_message(StreamMessage::received(raw)));
            }
            Some(SocketEvent::Error(reason)) => {
                tracing::warn!(record_id = %id, error = %reason, "socket 连接出错");
                self.monitor.update_record(&id, |r| {
                    r.push_message(StreamMessage::system(format!("连接出错: {}", reason)));
                    r.fail(reason.clone());
                });
            }
            Some(SocketEvent::Close { code, reason }) => {
                self.closed = true;
                tracing::debug!(record_id = %id, code, "socket 已关闭");
                let reason = if reason.is_empty() { "N/A" } else { reason.as_str() };
                let note = format!("连接已关闭 - Code: {}, Reason: {}", code, reason);
                self.monitor.update_record(&id, |r| {
                    r.push_message(StreamMessage::system(note));
                    r.complete();
                    r.stamp_end();
                });
            }
            None => {
                self.closed = true;
                self.monitor.update_record(&id, |r| {
                    r.push_message(StreamMessage::system("连接已结束"));
                    r.complete();
                    r.stamp_end();
                });
            }
        }
    }
}

#[async_trait]
impl<S: SocketHandle> SocketHandle for CapturingSocket<S> {
    fn url(&self) -> &str {
        self.inner.url()
    }

    fn send(&mut self, payload: SocketPayload) -> anyhow::Result<()> {
        if let Some(id) = self.id {
            let raw = payload.to_raw_line();
            tracing::debug!(record_id = %id, payload = %payload_preview(&raw), "socket 发送");
            self.monitor
                .update_record(&id, |r| r.push_message(StreamMessage::sent(raw)));
        }
        self.inner.send(payload)
    }

    fn close(&mut self, code: Option<u16>, reason: Option<&str>) -> anyhow::Result<()> {
        self.inner.close(code, reason)
    }

    async fn next_event(&mut self) -> Option<SocketEvent> {
        let event = self.inner.next_event().await;
        self.observe(event.as_ref());
        event
    }
}

impl<S> Drop for CapturingSocket<S> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Some(id) = self.id {
            self.monitor.update_record(&id, |r| {
                r.push_message(StreamMessage::system("连接在关闭前被丢弃"));
                r.complete();
                r.stamp_end();
            });
        }
    }
}

/// 带抓包的 socket 原语
pub struct CapturingConnector<C> {
    inner: C,
    monitor: Arc<CaptureMonitor>,
}

impl<C: SocketConnector> CapturingConnector<C> {
    pub fn new(inner: C, monitor: Arc<CaptureMonitor>) -> Self {
        Self { inner, monitor }
    }
}

impl<C: SocketConnector> SocketConnector for CapturingConnector<C> {
    type Socket = CapturingSocket<C::Socket>;

    fn connect(&self, url: &str, protocols: &[String]) -> anyhow::Result<Self::Socket> {
        if !self.monitor.is_capture_enabled() {
            return Ok(CapturingSocket {
                inner: self.inner.connect(url, protocols)?,
                monitor: self.monitor.clone(),
                id: None,
                closed: false,
            });
        }

        let mut headers = BTreeMap::new();
        if !protocols.is_empty() {
            headers.insert("sec-websocket-protocol".to_string(), protocols.join(", "));
        }
        let record = CaptureRecord::new(
            RecordKind::Socket,
            "WSS",
            resolve_url(url, None),
            headers,
            None,
            capture_initiator(),
        );
        let id = self.monitor.insert_record(record);
        tracing::debug!(record_id = %id, url, "捕获 socket 连接");

        match self.inner.connect(url, protocols) {
            Ok(inner) => Ok(CapturingSocket {
                inner,
                monitor: self.monitor.clone(),
                id: Some(id),
                closed: false,
            }),
            Err(e) => {
                self.monitor.update_record(&id, |r| r.fail(e.to_string()));
                Err(e)
            }
        }
    }
}
