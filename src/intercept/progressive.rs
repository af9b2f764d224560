//! 渐进式请求原语的抓包包装
//!
//! 渐进式请求通过 [`ProgressEvent`] 报告进度，`response_text()` 返回截至目前
//! 收到的全部文本。包装层在 send 时创建记录，随后在调用方轮询事件时观察：
//! 响应头到达时判定是否为事件流，事件流的每次进度只解码新增的文本后缀。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::common::headers::{parse_raw_headers, resolve_url};
use crate::common::{capture_initiator, payload_preview};
use crate::ingest::StreamDecoder;
use crate::model::record::{
    CaptureRecord, CapturedBody, RecordId, RecordKind, StreamDetection, StreamMessage,
};
use crate::monitor::CaptureMonitor;

/// 请求阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReadyState {
    Unsent,
    Opened,
    HeadersReceived,
    Loading,
    Done,
}

/// 进度事件；Load / Error / Abort 为终结事件
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    ReadyStateChange(ReadyState),
    Progress,
    Load,
    Error(String),
    Abort,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Load | ProgressEvent::Error(_) | ProgressEvent::Abort
        )
    }
}

/// 渐进式请求原语
#[async_trait]
pub trait ProgressiveExchange: Send {
    fn open(&mut self, method: &str, url: &str) -> anyhow::Result<()>;

    fn set_request_header(&mut self, name: &str, value: &str) -> anyhow::Result<()>;

    /// 发送请求；之后通过 [`next_event`](Self::next_event) 获取进度
    fn send(&mut self, body: Option<Bytes>) -> anyhow::Result<()>;

    fn abort(&mut self);

    /// 下一个进度事件；终结事件之后返回 None
    async fn next_event(&mut self) -> Option<ProgressEvent>;

    fn ready_state(&self) -> ReadyState;

    fn status(&self) -> u16;

    fn status_text(&self) -> &str;

    fn response_header(&self, name: &str) -> Option<String>;

    /// CRLF 分隔的全部响应头
    fn all_response_headers(&self) -> String;

    /// 截至目前收到的响应文本
    fn response_text(&self) -> &str;
}

/// 渐进式请求的构造器
pub trait ExchangeFactory: Send + Sync {
    type Exchange: ProgressiveExchange;

    fn create(&self) -> Self::Exchange;
}

/// 单次请求的抓包状态
struct ExchangeCapture {
    id: RecordId,
    detection: StreamDetection,
    /// 已解码的 response_text 字节偏移
    processed: usize,
    decoder: StreamDecoder,
    finished: bool,
}

/// 带抓包的渐进式请求
pub struct CapturingExchange<P> {
    inner: P,
    monitor: Arc<CaptureMonitor>,
    method: String,
    url: String,
    request_headers: BTreeMap<String, String>,
    capture: Option<ExchangeCapture>,
}

impl<P: ProgressiveExchange> CapturingExchange<P> {
    pub fn new(inner: P, monitor: Arc<CaptureMonitor>) -> Self {
        Self {
            inner,
            monitor,
            method: "GET".to_string(),
            url: String::new(),
            request_headers: BTreeMap::new(),
            capture: None,
        }
    }

    /// 当前请求对应的记录 ID（未抓包时为 None）
    pub fn record_id(&self) -> Option<RecordId> {
        self.capture.as_ref().map(|c| c.id)
    }

    /// 结束上一次尚未完成的请求记录（重新 open / send 时）
    fn abandon_capture(&mut self) {
        let Some(capture) = self.capture.take().filter(|c| !c.finished) else {
            return;
        };
        let streaming = capture.detection.is_streaming();
        tracing::debug!(record_id = %capture.id, "渐进式请求被重新打开，结束上一次记录");
        self.monitor.update_record(&capture.id, |r| {
            if streaming {
                r.push_message(StreamMessage::system("流因请求被重新打开而结束"));
            }
            r.fail("请求被重新打开");
        });
    }

    fn observe(&mut self, event: Option<&ProgressEvent>) {
        let Some(capture) = self.capture.as_mut() else {
            return;
        };
        if capture.finished {
            return;
        }
        let inner = &self.inner;
        let monitor = &self.monitor;
        let id = capture.id;

        let Some(event) = event else {
            capture.finished = true;
            monitor.update_record(&id, |r| r.fail("请求在终结事件之前结束"));
            return;
        };

        match event {
            ProgressEvent::ReadyStateChange(state) if *state >= ReadyState::HeadersReceived => {
                let meta = ResponseMeta::read(inner);
                let became_streaming = capture
                    .detection
                    .inspect(inner.response_header("content-type").as_deref());
                monitor.update_record(&id, |r| {
                    r.mark_first_byte();
                    meta.fill(r);
                    if became_streaming {
                        r.confirm_streaming();
                        r.push_message(StreamMessage::system("流已建立 (渐进式请求事件流)"));
                    }
                });
                if became_streaming {
                    tracing::debug!(record_id = %id, "渐进式请求响应为事件流");
                }
            }
            ProgressEvent::ReadyStateChange(_) => {}
            ProgressEvent::Progress => {
                if capture.detection.is_streaming() {
                    let messages = consume_new_text(capture, inner.response_text());
                    if !messages.is_empty() {
                        monitor.update_record(&id, |r| r.ingest(messages));
                    }
                }
            }
            ProgressEvent::Load => {
                capture.finished = true;
                let meta = ResponseMeta::read(inner);
                let text = inner.response_text();
                if capture.detection.is_streaming() {
                    let mut messages = consume_new_text(capture, text);
                    messages.extend(capture.decoder.finish());
                    let size = text.len() as u64;
                    monitor.update_record(&id, |r| {
                        meta.fill(r);
                        r.ingest(messages);
                        r.push_message(StreamMessage::system("流已结束"));
                        r.set_size(size);
                        r.complete();
                    });
                } else {
                    tracing::debug!(record_id = %id, body = %payload_preview(text), "渐进式请求已完成");
                    let body = CapturedBody::parse(text.as_bytes());
                    let size = text.len() as u64;
                    monitor.update_record(&id, |r| {
                        meta.fill(r);
                        r.response_body = Some(body);
                        r.set_size(size);
                        r.complete();
                    });
                }
            }
            ProgressEvent::Error(reason) => {
                capture.finished = true;
                let meta = ResponseMeta::read(inner);
                tracing::warn!(record_id = %id, error = %reason, "渐进式请求失败");
                let streaming = capture.detection.is_streaming();
                let mut messages = if streaming {
                    consume_new_text(capture, inner.response_text())
                } else {
                    Vec::new()
                };
                messages.extend(capture.decoder.finish());
                monitor.update_record(&id, |r| {
                    meta.fill(r);
                    r.ingest(messages);
                    if streaming {
                        r.push_message(StreamMessage::system(format!("流因网络错误中断: {}", reason)));
                    }
                    r.fail(reason.clone());
                });
            }
            ProgressEvent::Abort => {
                capture.finished = true;
                let streaming = capture.detection.is_streaming();
                monitor.update_record(&id, |r| {
                    if streaming {
                        r.push_message(StreamMessage::system("流已被中止"));
                    }
                    r.fail("请求已中止");
                });
            }
        }
    }
}

/// 原语当前报告的响应状态与响应头
struct ResponseMeta {
    status: u16,
    status_text: String,
    headers: BTreeMap<String, String>,
}

impl ResponseMeta {
    fn read<P: ProgressiveExchange>(inner: &P) -> Self {
        Self {
            status: inner.status(),
            status_text: inner.status_text().to_string(),
            headers: parse_raw_headers(&inner.all_response_headers()),
        }
    }

    /// 记录尚无响应状态且原语已有状态时写入
    fn fill(&self, r: &mut CaptureRecord) {
        if r.response_status.is_none() && self.status != 0 {
            r.response_status = Some(self.status);
            r.response_status_text = Some(self.status_text.clone());
            r.response_headers = Some(self.headers.clone());
        }
    }
}

/// 只解码 response_text 中尚未处理过的后缀
fn consume_new_text(capture: &mut ExchangeCapture, text: &str) -> Vec<StreamMessage> {
    // 文本被重置时从头开始
    if text.len() < capture.processed {
        capture.processed = 0;
    }
    let suffix = &text.as_bytes()[capture.processed..];
    capture.processed = text.len();
    capture.decoder.feed(suffix)
}

#[async_trait]
impl<P: ProgressiveExchange> ProgressiveExchange for CapturingExchange<P> {
    fn open(&mut self, method: &str, url: &str) -> anyhow::Result<()> {
        self.abandon_capture();
        self.method = method.to_string();
        self.url = resolve_url(url, None);
        self.request_headers.clear();
        self.inner.open(method, url)
    }

    fn set_request_header(&mut self, name: &str, value: &str) -> anyhow::Result<()> {
        self.request_headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self.inner.set_request_header(name, value)
    }

    fn send(&mut self, body: Option<Bytes>) -> anyhow::Result<()> {
        self.abandon_capture();
        if self.monitor.is_capture_enabled() {
            let record = CaptureRecord::new(
                RecordKind::Http,
                self.method.as_str(),
                self.url.as_str(),
                self.request_headers.clone(),
                body.as_deref().map(CapturedBody::text),
                capture_initiator(),
            );
            let id = self.monitor.insert_record(record);
            tracing::debug!(record_id = %id, method = %self.method, url = %self.url, "捕获渐进式请求");
            self.capture = Some(ExchangeCapture {
                id,
                detection: StreamDetection::default(),
                processed: 0,
                decoder: StreamDecoder::new(self.monitor.ingest_config()),
                finished: false,
            });
        } else {
            self.capture = None;
        }

        if let Err(e) = self.inner.send(body) {
            if let Some(capture) = self.capture.as_mut() {
                capture.finished = true;
                self.monitor.update_record(&capture.id, |r| r.fail(e.to_string()));
            }
            return Err(e);
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.inner.abort();
    }

    async fn next_event(&mut self) -> Option<ProgressEvent> {
        let event = self.inner.next_event().await;
        self.observe(event.as_ref());
        event
    }

    fn ready_state(&self) -> ReadyState {
        self.inner.ready_state()
    }

    fn status(&self) -> u16 {
        self.inner.status()
    }

    fn status_text(&self) -> &str {
        self.inner.status_text()
    }

    fn response_header(&self, name: &str) -> Option<String> {
        self.inner.response_header(name)
    }

    fn all_response_headers(&self) -> String {
        self.inner.all_response_headers()
    }

    fn response_text(&self) -> &str {
        self.inner.response_text()
    }
}

impl<P> Drop for CapturingExchange<P> {
    fn drop(&mut self) {
        if let Some(capture) = self.capture.as_ref().filter(|c| !c.finished) {
            self.monitor
                .update_record(&capture.id, |r| r.fail("请求在完成前被丢弃"));
        }
    }
}

/// 带抓包的渐进式请求构造器
pub struct CapturingExchangeFactory<F> {
    inner: F,
    monitor: Arc<CaptureMonitor>,
}

impl<F: ExchangeFactory> CapturingExchangeFactory<F> {
    pub fn new(inner: F, monitor: Arc<CaptureMonitor>) -> Self {
        Self { inner, monitor }
    }
}

impl<F: ExchangeFactory> ExchangeFactory for CapturingExchangeFactory<F> {
    type Exchange = CapturingExchange<F::Exchange>;

    fn create(&self) -> Self::Exchange {
        CapturingExchange::new(self.inner.create(), self.monitor.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::encode_frame;
    use crate::model::config::{Config, IngestConfig};
    use crate::model::record::{MessageKind, RecordStatus};
    use std::collections::VecDeque;

    /// 预设脚本的假渐进式请求
    enum Step {
        Headers(&'static str),
        Text(String),
        Finish(ProgressEvent),
    }

    struct FakeExchange {
        steps: VecDeque<Step>,
        ready_state: ReadyState,
        content_type: Option<&'static str>,
        text: String,
        fail_send: bool,
        done: bool,
    }

    impl FakeExchange {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: steps.into(),
                ready_state: ReadyState::Unsent,
                content_type: None,
                text: String::new(),
                fail_send: false,
                done: false,
            }
        }
    }

    #[async_trait]
    impl ProgressiveExchange for FakeExchange {
        fn open(&mut self, _method: &str, _url: &str) -> anyhow::Result<()> {
            self.ready_state = ReadyState::Opened;
            Ok(())
        }

        fn set_request_header(&mut self, _name: &str, _value: &str) -> anyhow::Result<()> {
            Ok(())
        }

        fn send(&mut self, _body: Option<Bytes>) -> anyhow::Result<()> {
            if self.fail_send {
                anyhow::bail!("invalid state");
            }
            Ok(())
        }

        fn abort(&mut self) {
            self.steps = VecDeque::from([Step::Finish(ProgressEvent::Abort)]);
        }

        async fn next_event(&mut self) -> Option<ProgressEvent> {
            if self.done {
                return None;
            }
            match self.steps.pop_front()? {
                Step::Headers(content_type) => {
                    self.content_type = Some(content_type);
                    self.ready_state = ReadyState::HeadersReceived;
                    Some(ProgressEvent::ReadyStateChange(ReadyState::HeadersReceived))
                }
                Step::Text(chunk) => {
                    self.text.push_str(&chunk);
                    self.ready_state = ReadyState::Loading;
                    Some(ProgressEvent::Progress)
                }
                Step::Finish(event) => {
                    self.ready_state = ReadyState::Done;
                    self.done = true;
                    Some(event)
                }
            }
        }

        fn ready_state(&self) -> ReadyState {
            self.ready_state
        }

        fn status(&self) -> u16 {
            200
        }

        fn status_text(&self) -> &str {
            "OK"
        }

        fn response_header(&self, name: &str) -> Option<String> {
            (name == "content-type")
                .then_some(self.content_type)
                .flatten()
                .map(str::to_string)
        }

        fn all_response_headers(&self) -> String {
            self.content_type
                .map(|ct| format!("Content-Type: {}\r\n", ct))
                .unwrap_or_default()
        }

        fn response_text(&self) -> &str {
            &self.text
        }
    }

    fn monitor() -> Arc<CaptureMonitor> {
        CaptureMonitor::new(Config {
            debounce_ms: 10,
            ..Config::default()
        })
        .unwrap()
    }

    async fn drive<P: ProgressiveExchange>(exchange: &mut P) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = exchange.next_event().await {
            events.push(event);
        }
        events
    }

    fn frame(content: &str) -> String {
        let doc = serde_json::json!({"data": {"content": content}}).to_string();
        format!("{}\n", encode_frame(&IngestConfig::default(), &doc))
    }

    #[tokio::test]
    async fn test_streaming_exchange_decodes_only_new_suffix() {
        let m = monitor();
        let f1 = frame("foo");
        let f2 = frame("bar");
        let (f2a, f2b) = f2.split_at(5);
        let mut exchange = CapturingExchange::new(
            FakeExchange::new(vec![
                Step::Headers("text/event-stream"),
                Step::Text(f1.clone()),
                Step::Text(f2a.to_string()),
                Step::Text(f2b.to_string()),
                Step::Text("data: <end>\n".to_string()),
                Step::Finish(ProgressEvent::Load),
            ]),
            m.clone(),
        );
        exchange.open("post", "https://api.test/chat").unwrap();
        exchange.set_request_header("Accept", "text/event-stream").unwrap();
        exchange.send(Some(Bytes::from_static(b"{}"))).unwrap();
        let events = drive(&mut exchange).await;
        assert_eq!(events.last(), Some(&ProgressEvent::Load));

        let r = m.get_record(&exchange.record_id().unwrap()).unwrap();
        assert_eq!(r.kind, RecordKind::ServerPush);
        assert_eq!(r.status, RecordStatus::Complete);
        assert_eq!(r.method, "POST");
        assert_eq!(r.request_headers["accept"], "text/event-stream");
        assert_eq!(r.aggregated_text(), "foobar");
        let data = r.messages.iter().filter(|msg| msg.kind == MessageKind::Data).count();
        assert_eq!(data, 2);
        assert_eq!(
            r.messages.iter().filter(|msg| msg.kind == MessageKind::End).count(),
            1
        );
        assert_eq!(r.size_bytes, Some(exchange.response_text().len() as u64));
        assert_eq!(r.response_headers.unwrap()["content-type"], "text/event-stream");
    }

    #[tokio::test]
    async fn test_plain_exchange_stores_body_on_load() {
        let m = monitor();
        let mut exchange = CapturingExchange::new(
            FakeExchange::new(vec![
                Step::Headers("application/json"),
                Step::Text(r#"{"a":"#.to_string()),
                Step::Text("1}".to_string()),
                Step::Finish(ProgressEvent::Load),
            ]),
            m.clone(),
        );
        exchange.open("GET", "https://api.test/item").unwrap();
        exchange.send(None).unwrap();
        drive(&mut exchange).await;

        let r = m.get_record(&exchange.record_id().unwrap()).unwrap();
        assert_eq!(r.kind, RecordKind::Http);
        assert_eq!(r.status, RecordStatus::Complete);
        assert_eq!(r.response_status, Some(200));
        assert_eq!(r.response_body, Some(CapturedBody::Json(serde_json::json!({"a": 1}))));
        assert!(r.messages.is_empty());
    }

    #[tokio::test]
    async fn test_network_error_marks_record() {
        let m = monitor();
        let mut exchange = CapturingExchange::new(
            FakeExchange::new(vec![
                Step::Headers("text/event-stream"),
                Step::Text(frame("partial")),
                Step::Finish(ProgressEvent::Error("network down".to_string())),
            ]),
            m.clone(),
        );
        exchange.open("GET", "https://api.test/chat").unwrap();
        exchange.send(None).unwrap();
        drive(&mut exchange).await;

        let r = m.get_record(&exchange.record_id().unwrap()).unwrap();
        assert_eq!(r.status, RecordStatus::Error);
        assert_eq!(r.error.as_deref(), Some("network down"));
        assert_eq!(r.aggregated_text(), "partial");
        assert_eq!(r.messages.last().unwrap().kind, MessageKind::System);
    }

    #[tokio::test]
    async fn test_abort_marks_record() {
        let m = monitor();
        let mut exchange = CapturingExchange::new(
            FakeExchange::new(vec![Step::Headers("text/plain")]),
            m.clone(),
        );
        exchange.open("GET", "https://api.test/slow").unwrap();
        exchange.send(None).unwrap();
        exchange.next_event().await;
        exchange.abort();
        drive(&mut exchange).await;

        let r = m.get_record(&exchange.record_id().unwrap()).unwrap();
        assert_eq!(r.status, RecordStatus::Error);
        assert_eq!(r.error.as_deref(), Some("请求已中止"));
    }

    #[tokio::test]
    async fn test_send_failure_is_rethrown() {
        let m = monitor();
        let mut fake = FakeExchange::new(vec![]);
        fake.fail_send = true;
        let mut exchange = CapturingExchange::new(fake, m.clone());
        exchange.open("GET", "https://api.test/").unwrap();
        let err = exchange.send(None).unwrap_err();
        assert_eq!(err.to_string(), "invalid state");

        let r = m.get_record(&exchange.record_id().unwrap()).unwrap();
        assert_eq!(r.status, RecordStatus::Error);
    }

    #[tokio::test]
    async fn test_drop_before_completion_finalizes_record() {
        let m = monitor();
        let mut exchange = CapturingExchange::new(
            FakeExchange::new(vec![Step::Headers("text/event-stream")]),
            m.clone(),
        );
        exchange.open("GET", "https://api.test/chat").unwrap();
        exchange.send(None).unwrap();
        exchange.next_event().await;
        let id = exchange.record_id().unwrap();
        drop(exchange);

        let r = m.get_record(&id).unwrap();
        assert!(r.is_terminal());
        assert!(r.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_reopen_finalizes_unfinished_stream_record() {
        let m = monitor();
        let mut exchange = CapturingExchange::new(
            FakeExchange::new(vec![
                Step::Headers("text/event-stream"),
                Step::Headers("application/json"),
                Step::Text("{}".to_string()),
                Step::Finish(ProgressEvent::Load),
            ]),
            m.clone(),
        );
        exchange.open("GET", "https://api.test/chat").unwrap();
        exchange.send(None).unwrap();
        exchange.next_event().await;
        let first = exchange.record_id().unwrap();
        assert_eq!(m.get_record(&first).unwrap().status, RecordStatus::Streaming);

        exchange.open("GET", "https://api.test/item").unwrap();
        exchange.send(None).unwrap();
        drive(&mut exchange).await;
        let second = exchange.record_id().unwrap();
        assert_ne!(first, second);
        drop(exchange);

        let r = m.get_record(&first).unwrap();
        assert_eq!(r.status, RecordStatus::Error);
        assert!(r.ended_at.is_some());
        assert_eq!(r.messages.last().unwrap().kind, MessageKind::System);

        let r = m.get_record(&second).unwrap();
        assert_eq!(r.status, RecordStatus::Complete);
        assert_eq!(r.url, "https://api.test/item");
    }

    #[tokio::test]
    async fn test_resend_finalizes_pending_record() {
        let m = monitor();
        let mut exchange = CapturingExchange::new(
            FakeExchange::new(vec![Step::Finish(ProgressEvent::Load)]),
            m.clone(),
        );
        exchange.open("GET", "https://api.test/").unwrap();
        exchange.send(None).unwrap();
        let first = exchange.record_id().unwrap();
        exchange.send(None).unwrap();
        drive(&mut exchange).await;

        let r = m.get_record(&first).unwrap();
        assert_eq!(r.status, RecordStatus::Error);
        assert!(r.messages.is_empty());
        assert_eq!(m.list_records().len(), 2);
    }

    #[tokio::test]
    async fn test_load_without_headers_event_fills_response_status() {
        let m = monitor();
        let mut exchange = CapturingExchange::new(
            FakeExchange::new(vec![
                Step::Text("hello".to_string()),
                Step::Finish(ProgressEvent::Load),
            ]),
            m.clone(),
        );
        exchange.open("GET", "https://api.test/plain").unwrap();
        exchange.send(None).unwrap();
        drive(&mut exchange).await;

        let r = m.get_record(&exchange.record_id().unwrap()).unwrap();
        assert_eq!(r.status, RecordStatus::Complete);
        assert_eq!(r.response_status, Some(200));
        assert_eq!(r.response_status_text.as_deref(), Some("OK"));
        assert!(r.response_headers.is_some());
    }

    #[tokio::test]
    async fn test_disabled_capture_creates_no_record() {
        let m = monitor();
        m.set_capture_enabled(false);
        let mut exchange = CapturingExchange::new(
            FakeExchange::new(vec![Step::Finish(ProgressEvent::Load)]),
            m.clone(),
        );
        exchange.open("GET", "https://api.test/").unwrap();
        exchange.send(None).unwrap();
        drive(&mut exchange).await;
        assert!(exchange.record_id().is_none());
        assert!(m.list_records().is_empty());
    }
}
