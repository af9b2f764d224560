use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::intercept::{ExchangeFactory, ProgressEvent, ProgressiveExchange, ReadyState};

/// 后台请求任务发回的进度
enum Update {
    Headers { status: StatusCode, headers: HeaderMap },
    Chunk(Bytes),
    Done,
    Failed(String),
}

/// 基于 reqwest 的渐进式请求
///
/// send 之后在后台任务中执行请求，响应文本随进度事件增长
pub struct ReqwestExchange {
    client: reqwest::Client,
    method: Option<Method>,
    url: String,
    headers: HeaderMap,
    ready_state: ReadyState,
    status: u16,
    status_text: String,
    response_headers: HeaderMap,
    response_text: String,
    /// 尚未凑成完整 UTF-8 字符的尾部字节
    utf8_pending: Vec<u8>,
    updates: Option<mpsc::UnboundedReceiver<Update>>,
    task: Option<JoinHandle<()>>,
    queued: VecDeque<ProgressEvent>,
    finished: bool,
}

impl ReqwestExchange {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            method: None,
            url: String::new(),
            headers: HeaderMap::new(),
            ready_state: ReadyState::Unsent,
            status: 0,
            status_text: String::new(),
            response_headers: HeaderMap::new(),
            response_text: String::new(),
            utf8_pending: Vec::new(),
            updates: None,
            task: None,
            queued: VecDeque::new(),
            finished: false,
        }
    }

    fn set_ready_state(&mut self, state: ReadyState) {
        if self.ready_state != state {
            self.ready_state = state;
            self.queued.push_back(ProgressEvent::ReadyStateChange(state));
        }
    }

    fn finish(&mut self, event: ProgressEvent) {
        self.flush_utf8();
        self.set_ready_state(ReadyState::Done);
        self.queued.push_back(event);
        self.finished = true;
        self.updates = None;
    }

    /// 追加响应字节；跨块的多字节字符等凑齐后再解码
    fn append_bytes(&mut self, chunk: &[u8]) {
        self.utf8_pending.extend_from_slice(chunk);
        loop {
            match std::str::from_utf8(&self.utf8_pending) {
                Ok(text) => {
                    self.response_text.push_str(text);
                    self.utf8_pending.clear();
                    return;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    if let Ok(text) = std::str::from_utf8(&self.utf8_pending[..valid]) {
                        self.response_text.push_str(text);
                    }
                    match e.error_len() {
                        Some(invalid) => {
                            self.response_text.push(char::REPLACEMENT_CHARACTER);
                            self.utf8_pending.drain(..valid + invalid);
                        }
                        None => {
                            self.utf8_pending.drain(..valid);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn flush_utf8(&mut self) {
        if !self.utf8_pending.is_empty() {
            let rest = String::from_utf8_lossy(&self.utf8_pending).into_owned();
            self.response_text.push_str(&rest);
            self.utf8_pending.clear();
        }
    }

    fn apply(&mut self, update: Option<Update>) {
        match update {
            Some(Update::Headers { status, headers }) => {
                self.status = status.as_u16();
                self.status_text = status.canonical_reason().unwrap_or_default().to_string();
                self.response_headers = headers;
                self.set_ready_state(ReadyState::HeadersReceived);
            }
            Some(Update::Chunk(bytes)) => {
                self.append_bytes(&bytes);
                self.set_ready_state(ReadyState::Loading);
                self.queued.push_back(ProgressEvent::Progress);
            }
            Some(Update::Done) => self.finish(ProgressEvent::Load),
            Some(Update::Failed(reason)) => self.finish(ProgressEvent::Error(reason)),
            None => self.finish(ProgressEvent::Error("请求任务意外结束".to_string())),
        }
    }
}

#[async_trait]
impl ProgressiveExchange for ReqwestExchange {
    fn open(&mut self, method: &str, url: &str) -> anyhow::Result<()> {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())?;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.method = Some(method);
        self.url = url.to_string();
        self.headers.clear();
        self.status = 0;
        self.status_text.clear();
        self.response_headers.clear();
        self.response_text.clear();
        self.utf8_pending.clear();
        self.updates = None;
        self.queued.clear();
        self.finished = false;
        self.ready_state = ReadyState::Unsent;
        self.set_ready_state(ReadyState::Opened);
        Ok(())
    }

    fn set_request_header(&mut self, name: &str, value: &str) -> anyhow::Result<()> {
        if self.ready_state != ReadyState::Opened || self.updates.is_some() {
            anyhow::bail!("只能在 open 之后、send 之前设置请求头");
        }
        let name = HeaderName::from_bytes(name.as_bytes())?;
        let value = HeaderValue::from_str(value)?;
        self.headers.append(name, value);
        Ok(())
    }

    fn send(&mut self, body: Option<Bytes>) -> anyhow::Result<()> {
        let Some(method) = self.method.clone() else {
            anyhow::bail!("请求尚未 open");
        };
        if self.updates.is_some() || self.finished {
            anyhow::bail!("请求已发送");
        }

        let mut request = self
            .client
            .request(method, &self.url)
            .headers(self.headers.clone());
        if let Some(body) = body {
            request = request.body(body);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.updates = Some(rx);
        self.task = Some(tokio::spawn(async move {
            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let _ = tx.send(Update::Failed(e.to_string()));
                    return;
                }
            };
            let _ = tx.send(Update::Headers {
                status: response.status(),
                headers: response.headers().clone(),
            });

            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        if tx.send(Update::Chunk(bytes)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Update::Failed(e.to_string()));
                        return;
                    }
                }
            }
            let _ = tx.send(Update::Done);
        }));
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if self.updates.is_some() && !self.finished {
            self.finish(ProgressEvent::Abort);
        }
    }

    async fn next_event(&mut self) -> Option<ProgressEvent> {
        loop {
            if let Some(event) = self.queued.pop_front() {
                return Some(event);
            }
            if self.finished {
                return None;
            }
            let update = self.updates.as_mut()?.recv().await;
            self.apply(update);
        }
    }

    fn ready_state(&self) -> ReadyState {
        self.ready_state
    }

    fn status(&self) -> u16 {
        self.status
    }

    fn status_text(&self) -> &str {
        &self.status_text
    }

    fn response_header(&self, name: &str) -> Option<String> {
        let values: Vec<&str> = self
            .response_headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        (!values.is_empty()).then(|| values.join(", "))
    }

    fn all_response_headers(&self) -> String {
        self.response_headers
            .iter()
            .map(|(name, value)| {
                format!("{}: {}\r\n", name, String::from_utf8_lossy(value.as_bytes()))
            })
            .collect()
    }

    fn response_text(&self) -> &str {
        &self.response_text
    }
}

impl Drop for ReqwestExchange {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// reqwest 渐进式请求构造器
#[derive(Debug, Clone)]
pub struct ReqwestExchangeFactory {
    client: reqwest::Client,
}

impl ReqwestExchangeFactory {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl ExchangeFactory for ReqwestExchangeFactory {
    type Exchange = ReqwestExchange;

    fn create(&self) -> ReqwestExchange {
        ReqwestExchange::new(self.client.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange() -> ReqwestExchange {
        ReqwestExchange::new(reqwest::Client::new())
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let mut ex = exchange();
        let text = "你好";
        let bytes = text.as_bytes();
        ex.append_bytes(&bytes[..2]);
        assert_eq!(ex.response_text(), "");
        ex.append_bytes(&bytes[2..4]);
        assert_eq!(ex.response_text(), "你");
        ex.append_bytes(&bytes[4..]);
        assert_eq!(ex.response_text(), "你好");
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut ex = exchange();
        ex.append_bytes(b"a\xffb");
        assert_eq!(ex.response_text(), "a\u{fffd}b");
    }

    #[test]
    fn test_header_requires_open() {
        let mut ex = exchange();
        assert!(ex.set_request_header("accept", "text/plain").is_err());
        ex.open("get", "https://example.com/").unwrap();
        assert_eq!(ex.ready_state(), ReadyState::Opened);
        ex.set_request_header("accept", "text/plain").unwrap();
    }

    #[test]
    fn test_send_before_open_fails() {
        let mut ex = exchange();
        assert!(ex.send(None).is_err());
    }

    #[tokio::test]
    async fn test_connection_failure_ends_with_error_event() {
        let mut ex = exchange();
        ex.open("GET", "http://127.0.0.1:1/").unwrap();
        ex.send(None).unwrap();

        let mut events = Vec::new();
        while let Some(event) = ex.next_event().await {
            events.push(event);
        }
        assert_eq!(
            events.first(),
            Some(&ProgressEvent::ReadyStateChange(ReadyState::Opened))
        );
        assert!(matches!(events.last(), Some(ProgressEvent::Error(_))));
        assert_eq!(ex.ready_state(), ReadyState::Done);
    }

    #[test]
    fn test_headers_update_exposes_status_and_headers() {
        let mut ex = exchange();
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/event-stream"));
        ex.apply(Some(Update::Headers {
            status: StatusCode::OK,
            headers,
        }));
        assert_eq!(ex.status(), 200);
        assert_eq!(ex.status_text(), "OK");
        assert_eq!(
            ex.response_header("Content-Type").as_deref(),
            Some("text/event-stream")
        );
        assert_eq!(ex.all_response_headers(), "content-type: text/event-stream\r\n");
    }
}
