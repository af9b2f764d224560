//! 请求/响应原语的抓包包装
//!
//! 普通响应在返回给调用方之前完整读取，响应体保存到记录中；
//! content-type 为事件流的响应通过 [`tee`] 复制，一个分支原样交给调用方，
//! 另一个分支在后台任务中逐块解码写入记录。

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use tokio::sync::mpsc;

use super::tee::{tee, Observed};
use crate::common::headers::{content_type, header_map_to_btree, resolve_url};
use crate::common::{capture_initiator, payload_preview};
use crate::ingest::StreamDecoder;
use crate::model::record::{
    is_event_stream, CaptureRecord, CapturedBody, RecordId, RecordKind, StreamMessage,
};
use crate::monitor::CaptureMonitor;

/// 响应体字节流
pub type BodyStream = BoxStream<'static, anyhow::Result<Bytes>>;

/// 响应体
pub enum HttpBody {
    Empty,
    Full(Bytes),
    Stream(BodyStream),
}

impl HttpBody {
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: futures::Stream<Item = anyhow::Result<Bytes>> + Send + 'static,
    {
        HttpBody::Stream(stream.boxed())
    }

    pub fn into_stream(self) -> BodyStream {
        match self {
            HttpBody::Empty => stream::empty().boxed(),
            HttpBody::Full(bytes) => stream::once(async move { Ok(bytes) }).boxed(),
            HttpBody::Stream(s) => s,
        }
    }

    /// 读取全部字节；流中途出错时返回该错误
    pub async fn bytes(self) -> anyhow::Result<Bytes> {
        match self {
            HttpBody::Empty => Ok(Bytes::new()),
            HttpBody::Full(bytes) => Ok(bytes),
            HttpBody::Stream(mut s) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = s.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }
}

impl fmt::Debug for HttpBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpBody::Empty => write!(f, "Empty"),
            HttpBody::Full(bytes) => write!(f, "Full({} bytes)", bytes.len()),
            HttpBody::Stream(_) => write!(f, "Stream"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: HttpBody,
}

impl HttpResponse {
    pub async fn bytes(self) -> anyhow::Result<Bytes> {
        self.body.bytes().await
    }

    pub async fn text(self) -> anyhow::Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// 请求/响应原语
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> anyhow::Result<HttpResponse>;
}

/// 带抓包的请求/响应原语
pub struct CapturingHttp<T> {
    inner: T,
    monitor: Arc<CaptureMonitor>,
}

impl<T: HttpTransport> CapturingHttp<T> {
    pub fn new(inner: T, monitor: Arc<CaptureMonitor>) -> Self {
        Self { inner, monitor }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    async fn observe_response(&self, id: RecordId, response: HttpResponse) -> HttpResponse {
        let HttpResponse {
            status,
            headers,
            body,
        } = response;
        let streaming = content_type(&headers).is_some_and(is_event_stream);
        let response_headers = header_map_to_btree(&headers);

        self.monitor.update_record(&id, |r| {
            r.mark_first_byte();
            r.response_status = Some(status.as_u16());
            r.response_status_text = status.canonical_reason().map(str::to_string);
            r.response_headers = Some(response_headers);
            if streaming {
                r.confirm_streaming();
                r.push_message(StreamMessage::system("流已建立 (事件流响应)"));
            }
        });

        if streaming {
            tracing::debug!(record_id = %id, "响应为事件流，开始增量解析");
            let (caller, observer) = tee(body.into_stream());
            tokio::spawn(ingest_observed(self.monitor.clone(), id, observer));
            return HttpResponse {
                status,
                headers,
                body: HttpBody::Stream(caller),
            };
        }

        let body = match body {
            HttpBody::Empty => Ok(Bytes::new()),
            HttpBody::Full(bytes) => Ok(bytes),
            HttpBody::Stream(s) => read_to_end(s).await,
        };

        match body {
            Ok(bytes) => {
                tracing::debug!(
                    record_id = %id,
                    status = status.as_u16(),
                    body = %payload_preview(&String::from_utf8_lossy(&bytes)),
                    "响应已完成"
                );
                self.monitor.update_record(&id, |r| {
                    r.response_body = Some(CapturedBody::parse(&bytes));
                    r.set_size(bytes.len() as u64);
                    r.complete();
                });
                HttpResponse {
                    status,
                    headers,
                    body: HttpBody::Full(bytes),
                }
            }
            Err((received, e)) => {
                tracing::warn!(record_id = %id, error = %e, "读取响应体失败");
                let size: usize = received.iter().map(Bytes::len).sum();
                let reason = format!("读取响应体失败: {}", e);
                self.monitor.update_record(&id, |r| {
                    r.set_size(size as u64);
                    r.fail(reason);
                });
                // 调用方照常拿到已读取的字节，随后是原始错误
                let replay = stream::iter(received.into_iter().map(Ok)).chain(stream::once(
                    async move { Err(e) },
                ));
                HttpResponse {
                    status,
                    headers,
                    body: HttpBody::from_stream(replay),
                }
            }
        }
    }
}

#[async_trait]
impl<T: HttpTransport> HttpTransport for CapturingHttp<T> {
    async fn execute(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
        if !self.monitor.is_capture_enabled() {
            return self.inner.execute(request).await;
        }

        let record = CaptureRecord::new(
            RecordKind::Http,
            request.method.as_str(),
            resolve_url(&request.url, None),
            header_map_to_btree(&request.headers),
            request.body.as_deref().map(CapturedBody::text),
            capture_initiator(),
        );
        let id = self.monitor.insert_record(record);
        tracing::debug!(record_id = %id, method = %request.method, url = %request.url, "捕获请求");

        match self.inner.execute(request).await {
            Ok(response) => Ok(self.observe_response(id, response).await),
            Err(e) => {
                tracing::warn!(record_id = %id, error = %e, "请求失败");
                self.monitor.update_record(&id, |r| r.fail(e.to_string()));
                Err(e)
            }
        }
    }
}

/// 读取完整响应体；出错时返回已读取的块和原始错误
async fn read_to_end(mut body: BodyStream) -> Result<Bytes, (Vec<Bytes>, anyhow::Error)> {
    let mut chunks = Vec::new();
    while let Some(item) = body.next().await {
        match item {
            Ok(chunk) => chunks.push(chunk),
            Err(e) => return Err((chunks, e)),
        }
    }
    let mut buf = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
    for chunk in &chunks {
        buf.extend_from_slice(chunk);
    }
    Ok(buf.freeze())
}

/// 消费观察分支：增量解码并写入记录
async fn ingest_observed(
    monitor: Arc<CaptureMonitor>,
    id: RecordId,
    mut observer: mpsc::UnboundedReceiver<Observed>,
) {
    let mut decoder = StreamDecoder::new(monitor.ingest_config());

    while let Some(item) = observer.recv().await {
        match item {
            Ok(chunk) => {
                let messages = decoder.feed(&chunk);
                if messages.is_empty() {
                    continue;
                }
                if monitor.update_record(&id, |r| r.ingest(messages)).is_none() {
                    tracing::debug!(record_id = %id, "记录已被移除，停止解析");
                    return;
                }
            }
            Err(reason) => {
                tracing::warn!(record_id = %id, error = %reason, "事件流读取出错");
                let tail = decoder.finish();
                let size = decoder.bytes_seen();
                monitor.update_record(&id, |r| {
                    r.ingest(tail);
                    r.push_message(StreamMessage::system(format!("流读取出错: {}", reason)));
                    r.set_size(size);
                    r.fail(reason);
                });
                return;
            }
        }
    }

    let tail = decoder.finish();
    let size = decoder.bytes_seen();
    tracing::debug!(record_id = %id, size, "事件流已结束");
    monitor.update_record(&id, |r| {
        r.ingest(tail);
        r.push_message(StreamMessage::system("流已结束"));
        r.set_size(size);
        r.complete();
    });
}
