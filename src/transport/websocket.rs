use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use http::HeaderValue;
use reqwest::Url;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::intercept::{SocketConnector, SocketEvent, SocketHandle, SocketPayload};

/// 异常断开时使用的关闭码
const ABNORMAL_CLOSURE: u16 = 1006;
/// 对端未给出关闭码
const NO_STATUS_RECEIVED: u16 = 1005;

/// 基于 tokio-tungstenite 的 socket 原语
#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector;

impl TungsteniteConnector {
    pub fn new() -> Self {
        Self
    }
}

impl SocketConnector for TungsteniteConnector {
    type Socket = TungsteniteSocket;

    fn connect(&self, url: &str, protocols: &[String]) -> anyhow::Result<TungsteniteSocket> {
        let parsed = Url::parse(url)?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            anyhow::bail!("不支持的 socket 协议: {}", parsed.scheme());
        }

        let mut request = url.into_client_request()?;
        if !protocols.is_empty() {
            request.headers_mut().insert(
                "sec-websocket-protocol",
                HeaderValue::from_str(&protocols.join(", "))?,
            );
        }

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_connection(request, outgoing_rx, event_tx));

        Ok(TungsteniteSocket {
            url: url.to_string(),
            outgoing: outgoing_tx,
            events: event_rx,
            closed: false,
        })
    }
}

/// 连接任务：握手后在收发之间转发，直到任一方关闭
async fn run_connection(
    request: tokio_tungstenite::tungstenite::handshake::client::Request,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<SocketEvent>,
) {
    let abnormal = |reason: &str| SocketEvent::Close {
        code: ABNORMAL_CLOSURE,
        reason: reason.to_string(),
    };

    let (ws_stream, _response) = match connect_async(request).await {
        Ok(connected) => connected,
        Err(e) => {
            tracing::warn!("socket 握手失败: {}", e);
            let _ = events.send(SocketEvent::Error(e.to_string()));
            let _ = events.send(abnormal(""));
            return;
        }
    };
    let _ = events.send(SocketEvent::Open);
    let (mut sink, mut stream) = ws_stream.split();

    loop {
        tokio::select! {
            message = outgoing.recv() => match message {
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        let _ = events.send(SocketEvent::Error(e.to_string()));
                        let _ = events.send(abnormal(""));
                        return;
                    }
                }
                // 句柄已被丢弃
                None => {
                    let _ = sink.close().await;
                    return;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(SocketEvent::Message(SocketPayload::Text(text.as_str().to_string())));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let _ = events.send(SocketEvent::Message(SocketPayload::Binary(bytes)));
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                        .unwrap_or((NO_STATUS_RECEIVED, String::new()));
                    let _ = events.send(SocketEvent::Close { code, reason });
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events.send(SocketEvent::Error(e.to_string()));
                    let _ = events.send(abnormal(""));
                    return;
                }
                None => {
                    let _ = events.send(abnormal("连接已断开"));
                    return;
                }
            },
        }
    }
}

/// tokio-tungstenite socket 句柄
pub struct TungsteniteSocket {
    url: String,
    outgoing: mpsc::UnboundedSender<Message>,
    events: mpsc::UnboundedReceiver<SocketEvent>,
    closed: bool,
}

#[async_trait]
impl SocketHandle for TungsteniteSocket {
    fn url(&self) -> &str {
        &self.url
    }

    fn send(&mut self, payload: SocketPayload) -> anyhow::Result<()> {
        let message = match payload {
            SocketPayload::Text(text) => Message::Text(text.into()),
            SocketPayload::Binary(bytes) => Message::Binary(bytes),
        };
        self.outgoing
            .send(message)
            .map_err(|_| anyhow::anyhow!("socket 已关闭"))
    }

    fn close(&mut self, code: Option<u16>, reason: Option<&str>) -> anyhow::Result<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code.unwrap_or(1000)),
            reason: reason.unwrap_or_default().to_string().into(),
        };
        self.outgoing
            .send(Message::Close(Some(frame)))
            .map_err(|_| anyhow::anyhow!("socket 已关闭"))
    }

    async fn next_event(&mut self) -> Option<SocketEvent> {
        if self.closed {
            return None;
        }
        let event = self.events.recv().await;
        if matches!(event, Some(SocketEvent::Close { .. }) | None) {
            self.closed = true;
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_non_socket_scheme() {
        let connector = TungsteniteConnector::new();
        assert!(connector.connect("https://example.com/", &[]).is_err());
        assert!(connector.connect("not a url", &[]).is_err());
    }

    #[tokio::test]
    async fn test_refused_connection_reports_error_then_close() {
        let connector = TungsteniteConnector::new();
        let mut socket = connector.connect("ws://127.0.0.1:1/", &[]).unwrap();
        assert!(matches!(socket.next_event().await, Some(SocketEvent::Error(_))));
        assert!(matches!(
            socket.next_event().await,
            Some(SocketEvent::Close { code: ABNORMAL_CLOSURE, .. })
        ));
        assert!(socket.next_event().await.is_none());
    }
}
