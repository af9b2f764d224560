//! 响应流复制
//!
//! 后台任务从上游读取，每个块依次写入调用方分支和观察分支。两个分支都是
//! 有序的无界通道，调用方分支原样携带上游的字节和错误；调用方丢弃自己的
//! 分支后观察分支仍继续读取，直到上游结束。

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::http::BodyStream;

/// 观察分支中的一项：数据块或上游错误的描述
pub type Observed = Result<Bytes, String>;

/// 将上游流复制为（调用方分支，观察分支）
pub fn tee(mut upstream: BodyStream) -> (BodyStream, mpsc::UnboundedReceiver<Observed>) {
    let (caller_tx, caller_rx) = mpsc::unbounded_channel::<anyhow::Result<Bytes>>();
    let (observer_tx, observer_rx) = mpsc::unbounded_channel::<Observed>();

    tokio::spawn(async move {
        while let Some(item) = upstream.next().await {
            match item {
                Ok(chunk) => {
                    let observer_gone = observer_tx.send(Ok(chunk.clone())).is_err();
                    let caller_gone = caller_tx.send(Ok(chunk)).is_err();
                    if observer_gone && caller_gone {
                        break;
                    }
                }
                Err(e) => {
                    let _ = observer_tx.send(Err(e.to_string()));
                    let _ = caller_tx.send(Err(e));
                    break;
                }
            }
        }
    });

    (UnboundedReceiverStream::new(caller_rx).boxed(), observer_rx)
}
