//! 网络活动抓包与流式数据解析
//!
//! 在三种网络原语（请求/响应、渐进式请求、双向 socket）外层安装抓包包装，
//! 把每次网络操作记录为一条 [`CaptureRecord`]，事件流响应在到达时增量解码。
//! 记录集合由 [`CaptureMonitor`] 持有，通过窄接口对外查看。

pub mod common;
pub mod http_client;
pub mod ingest;
pub mod intercept;
pub mod model;
pub mod monitor;
pub mod notification;
pub mod transport;

pub use intercept::{CapturingPrimitives, Primitives};
pub use model::config::{Config, IngestConfig};
pub use model::record::{
    CaptureRecord, CapturedBody, MessageKind, RecordId, RecordKind, RecordStatus, StreamMessage,
};
pub use monitor::CaptureMonitor;
pub use notification::Subscription;
