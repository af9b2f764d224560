//! 拦截层
//!
//! 三种网络原语各自抽象为一个 trait，抓包包装实现同一个 trait，
//! 调用方拿到的包装与原语行为一致：同样的返回值、同样的错误、同样的字节。

pub mod http;
pub mod progressive;
pub mod socket;
mod tee;

use std::sync::Arc;

pub use self::http::{BodyStream, CapturingHttp, HttpBody, HttpRequest, HttpResponse, HttpTransport};
pub use self::progressive::{
    CapturingExchange, CapturingExchangeFactory, ExchangeFactory, ProgressEvent,
    ProgressiveExchange, ReadyState,
};
pub use self::socket::{
    CapturingConnector, CapturingSocket, SocketConnector, SocketEvent, SocketHandle, SocketPayload,
};

use crate::monitor::CaptureMonitor;

/// 一组网络原语
pub struct Primitives<H, F, C> {
    pub http: H,
    pub exchanges: F,
    pub sockets: C,
}

/// 安装抓包后的网络原语
pub type CapturingPrimitives<H, F, C> =
    Primitives<CapturingHttp<H>, CapturingExchangeFactory<F>, CapturingConnector<C>>;

impl CaptureMonitor {
    /// 为三种原语安装抓包包装；每个实例只能安装一次
    pub fn install<H, F, C>(
        self: &Arc<Self>,
        primitives: Primitives<H, F, C>,
    ) -> anyhow::Result<CapturingPrimitives<H, F, C>>
    where
        H: HttpTransport,
        F: ExchangeFactory,
        C: SocketConnector,
    {
        if !self.mark_installed() {
            anyhow::bail!("抓包拦截已安装，不能重复安装");
        }
        tracing::info!("抓包拦截已安装");
        Ok(Primitives {
            http: CapturingHttp::new(primitives.http, self.clone()),
            exchanges: CapturingExchangeFactory::new(primitives.exchanges, self.clone()),
            sockets: CapturingConnector::new(primitives.sockets, self.clone()),
        })
    }
}
