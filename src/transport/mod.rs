//! 网络原语的默认实现
//!
//! 请求/响应和渐进式请求基于 reqwest，socket 基于 tokio-tungstenite

mod reqwest_exchange;
mod reqwest_http;
mod websocket;

pub use reqwest_exchange::{ReqwestExchange, ReqwestExchangeFactory};
pub use reqwest_http::ReqwestTransport;
pub use websocket::{TungsteniteConnector, TungsteniteSocket};

use crate::intercept::Primitives;

/// 默认的一组网络原语
pub type DefaultPrimitives = Primitives<ReqwestTransport, ReqwestExchangeFactory, TungsteniteConnector>;

/// 用同一个 HTTP Client 构建默认网络原语
pub fn default_primitives(client: reqwest::Client) -> DefaultPrimitives {
    Primitives {
        http: ReqwestTransport::new(client.clone()),
        exchanges: ReqwestExchangeFactory::new(client),
        sockets: TungsteniteConnector::new(),
    }
}
