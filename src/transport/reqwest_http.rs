use async_trait::async_trait;
use futures::StreamExt;

use crate::intercept::{HttpBody, HttpRequest, HttpResponse, HttpTransport};

/// 基于 reqwest 的请求/响应原语，响应体以流的形式返回
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(anyhow::Error::from));

        Ok(HttpResponse {
            status,
            headers,
            body: HttpBody::from_stream(body),
        })
    }
}
