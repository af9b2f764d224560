//! sniffer-rs 命令行入口
//!
//! 安装抓包后发起指定的请求 / 事件流 / socket 连接，结束后输出全部记录；
//! `--serve` 时继续提供查看接口直到 Ctrl+C。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use clap::Parser;
use futures::future::join_all;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sniffer_rs::http_client::build_client_from_config;
use sniffer_rs::intercept::{
    ExchangeFactory, HttpRequest, HttpTransport, ProgressEvent, ProgressiveExchange, SocketConnector,
    SocketEvent, SocketHandle,
};
use sniffer_rs::monitor::{cors_layer, create_monitor_router};
use sniffer_rs::transport::default_primitives;
use sniffer_rs::{CaptureMonitor, Config};

#[derive(Parser, Debug)]
#[command(name = "sniffer-rs", version, about = "网络活动抓包与流式数据解析")]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = Config::default_config_path())]
    config: String,

    /// 发起普通请求（可重复）
    #[arg(long = "fetch", value_name = "URL")]
    fetch: Vec<String>,

    /// 以渐进式请求读取事件流（可重复）
    #[arg(long = "stream", value_name = "URL")]
    stream: Vec<String>,

    /// 建立 socket 连接（可重复）
    #[arg(long = "socket", value_name = "URL")]
    socket: Vec<String>,

    /// socket 连接建立后发送的消息（可重复，按顺序发送）
    #[arg(long = "send", value_name = "MESSAGE")]
    send: Vec<String>,

    /// socket 连接保持的最长时间（秒）
    #[arg(long, default_value_t = 10)]
    socket_wait_secs: u64,

    /// 完成后启动查看接口
    #[arg(long)]
    serve: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;
    tracing::info!("配置已加载: {:?}", config.config_path());

    let monitor = CaptureMonitor::init_global(config.clone())?;
    let client = build_client_from_config(&config)?;
    let primitives = monitor.install(default_primitives(client))?;

    let weak = Arc::downgrade(&monitor);
    let _subscription = monitor.subscribe(move || {
        if let Some(monitor) = weak.upgrade() {
            tracing::debug!(records = monitor.record_count(), "记录集合已变化");
        }
    });

    let fetches = args.fetch.iter().map(|url| run_fetch(&primitives.http, url));
    let streams = args
        .stream
        .iter()
        .map(|url| run_stream(&primitives.exchanges, url));
    let wait = Duration::from_secs(args.socket_wait_secs);
    let sockets = args
        .socket
        .iter()
        .map(|url| run_socket(&primitives.sockets, url, &args.send, wait));
    tokio::join!(join_all(fetches), join_all(streams), join_all(sockets));

    // 等待最后一次变更通知落地
    tokio::time::sleep(config.debounce()).await;
    println!("{}", monitor.export_json()?);

    if args.serve {
        serve(&config, monitor).await?;
    }
    Ok(())
}

async fn run_fetch(http: &impl HttpTransport, url: &str) {
    let result = async {
        let response = http.execute(HttpRequest::get(url)).await?;
        let status = response.status;
        let body = response.bytes().await?;
        anyhow::Ok((status, body.len()))
    }
    .await;

    match result {
        Ok((status, len)) => tracing::info!(url, status = status.as_u16(), len, "请求完成"),
        Err(e) => tracing::warn!(url, "请求失败: {}", e),
    }
}

async fn run_stream(exchanges: &impl ExchangeFactory, url: &str) {
    let mut exchange = exchanges.create();
    let sent = (|| {
        exchange.open("GET", url)?;
        exchange.set_request_header("accept", "text/event-stream")?;
        exchange.send(None)
    })();
    if let Err(e) = sent {
        tracing::warn!(url, "渐进式请求发送失败: {}", e);
        return;
    }

    while let Some(event) = exchange.next_event().await {
        match event {
            ProgressEvent::Load => {
                tracing::info!(url, len = exchange.response_text().len(), "事件流读取完成");
            }
            ProgressEvent::Error(reason) => tracing::warn!(url, "事件流读取失败: {}", reason),
            ProgressEvent::Abort => tracing::warn!(url, "事件流已中止"),
            _ => {}
        }
    }
}

async fn run_socket(sockets: &impl SocketConnector, url: &str, messages: &[String], wait: Duration) {
    let mut socket = match sockets.connect(url, &[]) {
        Ok(socket) => socket,
        Err(e) => {
            tracing::warn!(url, "socket 连接失败: {}", e);
            return;
        }
    };

    let deadline = tokio::time::Instant::now() + wait;
    let mut closing = false;
    loop {
        let event = match tokio::time::timeout_at(deadline, socket.next_event()).await {
            Ok(event) => event,
            Err(_) if !closing => {
                closing = true;
                if let Err(e) = socket.close(Some(1000), None) {
                    tracing::warn!(url, "socket 关闭失败: {}", e);
                    return;
                }
                // 关闭握手单独给一小段时间
                match tokio::time::timeout(Duration::from_secs(2), socket.next_event()).await {
                    Ok(event) => event,
                    Err(_) => return,
                }
            }
            Err(_) => return,
        };

        match event {
            Some(SocketEvent::Open) => {
                tracing::info!(url, "socket 已连接");
                for message in messages {
                    if let Err(e) = socket.send(message.as_str().into()) {
                        tracing::warn!(url, "socket 发送失败: {}", e);
                    }
                }
            }
            Some(SocketEvent::Message(_)) => {}
            Some(SocketEvent::Error(reason)) => tracing::warn!(url, "socket 出错: {}", reason),
            Some(SocketEvent::Close { code, .. }) => {
                tracing::info!(url, code, "socket 已关闭");
                return;
            }
            None => return,
        }
    }
}

async fn serve(config: &Config, monitor: Arc<CaptureMonitor>) -> anyhow::Result<()> {
    let app = Router::new()
        .nest(
            "/api",
            create_monitor_router(config.admin_api_key.clone(), monitor),
        )
        .layer(cors_layer());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("绑定地址失败: {}", addr))?;
    tracing::info!("查看接口已启动: http://{}/api/records", addr);
    if config.admin_api_key.is_none() {
        tracing::warn!("未配置 adminApiKey，查看接口不做认证");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("收到退出信号，正在关闭");
        })
        .await?;
    Ok(())
}
