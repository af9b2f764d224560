//! 公共工具模块

pub mod auth;
pub mod headers;

/// 安全地截断 UTF-8 字符串，确保不会在多字节字符中间截断
///
/// 返回不超过 `max_bytes` 字节的最长有效 UTF-8 子串
pub fn truncate_str_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }

    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }

    &s[..end]
}

/// 安全地截断字符串并添加省略号后缀（用于日志预览）
pub fn truncate_with_ellipsis(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let truncate_at = if max_bytes > 3 { max_bytes - 3 } else { max_bytes };
    let truncated = truncate_str_safe(s, truncate_at);
    format!("{}...", truncated)
}

/// 日志中的负载预览
///
/// 默认只输出长度，启用 `sensitive-logs` feature 后输出截断后的内容
pub fn payload_preview(payload: &str) -> String {
    if cfg!(feature = "sensitive-logs") {
        truncate_with_ellipsis(payload, 256)
    } else {
        format!("<{} bytes>", payload.len())
    }
}

/// 捕获调用来源
///
/// 依赖 `RUST_BACKTRACE` / `RUST_LIB_BACKTRACE`；未开启时返回 "N/A"
pub fn capture_initiator() -> String {
    let backtrace = std::backtrace::Backtrace::capture();
    match backtrace.status() {
        std::backtrace::BacktraceStatus::Captured => parse_initiator(&backtrace.to_string()),
        _ => "N/A".to_string(),
    }
}

/// 过滤调用栈中属于抓包层自身和运行时的帧
pub fn parse_initiator(stack: &str) -> String {
    const IGNORED: &[&str] = &[
        "std::backtrace",
        "sniffer_rs::common::capture_initiator",
        "sniffer_rs::intercept::",
        "tokio::runtime",
        "core::future",
        "core::ops::function",
    ];

    let lines: Vec<&str> = stack
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !IGNORED.iter().any(|ignored| line.contains(ignored)))
        .collect();

    if lines.is_empty() {
        "N/A".to_string()
    } else {
        lines.join("\n")
    }
}
