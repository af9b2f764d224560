//! 请求头 / URL 规范化

use std::collections::BTreeMap;

use http::HeaderMap;
use reqwest::Url;

/// HeaderMap 转为小写键名的有序表
///
/// 同名多值以 ", " 合并；非 UTF-8 的值有损转换
pub fn header_map_to_btree(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        map.entry(name.as_str().to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    map
}

/// 解析 CRLF 分隔的原始响应头字符串（"name: value\r\n..."）
pub fn parse_raw_headers(raw: &str) -> BTreeMap<String, String> {
    raw.split("\r\n")
        .filter_map(|line| line.split_once(": "))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.to_string()))
        .collect()
}

/// 取 content-type 头
pub fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
}

/// 将相对 URL 按 base 解析为绝对 URL，失败时原样返回
pub fn resolve_url(url: &str, base: Option<&str>) -> String {
    if let Ok(parsed) = Url::parse(url) {
        return parsed.to_string();
    }
    base.and_then(|b| Url::parse(b).ok())
        .and_then(|b| b.join(url).ok())
        .map(|u| u.to_string())
        .unwrap_or_else(|| url.to_string())
}
