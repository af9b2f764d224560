use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 流式数据解码配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngestConfig {
    /// 数据帧前缀
    #[serde(default = "default_frame_prefix")]
    pub frame_prefix: String,
    /// 流结束标记
    #[serde(default = "default_end_sentinel")]
    pub end_sentinel: String,
    /// 解码后需要剥离的内部前缀
    #[serde(default = "default_inner_marker")]
    pub inner_marker: String,
    /// 从 JSON 文档中提取文本内容的路径
    #[serde(default = "default_content_path")]
    pub content_path: Vec<String>,
}

fn default_frame_prefix() -> String {
    "data:".to_string()
}

fn default_end_sentinel() -> String {
    "<end>".to_string()
}

fn default_inner_marker() -> String {
    "<deep_x1>".to_string()
}

fn default_content_path() -> Vec<String> {
    vec!["data".to_string(), "content".to_string()]
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            frame_prefix: default_frame_prefix(),
            end_sentinel: default_end_sentinel(),
            inner_marker: default_inner_marker(),
            content_path: default_content_path(),
        }
    }
}

/// 应用配置（启动时固定）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// 最多保留的记录数，超出时按 FIFO 淘汰
    #[serde(default = "default_max_records", alias = "MAX_RECORDS")]
    pub max_records: usize,

    /// 变更通知的合并延迟（毫秒）
    #[serde(default = "default_debounce_ms", alias = "DEBOUNCE_MS")]
    pub debounce_ms: u64,

    /// 启动时是否开启抓包
    #[serde(default = "default_capture_enabled")]
    pub capture_enabled: bool,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// 查看接口的 API 密钥（可选，未配置时接口不做认证）
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_api_key: Option<String>,

    /// HTTP 代理地址（可选）
    /// 支持格式: http://host:port, https://host:port, socks5://host:port
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,

    /// 请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// 预设过滤关键字：URL 包含任一关键字的记录会被一键清除
    #[serde(default = "default_preset_filter_keywords")]
    pub preset_filter_keywords: Vec<String>,

    #[serde(default)]
    pub ingest: IngestConfig,

    /// 配置文件路径（运行时元数据，不写入 JSON）
    #[serde(skip)]
    pub(crate) config_path: Option<PathBuf>,
}

fn default_max_records() -> usize {
    1000
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_capture_enabled() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8089
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_preset_filter_keywords() -> Vec<String> {
    const KEYWORDS: &[&str] = &[
        "o.clarity.ms",
        "riskct.geetest.com",
        "openres.xfyun.cn",
        ".svg",
        ".png",
        ".jpg",
        ".jpeg",
        ".gif",
        ".ico",
        ".css",
        ".js",
        ".woff",
        ".woff2",
        "client_report",
    ];
    KEYWORDS.iter().map(|k| k.to_string()).collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
            debounce_ms: default_debounce_ms(),
            capture_enabled: default_capture_enabled(),
            host: default_host(),
            port: default_port(),
            admin_api_key: None,
            proxy_url: None,
            request_timeout_secs: default_request_timeout_secs(),
            preset_filter_keywords: default_preset_filter_keywords(),
            ingest: IngestConfig::default(),
            config_path: None,
        }
    }
}

impl Config {
    /// 获取默认配置文件路径
    pub fn default_config_path() -> &'static str {
        "config.json"
    }

    /// 从文件加载配置
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            // 配置文件不存在，返回默认配置
            let mut config = Self::default();
            config.config_path = Some(path.to_path_buf());
            return Ok(config);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        let mut config: Config = serde_json::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        config.validate()?;
        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// 获取配置文件路径（如果有）
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn debounce(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.debounce_ms)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.max_records == 0 {
            anyhow::bail!("maxRecords 必须大于 0");
        }
        if self.ingest.frame_prefix.is_empty() {
            anyhow::bail!("ingest.framePrefix 不能为空");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_records, 1000);
        assert_eq!(config.debounce_ms, 100);
        assert!(config.capture_enabled);
        assert_eq!(config.ingest.frame_prefix, "data:");
        assert_eq!(config.ingest.end_sentinel, "<end>");
        assert_eq!(config.ingest.content_path, vec!["data", "content"]);
    }

    #[test]
    fn test_parse_with_alias_keys() {
        let config: Config =
            serde_json::from_str(r#"{"MAX_RECORDS": 5, "DEBOUNCE_MS": 20}"#).unwrap();
        assert_eq!(config.max_records, 5);
        assert_eq!(config.debounce_ms, 20);
        assert!(config.capture_enabled);
    }

    #[test]
    fn test_parse_camel_case() {
        let config: Config = serde_json::from_str(
            r#"{"maxRecords": 3, "captureEnabled": false, "ingest": {"endSentinel": "[DONE]"}}"#,
        )
        .unwrap();
        assert_eq!(config.max_records, 3);
        assert!(!config.capture_enabled);
        assert_eq!(config.ingest.end_sentinel, "[DONE]");
        assert_eq!(config.ingest.frame_prefix, "data:");
    }

    #[test]
    fn test_load_missing_file_returns_default() {
        let config = Config::load("/nonexistent/sniffer-config.json").unwrap();
        assert_eq!(config.max_records, 1000);
        assert!(config.config_path().is_some());
    }

    #[test]
    fn test_load_rejects_zero_capacity() {
        let path = std::env::temp_dir().join(format!("sniffer-config-{}.json", uuid::Uuid::new_v4()));
        fs::write(&path, r#"{"maxRecords": 0}"#).unwrap();
        let result = Config::load(&path);
        let _ = fs::remove_file(&path);
        assert!(result.is_err());
    }
}
