//! 单行解析：事件流中的一行 → 一条 StreamMessage

use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};

use crate::model::config::IngestConfig;
use crate::model::record::{MessageKind, StreamMessage};

/// 宽松的 base64 解码器：填充可有可无
const FORGIVING_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// 解析一行完整的事件流数据
///
/// 不以帧前缀开头的行返回 None；解码失败降级为 raw 消息，永不报错
pub fn parse_line(line: &str, config: &IngestConfig) -> Option<StreamMessage> {
    let payload = line.strip_prefix(config.frame_prefix.as_str())?.trim();

    if payload == config.end_sentinel {
        return Some(StreamMessage::new(MessageKind::End, line));
    }

    let decoded = match FORGIVING_BASE64
        .decode(payload)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
    {
        Some(text) => text,
        None => {
            return Some(StreamMessage::new(MessageKind::Raw, line).with_content(payload));
        }
    };

    let cleaned = decoded
        .strip_prefix(config.inner_marker.as_str())
        .unwrap_or(&decoded);

    match serde_json::from_str::<serde_json::Value>(cleaned) {
        Ok(envelope) => {
            let content = extract_text(&envelope, &config.content_path).map(str::to_string);
            let mut message = StreamMessage::new(MessageKind::Data, line).with_envelope(envelope);
            message.decoded_content = content;
            Some(message)
        }
        Err(_) => Some(StreamMessage::new(MessageKind::Data, line).with_content(decoded)),
    }
}

/// 按路径提取嵌套的字符串字段
fn extract_text<'a>(value: &'a serde_json::Value, path: &[String]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |current, key| current.get(key.as_str()))
        .and_then(|v| v.as_str())
}

#[cfg(test)]
pub(crate) fn encode_frame(config: &IngestConfig, document: &str) -> String {
    format!(
        "{}{}",
        config.frame_prefix,
        base64::engine::general_purpose::STANDARD.encode(format!("{}{}", config.inner_marker, document))
    )
}
