//! 增量解码器：任意切分的字节块 → 按行解析的消息序列

use std::sync::Arc;

use crate::model::config::IngestConfig;
use crate::model::record::StreamMessage;

use super::parser::parse_line;

/// 单条记录的流解码状态
///
/// 缓冲区按字节保存，多字节 UTF-8 字符被切在两个块之间时也能正确拼接，
/// 因此任意切分方式得到的消息序列与一次性输入完全相同。
#[derive(Debug)]
pub struct StreamDecoder {
    config: Arc<IngestConfig>,
    pending: Vec<u8>,
    bytes_seen: u64,
}

impl StreamDecoder {
    pub fn new(config: Arc<IngestConfig>) -> Self {
        Self {
            config,
            pending: Vec::new(),
            bytes_seen: 0,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(Arc::new(IngestConfig::default()))
    }

    /// 输入一个新块，返回其中所有完整行解析出的消息
    ///
    /// 最后一个（可能不完整的）片段留在缓冲区等待下一块
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamMessage> {
        self.bytes_seen += chunk.len() as u64;
        self.pending.extend_from_slice(chunk);

        let Some(last_newline) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };

        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        self.parse_lines(&complete)
    }

    /// 传输结束：处理缓冲区中剩余的未终止行
    pub fn finish(&mut self) -> Vec<StreamMessage> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let remaining = std::mem::take(&mut self.pending);
        self.parse_lines(&remaining)
    }

    /// 已输入的总字节数
    pub fn bytes_seen(&self) -> u64 {
        self.bytes_seen
    }

    /// 缓冲区中尚未成行的字节数
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn parse_lines(&self, bytes: &[u8]) -> Vec<StreamMessage> {
        bytes
            .split(|&b| b == b'\n')
            .filter_map(|raw| {
                let line = String::from_utf8_lossy(raw);
                let line = line.trim_end_matches('\r');
                if line.trim().is_empty() {
                    return None;
                }
                parse_line(line, &self.config)
            })
            .collect()
    }
}
