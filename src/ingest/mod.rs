//! 流式数据解码引擎
//!
//! 将增量到达的文本流转换为有序的 StreamMessage 序列，每个完整行一条消息。
//! 纯增量转换：不阻塞、不依赖流结束，对块的切分位置不敏感。

mod decoder;
mod parser;

pub use decoder::StreamDecoder;
pub use parser::parse_line;

#[cfg(test)]
pub(crate) use parser::encode_frame;
