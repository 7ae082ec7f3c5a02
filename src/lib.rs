//! 网络流解码与缓冲引擎
//!
//! 从可能很慢、可能卡住的网络字节源读取压缩音视频，解码后放进有界环形缓冲，
//! 供另一个线程的渲染 / 播放端消费。编解码库通过 [`engine::CodecBackend`] 注入。

pub mod core;
pub mod engine;

pub use crate::core::{DecodeType, DecoderError, ErrorKind, MediaKind, PipelineConfig, Result};
pub use crate::engine::{DecodePipeline, FrameConsumer, MediaData, PipelineFlags};
