use crate::core::types::MediaKind;
use thiserror::Error;

/// 错误分类（供调用方做机器判断）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 数据源 / 格式错误：源不可读、格式识别失败、编解码器不支持
    Source,
    /// 单个数据包解码失败（内部记录日志后跳过，不会返回给调用方）
    Transient,
    /// 致命错误：管线进入不可用状态，调用方需要 deinit 后重建
    Fatal,
    /// 被中断（不是错误，只是提前返回）
    Cancelled,
    /// 调用方式错误：未初始化、输出缓冲已满、暂无可用帧
    Usage,
}

#[derive(Error, Debug)]
pub enum DecoderError {
    #[error("FFmpeg 错误: {0}")]
    #[cfg(feature = "ffmpeg")]
    FFmpegError(#[from] ffmpeg_next::Error),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("无法打开数据源: {0}")]
    OpenError(String),

    #[error("数据源类型不匹配: 期望 {expected}, 实际 {found}")]
    KindMismatch { expected: MediaKind, found: String },

    #[error("无法找到{0}流")]
    NoStream(MediaKind),

    #[error("不支持的编解码器: {0}")]
    UnsupportedCodec(String),

    #[error("网络数据源失效: {0}")]
    SourceFailed(String),

    #[error("解码错误: {0}")]
    DecodeError(String),

    #[error("上下文分配失败: {0}")]
    ContextError(String),

    #[error("重采样器初始化失败: {0}")]
    ResamplerError(String),

    #[error("硬件解码服务拒绝: {0}")]
    HardwareRejected(String),

    #[error("解码管线未就绪")]
    NotReady,

    #[error("{0}输出缓冲已满")]
    OutputFull(MediaKind),

    #[error("{0}数据包队列为空")]
    NoPacket(MediaKind),

    #[error("暂无已解码的视频帧")]
    NoFrame,

    #[error("操作被中断")]
    Interrupted,

    #[error("其他错误: {0}")]
    Other(String),
}

impl DecoderError {
    /// 错误分类
    pub fn kind(&self) -> ErrorKind {
        match self {
            #[cfg(feature = "ffmpeg")]
            DecoderError::FFmpegError(_) => ErrorKind::Fatal,
            DecoderError::IoError(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                ErrorKind::Cancelled
            }
            DecoderError::IoError(_)
            | DecoderError::OpenError(_)
            | DecoderError::KindMismatch { .. }
            | DecoderError::NoStream(_)
            | DecoderError::UnsupportedCodec(_)
            | DecoderError::SourceFailed(_) => ErrorKind::Source,
            DecoderError::DecodeError(_) => ErrorKind::Transient,
            DecoderError::ContextError(_)
            | DecoderError::ResamplerError(_)
            | DecoderError::HardwareRejected(_)
            | DecoderError::Other(_) => ErrorKind::Fatal,
            DecoderError::Interrupted => ErrorKind::Cancelled,
            DecoderError::NotReady
            | DecoderError::OutputFull(_)
            | DecoderError::NoPacket(_)
            | DecoderError::NoFrame => ErrorKind::Usage,
        }
    }

    /// 是否会让管线进入不可用状态
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

pub type Result<T> = std::result::Result<T, DecoderError>;
