use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// 媒体轨道类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Video => write!(f, "视频"),
            MediaKind::Audio => write!(f, "音频"),
        }
    }
}

/// 下一步应该解码哪条轨道
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeType {
    Audio,
    Video,
    EndOfStream,
    Interrupted,
}

/// 像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    RGBA,
    RGB,
    RGB565,
    YUV420P,
    NV12,
}

impl PixelFormat {
    /// 每像素字节数（平面格式按平均值计算）
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::RGBA => pixels * 4,
            PixelFormat::RGB => pixels * 3,
            PixelFormat::RGB565 => pixels * 2,
            PixelFormat::YUV420P | PixelFormat::NV12 => pixels * 3 / 2,
        }
    }
}

/// 音频采样格式（解码器原始输出）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    I16,
    F32,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::I16 => 2,
            SampleFormat::F32 => 4,
        }
    }
}

/// 压缩数据包（解封装输出，解码前由数据包队列持有）
#[derive(Debug, Clone, Default)]
pub struct Packet {
    pub stream_index: usize,
    pub pts: Option<f64>, // 显示时间戳（秒）
    pub dts: Option<f64>, // 解码时间戳（秒）
    pub key_frame: bool,
    pub data: Vec<u8>,
}

impl Packet {
    /// 用于排序的时间戳：优先 pts，没有则用 dts
    pub fn timestamp(&self) -> Option<f64> {
        self.pts.or(self.dts)
    }
}

/// 解封装器报告的流信息
#[derive(Debug, Clone, Default)]
pub struct StreamInfo {
    pub index: usize,
    pub kind: Option<MediaKind>,
    pub codec_name: String,
    pub time_base: f64,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_rate: u64,
    pub duration: Option<f64>, // 秒
    pub frame_count: u64,
    pub codec_private: Option<CodecPrivate>,
}

/// 后端私有的编解码参数：解封装时存入，同一个后端打开解码器时取回
#[derive(Clone)]
pub struct CodecPrivate(pub Arc<dyn Any + Send + Sync>);

impl CodecPrivate {
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for CodecPrivate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodecPrivate(..)")
    }
}

/// 已解码视频帧（环形缓冲的槽位，解码时原地写入）
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub pts: f64, // 秒（已加上 timestamp_offset）
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub key_frame: bool,
    pub data: Vec<u8>,
}

impl Default for VideoFrame {
    fn default() -> Self {
        Self {
            pts: 0.0,
            width: 0,
            height: 0,
            format: PixelFormat::RGBA,
            key_frame: false,
            data: Vec::new(),
        }
    }
}

/// 解码器原始音频输出（重采样前）
#[derive(Debug, Clone)]
pub struct RawAudio {
    pub pts: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
    pub planar: bool,
    pub samples: usize,      // 每声道采样数
    pub planes: Vec<Vec<u8>>, // packed 时只有一个平面
}

impl Default for RawAudio {
    fn default() -> Self {
        Self {
            pts: 0.0,
            sample_rate: 0,
            channels: 0,
            format: SampleFormat::F32,
            planar: false,
            samples: 0,
            planes: Vec::new(),
        }
    }
}

/// 音频帧数据（交错 f32，已统一声道数）
#[derive(Debug, Clone, Default)]
pub struct AudioFrame {
    pub pts: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub data: Vec<f32>,
}

/// 视频格式信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoFormatInfo {
    pub width: u32,
    pub height: u32,
    pub framerate: f64,
    pub format_name: String,
    pub duration: f64, // 秒
}

/// 音频格式信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioFormatInfo {
    pub bitrate: u64,
    pub sample_rate: u32,
    pub channels: u16,
    pub format_name: String,
    pub duration: f64, // 秒
}

/// 缓冲状态信息（用于监控和调试）
#[derive(Debug, Clone, Default, Serialize)]
pub struct BufferStatus {
    /// 视频数据包队列长度
    pub video_packets: usize,

    /// 音频数据包队列长度
    pub audio_packets: usize,

    /// 视频帧队列长度
    pub video_frames: usize,

    /// 音频帧队列长度
    pub audio_frames: usize,

    /// 硬件解码中尚未输出的帧数
    pub pending_hw_frames: usize,

    /// 是否正在等待网络数据
    pub is_buffering: bool,
}

/// 可排序的时间戳（秒），按 `f64::total_cmp` 比较
#[derive(Debug, Clone, Copy)]
pub struct Pts(pub f64);

impl PartialEq for Pts {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pts {}

impl PartialOrd for Pts {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pts {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_timestamp_falls_back_to_dts() {
        let packet = Packet {
            dts: Some(1.5),
            ..Default::default()
        };
        assert_eq!(packet.timestamp(), Some(1.5));

        let packet = Packet {
            pts: Some(2.0),
            dts: Some(1.5),
            ..Default::default()
        };
        assert_eq!(packet.timestamp(), Some(2.0));
    }

    #[test]
    fn test_pts_ordering() {
        let mut list = vec![Pts(0.1), Pts(-1.0), Pts(0.033)];
        list.sort();
        assert_eq!(list.iter().map(|p| p.0).collect::<Vec<_>>(), vec![-1.0, 0.033, 0.1]);
    }

    #[test]
    fn test_frame_size() {
        assert_eq!(PixelFormat::RGBA.frame_size(4, 2), 32);
        assert_eq!(PixelFormat::YUV420P.frame_size(4, 4), 24);
    }
}
