//! 编解码层接口
//!
//! 解封装、解码、硬件加速服务都属于外部编解码库，这里只定义引擎需要的最小契约。
//! 后端（`CodecBackend`）以显式对象的形式注入管线，不依赖任何全局状态。

use crate::core::{DecoderError, Packet, PixelFormat, RawAudio, Result, StreamInfo, VideoFrame};
use crate::engine::network_source::SourceReader;
use crate::engine::pts_set::HwFrameSink;

/// 单次解码的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// 输出缓冲已写入一帧
    Frame,
    /// 解码器需要更多数据（例如 B 帧延迟），本次没有输出
    NeedMoreData,
    /// 解码器内部已经没有缓存的帧（只由 `drain` 返回）
    Drained,
}

/// 解封装器：从字节源读取压缩数据包
pub trait Demuxer: Send {
    /// 容器内的全部流
    fn streams(&self) -> &[StreamInfo];

    /// 读取下一个数据包（可能阻塞在网络读取上）
    ///
    /// 返回：
    /// - Ok(Some(packet)): 成功读取一个包
    /// - Ok(None): 到达末尾
    /// - Err(e): 读取错误
    fn read_packet(&mut self) -> Result<Option<Packet>>;

    /// 定位到指定时间（微秒），落在该时间之前最近的关键帧上
    fn seek(&mut self, timestamp_us: i64) -> Result<()>;

    /// 容器报告的总时长（秒）
    fn duration(&self) -> Option<f64>;

    /// 容器格式名称
    fn format_name(&self) -> String;

    /// 容器整体码率（bit/s）
    fn bit_rate(&self) -> u64 {
        0
    }
}

/// 软件视频解码器：同步解码，结果直接写入环形缓冲槽位
pub trait VideoDecoder: Send {
    fn decode(&mut self, packet: &Packet, out: &mut VideoFrame) -> Result<DecodeStatus>;

    /// 输入已经结束：每次取出一帧缓存在解码器内部的帧，全部取完后返回 `Drained`
    ///
    /// 之后需要先 `flush` 才能继续解码。
    fn drain(&mut self, _out: &mut VideoFrame) -> Result<DecodeStatus> {
        Ok(DecodeStatus::Drained)
    }

    fn flush(&mut self);
    fn output_format(&self) -> PixelFormat;
    fn name(&self) -> String;
}

/// 音频解码器：输出原始采样，交给重采样器统一格式
pub trait AudioDecoder: Send {
    fn decode(&mut self, packet: &Packet, out: &mut RawAudio) -> Result<DecodeStatus>;

    /// 同 [`VideoDecoder::drain`]
    fn drain(&mut self, _out: &mut RawAudio) -> Result<DecodeStatus> {
        Ok(DecodeStatus::Drained)
    }

    fn flush(&mut self);
    fn name(&self) -> String;
}

/// 硬件视频解码服务：异步提交 / 完成
///
/// `submit` 只负责把数据包交给加速器（可能因输入队列满而短暂阻塞）；
/// 解码完成后由服务在它自己的执行上下文里调用 [`HwFrameSink::complete_with`]。
pub trait HardwareVideoDecoder: Send {
    fn submit(&mut self, packet: &Packet) -> Result<()>;

    /// 丢弃所有尚未完成的工作（seek 时调用），返回前保证不会再有旧的完成回调
    fn flush(&mut self);

    fn name(&self) -> String;
}

/// 编解码后端
pub trait CodecBackend: Send + Sync {
    fn name(&self) -> String;

    /// 在字节源上打开解封装器并识别媒体格式
    fn open_demuxer(&self, reader: SourceReader) -> Result<Box<dyn Demuxer>>;

    fn open_video_decoder(&self, stream: &StreamInfo) -> Result<Box<dyn VideoDecoder>>;

    fn open_audio_decoder(&self, stream: &StreamInfo) -> Result<Box<dyn AudioDecoder>>;

    /// 是否能用硬件解码该视频流
    fn supports_hw_decoder(&self, _stream: &StreamInfo) -> bool {
        false
    }

    fn open_hw_video_decoder(
        &self,
        stream: &StreamInfo,
        _sink: HwFrameSink,
    ) -> Result<Box<dyn HardwareVideoDecoder>> {
        Err(DecoderError::UnsupportedCodec(format!(
            "{} 不支持硬件解码",
            stream.codec_name
        )))
    }
}
