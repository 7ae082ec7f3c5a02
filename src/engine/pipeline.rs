//! 解码管线
//!
//! 所有方法都在同一个解码线程上调用；消费端通过 [`FrameConsumer`] 在另一个线程取帧，
//! 两者之间只通过环形缓冲和 [`PipelineFlags`] 交互。典型的解码循环：
//!
//! ```text
//! loop {
//!     match pipeline.next_decode_type()? {
//!         DecodeType::Video => pipeline.decode_video()?,
//!         DecodeType::Audio => pipeline.decode_audio()?,
//!         DecodeType::EndOfStream | DecodeType::Interrupted => break,
//!     }
//! }
//! ```

use crate::core::{
    AudioFormatInfo, AudioFrame, BufferStatus, DecodeType, DecoderError, ErrorKind, MediaKind, Packet,
    PipelineConfig, RawAudio, Result, StreamInfo, VideoFormatInfo, VideoFrame,
};
use crate::engine::buffering::{BufferingBar, BufferingMonitor};
use crate::engine::codec::{CodecBackend, DecodeStatus};
use crate::engine::flags::PipelineFlags;
use crate::engine::output::FrameConsumer;
use crate::engine::pts_set::HwFrameSink;
use crate::engine::resampler::{copy_packed_f32, Resampler};
use crate::engine::ring_buffer::RingBuffer;
use crate::engine::track::{MediaData, StreamSet, TrackDecoder, VideoPath};
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::process;
use std::sync::Arc;
use std::thread;

const LOG_FIRST_PACKETS: usize = 5;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 软件解码产出一帧时返回的信息
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoFrameInfo {
    pub width: u32,
    pub height: u32,
    pub key_frame: bool,
    pub pts: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VideoDecodeOutcome {
    /// 软件解码：一帧已写入视频缓冲
    Frame(VideoFrameInfo),
    /// 硬件解码：数据包已提交，帧稍后由完成回调写入
    Submitted { pts: f64 },
    /// 没有产出（解码器需要更多数据，或坏包已跳过）
    NoFrame,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AudioDecodeOutcome {
    /// 一块音频已写入音频缓冲
    Block { samples: usize, pts: f64 },
    NoFrame,
}

/// 两条轨道的待解码数据包
#[derive(Default)]
struct PacketQueues {
    video: VecDeque<Packet>,
    audio: VecDeque<Packet>,
    last_video_ts: f64,
    last_audio_ts: f64,
    video_count: usize,
    audio_count: usize,
    // 到达末尾后解码器已经排空
    video_drained: bool,
    audio_drained: bool,
}

impl PacketQueues {
    fn queue(&self, kind: MediaKind) -> &VecDeque<Packet> {
        match kind {
            MediaKind::Video => &self.video,
            MediaKind::Audio => &self.audio,
        }
    }

    fn push(&mut self, kind: MediaKind, mut packet: Packet, log_every: usize) {
        let (queue, last_ts, count) = match kind {
            MediaKind::Video => (&mut self.video, &mut self.last_video_ts, &mut self.video_count),
            MediaKind::Audio => (&mut self.audio, &mut self.last_audio_ts, &mut self.audio_count),
        };
        // 没有时间戳的包沿用同轨道上一个包的时间戳
        match packet.timestamp() {
            Some(ts) => *last_ts = ts,
            None => packet.pts = Some(*last_ts),
        }
        *count += 1;
        if *count <= LOG_FIRST_PACKETS || (log_every > 0 && *count % log_every == 0) {
            debug!(
                "📦 {}包 #{}: pts={:.3}s, {} 字节, 关键帧={}",
                kind,
                count,
                *last_ts,
                packet.data.len(),
                packet.key_frame
            );
        }
        queue.push_back(packet);
    }

    fn pop(&mut self, kind: MediaKind) -> Option<Packet> {
        match kind {
            MediaKind::Video => self.video.pop_front(),
            MediaKind::Audio => self.audio.pop_front(),
        }
    }

    fn front_timestamp(&self, kind: MediaKind) -> Option<f64> {
        self.queue(kind).front().and_then(Packet::timestamp)
    }

    fn is_drained(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Video => self.video_drained,
            MediaKind::Audio => self.audio_drained,
        }
    }

    fn set_drained(&mut self, kind: MediaKind) {
        debug!("{} ✓ {}解码器已排空", log_ctx(), kind);
        match kind {
            MediaKind::Video => self.video_drained = true,
            MediaKind::Audio => self.audio_drained = true,
        }
    }

    fn clear(&mut self) {
        self.video.clear();
        self.audio.clear();
        self.last_video_ts = 0.0;
        self.last_audio_ts = 0.0;
        self.video_drained = false;
        self.audio_drained = false;
    }
}

/// 解码管线：数据包队列 + 解码器 + 两个输出环形缓冲
pub struct DecodePipeline {
    backend: Arc<dyn CodecBackend>,
    config: PipelineConfig,
    flags: Arc<PipelineFlags>,
    data: Option<MediaData>,
    queues: PacketQueues,
    video_out: Arc<RingBuffer<VideoFrame>>,
    audio_out: Arc<RingBuffer<AudioFrame>>,
    consumer: Option<FrameConsumer>,
    raw_audio: RawAudio,
    timestamp_offset: f64,
    position: f64, // 最近一次产出的时间戳（秒，含偏移），reinit 时从这里继续
    hw_requested: bool,
    hw_enabled: bool,
}

impl DecodePipeline {
    pub fn new(backend: Arc<dyn CodecBackend>, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        info!(
            "{} 🎬 创建解码管线: 后端 {}, 视频缓冲 {} 帧, 音频缓冲 {} 块",
            log_ctx(),
            backend.name(),
            config.video_buffer_frames,
            config.audio_buffer_blocks
        );
        let video_out = Arc::new(RingBuffer::new(config.video_buffer_frames, VideoFrame::default));
        let audio_out = Arc::new(RingBuffer::new(config.audio_buffer_blocks, AudioFrame::default));
        let consumer = FrameConsumer::new(Arc::clone(&video_out), Arc::clone(&audio_out));
        Ok(Self {
            backend,
            config,
            flags: PipelineFlags::new(),
            data: None,
            queues: PacketQueues::default(),
            video_out,
            audio_out,
            consumer: Some(consumer),
            raw_audio: RawAudio::default(),
            timestamp_offset: 0.0,
            position: 0.0,
            hw_requested: false,
            hw_enabled: false,
        })
    }

    /// 状态标志（打开 `MediaData` 时需要传入同一份标志）
    pub fn flags(&self) -> &Arc<PipelineFlags> {
        &self.flags
    }

    pub fn backend(&self) -> &Arc<dyn CodecBackend> {
        &self.backend
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn media_data(&self) -> Option<&MediaData> {
        self.data.as_ref()
    }

    pub fn timestamp_offset(&self) -> f64 {
        self.timestamp_offset
    }

    /// 取走消费端（交给渲染 / 播放线程），只能取一次
    pub fn take_consumer(&mut self) -> Option<FrameConsumer> {
        self.consumer.take()
    }

    /// 换用新的轨道上下文（例如切换清晰度或下一个分段）
    ///
    /// 之后输出的所有时间戳都会加上 `timestamp_offset`。需要重新调用 `init`。
    pub fn change_media_data(&mut self, data: MediaData, timestamp_offset: f64) -> Result<()> {
        if !Arc::ptr_eq(data.flags(), &self.flags) {
            return Err(DecoderError::Other(
                "媒体数据不是用这个解码管线的标志打开的".to_string(),
            ));
        }
        info!(
            "{} 🔀 切换媒体数据: {}, 时间偏移 {:.3}s",
            log_ctx(),
            if data.is_separate() { "分离流" } else { "复用流" },
            timestamp_offset
        );
        self.flags.set_ready(false);
        if let Some(old) = self.data.take() {
            old.deinit(false);
        }
        // 旧上下文注销时可能带走了和新上下文共用的数据源
        for demux in data.demux_contexts() {
            self.flags.register_source(demux.source());
        }
        self.queues.clear();
        self.video_out.clear();
        self.audio_out.clear();
        self.data = Some(data);
        self.timestamp_offset = timestamp_offset;
        self.position = timestamp_offset;
        self.hw_enabled = false;
        Ok(())
    }

    /// 为当前轨道创建解码器
    ///
    /// `request_hw` 为 true 且后端支持时优先使用硬件解码，失败则回退到软件解码。
    pub fn init(&mut self, request_hw: bool) -> Result<()> {
        self.flags.set_ready(false);
        let backend = Arc::clone(&self.backend);
        let data = self
            .data
            .as_mut()
            .ok_or_else(|| DecoderError::Other("尚未设置媒体数据".to_string()))?;

        let mut bind = || -> Result<bool> {
            let mut hw_enabled = false;
            if let Some(track) = data.track_mut(MediaKind::Video) {
                let path = open_video_path(backend.as_ref(), &track.stream, request_hw, &self.video_out)?;
                hw_enabled = matches!(path, VideoPath::Hardware { .. });
                track.decoder = Some(TrackDecoder::Video(path));
            }
            if let Some(track) = data.track_mut(MediaKind::Audio) {
                let decoder = backend.open_audio_decoder(&track.stream)?;
                info!(
                    "✓ 音频解码器: {} ({} Hz, {} 声道)",
                    decoder.name(),
                    track.stream.sample_rate,
                    track.stream.channels
                );
                track.decoder = Some(TrackDecoder::Audio {
                    decoder,
                    resampler: None,
                });
            }
            Ok(hw_enabled)
        };

        match bind() {
            Ok(hw_enabled) => {
                self.hw_requested = request_hw;
                self.hw_enabled = hw_enabled;
                self.flags.set_ready(true);
                info!(
                    "{} ✅ 解码管线就绪 (硬件解码: {})",
                    log_ctx(),
                    if hw_enabled { "开" } else { "关" }
                );
                Ok(())
            }
            Err(e) => {
                error!("{} ❌ 解码器初始化失败: {}", log_ctx(), e);
                for kind in [MediaKind::Video, MediaKind::Audio] {
                    if let Some(track) = data.track_mut(kind) {
                        track.decoder = None;
                    }
                }
                Err(e)
            }
        }
    }

    /// 释放解码器、队列和缓冲
    ///
    /// `deinit_stream` 为 false 时网络字节源保持打开并返回给调用方。
    pub fn deinit(&mut self, deinit_stream: bool) -> Option<StreamSet> {
        info!("{} 🛑 释放解码管线", log_ctx());
        self.flags.set_ready(false);
        self.queues.clear();
        // 先释放解码器（硬件解码服务在这里停止回调），再清空缓冲
        let streams = self.data.take().and_then(|data| data.deinit(deinit_stream));
        self.video_out.clear();
        self.audio_out.clear();
        self.hw_enabled = false;
        streams
    }

    /// 网络层重新协商数据源之后，在原数据源上重建全部上下文并回到之前的位置
    pub fn reinit(&mut self) -> Result<()> {
        let data = self
            .data
            .take()
            .ok_or_else(|| DecoderError::Other("尚未设置媒体数据".to_string()))?;
        let resume = self.position;
        info!("{} 🔄 重新初始化解码管线，从 {:.3}s 继续", log_ctx(), resume);
        self.flags.set_ready(false);
        self.queues.clear();
        let rebuilt = data.reinit(self.backend.as_ref());
        self.video_out.clear();
        self.audio_out.clear();
        self.data = Some(rebuilt?);
        self.init(self.hw_requested)?;
        if resume > self.timestamp_offset {
            self.seek((resume * 1_000_000.0) as i64)?;
        }
        self.flags.set_need_reinit(false);
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.flags.is_ready() {
            Ok(())
        } else {
            Err(DecoderError::NotReady)
        }
    }

    /// 决定下一步解码哪条轨道：队首时间戳较小的一方优先，相同时视频优先
    ///
    /// 队列为空时会从网络读取（可能阻塞）；设置了中断标志时立即返回 `Interrupted`。
    /// 某条轨道读到末尾后先把它的解码器排空（解码器内部还缓存着帧），
    /// 两条轨道都排空之后才返回 `EndOfStream`。
    pub fn next_decode_type(&mut self) -> Result<DecodeType> {
        if self.flags.is_interrupted() {
            return Ok(DecodeType::Interrupted);
        }
        self.ensure_ready()?;

        for kind in [MediaKind::Video, MediaKind::Audio] {
            match self.fill_queue(kind) {
                Ok(true) => {}
                Ok(false) => {
                    debug!("{} ⏹ 读取被中断", log_ctx());
                    return Ok(DecodeType::Interrupted);
                }
                Err(e) => {
                    error!("{} ❌ 读取{}数据包失败: {}", log_ctx(), kind, e);
                    return Err(note_failure(&self.flags, e));
                }
            }
        }

        if self.pending_drain(MediaKind::Video) {
            return Ok(DecodeType::Video);
        }
        if self.pending_drain(MediaKind::Audio) {
            return Ok(DecodeType::Audio);
        }

        let video = self.queues.front_timestamp(MediaKind::Video);
        let audio = self.queues.front_timestamp(MediaKind::Audio);
        Ok(match (video, audio) {
            (None, None) => {
                info!("{} 🏁 所有轨道已解码完毕", log_ctx());
                DecodeType::EndOfStream
            }
            (Some(_), None) => DecodeType::Video,
            (None, Some(_)) => DecodeType::Audio,
            (Some(v), Some(a)) if a < v => DecodeType::Audio,
            (Some(_), Some(_)) => DecodeType::Video,
        })
    }

    /// 轨道已读到末尾、队列已空，但软件解码器还没有排空
    fn pending_drain(&self, kind: MediaKind) -> bool {
        if self.queues.is_drained(kind) || !self.queues.queue(kind).is_empty() {
            return false;
        }
        let Some(data) = self.data.as_ref() else {
            return false;
        };
        let Some(track) = data.track(kind) else {
            return false;
        };
        data.demux(kind).is_eof()
            && matches!(
                track.decoder,
                Some(TrackDecoder::Video(VideoPath::Software(_))) | Some(TrackDecoder::Audio { .. })
            )
    }

    /// 读取数据包直到该轨道队列非空或到达末尾；返回 false 表示被中断
    fn fill_queue(&mut self, kind: MediaKind) -> Result<bool> {
        let Some(data) = self.data.as_mut() else {
            return Ok(true);
        };
        let Some(own_index) = data.track(kind).map(|t| t.stream_index) else {
            return Ok(true);
        };
        let separate = data.is_separate();
        let video_index = data.track(MediaKind::Video).map(|t| t.stream_index);
        let audio_index = data.track(MediaKind::Audio).map(|t| t.stream_index);

        while self.queues.queue(kind).is_empty() {
            if self.flags.is_interrupted() {
                return Ok(false);
            }
            let packet = match data.demux_mut(kind).read_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => break,
                Err(DecoderError::Interrupted) => return Ok(false),
                Err(e) => return Err(e),
            };
            let target = if separate {
                (packet.stream_index == own_index).then_some(kind)
            } else if Some(packet.stream_index) == video_index {
                Some(MediaKind::Video)
            } else if Some(packet.stream_index) == audio_index {
                Some(MediaKind::Audio)
            } else {
                None
            };
            if let Some(target) = target {
                self.queues.push(target, packet, self.config.packet_log_every);
            }
        }
        Ok(true)
    }

    /// 解码一个视频数据包
    ///
    /// 视频缓冲已满（硬件模式下包括尚未完成的帧）时返回 `OutputFull`，数据包留在队列中。
    pub fn decode_video(&mut self) -> Result<VideoDecodeOutcome> {
        self.ensure_ready()?;
        if self.flags.is_interrupted() {
            return Err(DecoderError::Interrupted);
        }
        let offset = self.timestamp_offset;
        let data = self.data.as_mut().ok_or(DecoderError::NotReady)?;
        let at_eof = data.demux(MediaKind::Video).is_eof();
        let track = data
            .track_mut(MediaKind::Video)
            .ok_or(DecoderError::NoStream(MediaKind::Video))?;
        let Some(TrackDecoder::Video(path)) = track.decoder.as_mut() else {
            return Err(DecoderError::NotReady);
        };

        match path {
            VideoPath::Software(decoder) => {
                let Some(mut slot) = self.video_out.push_slot() else {
                    return Err(DecoderError::OutputFull(MediaKind::Video));
                };
                let result = match self.queues.pop(MediaKind::Video) {
                    Some(packet) => decoder.decode(&packet, &mut slot),
                    None if at_eof && !self.queues.is_drained(MediaKind::Video) => {
                        let drained = decoder.drain(&mut slot);
                        if !matches!(drained, Ok(DecodeStatus::Frame)) {
                            self.queues.set_drained(MediaKind::Video);
                        }
                        drained
                    }
                    None => return Err(DecoderError::NoPacket(MediaKind::Video)),
                };
                match result {
                    Ok(DecodeStatus::Frame) => {
                        slot.pts += offset;
                        let info = VideoFrameInfo {
                            width: slot.width,
                            height: slot.height,
                            key_frame: slot.key_frame,
                            pts: slot.pts,
                        };
                        slot.commit();
                        self.position = info.pts;
                        Ok(VideoDecodeOutcome::Frame(info))
                    }
                    Ok(DecodeStatus::NeedMoreData | DecodeStatus::Drained) => {
                        Ok(VideoDecodeOutcome::NoFrame)
                    }
                    Err(e) => absorb(&self.flags, MediaKind::Video, e, VideoDecodeOutcome::NoFrame),
                }
            }
            VideoPath::Hardware { decoder, sink } => {
                if self.video_out.size() + sink.pending() >= self.video_out.capacity() {
                    return Err(DecoderError::OutputFull(MediaKind::Video));
                }
                let packet = self
                    .queues
                    .pop(MediaKind::Video)
                    .ok_or(DecoderError::NoPacket(MediaKind::Video))?;
                let pts = packet.timestamp().unwrap_or(0.0) + offset;
                // 先登记时间戳再提交，完成回调可能比 submit 返回得更早
                sink.record_submission(pts);
                match decoder.submit(&packet) {
                    Ok(()) => {
                        self.position = self.position.max(pts);
                        Ok(VideoDecodeOutcome::Submitted { pts })
                    }
                    Err(e) => {
                        sink.cancel_submission(pts);
                        absorb(&self.flags, MediaKind::Video, e, VideoDecodeOutcome::NoFrame)
                    }
                }
            }
        }
    }

    /// 解码一个音频数据包，统一成交错 f32 后写入音频缓冲
    pub fn decode_audio(&mut self) -> Result<AudioDecodeOutcome> {
        self.ensure_ready()?;
        if self.flags.is_interrupted() {
            return Err(DecoderError::Interrupted);
        }
        let offset = self.timestamp_offset;
        let target_channels = self.config.audio_target_channels;
        let data = self.data.as_mut().ok_or(DecoderError::NotReady)?;
        let at_eof = data.demux(MediaKind::Audio).is_eof();
        let track = data
            .track_mut(MediaKind::Audio)
            .ok_or(DecoderError::NoStream(MediaKind::Audio))?;
        let Some(TrackDecoder::Audio { decoder, resampler }) = track.decoder.as_mut() else {
            return Err(DecoderError::NotReady);
        };

        let Some(mut slot) = self.audio_out.push_slot() else {
            return Err(DecoderError::OutputFull(MediaKind::Audio));
        };
        let result = match self.queues.pop(MediaKind::Audio) {
            Some(packet) => decoder.decode(&packet, &mut self.raw_audio),
            None if at_eof && !self.queues.is_drained(MediaKind::Audio) => {
                let drained = decoder.drain(&mut self.raw_audio);
                if !matches!(drained, Ok(DecodeStatus::Frame)) {
                    self.queues.set_drained(MediaKind::Audio);
                }
                drained
            }
            None => return Err(DecoderError::NoPacket(MediaKind::Audio)),
        };
        match result {
            Ok(DecodeStatus::Frame) => {}
            Ok(DecodeStatus::NeedMoreData | DecodeStatus::Drained) => {
                return Ok(AudioDecodeOutcome::NoFrame)
            }
            Err(e) => return absorb(&self.flags, MediaKind::Audio, e, AudioDecodeOutcome::NoFrame),
        }

        // 解码器输出的格式可能在中途改变（例如 HE-AAC/PS 从单声道变成立体声）
        let raw = &self.raw_audio;
        let needed = Resampler::is_needed(raw.format, raw.planar, raw.channels, target_channels);
        let stale = match resampler.as_ref() {
            Some(current) => !needed || !current.accepts(raw),
            None => needed,
        };
        if stale {
            if resampler.take().is_some() {
                info!(
                    "{} 🔧 音频格式变为 {:?}{} {} 声道，重建重采样器",
                    log_ctx(),
                    raw.format,
                    if raw.planar { "(planar)" } else { "" },
                    raw.channels
                );
            }
            if needed {
                match Resampler::new(raw.format, raw.planar, raw.channels, target_channels) {
                    Ok(created) => *resampler = Some(created),
                    Err(e) => {
                        error!("{} ❌ {}", log_ctx(), e);
                        self.flags.set_ready(false);
                        return Err(e);
                    }
                }
            }
        }
        let converted = match resampler.as_mut() {
            Some(resampler) => resampler.run(raw, &mut slot),
            None => copy_packed_f32(raw, &mut slot),
        };
        if let Err(e) = converted {
            return absorb(&self.flags, MediaKind::Audio, e, AudioDecodeOutcome::NoFrame);
        }

        slot.pts += offset;
        let pts = slot.pts;
        let samples = slot.data.len() / slot.channels.max(1) as usize;
        slot.commit();
        if data.track(MediaKind::Video).is_none() {
            self.position = pts;
        }
        Ok(AudioDecodeOutcome::Block { samples, pts })
    }

    /// 跳转到 `timestamp_us`（微秒，与输出时间戳同一时间轴）
    ///
    /// 清空数据包队列和两个输出缓冲，丢弃所有尚未完成的硬件解码帧。
    pub fn seek(&mut self, timestamp_us: i64) -> Result<()> {
        let offset_us = (self.timestamp_offset * 1_000_000.0).round() as i64;
        let target = (timestamp_us - offset_us).max(0);
        info!(
            "{} 🎯 Seek 到: {} us (流内 {} us)",
            log_ctx(),
            timestamp_us,
            target
        );
        let data = self.data.as_mut().ok_or(DecoderError::NotReady)?;

        self.queues.clear();
        // 先 flush：硬件解码服务返回后不会再有旧帧的完成回调
        for kind in [MediaKind::Video, MediaKind::Audio] {
            if let Some(decoder) = data.track_mut(kind).and_then(|t| t.decoder.as_mut()) {
                decoder.flush();
            }
        }
        match hw_sink_of(data) {
            Some(sink) => {
                let dropped = sink.reset();
                if dropped > 0 {
                    debug!("✓ 丢弃 {} 个未完成的硬件解码帧", dropped);
                }
            }
            None => self.video_out.clear(),
        }
        self.audio_out.clear();

        for demux in data.demux_contexts_mut() {
            if let Err(e) = demux.seek(target) {
                error!("{} ❌ Seek 失败: {}", log_ctx(), e);
                return Err(note_failure(&self.flags, e));
            }
        }
        self.position = timestamp_us as f64 / 1_000_000.0;
        Ok(())
    }

    /// 只清空两个输出缓冲（不影响数据包队列和解码器状态）
    pub fn clear_buffer(&mut self) {
        debug!("{} 🧹 清空输出缓冲", log_ctx());
        match self.data.as_ref().and_then(hw_sink_of) {
            Some(sink) => sink.clear_output(),
            None => self.video_out.clear(),
        }
        self.audio_out.clear();
    }

    /// 取出最早的一帧视频（消费端还没有被取走时可以直接在管线上取）
    pub fn get_decoded_video_frame(&mut self) -> Result<&VideoFrame> {
        self.consumer
            .as_mut()
            .ok_or_else(|| DecoderError::Other("消费端已被取走".to_string()))?
            .get_decoded_video_frame()
    }

    pub fn get_video_info(&self) -> VideoFormatInfo {
        let Some(data) = self.data.as_ref() else {
            return VideoFormatInfo::default();
        };
        match data.track(MediaKind::Video) {
            Some(track) => VideoFormatInfo {
                width: track.stream.width,
                height: track.stream.height,
                framerate: track.stream.frame_rate,
                format_name: track.codec.clone(),
                duration: data.get_duration(),
            },
            None => VideoFormatInfo::default(),
        }
    }

    pub fn get_audio_info(&self) -> AudioFormatInfo {
        let Some(data) = self.data.as_ref() else {
            return AudioFormatInfo::default();
        };
        match data.track(MediaKind::Audio) {
            Some(track) => AudioFormatInfo {
                bitrate: if track.stream.bit_rate > 0 {
                    track.stream.bit_rate
                } else {
                    data.demux(MediaKind::Audio).demuxer().bit_rate()
                },
                sample_rate: track.stream.sample_rate,
                channels: track.stream.channels,
                format_name: track.codec.clone(),
                duration: data.get_duration(),
            },
            None => AudioFormatInfo::default(),
        }
    }

    /// 网络层当前的等待状态（不在等待时为 None）
    pub fn get_network_waiting_status(&self) -> Option<String> {
        self.data.as_ref().and_then(|data| {
            data.demux_contexts()
                .iter()
                .find_map(|demux| demux.source().waiting_status())
        })
    }

    /// 每个网络流一条缓冲进度条，每条 `bar_len` 格
    pub fn get_buffering_progress_bars(&self, bar_len: usize) -> Vec<BufferingBar> {
        self.data
            .as_ref()
            .map(|data| BufferingMonitor::from_media(data).get_buffering_progress_bars(bar_len))
            .unwrap_or_default()
    }

    pub fn buffer_status(&self) -> BufferStatus {
        BufferStatus {
            video_packets: self.queues.video.len(),
            audio_packets: self.queues.audio.len(),
            video_frames: self.video_out.size(),
            audio_frames: self.audio_out.size(),
            pending_hw_frames: self
                .data
                .as_ref()
                .and_then(hw_sink_of)
                .map_or(0, |sink| sink.pending()),
            is_buffering: self.get_network_waiting_status().is_some(),
        }
    }

    pub fn is_hw_decoder_enabled(&self) -> bool {
        self.hw_enabled
    }
}

fn open_video_path(
    backend: &dyn CodecBackend,
    stream: &StreamInfo,
    request_hw: bool,
    video_out: &Arc<RingBuffer<VideoFrame>>,
) -> Result<VideoPath> {
    if request_hw {
        if cfg!(feature = "hwaccel") && backend.supports_hw_decoder(stream) {
            let sink = HwFrameSink::new(Arc::clone(video_out));
            match backend.open_hw_video_decoder(stream, sink.clone()) {
                Ok(decoder) => {
                    info!("✓ 使用硬件解码: {}", decoder.name());
                    return Ok(VideoPath::Hardware { decoder, sink });
                }
                Err(e) => warn!("⚠️ 硬件解码器创建失败，回退到软件解码: {}", e),
            }
        } else {
            info!("硬件解码不可用 ({}), 使用软件解码", stream.codec_name);
        }
    }
    let decoder = backend.open_video_decoder(stream)?;
    info!(
        "✓ 使用软件解码: {} ({}x{})",
        decoder.name(),
        stream.width,
        stream.height
    );
    Ok(VideoPath::Software(decoder))
}

fn hw_sink_of(data: &MediaData) -> Option<HwFrameSink> {
    match data.track(MediaKind::Video)?.decoder.as_ref()? {
        TrackDecoder::Video(VideoPath::Hardware { sink, .. }) => Some(sink.clone()),
        _ => None,
    }
}

/// 单个坏包记录日志后跳过；致命错误让管线进入不可用状态
fn absorb<T>(flags: &PipelineFlags, kind: MediaKind, err: DecoderError, skipped: T) -> Result<T> {
    if err.kind() == ErrorKind::Transient {
        warn!("{} ⚠️ {}解码错误（已跳过）: {}", log_ctx(), kind, err);
        return Ok(skipped);
    }
    error!("{} ❌ {}解码失败: {}", log_ctx(), kind, err);
    Err(note_failure(flags, err))
}

fn note_failure(flags: &PipelineFlags, err: DecoderError) -> DecoderError {
    match err.kind() {
        ErrorKind::Cancelled | ErrorKind::Usage | ErrorKind::Transient => {}
        ErrorKind::Source | ErrorKind::Fatal => {
            if matches!(err, DecoderError::SourceFailed(_)) {
                warn!("{} 🌐 网络数据源失效，等待网络层重新协商后 reinit", log_ctx());
                flags.set_need_reinit(true);
            }
            flags.set_ready(false);
        }
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::network_source::{MemoryByteSource, NetworkByteSource};
    use crate::engine::synthetic::{
        build_clip, AudioTrackSpec, ClipSpec, SyntheticBackend, VideoTrackSpec,
    };
    use std::time::{Duration, Instant};

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn video_clip(frames: usize) -> ClipSpec {
        ClipSpec::video_only(VideoTrackSpec {
            frames,
            ..Default::default()
        })
    }

    fn short_muxed(count: usize) -> ClipSpec {
        ClipSpec {
            video: Some(VideoTrackSpec {
                frames: count,
                ..Default::default()
            }),
            audio: Some(AudioTrackSpec {
                packets: count,
                ..Default::default()
            }),
            duration_in_header: true,
        }
    }

    fn new_pipeline(backend: SyntheticBackend, config: PipelineConfig) -> DecodePipeline {
        init_logger();
        DecodePipeline::new(Arc::new(backend), config).unwrap()
    }

    fn attach(pipeline: &mut DecodePipeline, source: Arc<dyn NetworkByteSource>, offset: f64) {
        let data =
            MediaData::open_muxed(pipeline.backend().as_ref(), source, pipeline.flags()).unwrap();
        pipeline.change_media_data(data, offset).unwrap();
    }

    fn open(
        backend: SyntheticBackend,
        spec: &ClipSpec,
        config: PipelineConfig,
        request_hw: bool,
    ) -> (DecodePipeline, Arc<MemoryByteSource>) {
        let mut pipeline = new_pipeline(backend, config);
        let source = Arc::new(MemoryByteSource::new("clip", build_clip(spec)));
        attach(&mut pipeline, source.clone(), 0.0);
        pipeline.init(request_hw).unwrap();
        (pipeline, source)
    }

    /// 软件解码到末尾，边解码边取走输出
    fn drain(pipeline: &mut DecodePipeline, consumer: &mut FrameConsumer) -> (Vec<f64>, Vec<f64>) {
        let mut video = Vec::new();
        let mut audio = Vec::new();
        loop {
            match pipeline.next_decode_type().unwrap() {
                DecodeType::Video => {
                    pipeline.decode_video().unwrap();
                }
                DecodeType::Audio => {
                    pipeline.decode_audio().unwrap();
                }
                DecodeType::EndOfStream | DecodeType::Interrupted => break,
            }
            while let Ok(frame) = consumer.get_decoded_video_frame() {
                video.push(frame.pts);
            }
            while let Some(block) = consumer.pop_audio() {
                audio.push(block.pts);
            }
        }
        (video, audio)
    }

    fn wait_for_frames(consumer: &FrameConsumer, count: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while consumer.video_frames_ready() < count {
            if Instant::now() > deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    fn decode_one_video(pipeline: &mut DecodePipeline) -> VideoDecodeOutcome {
        assert_eq!(pipeline.next_decode_type().unwrap(), DecodeType::Video);
        pipeline.decode_video().unwrap()
    }

    #[test]
    fn test_not_ready_before_init() {
        let mut pipeline = new_pipeline(SyntheticBackend::new(), PipelineConfig::default());
        assert!(matches!(pipeline.next_decode_type(), Err(DecoderError::NotReady)));
        assert!(matches!(pipeline.decode_video(), Err(DecoderError::NotReady)));
        assert!(pipeline.init(false).is_err());
        assert_eq!(pipeline.get_video_info(), VideoFormatInfo::default());
        assert!(pipeline.get_buffering_progress_bars(10).is_empty());
    }

    #[test]
    fn test_video_ring_full_at_capacity() {
        let (mut pipeline, _source) =
            open(SyntheticBackend::new(), &video_clip(30), PipelineConfig::default(), false);

        for i in 0..8 {
            match decode_one_video(&mut pipeline) {
                VideoDecodeOutcome::Frame(info) => assert_eq!(info.pts, i as f64 / 30.0),
                other => panic!("unexpected outcome: {:?}", other),
            }
        }
        assert_eq!(pipeline.buffer_status().video_frames, 8);

        // 缓冲已满：数据包不会被消耗
        assert_eq!(pipeline.next_decode_type().unwrap(), DecodeType::Video);
        let err = pipeline.decode_video().unwrap_err();
        assert!(matches!(err, DecoderError::OutputFull(MediaKind::Video)));
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(pipeline.buffer_status().video_packets, 1);

        assert_eq!(pipeline.get_decoded_video_frame().unwrap().pts, 0.0);
        match pipeline.decode_video().unwrap() {
            VideoDecodeOutcome::Frame(info) => assert_eq!(info.pts, 8.0 / 30.0),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_ties_prefer_video_then_alternate() {
        let (mut pipeline, _source) =
            open(SyntheticBackend::new(), &short_muxed(3), PipelineConfig::default(), false);
        let mut order = Vec::new();
        loop {
            let next = pipeline.next_decode_type().unwrap();
            order.push(next);
            match next {
                DecodeType::Video => {
                    pipeline.decode_video().unwrap();
                }
                DecodeType::Audio => {
                    pipeline.decode_audio().unwrap();
                }
                _ => break,
            }
        }
        use DecodeType::*;
        // 视频先读到末尾，先排空视频解码器，再处理剩下的音频
        assert_eq!(
            order,
            vec![Video, Audio, Video, Audio, Video, Video, Audio, Audio, EndOfStream]
        );
    }

    #[test]
    fn test_muxed_decodes_to_end_of_stream() {
        let (mut pipeline, _source) =
            open(SyntheticBackend::new(), &short_muxed(30), PipelineConfig::default(), false);
        let mut consumer = pipeline.take_consumer().unwrap();
        assert!(pipeline.take_consumer().is_none());

        let (video, audio) = drain(&mut pipeline, &mut consumer);
        assert_eq!(video.len(), 30);
        assert_eq!(audio.len(), 30);
        assert!(video.windows(2).all(|w| w[0] < w[1]));
        assert!(audio.windows(2).all(|w| w[0] < w[1]));

        assert_eq!(pipeline.next_decode_type().unwrap(), DecodeType::EndOfStream);
        let info = pipeline.get_video_info();
        assert_eq!((info.width, info.height), (16, 8));
        assert_eq!(info.framerate, 30.0);
        assert_eq!(info.duration, 1.0);
    }

    #[test]
    fn test_separate_streams() {
        let mut pipeline = new_pipeline(SyntheticBackend::new(), PipelineConfig::default());
        let video: Arc<dyn NetworkByteSource> =
            Arc::new(MemoryByteSource::new("video", build_clip(&video_clip(30))));
        let audio: Arc<dyn NetworkByteSource> = Arc::new(MemoryByteSource::new(
            "audio",
            build_clip(&ClipSpec::audio_only(AudioTrackSpec {
                packets: 30,
                ..Default::default()
            })),
        ));
        let data =
            MediaData::open_separate(pipeline.backend().as_ref(), video, audio, pipeline.flags())
                .unwrap();
        assert!(data.is_separate());
        pipeline.change_media_data(data, 0.0).unwrap();
        pipeline.init(false).unwrap();

        let audio_info = pipeline.get_audio_info();
        assert_eq!(audio_info.sample_rate, 48000);
        assert_eq!(audio_info.channels, 2);
        assert_eq!(audio_info.bitrate, 48000 * 2 * 16);
        assert_eq!(pipeline.get_buffering_progress_bars(4).len(), 2);

        let mut consumer = pipeline.take_consumer().unwrap();
        let (video, audio) = drain(&mut pipeline, &mut consumer);
        assert_eq!((video.len(), audio.len()), (30, 30));
    }

    #[test]
    fn test_audio_only_source() {
        let spec = ClipSpec::audio_only(AudioTrackSpec {
            codec: "pcm_f32le".to_string(),
            channels: 1,
            packets: 10,
            ..Default::default()
        });
        let (mut pipeline, _source) =
            open(SyntheticBackend::new(), &spec, PipelineConfig::default(), false);
        assert!(pipeline.media_data().unwrap().is_audio_only());
        assert_eq!(pipeline.get_video_info(), VideoFormatInfo::default());

        assert_eq!(pipeline.next_decode_type().unwrap(), DecodeType::Audio);
        assert!(matches!(
            pipeline.decode_video(),
            Err(DecoderError::NoStream(MediaKind::Video))
        ));
        match pipeline.decode_audio().unwrap() {
            AudioDecodeOutcome::Block { samples, pts } => {
                assert_eq!(samples, 1600);
                assert_eq!(pts, 0.0);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        // 单声道被复制成立体声
        let mut consumer = pipeline.take_consumer().unwrap();
        let block = consumer.pop_audio().unwrap();
        assert_eq!(block.channels, 2);
        assert_eq!(block.data.len(), 3200);
        assert_eq!(block.data[0], block.data[1]);

        let (video, audio) = drain(&mut pipeline, &mut consumer);
        assert!(video.is_empty());
        assert_eq!(audio.len(), 9);
    }

    #[test]
    fn test_kind_mismatch_on_separate_video_source() {
        let pipeline = new_pipeline(SyntheticBackend::new(), PipelineConfig::default());
        let audio_clip = build_clip(&ClipSpec::audio_only(AudioTrackSpec::default()));
        let wrong: Arc<dyn NetworkByteSource> =
            Arc::new(MemoryByteSource::new("wrong", audio_clip.clone()));
        let audio: Arc<dyn NetworkByteSource> = Arc::new(MemoryByteSource::new("audio", audio_clip));
        let err = MediaData::open_separate(pipeline.backend().as_ref(), wrong, audio, pipeline.flags())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            DecoderError::KindMismatch {
                expected: MediaKind::Video,
                ..
            }
        ));
        assert_eq!(err.kind(), ErrorKind::Source);
    }

    #[test]
    fn test_interrupt_returns_without_reading() {
        let (mut pipeline, _source) =
            open(SyntheticBackend::new(), &short_muxed(10), PipelineConfig::default(), false);
        let before = pipeline
            .media_data()
            .unwrap()
            .demux(MediaKind::Video)
            .read_position();

        pipeline.flags().request_interrupt();
        assert_eq!(pipeline.next_decode_type().unwrap(), DecodeType::Interrupted);
        assert!(matches!(pipeline.decode_video(), Err(DecoderError::Interrupted)));
        let after = pipeline
            .media_data()
            .unwrap()
            .demux(MediaKind::Video)
            .read_position();
        assert_eq!(before, after);

        pipeline.flags().clear_interrupt();
        assert_eq!(pipeline.next_decode_type().unwrap(), DecodeType::Video);
    }

    #[test]
    fn test_interrupt_wakes_blocked_network_read() {
        let data = build_clip(&ClipSpec::muxed());
        let available = data.len() as u64 / 4;
        let source = Arc::new(MemoryByteSource::with_available("slow", data, available));
        let config = PipelineConfig {
            video_buffer_frames: 400,
            audio_buffer_blocks: 400,
            ..Default::default()
        };
        let mut pipeline = new_pipeline(SyntheticBackend::new(), config);
        attach(&mut pipeline, source.clone(), 0.0);
        pipeline.init(false).unwrap();
        let flags = Arc::clone(pipeline.flags());

        let handle = thread::spawn(move || loop {
            match pipeline.next_decode_type() {
                Ok(DecodeType::Video) => {
                    pipeline.decode_video().unwrap();
                }
                Ok(DecodeType::Audio) => {
                    pipeline.decode_audio().unwrap();
                }
                other => return (pipeline, other.unwrap()),
            }
        });

        let deadline = Instant::now() + Duration::from_secs(3);
        while source.waiting_status().is_none() {
            assert!(Instant::now() < deadline, "decode thread never blocked");
            thread::sleep(Duration::from_millis(5));
        }
        flags.request_interrupt();
        let (pipeline, last) = handle.join().unwrap();
        assert_eq!(last, DecodeType::Interrupted);
        assert!(pipeline.get_network_waiting_status().is_some());
        assert!(pipeline.buffer_status().is_buffering);
    }

    #[test]
    fn test_hardware_frames_follow_presentation_order() {
        let spec = ClipSpec::video_only(VideoTrackSpec {
            frames: 30,
            b_frames: true,
            ..Default::default()
        });
        let (mut pipeline, _source) = open(
            SyntheticBackend::new().with_hardware(),
            &spec,
            PipelineConfig::default(),
            true,
        );
        assert!(pipeline.is_hw_decoder_enabled());
        let mut consumer = pipeline.take_consumer().unwrap();

        let mut submitted = Vec::new();
        for _ in 0..5 {
            match decode_one_video(&mut pipeline) {
                VideoDecodeOutcome::Submitted { pts } => submitted.push(pts),
                other => panic!("unexpected outcome: {:?}", other),
            }
        }
        assert!(submitted.windows(2).any(|w| w[0] > w[1]));

        assert!(wait_for_frames(&consumer, 5));
        let mut emitted = Vec::new();
        while let Ok(frame) = consumer.get_decoded_video_frame() {
            emitted.push(frame.pts);
        }
        let expected: Vec<f64> = (0..5).map(|i| i as f64 / 30.0).collect();
        assert_eq!(emitted, expected);
        assert_eq!(pipeline.buffer_status().pending_hw_frames, 0);
    }

    #[test]
    fn test_hardware_backpressure_counts_pending_frames() {
        let config = PipelineConfig {
            video_buffer_frames: 4,
            ..Default::default()
        };
        let (mut pipeline, _source) = open(
            SyntheticBackend::new().with_hardware(),
            &video_clip(30),
            config,
            true,
        );
        for _ in 0..4 {
            assert!(matches!(
                decode_one_video(&mut pipeline),
                VideoDecodeOutcome::Submitted { .. }
            ));
        }
        assert_eq!(pipeline.next_decode_type().unwrap(), DecodeType::Video);
        assert!(matches!(
            pipeline.decode_video(),
            Err(DecoderError::OutputFull(MediaKind::Video))
        ));
    }

    #[test]
    fn test_seek_discards_buffers_and_lands_near_target() {
        let (mut pipeline, _source) =
            open(SyntheticBackend::new(), &video_clip(300), PipelineConfig::default(), false);
        for _ in 0..5 {
            decode_one_video(&mut pipeline);
        }
        assert_eq!(pipeline.buffer_status().video_frames, 5);

        pipeline.seek(5_500_000).unwrap();
        let status = pipeline.buffer_status();
        assert_eq!((status.video_frames, status.video_packets), (0, 0));

        match decode_one_video(&mut pipeline) {
            VideoDecodeOutcome::Frame(info) => {
                assert!(info.key_frame);
                assert!((4.5..=5.5).contains(&info.pts), "pts {}", info.pts);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_seek_drops_pending_hardware_frames() {
        let (mut pipeline, _source) = open(
            SyntheticBackend::new().with_hardware(),
            &video_clip(300),
            PipelineConfig::default(),
            true,
        );
        let mut consumer = pipeline.take_consumer().unwrap();
        for _ in 0..3 {
            decode_one_video(&mut pipeline);
        }
        pipeline.seek(2_000_000).unwrap();
        let status = pipeline.buffer_status();
        assert_eq!((status.video_frames, status.pending_hw_frames), (0, 0));

        assert_eq!(
            decode_one_video(&mut pipeline),
            VideoDecodeOutcome::Submitted { pts: 2.0 }
        );
        assert!(wait_for_frames(&consumer, 1));
        thread::sleep(Duration::from_millis(60));
        assert_eq!(consumer.video_frames_ready(), 1);
        assert_eq!(consumer.get_decoded_video_frame().unwrap().pts, 2.0);
    }

    #[test]
    fn test_timestamp_offset_keeps_pts_monotonic() {
        let spec = video_clip(30);
        let (mut pipeline, _source) =
            open(SyntheticBackend::new(), &spec, PipelineConfig::default(), false);
        let mut consumer = pipeline.take_consumer().unwrap();
        let (mut all, _) = drain(&mut pipeline, &mut consumer);
        assert_eq!(all.len(), 30);

        let next: Arc<dyn NetworkByteSource> =
            Arc::new(MemoryByteSource::new("segment-2", build_clip(&spec)));
        attach(&mut pipeline, next, 1.0);
        assert!(!pipeline.flags().is_ready());
        pipeline.init(false).unwrap();
        assert_eq!(pipeline.timestamp_offset(), 1.0);

        let (second, _) = drain(&mut pipeline, &mut consumer);
        assert_eq!(second.len(), 30);
        assert!(second.iter().all(|pts| *pts >= 1.0));
        all.extend(second);
        assert!(all.windows(2).all(|w| w[0] < w[1]));

        // seek 使用同一时间轴
        pipeline.seek(1_500_000).unwrap();
        match decode_one_video(&mut pipeline) {
            VideoDecodeOutcome::Frame(info) => assert_eq!(info.pts, 1.0),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_corrupt_packet_is_skipped() {
        let spec = ClipSpec::video_only(VideoTrackSpec {
            frames: 10,
            corrupt_frames: vec![3],
            ..Default::default()
        });
        let (mut pipeline, _source) =
            open(SyntheticBackend::new(), &spec, PipelineConfig::default(), false);
        let mut consumer = pipeline.take_consumer().unwrap();
        let (video, _) = drain(&mut pipeline, &mut consumer);
        assert_eq!(video.len(), 9);
        assert!(!video.contains(&(3.0 / 30.0)));
        assert!(pipeline.flags().is_ready());
    }

    #[test]
    fn test_hardware_rejection_is_fatal() {
        let (mut pipeline, _source) = open(
            SyntheticBackend::new().with_hw_failure_after(2),
            &video_clip(30),
            PipelineConfig::default(),
            true,
        );
        decode_one_video(&mut pipeline);
        decode_one_video(&mut pipeline);
        assert_eq!(pipeline.next_decode_type().unwrap(), DecodeType::Video);
        let err = pipeline.decode_video().unwrap_err();
        assert!(err.is_fatal());
        assert!(!pipeline.flags().is_ready());
        assert!(matches!(pipeline.next_decode_type(), Err(DecoderError::NotReady)));
    }

    #[test]
    fn test_hardware_open_failure_falls_back_to_software() {
        let (mut pipeline, _source) = open(
            SyntheticBackend::new().with_hw_open_failure(),
            &video_clip(30),
            PipelineConfig::default(),
            true,
        );
        assert!(!pipeline.is_hw_decoder_enabled());
        assert!(matches!(
            decode_one_video(&mut pipeline),
            VideoDecodeOutcome::Frame(_)
        ));
    }

    #[test]
    fn test_failed_source_requests_reinit() {
        let (mut pipeline, source) =
            open(SyntheticBackend::new(), &video_clip(300), PipelineConfig::default(), false);
        let mut consumer = pipeline.take_consumer().unwrap();
        for _ in 0..40 {
            decode_one_video(&mut pipeline);
            consumer.get_decoded_video_frame().unwrap();
        }

        source.fail();
        let err = pipeline.next_decode_type().unwrap_err();
        assert!(matches!(err, DecoderError::SourceFailed(_)));
        assert!(pipeline.flags().need_reinit());
        assert!(!pipeline.flags().is_ready());

        source.recover();
        pipeline.reinit().unwrap();
        assert!(!pipeline.flags().need_reinit());
        assert!(pipeline.flags().is_ready());
        match decode_one_video(&mut pipeline) {
            VideoDecodeOutcome::Frame(info) => {
                assert!(info.key_frame);
                assert!((1.0..=39.0 / 30.0).contains(&info.pts), "pts {}", info.pts);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_progress_bars_follow_download() {
        let data = build_clip(&ClipSpec::muxed());
        let half = data.len() as u64 / 2;
        let mut pipeline = new_pipeline(SyntheticBackend::new(), PipelineConfig::default());
        attach(
            &mut pipeline,
            Arc::new(MemoryByteSource::with_available("half", data, half)),
            0.0,
        );
        let bars = pipeline.get_buffering_progress_bars(4);
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].tracks, vec![MediaKind::Video, MediaKind::Audio]);
        assert_eq!(bars[0].buckets[0], 1.0);
        assert!(bars[0].buckets[1] > 0.99);
        assert_eq!(bars[0].buckets[3], 0.0);
        assert!(bars[0].read_position > 0.0 && bars[0].read_position < 0.5);
        assert!(pipeline.get_network_waiting_status().is_none());
    }

    #[test]
    fn test_duration_estimated_from_frame_count() {
        let mut spec = video_clip(300);
        spec.duration_in_header = false;
        let (pipeline, _source) =
            open(SyntheticBackend::new(), &spec, PipelineConfig::default(), false);
        assert_eq!(pipeline.get_video_info().duration, 10.0);
    }

    #[test]
    fn test_change_media_data_rejects_foreign_flags() {
        let mut pipeline = new_pipeline(SyntheticBackend::new(), PipelineConfig::default());
        let source: Arc<dyn NetworkByteSource> =
            Arc::new(MemoryByteSource::new("clip", build_clip(&video_clip(5))));
        let foreign = PipelineFlags::new();
        let data = MediaData::open_muxed(pipeline.backend().as_ref(), source, &foreign).unwrap();
        assert!(pipeline.change_media_data(data, 0.0).is_err());
    }

    #[test]
    fn test_deinit_optionally_keeps_streams() {
        let (mut pipeline, _source) =
            open(SyntheticBackend::new(), &video_clip(5), PipelineConfig::default(), false);
        decode_one_video(&mut pipeline);
        assert!(matches!(pipeline.deinit(false), Some(StreamSet::Muxed(_))));
        assert!(!pipeline.flags().is_ready());
        assert_eq!(pipeline.buffer_status().video_frames, 0);
        assert!(pipeline.deinit(true).is_none());
    }

    #[test]
    fn test_clear_buffer_keeps_packet_queue() {
        let (mut pipeline, _source) =
            open(SyntheticBackend::new(), &short_muxed(10), PipelineConfig::default(), false);
        decode_one_video(&mut pipeline);
        assert_eq!(pipeline.next_decode_type().unwrap(), DecodeType::Audio);
        pipeline.clear_buffer();
        let status = pipeline.buffer_status();
        assert_eq!(status.video_frames, 0);
        assert_eq!(status.audio_packets, 1);
        assert!(matches!(
            pipeline.decode_audio().unwrap(),
            AudioDecodeOutcome::Block { .. }
        ));
    }

    #[test]
    fn test_decoder_delay_drained_at_end_of_stream() {
        let spec = ClipSpec::video_only(VideoTrackSpec {
            frames: 30,
            b_frames: true,
            ..Default::default()
        });
        let (mut pipeline, _source) = open(
            SyntheticBackend::new().with_decoder_delay(2),
            &spec,
            PipelineConfig::default(),
            false,
        );
        let mut consumer = pipeline.take_consumer().unwrap();

        assert_eq!(decode_one_video(&mut pipeline), VideoDecodeOutcome::NoFrame);
        assert_eq!(decode_one_video(&mut pipeline), VideoDecodeOutcome::NoFrame);

        let (video, _) = drain(&mut pipeline, &mut consumer);
        let expected: Vec<f64> = (0..30).map(|i| i as f64 / 30.0).collect();
        assert_eq!(video, expected);
        assert_eq!(pipeline.next_decode_type().unwrap(), DecodeType::EndOfStream);
        assert!(pipeline.flags().is_ready());

        // seek 之后重新读取，解码器可以再次排空
        pipeline.seek(0).unwrap();
        let (again, _) = drain(&mut pipeline, &mut consumer);
        assert_eq!(again.len(), 30);
    }

    #[test]
    fn test_muxed_drain_keeps_both_tracks() {
        let (mut pipeline, _source) = open(
            SyntheticBackend::new().with_decoder_delay(3),
            &short_muxed(20),
            PipelineConfig::default(),
            false,
        );
        let mut consumer = pipeline.take_consumer().unwrap();
        let (video, audio) = drain(&mut pipeline, &mut consumer);
        assert_eq!((video.len(), audio.len()), (20, 20));
        assert!(video.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_audio_layout_change_rebuilds_resampler() {
        let spec = ClipSpec::audio_only(AudioTrackSpec {
            channels: 1,
            packets: 10,
            ..Default::default()
        });
        let (mut pipeline, _source) = open(
            SyntheticBackend::new().with_audio_channel_switch(3, 2),
            &spec,
            PipelineConfig::default(),
            false,
        );
        let mut consumer = pipeline.take_consumer().unwrap();

        let mut samples = Vec::new();
        loop {
            match pipeline.next_decode_type().unwrap() {
                DecodeType::Audio => {
                    if let AudioDecodeOutcome::Block { samples: n, .. } =
                        pipeline.decode_audio().unwrap()
                    {
                        samples.push(n);
                    }
                }
                _ => break,
            }
            while let Some(block) = consumer.pop_audio() {
                assert_eq!(block.channels, 2);
            }
        }
        assert_eq!(samples.len(), 10);
        assert_eq!(&samples[..4], &[1600, 1600, 1600, 800]);
        assert!(pipeline.flags().is_ready());
    }

    #[test]
    fn test_layout_change_after_passthrough_creates_resampler() {
        // 立体声 f32 直接复制，之后变成单声道需要重采样器
        let spec = ClipSpec::audio_only(AudioTrackSpec {
            codec: "pcm_f32le".to_string(),
            packets: 6,
            ..Default::default()
        });
        let (mut pipeline, _source) = open(
            SyntheticBackend::new().with_audio_channel_switch(2, 1),
            &spec,
            PipelineConfig::default(),
            false,
        );
        let mut consumer = pipeline.take_consumer().unwrap();
        let mut lengths = Vec::new();
        loop {
            match pipeline.next_decode_type().unwrap() {
                DecodeType::Audio => {
                    pipeline.decode_audio().unwrap();
                }
                _ => break,
            }
            while let Some(block) = consumer.pop_audio() {
                assert_eq!(block.channels, 2);
                lengths.push(block.data.len());
            }
        }
        assert_eq!(lengths, vec![3200, 3200, 6400, 6400, 6400, 6400]);
        assert!(pipeline.flags().is_ready());
    }

    #[test]
    fn test_clear_buffer_keeps_in_flight_hardware_frames() {
        let backend = SyntheticBackend::new()
            .with_hardware()
            .with_hw_idle_drain(Duration::from_millis(300));
        let (mut pipeline, _source) =
            open(backend, &video_clip(30), PipelineConfig::default(), true);
        let mut consumer = pipeline.take_consumer().unwrap();
        for _ in 0..3 {
            decode_one_video(&mut pipeline);
        }
        // 重排窗口满了之后最早的一帧立即输出，另外两帧还在解码中
        assert!(wait_for_frames(&consumer, 1));
        assert_eq!(pipeline.buffer_status().pending_hw_frames, 2);

        pipeline.clear_buffer();
        let status = pipeline.buffer_status();
        assert_eq!((status.video_frames, status.pending_hw_frames), (0, 2));

        assert!(wait_for_frames(&consumer, 2));
        let mut emitted = Vec::new();
        while let Ok(frame) = consumer.get_decoded_video_frame() {
            emitted.push(frame.pts);
        }
        assert_eq!(emitted, vec![1.0 / 30.0, 2.0 / 30.0]);
        assert_eq!(pipeline.buffer_status().pending_hw_frames, 0);
    }

    #[test]
    fn test_malformed_packet_does_not_request_reinit() {
        let mut bytes = build_clip(&video_clip(10));
        let payloads: Vec<usize> = bytes
            .windows(4)
            .enumerate()
            .filter(|(_, w)| *w == b"MYYV")
            .map(|(i, _)| i)
            .collect();
        // 包头 23 字节：标记 + 流号 + 标志 + pts + dts + 长度
        bytes[payloads[4] - 23] = b'X';

        let mut pipeline = new_pipeline(SyntheticBackend::new(), PipelineConfig::default());
        attach(&mut pipeline, Arc::new(MemoryByteSource::new("damaged", bytes)), 0.0);
        pipeline.init(false).unwrap();
        for _ in 0..4 {
            decode_one_video(&mut pipeline);
        }
        let err = pipeline.next_decode_type().unwrap_err();
        assert!(matches!(err, DecoderError::DecodeError(_)));
        assert!(!pipeline.flags().need_reinit());
        assert!(pipeline.flags().is_ready());
    }
}
