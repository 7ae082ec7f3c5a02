//! 轨道绑定：网络字节源 ↔ 解封装 / 解码上下文
//!
//! 两种绑定方式：
//! - 分离流：音频和视频各自来自独立的网络流，各有一个解封装上下文
//! - 复用流：一个网络流里同时包含音视频，两条轨道共享同一个解封装上下文

use crate::core::{DecoderError, MediaKind, Packet, Result, StreamInfo};
use crate::engine::codec::{AudioDecoder, CodecBackend, Demuxer, HardwareVideoDecoder, VideoDecoder};
use crate::engine::flags::PipelineFlags;
use crate::engine::network_source::{is_interrupt, NetworkByteSource, SourceReader};
use crate::engine::pts_set::HwFrameSink;
use crate::engine::resampler::Resampler;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 绑定在一个字节源上的解封装上下文
pub struct DemuxContext {
    demuxer: Box<dyn Demuxer>,
    source: Arc<dyn NetworkByteSource>,
    position: Arc<AtomicU64>,
    eof: bool,
}

impl DemuxContext {
    fn open(
        backend: &dyn CodecBackend,
        source: Arc<dyn NetworkByteSource>,
        flags: &Arc<PipelineFlags>,
    ) -> Result<Self> {
        info!("📂 打开解封装上下文: {}", source.description());
        let reader = SourceReader::new(Arc::clone(&source), Arc::clone(flags));
        let position = reader.position_handle();
        flags.register_source(&source);
        let demuxer = backend.open_demuxer(reader).map_err(|e| match e {
            DecoderError::IoError(ref io) if is_interrupt(io) => DecoderError::Interrupted,
            other => other,
        })?;
        debug!(
            "容器格式: {}, 共 {} 个流",
            demuxer.format_name(),
            demuxer.streams().len()
        );
        Ok(Self {
            demuxer,
            source,
            position,
            eof: false,
        })
    }

    /// 查找第一个指定类型的流
    fn find_stream(&self, kind: MediaKind) -> Option<&StreamInfo> {
        self.demuxer.streams().iter().find(|s| s.kind == Some(kind))
    }

    fn describe_streams(&self) -> String {
        let kinds: Vec<&str> = self
            .demuxer
            .streams()
            .iter()
            .map(|s| s.kind.map(|k| k.as_str()).unwrap_or("other"))
            .collect();
        if kinds.is_empty() {
            "无可用流".to_string()
        } else {
            kinds.join("+")
        }
    }

    /// 读取下一个数据包；到达末尾后记住 eof，seek 时清除
    pub(crate) fn read_packet(&mut self) -> Result<Option<Packet>> {
        if self.eof {
            return Ok(None);
        }
        match self.demuxer.read_packet() {
            Ok(Some(packet)) => Ok(Some(packet)),
            Ok(None) => {
                debug!("📄 {} 已读到末尾", self.source.description());
                self.eof = true;
                Ok(None)
            }
            Err(DecoderError::IoError(ref io)) if is_interrupt(io) => Err(DecoderError::Interrupted),
            Err(e) => {
                if self.source.has_failed() {
                    Err(DecoderError::SourceFailed(format!(
                        "{}: {}",
                        self.source.description(),
                        e
                    )))
                } else {
                    Err(e)
                }
            }
        }
    }

    pub(crate) fn seek(&mut self, timestamp_us: i64) -> Result<()> {
        self.eof = false;
        self.demuxer.seek(timestamp_us).map_err(|e| match e {
            DecoderError::IoError(ref io) if is_interrupt(io) => DecoderError::Interrupted,
            other => other,
        })
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn source(&self) -> &Arc<dyn NetworkByteSource> {
        &self.source
    }

    /// 当前读取位置（字节）
    pub fn read_position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub fn demuxer(&self) -> &dyn Demuxer {
        self.demuxer.as_ref()
    }
}

/// 视频解码路径（初始化时选定）
pub enum VideoPath {
    Software(Box<dyn VideoDecoder>),
    Hardware {
        decoder: Box<dyn HardwareVideoDecoder>,
        sink: HwFrameSink,
    },
}

/// 轨道上的解码器
pub enum TrackDecoder {
    Video(VideoPath),
    Audio {
        decoder: Box<dyn AudioDecoder>,
        resampler: Option<Resampler>,
    },
}

impl TrackDecoder {
    pub fn flush(&mut self) {
        match self {
            TrackDecoder::Video(VideoPath::Software(decoder)) => decoder.flush(),
            TrackDecoder::Video(VideoPath::Hardware { decoder, .. }) => decoder.flush(),
            TrackDecoder::Audio { decoder, .. } => decoder.flush(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            TrackDecoder::Video(VideoPath::Software(decoder)) => decoder.name(),
            TrackDecoder::Video(VideoPath::Hardware { decoder, .. }) => decoder.name(),
            TrackDecoder::Audio { decoder, .. } => decoder.name(),
        }
    }
}

/// 一条轨道的流信息与解码器
pub struct TrackContext {
    pub kind: MediaKind,
    pub stream_index: usize,
    pub codec: String,
    pub stream: StreamInfo,
    pub(crate) decoder: Option<TrackDecoder>,
}

impl TrackContext {
    fn bind(demux: &DemuxContext, kind: MediaKind) -> Result<Self> {
        let stream = demux.find_stream(kind).cloned().ok_or_else(|| {
            warn!("❌ 数据源中没有{}流: {}", kind, demux.describe_streams());
            DecoderError::KindMismatch {
                expected: kind,
                found: demux.describe_streams(),
            }
        })?;
        info!(
            "✓ 绑定{}轨道: 流 #{}, 编解码器 {}",
            kind, stream.index, stream.codec_name
        );
        Ok(Self {
            kind,
            stream_index: stream.index,
            codec: stream.codec_name.clone(),
            stream,
            decoder: None,
        })
    }

    pub fn decoder_name(&self) -> Option<String> {
        self.decoder.as_ref().map(|d| d.name())
    }
}

/// 分离流中的一条轨道：独占一个解封装上下文
pub struct SeparateTrack {
    pub demux: DemuxContext,
    pub track: TrackContext,
}

/// 轨道布局（绑定时选定一次）
pub enum Tracks {
    Separate {
        video: SeparateTrack,
        audio: SeparateTrack,
    },
    Muxed {
        shared: DemuxContext,
        video: Option<TrackContext>,
        audio: Option<TrackContext>,
    },
}

/// 重新绑定时保留下来的字节源
#[derive(Clone)]
pub enum StreamSet {
    Separate {
        video: Arc<dyn NetworkByteSource>,
        audio: Arc<dyn NetworkByteSource>,
    },
    Muxed(Arc<dyn NetworkByteSource>),
}

/// 一组已完成格式识别的轨道上下文，通过 `change_media_data` 交给解码管线
pub struct MediaData {
    pub(crate) tracks: Tracks,
    flags: Arc<PipelineFlags>,
}

impl MediaData {
    /// 分离流：视频和音频来自两个独立的网络流
    pub fn open_separate(
        backend: &dyn CodecBackend,
        video_source: Arc<dyn NetworkByteSource>,
        audio_source: Arc<dyn NetworkByteSource>,
        flags: &Arc<PipelineFlags>,
    ) -> Result<Self> {
        info!("🎬 初始化分离音视频流");
        let opened = Self::open_track(backend, &video_source, flags, MediaKind::Video).and_then(
            |video| {
                Self::open_track(backend, &audio_source, flags, MediaKind::Audio)
                    .map(|audio| (video, audio))
            },
        );
        let (video, audio) = match opened {
            Ok(parts) => parts,
            Err(e) => {
                flags.unregister_source(&video_source);
                flags.unregister_source(&audio_source);
                return Err(e);
            }
        };
        Ok(Self {
            tracks: Tracks::Separate { video, audio },
            flags: Arc::clone(flags),
        })
    }

    fn open_track(
        backend: &dyn CodecBackend,
        source: &Arc<dyn NetworkByteSource>,
        flags: &Arc<PipelineFlags>,
        kind: MediaKind,
    ) -> Result<SeparateTrack> {
        let demux = DemuxContext::open(backend, Arc::clone(source), flags)?;
        let track = TrackContext::bind(&demux, kind)?;
        Ok(SeparateTrack { demux, track })
    }

    /// 复用流：一个网络流同时提供音视频（允许只有音频或只有视频）
    pub fn open_muxed(
        backend: &dyn CodecBackend,
        source: Arc<dyn NetworkByteSource>,
        flags: &Arc<PipelineFlags>,
    ) -> Result<Self> {
        info!("🎬 初始化复用音视频流");
        let shared = match DemuxContext::open(backend, Arc::clone(&source), flags) {
            Ok(shared) => shared,
            Err(e) => {
                flags.unregister_source(&source);
                return Err(e);
            }
        };
        let video = TrackContext::bind(&shared, MediaKind::Video).ok();
        let audio = TrackContext::bind(&shared, MediaKind::Audio).ok();
        if video.is_none() && audio.is_none() {
            flags.unregister_source(&source);
            return Err(DecoderError::NoStream(MediaKind::Video));
        }
        if video.is_none() {
            info!("🔊 纯音频流");
        }
        Ok(Self {
            tracks: Tracks::Muxed {
                shared,
                video,
                audio,
            },
            flags: Arc::clone(flags),
        })
    }

    pub fn tracks(&self) -> &Tracks {
        &self.tracks
    }

    pub fn is_separate(&self) -> bool {
        matches!(self.tracks, Tracks::Separate { .. })
    }

    pub fn is_audio_only(&self) -> bool {
        matches!(self.tracks, Tracks::Muxed { video: None, .. })
    }

    pub fn flags(&self) -> &Arc<PipelineFlags> {
        &self.flags
    }

    pub fn track(&self, kind: MediaKind) -> Option<&TrackContext> {
        match (&self.tracks, kind) {
            (Tracks::Separate { video, .. }, MediaKind::Video) => Some(&video.track),
            (Tracks::Separate { audio, .. }, MediaKind::Audio) => Some(&audio.track),
            (Tracks::Muxed { video, .. }, MediaKind::Video) => video.as_ref(),
            (Tracks::Muxed { audio, .. }, MediaKind::Audio) => audio.as_ref(),
        }
    }

    pub(crate) fn track_mut(&mut self, kind: MediaKind) -> Option<&mut TrackContext> {
        match (&mut self.tracks, kind) {
            (Tracks::Separate { video, .. }, MediaKind::Video) => Some(&mut video.track),
            (Tracks::Separate { audio, .. }, MediaKind::Audio) => Some(&mut audio.track),
            (Tracks::Muxed { video, .. }, MediaKind::Video) => video.as_mut(),
            (Tracks::Muxed { audio, .. }, MediaKind::Audio) => audio.as_mut(),
        }
    }

    /// 该轨道所在的解封装上下文
    pub fn demux(&self, kind: MediaKind) -> &DemuxContext {
        match (&self.tracks, kind) {
            (Tracks::Separate { video, .. }, MediaKind::Video) => &video.demux,
            (Tracks::Separate { audio, .. }, MediaKind::Audio) => &audio.demux,
            (Tracks::Muxed { shared, .. }, _) => shared,
        }
    }

    pub(crate) fn demux_mut(&mut self, kind: MediaKind) -> &mut DemuxContext {
        match (&mut self.tracks, kind) {
            (Tracks::Separate { video, .. }, MediaKind::Video) => &mut video.demux,
            (Tracks::Separate { audio, .. }, MediaKind::Audio) => &mut audio.demux,
            (Tracks::Muxed { shared, .. }, _) => shared,
        }
    }

    /// 去重后的全部解封装上下文
    pub fn demux_contexts(&self) -> Vec<&DemuxContext> {
        match &self.tracks {
            Tracks::Separate { video, audio } => vec![&video.demux, &audio.demux],
            Tracks::Muxed { shared, .. } => vec![shared],
        }
    }

    pub(crate) fn demux_contexts_mut(&mut self) -> Vec<&mut DemuxContext> {
        match &mut self.tracks {
            Tracks::Separate { video, audio } => vec![&mut video.demux, &mut audio.demux],
            Tracks::Muxed { shared, .. } => vec![shared],
        }
    }

    pub fn stream_set(&self) -> StreamSet {
        match &self.tracks {
            Tracks::Separate { video, audio } => StreamSet::Separate {
                video: Arc::clone(video.demux.source()),
                audio: Arc::clone(audio.demux.source()),
            },
            Tracks::Muxed { shared, .. } => StreamSet::Muxed(Arc::clone(shared.source())),
        }
    }

    /// 释放全部上下文
    ///
    /// `deinit_stream` 为 false 时保留网络字节源并返回，供 `reinit` 在不重新连接的情况下重新绑定。
    pub fn deinit(self, deinit_stream: bool) -> Option<StreamSet> {
        let streams = self.stream_set();
        let sources: Vec<Arc<dyn NetworkByteSource>> = match &streams {
            StreamSet::Separate { video, audio } => vec![Arc::clone(video), Arc::clone(audio)],
            StreamSet::Muxed(both) => vec![Arc::clone(both)],
        };
        for source in &sources {
            self.flags.unregister_source(source);
        }
        drop(self.tracks);
        if deinit_stream {
            info!("🔌 释放轨道上下文和网络流");
            for source in &sources {
                source.close();
            }
            None
        } else {
            info!("🔌 释放轨道上下文（保留网络流）");
            Some(streams)
        }
    }

    /// 在原来的字节源上重新建立全部上下文
    pub fn reinit(self, backend: &dyn CodecBackend) -> Result<Self> {
        info!("🔄 重新初始化轨道上下文");
        let flags = Arc::clone(&self.flags);
        match self.deinit(false) {
            Some(StreamSet::Separate { video, audio }) => {
                Self::open_separate(backend, video, audio, &flags)
            }
            Some(StreamSet::Muxed(both)) => Self::open_muxed(backend, both, &flags),
            None => Err(DecoderError::Other("网络流已释放，无法重新初始化".to_string())),
        }
    }

    /// 总时长（秒）：优先用容器报告的时长，没有时根据流信息估算
    pub fn get_duration(&self) -> f64 {
        let primary = self
            .track(MediaKind::Video)
            .map(|t| (self.demux(MediaKind::Video), t))
            .or_else(|| {
                self.track(MediaKind::Audio)
                    .map(|t| (self.demux(MediaKind::Audio), t))
            });
        match primary {
            Some((demux, track)) => demux
                .demuxer()
                .duration()
                .filter(|d| d.is_finite() && *d > 0.0)
                .unwrap_or_else(|| estimate_duration(&track.stream, demux)),
            None => 0.0,
        }
    }
}

/// 时长估算：流时长 → 帧数 / 帧率 → 字节数 / 码率
pub(crate) fn estimate_duration(stream: &StreamInfo, demux: &DemuxContext) -> f64 {
    if let Some(duration) = stream.duration.filter(|d| d.is_finite() && *d > 0.0) {
        return duration;
    }
    if stream.frame_count > 0 && stream.frame_rate > 0.0 {
        return stream.frame_count as f64 / stream.frame_rate;
    }
    let bit_rate = if stream.bit_rate > 0 {
        stream.bit_rate
    } else {
        demux.demuxer().bit_rate()
    };
    match demux.source().total_size() {
        Some(size) if bit_rate > 0 => size as f64 * 8.0 / bit_rate as f64,
        _ => 0.0,
    }
}
