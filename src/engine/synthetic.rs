//! 合成编解码后端
//!
//! 一个极简的 "MYYS" 容器格式和配套的解码器，不依赖任何系统库，
//! 用于测试和 `myy-decode-inspect` 的默认输入。硬件解码服务用一个后台线程模拟：
//! 异步完成、按显示顺序重排输出、flush 同步返回。
//!
//! 容器布局（小端）：
//!
//! ```text
//! "MYYS" | version u8 | stream_count u8 | duration f64
//! 每个流: kind u8 | name_len u8 | name | width u32 | height u32 | fps f64
//!         | sample_rate u32 | channels u16 | bit_rate u64 | duration f64 | frame_count u64
//! 每个包: 'P' | stream u8 | flags u8 | pts f64 | dts f64 | len u32 | data
//! ```

use crate::core::{
    DecoderError, MediaKind, Packet, PixelFormat, RawAudio, Result, SampleFormat, StreamInfo,
    VideoFrame,
};
use crate::engine::codec::{
    AudioDecoder, CodecBackend, DecodeStatus, Demuxer, HardwareVideoDecoder, VideoDecoder,
};
use crate::engine::network_source::SourceReader;
use crate::engine::pts_set::HwFrameSink;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::{Read, Seek, SeekFrom};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const MAGIC: &[u8; 4] = b"MYYS";
const VERSION: u8 = 1;
const VIDEO_MAGIC: &[u8; 4] = b"MYYV";
const FLAG_KEY: u8 = 1;
const FLAG_PTS: u8 = 2;
const FLAG_DTS: u8 = 4;
const HEADER_LEN: u64 = 1 + 1 + 1 + 8 + 8 + 4;

pub const VIDEO_CODECS: &[&str] = &["myy_raw", "myy_hevc"];

/// 视频轨道参数
#[derive(Debug, Clone)]
pub struct VideoTrackSpec {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frames: usize,
    pub keyframe_interval: usize,
    /// 每个 GOP 内相邻两帧交换解码顺序（模拟 B 帧）
    pub b_frames: bool,
    /// 这些帧号写入损坏的数据
    pub corrupt_frames: Vec<usize>,
}

impl Default for VideoTrackSpec {
    fn default() -> Self {
        Self {
            codec: "myy_raw".to_string(),
            width: 16,
            height: 8,
            fps: 30.0,
            frames: 300,
            keyframe_interval: 30,
            b_frames: false,
            corrupt_frames: Vec::new(),
        }
    }
}

/// 音频轨道参数（codec 决定采样格式：pcm_s16le / pcm_f32le / pcm_f32p）
#[derive(Debug, Clone)]
pub struct AudioTrackSpec {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples_per_packet: usize,
    pub packets: usize,
}

impl Default for AudioTrackSpec {
    fn default() -> Self {
        Self {
            codec: "pcm_s16le".to_string(),
            sample_rate: 48000,
            channels: 2,
            samples_per_packet: 1600,
            packets: 300,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClipSpec {
    pub video: Option<VideoTrackSpec>,
    pub audio: Option<AudioTrackSpec>,
    /// 为 false 时不写入时长，需要靠帧数 / 码率估算
    pub duration_in_header: bool,
}

impl ClipSpec {
    /// 默认 10 秒 30fps 视频 + 立体声音频
    pub fn muxed() -> Self {
        Self {
            video: Some(VideoTrackSpec::default()),
            audio: Some(AudioTrackSpec::default()),
            duration_in_header: true,
        }
    }

    pub fn video_only(video: VideoTrackSpec) -> Self {
        Self {
            video: Some(video),
            audio: None,
            duration_in_header: true,
        }
    }

    pub fn audio_only(audio: AudioTrackSpec) -> Self {
        Self {
            video: None,
            audio: Some(audio),
            duration_in_header: true,
        }
    }

    fn duration(&self) -> f64 {
        let video = self
            .video
            .as_ref()
            .map_or(0.0, |v| v.frames as f64 / v.fps);
        let audio = self.audio.as_ref().map_or(0.0, |a| {
            (a.packets * a.samples_per_packet) as f64 / a.sample_rate as f64
        });
        video.max(audio)
    }
}

fn audio_layout(codec: &str) -> Option<(SampleFormat, bool)> {
    match codec {
        "pcm_s16le" => Some((SampleFormat::I16, false)),
        "pcm_f32le" => Some((SampleFormat::F32, false)),
        "pcm_f32p" => Some((SampleFormat::F32, true)),
        _ => None,
    }
}

struct PendingPacket {
    order: f64, // 写入顺序（dts）
    stream: u8,
    flags: u8,
    pts: f64,
    dts: f64,
    data: Vec<u8>,
}

/// 生成一段 MYYS 数据
pub fn build_clip(spec: &ClipSpec) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    let stream_count = spec.video.is_some() as u8 + spec.audio.is_some() as u8;
    out.push(stream_count);
    let duration = if spec.duration_in_header { spec.duration() } else { 0.0 };
    out.extend_from_slice(&duration.to_le_bytes());

    let mut packets = Vec::new();
    let mut index = 0u8;

    if let Some(video) = &spec.video {
        write_stream_header(
            &mut out,
            0,
            &video.codec,
            (video.width, video.height, video.fps),
            (0, 0, 0),
            if spec.duration_in_header { video.frames as f64 / video.fps } else { 0.0 },
            video.frames as u64,
        );
        for position in 0..video.frames {
            let frame = decode_order_to_frame(video, position);
            let mut data = Vec::with_capacity(8);
            if video.corrupt_frames.contains(&frame) {
                data.extend_from_slice(b"BAD!");
            } else {
                data.extend_from_slice(VIDEO_MAGIC);
                data.extend_from_slice(&(frame as u32).to_le_bytes());
            }
            let key = frame % video.keyframe_interval.max(1) == 0;
            packets.push(PendingPacket {
                order: position as f64 / video.fps,
                stream: index,
                flags: FLAG_PTS | FLAG_DTS | if key { FLAG_KEY } else { 0 },
                pts: frame as f64 / video.fps,
                dts: position as f64 / video.fps,
                data,
            });
        }
        index += 1;
    }

    if let Some(audio) = &spec.audio {
        let (format, planar) = audio_layout(&audio.codec).unwrap_or((SampleFormat::I16, false));
        let bit_rate = audio.sample_rate as u64
            * audio.channels as u64
            * format.bytes_per_sample() as u64
            * 8;
        let total_samples = (audio.packets * audio.samples_per_packet) as f64;
        write_stream_header(
            &mut out,
            1,
            &audio.codec,
            (0, 0, 0.0),
            (audio.sample_rate, audio.channels, bit_rate),
            if spec.duration_in_header { total_samples / audio.sample_rate as f64 } else { 0.0 },
            0,
        );
        for n in 0..audio.packets {
            let ts = (n * audio.samples_per_packet) as f64 / audio.sample_rate as f64;
            packets.push(PendingPacket {
                order: ts,
                stream: index,
                flags: FLAG_KEY | FLAG_PTS | FLAG_DTS,
                pts: ts,
                dts: ts,
                data: audio_payload(audio, format, planar, n),
            });
        }
    }

    // 按解码顺序交错，时间相同时视频在前
    packets.sort_by(|a, b| a.order.total_cmp(&b.order).then(a.stream.cmp(&b.stream)));
    for p in packets {
        out.push(b'P');
        out.push(p.stream);
        out.push(p.flags);
        out.extend_from_slice(&p.pts.to_le_bytes());
        out.extend_from_slice(&p.dts.to_le_bytes());
        out.extend_from_slice(&(p.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&p.data);
    }
    out
}

// GOP 内关键帧之后每两帧交换一次顺序
fn decode_order_to_frame(video: &VideoTrackSpec, position: usize) -> usize {
    if !video.b_frames {
        return position;
    }
    let gop = video.keyframe_interval.max(1);
    let gop_start = position - position % gop;
    let offset = position - gop_start;
    if offset == 0 {
        return position;
    }
    let gop_end = (gop_start + gop).min(video.frames);
    let swapped = if offset % 2 == 1 { position + 1 } else { position - 1 };
    if swapped >= gop_end {
        position
    } else {
        swapped
    }
}

fn write_stream_header(
    out: &mut Vec<u8>,
    kind: u8,
    codec: &str,
    (width, height, fps): (u32, u32, f64),
    (sample_rate, channels, bit_rate): (u32, u16, u64),
    duration: f64,
    frame_count: u64,
) {
    out.push(kind);
    out.push(codec.len() as u8);
    out.extend_from_slice(codec.as_bytes());
    out.extend_from_slice(&width.to_le_bytes());
    out.extend_from_slice(&height.to_le_bytes());
    out.extend_from_slice(&fps.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&bit_rate.to_le_bytes());
    out.extend_from_slice(&duration.to_le_bytes());
    out.extend_from_slice(&frame_count.to_le_bytes());
}

fn audio_payload(audio: &AudioTrackSpec, format: SampleFormat, planar: bool, n: usize) -> Vec<u8> {
    let channels = audio.channels as usize;
    let value = |ch: usize| ((n % 8) as f32 + 1.0) * 0.1 * if ch % 2 == 0 { 1.0 } else { -1.0 };
    let encode = |v: f32, out: &mut Vec<u8>| match format {
        SampleFormat::I16 => out.extend_from_slice(&((v * 32767.0) as i16).to_le_bytes()),
        SampleFormat::F32 => out.extend_from_slice(&v.to_le_bytes()),
    };
    let mut out = Vec::with_capacity(audio.samples_per_packet * channels * format.bytes_per_sample());
    if planar {
        for ch in 0..channels {
            for _ in 0..audio.samples_per_packet {
                encode(value(ch), &mut out);
            }
        }
    } else {
        for _ in 0..audio.samples_per_packet {
            for ch in 0..channels {
                encode(value(ch), &mut out);
            }
        }
    }
    out
}

// ============= 解封装 =============

struct PacketHeader {
    stream: usize,
    flags: u8,
    pts: f64,
    dts: f64,
    len: u32,
}

/// MYYS 解封装器
pub struct SyntheticDemuxer {
    reader: SourceReader,
    streams: Vec<StreamInfo>,
    duration: Option<f64>,
    data_start: u64,
    primary: usize,
    // 主流关键帧索引（pts, 包偏移），边读边建
    index: Vec<(f64, u64)>,
    scan_pos: u64,
    index_complete: bool,
}

fn read_u8(r: &mut impl Read) -> std::io::Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_u16(r: &mut impl Read) -> std::io::Result<u16> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_le_bytes(b))
}

fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_u64(r: &mut impl Read) -> std::io::Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

fn read_f64(r: &mut impl Read) -> std::io::Result<f64> {
    Ok(f64::from_bits(read_u64(r)?))
}

fn positive(value: f64) -> Option<f64> {
    (value.is_finite() && value > 0.0).then_some(value)
}

impl SyntheticDemuxer {
    pub fn open(mut reader: SourceReader) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(DecoderError::OpenError(format!(
                "不是 MYYS 数据 ({})",
                reader.source().description()
            )));
        }
        let version = read_u8(&mut reader)?;
        if version != VERSION {
            return Err(DecoderError::OpenError(format!("不支持的 MYYS 版本: {}", version)));
        }
        let count = read_u8(&mut reader)? as usize;
        let duration = positive(read_f64(&mut reader)?);

        let mut streams = Vec::with_capacity(count);
        for index in 0..count {
            let kind = match read_u8(&mut reader)? {
                0 => Some(MediaKind::Video),
                1 => Some(MediaKind::Audio),
                _ => None,
            };
            let name_len = read_u8(&mut reader)? as usize;
            let mut name = vec![0u8; name_len];
            reader.read_exact(&mut name)?;
            let width = read_u32(&mut reader)?;
            let height = read_u32(&mut reader)?;
            let frame_rate = read_f64(&mut reader)?;
            let sample_rate = read_u32(&mut reader)?;
            let channels = read_u16(&mut reader)?;
            let bit_rate = read_u64(&mut reader)?;
            let stream_duration = positive(read_f64(&mut reader)?);
            let frame_count = read_u64(&mut reader)?;
            streams.push(StreamInfo {
                index,
                kind,
                codec_name: String::from_utf8_lossy(&name).into_owned(),
                time_base: 1.0 / 1_000_000.0,
                width,
                height,
                frame_rate,
                sample_rate,
                channels,
                bit_rate,
                duration: stream_duration,
                frame_count,
                codec_private: None,
            });
        }

        let primary = streams
            .iter()
            .position(|s| s.kind == Some(MediaKind::Video))
            .unwrap_or(0);
        let data_start = reader.position();
        Ok(Self {
            reader,
            streams,
            duration,
            data_start,
            primary,
            index: Vec::new(),
            scan_pos: data_start,
            index_complete: false,
        })
    }

    /// 读取包头；在包边界上读到末尾时返回 None
    fn read_header(&mut self) -> Result<Option<PacketHeader>> {
        let mut marker = [0u8; 1];
        if self.reader.read(&mut marker)? == 0 {
            return Ok(None);
        }
        if marker[0] != b'P' {
            return Err(DecoderError::DecodeError(format!(
                "包标记错误 @{}",
                self.reader.position() - 1
            )));
        }
        let stream = read_u8(&mut self.reader)? as usize;
        let flags = read_u8(&mut self.reader)?;
        let pts = read_f64(&mut self.reader)?;
        let dts = read_f64(&mut self.reader)?;
        let len = read_u32(&mut self.reader)?;
        Ok(Some(PacketHeader {
            stream,
            flags,
            pts,
            dts,
            len,
        }))
    }

    fn read_packet_at(&mut self, offset: u64) -> Result<Option<Packet>> {
        let Some(header) = self.read_header()? else {
            if offset == self.scan_pos {
                self.index_complete = true;
            }
            return Ok(None);
        };
        let mut data = vec![0u8; header.len as usize];
        self.reader.read_exact(&mut data)?;
        self.note_index(offset, &header);
        Ok(Some(Packet {
            stream_index: header.stream,
            pts: (header.flags & FLAG_PTS != 0).then_some(header.pts),
            dts: (header.flags & FLAG_DTS != 0).then_some(header.dts),
            key_frame: header.flags & FLAG_KEY != 0,
            data,
        }))
    }

    fn note_index(&mut self, offset: u64, header: &PacketHeader) {
        if offset != self.scan_pos {
            return;
        }
        if header.stream == self.primary && header.flags & FLAG_KEY != 0 {
            self.index.push((header.pts, offset));
        }
        self.scan_pos = offset + HEADER_LEN + header.len as u64;
    }
}

impl Demuxer for SyntheticDemuxer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        let offset = self.reader.position();
        let result = self.read_packet_at(offset);
        if result.is_err() {
            // 读到一半被中断或失败时回到包头，之后可以原样重读
            self.reader.seek(SeekFrom::Start(offset))?;
        }
        result
    }

    fn seek(&mut self, timestamp_us: i64) -> Result<()> {
        let target = timestamp_us as f64 / 1_000_000.0;
        // 索引还没覆盖到目标位置时先往后扫描包头
        while !self.index_complete && self.index.last().map_or(true, |(pts, _)| *pts <= target) {
            self.reader.seek(SeekFrom::Start(self.scan_pos))?;
            let offset = self.scan_pos;
            match self.read_header()? {
                Some(header) => self.note_index(offset, &header),
                None => self.index_complete = true,
            }
        }
        let offset = self
            .index
            .iter()
            .rev()
            .find(|(pts, _)| *pts <= target)
            .map_or(self.data_start, |(_, offset)| *offset);
        debug!("MYYS seek {:.3}s → 偏移 {}", target, offset);
        self.reader.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn duration(&self) -> Option<f64> {
        self.duration
    }

    fn format_name(&self) -> String {
        "myys".to_string()
    }

    fn bit_rate(&self) -> u64 {
        self.streams.iter().map(|s| s.bit_rate).sum()
    }
}

// ============= 解码器 =============

fn parse_video_payload(packet: &Packet) -> Result<u32> {
    match packet.data.as_slice() {
        [m0, m1, m2, m3, n0, n1, n2, n3, ..] if [*m0, *m1, *m2, *m3] == *VIDEO_MAGIC => {
            Ok(u32::from_le_bytes([*n0, *n1, *n2, *n3]))
        }
        _ => Err(DecoderError::DecodeError(format!(
            "损坏的视频包 (pts={:?})",
            packet.pts
        ))),
    }
}

fn fill_frame(data: &mut Vec<u8>, width: u32, height: u32, frame: u32) {
    data.clear();
    data.resize(PixelFormat::RGBA.frame_size(width, height), (frame % 256) as u8);
}

struct HeldFrame {
    pts: f64,
    key_frame: bool,
    frame: u32,
}

/// 软件视频解码器：每个包输出一帧纯色 RGBA 图像
///
/// `delay` > 0 时像带 B 帧的真实解码器一样在内部缓存这么多帧，按显示顺序输出，
/// 输入结束后要靠 `drain` 取出剩下的帧。
pub struct SyntheticVideoDecoder {
    width: u32,
    height: u32,
    codec: String,
    delay: usize,
    held: Vec<HeldFrame>,
}

impl SyntheticVideoDecoder {
    fn emit_earliest(&mut self, out: &mut VideoFrame) -> bool {
        let Some(index) = self
            .held
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.pts.total_cmp(&b.pts))
            .map(|(i, _)| i)
        else {
            return false;
        };
        let held = self.held.swap_remove(index);
        out.pts = held.pts;
        out.width = self.width;
        out.height = self.height;
        out.format = PixelFormat::RGBA;
        out.key_frame = held.key_frame;
        fill_frame(&mut out.data, self.width, self.height, held.frame);
        true
    }
}

impl VideoDecoder for SyntheticVideoDecoder {
    fn decode(&mut self, packet: &Packet, out: &mut VideoFrame) -> Result<DecodeStatus> {
        let frame = parse_video_payload(packet)?;
        self.held.push(HeldFrame {
            pts: packet.pts.unwrap_or(0.0),
            key_frame: packet.key_frame,
            frame,
        });
        if self.held.len() > self.delay && self.emit_earliest(out) {
            Ok(DecodeStatus::Frame)
        } else {
            Ok(DecodeStatus::NeedMoreData)
        }
    }

    fn drain(&mut self, out: &mut VideoFrame) -> Result<DecodeStatus> {
        Ok(if self.emit_earliest(out) {
            DecodeStatus::Frame
        } else {
            DecodeStatus::Drained
        })
    }

    fn flush(&mut self) {
        self.held.clear();
    }

    fn output_format(&self) -> PixelFormat {
        PixelFormat::RGBA
    }

    fn name(&self) -> String {
        format!("synthetic-sw ({})", self.codec)
    }
}

/// PCM 音频解码器
///
/// 可以在解码若干个包之后改变输出声道数，模拟 HE-AAC/PS 这类中途改变布局的流。
pub struct SyntheticAudioDecoder {
    format: SampleFormat,
    planar: bool,
    channels: u16,
    sample_rate: u32,
    codec: String,
    channel_switch: Option<(usize, u16)>,
    decoded: usize,
}

impl AudioDecoder for SyntheticAudioDecoder {
    fn decode(&mut self, packet: &Packet, out: &mut RawAudio) -> Result<DecodeStatus> {
        let channels = match self.channel_switch {
            Some((after, channels)) if self.decoded >= after => channels,
            _ => self.channels,
        };
        self.decoded += 1;
        let frame_bytes = self.format.bytes_per_sample() * channels as usize;
        if packet.data.is_empty() || packet.data.len() % frame_bytes != 0 {
            return Err(DecoderError::DecodeError(format!(
                "音频包长度 {} 不是 {} 的整数倍",
                packet.data.len(),
                frame_bytes
            )));
        }
        let samples = packet.data.len() / frame_bytes;
        out.pts = packet.pts.unwrap_or(0.0);
        out.sample_rate = self.sample_rate;
        out.channels = channels;
        out.format = self.format;
        out.planar = self.planar;
        out.samples = samples;
        let plane_count = if self.planar { channels as usize } else { 1 };
        let plane_len = packet.data.len() / plane_count;
        out.planes.resize_with(plane_count, Vec::new);
        for (plane, chunk) in out.planes.iter_mut().zip(packet.data.chunks(plane_len)) {
            plane.clear();
            plane.extend_from_slice(chunk);
        }
        Ok(DecodeStatus::Frame)
    }

    fn flush(&mut self) {}

    fn name(&self) -> String {
        format!("synthetic-pcm ({})", self.codec)
    }
}

// ============= 模拟硬件解码服务 =============

enum HwCommand {
    Submit(u32),
    Flush(Sender<()>),
    Stop,
}

/// 模拟硬件解码：后台线程异步完成，按帧号（显示顺序）重排后输出
pub struct SyntheticHwDecoder {
    commands: Sender<HwCommand>,
    worker: Option<JoinHandle<()>>,
    submitted: usize,
    fail_after: Option<usize>,
}

/// 重排窗口：缓存超过这么多帧时输出最早的一帧
const HW_REORDER_DEPTH: usize = 2;
/// 没有新输入时，等待这么久后把剩余帧全部输出
const HW_IDLE_DRAIN: Duration = Duration::from_millis(20);

impl SyntheticHwDecoder {
    fn start(
        width: u32,
        height: u32,
        sink: HwFrameSink,
        fail_after: Option<usize>,
        idle: Duration,
    ) -> Self {
        let (commands, rx) = bounded(16);
        let worker = thread::Builder::new()
            .name("synthetic-hw".to_string())
            .spawn(move || Self::run(rx, sink, width, height, idle))
            .ok();
        Self {
            commands,
            worker,
            submitted: 0,
            fail_after,
        }
    }

    fn run(rx: Receiver<HwCommand>, sink: HwFrameSink, width: u32, height: u32, idle: Duration) {
        let mut held: BinaryHeap<Reverse<u32>> = BinaryHeap::new();
        let complete = |frame: u32| {
            sink.complete_with(width, height, PixelFormat::RGBA, |data| {
                fill_frame(data, width, height, frame)
            });
        };
        loop {
            match rx.recv_timeout(idle) {
                Ok(HwCommand::Submit(frame)) => {
                    held.push(Reverse(frame));
                    while held.len() > HW_REORDER_DEPTH {
                        if let Some(Reverse(frame)) = held.pop() {
                            complete(frame);
                        }
                    }
                }
                Ok(HwCommand::Flush(ack)) => {
                    held.clear();
                    let _ = ack.send(());
                }
                Ok(HwCommand::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    while let Some(Reverse(frame)) = held.pop() {
                        complete(frame);
                    }
                }
            }
        }
        debug!("模拟硬件解码线程退出");
    }
}

impl HardwareVideoDecoder for SyntheticHwDecoder {
    fn submit(&mut self, packet: &Packet) -> Result<()> {
        if self.fail_after.is_some_and(|n| self.submitted >= n) {
            return Err(DecoderError::HardwareRejected(format!(
                "加速器拒绝第 {} 个数据包",
                self.submitted + 1
            )));
        }
        let frame = parse_video_payload(packet)?;
        self.commands
            .send(HwCommand::Submit(frame))
            .map_err(|_| DecoderError::HardwareRejected("硬件解码线程已退出".to_string()))?;
        self.submitted += 1;
        Ok(())
    }

    fn flush(&mut self) {
        let (ack, done) = bounded(1);
        if self.commands.send(HwCommand::Flush(ack)).is_ok() {
            let _ = done.recv();
        }
    }

    fn name(&self) -> String {
        "synthetic-hw".to_string()
    }
}

impl Drop for SyntheticHwDecoder {
    fn drop(&mut self) {
        let _ = self.commands.send(HwCommand::Stop);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("模拟硬件解码线程异常退出");
            }
        }
    }
}

// ============= 后端 =============

/// 合成后端
#[derive(Debug, Clone, Default)]
pub struct SyntheticBackend {
    hardware: bool,
    hw_open_fails: bool,
    hw_fail_after: Option<usize>,
    hw_idle: Option<Duration>,
    decoder_delay: usize,
    audio_channel_switch: Option<(usize, u16)>,
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 启用模拟硬件解码
    pub fn with_hardware(mut self) -> Self {
        self.hardware = true;
        self
    }

    /// 硬件解码器创建失败（用于验证回退到软件解码）
    pub fn with_hw_open_failure(mut self) -> Self {
        self.hardware = true;
        self.hw_open_fails = true;
        self
    }

    /// 提交 `n` 个数据包之后加速器开始拒绝
    pub fn with_hw_failure_after(mut self, n: usize) -> Self {
        self.hardware = true;
        self.hw_fail_after = Some(n);
        self
    }

    /// 硬件解码服务没有新输入时，等待这么久才输出重排窗口里剩下的帧
    pub fn with_hw_idle_drain(mut self, idle: Duration) -> Self {
        self.hw_idle = Some(idle);
        self
    }

    /// 软件视频解码器内部缓存 `frames` 帧（模拟 B 帧重排延迟）
    pub fn with_decoder_delay(mut self, frames: usize) -> Self {
        self.decoder_delay = frames;
        self
    }

    /// 音频解码器在 `after` 个包之后改为输出 `channels` 声道
    pub fn with_audio_channel_switch(mut self, after: usize, channels: u16) -> Self {
        self.audio_channel_switch = Some((after, channels));
        self
    }
}

impl CodecBackend for SyntheticBackend {
    fn name(&self) -> String {
        "synthetic".to_string()
    }

    fn open_demuxer(&self, reader: SourceReader) -> Result<Box<dyn Demuxer>> {
        Ok(Box::new(SyntheticDemuxer::open(reader)?))
    }

    fn open_video_decoder(&self, stream: &StreamInfo) -> Result<Box<dyn VideoDecoder>> {
        if !VIDEO_CODECS.contains(&stream.codec_name.as_str()) {
            return Err(DecoderError::UnsupportedCodec(stream.codec_name.clone()));
        }
        Ok(Box::new(SyntheticVideoDecoder {
            width: stream.width,
            height: stream.height,
            codec: stream.codec_name.clone(),
            delay: self.decoder_delay,
            held: Vec::new(),
        }))
    }

    fn open_audio_decoder(&self, stream: &StreamInfo) -> Result<Box<dyn AudioDecoder>> {
        let (format, planar) = audio_layout(&stream.codec_name)
            .ok_or_else(|| DecoderError::UnsupportedCodec(stream.codec_name.clone()))?;
        if stream.channels == 0 {
            return Err(DecoderError::ContextError("音频流声道数为 0".to_string()));
        }
        Ok(Box::new(SyntheticAudioDecoder {
            format,
            planar,
            channels: stream.channels,
            sample_rate: stream.sample_rate,
            codec: stream.codec_name.clone(),
            channel_switch: self.audio_channel_switch,
            decoded: 0,
        }))
    }

    fn supports_hw_decoder(&self, stream: &StreamInfo) -> bool {
        self.hardware && VIDEO_CODECS.contains(&stream.codec_name.as_str())
    }

    fn open_hw_video_decoder(
        &self,
        stream: &StreamInfo,
        sink: HwFrameSink,
    ) -> Result<Box<dyn HardwareVideoDecoder>> {
        if self.hw_open_fails {
            return Err(DecoderError::HardwareRejected(
                "没有可用的硬件加速设备".to_string(),
            ));
        }
        info!(
            "🚀 启动模拟硬件解码: {} {}x{}",
            stream.codec_name, stream.width, stream.height
        );
        Ok(Box::new(SyntheticHwDecoder::start(
            stream.width,
            stream.height,
            sink,
            self.hw_fail_after,
            self.hw_idle.unwrap_or(HW_IDLE_DRAIN),
        )))
    }
}
