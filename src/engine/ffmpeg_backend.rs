//! FFmpeg 编解码后端
//!
//! 解封装通过自定义 AVIO 从 [`SourceReader`] 读取字节，不让 FFmpeg 自己访问网络。
//! 只提供软件解码；视频统一转换为 RGBA，音频交给引擎的重采样器统一为 f32。

use crate::core::{
    CodecPrivate, DecoderError, MediaKind, Packet, PixelFormat, RawAudio, Result, SampleFormat,
    StreamInfo, VideoFrame,
};
use crate::engine::codec::{AudioDecoder, CodecBackend, DecodeStatus, Demuxer, VideoDecoder};
use crate::engine::network_source::{is_interrupt, SourceReader};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, ffi, format, media, software, util};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::ffi::c_void;
use std::io::{Read, Seek, SeekFrom};
use std::os::raw::c_int;
use std::ptr;
use std::sync::Arc;

const AVIO_BUFFER_SIZE: usize = 64 * 1024;
const AVSEEK_SIZE: c_int = 0x10000;
const AVSEEK_FORCE: c_int = 0x20000;

fn rational_to_f64(r: util::rational::Rational) -> f64 {
    if r.denominator() == 0 {
        0.0
    } else {
        r.numerator() as f64 / r.denominator() as f64
    }
}

fn decode_error(e: ffmpeg::Error) -> DecoderError {
    DecoderError::DecodeError(e.to_string())
}

fn is_again(e: &ffmpeg::Error) -> bool {
    matches!(e, ffmpeg::Error::Other { errno } if *errno == util::error::EAGAIN)
}

// ============= 自定义 AVIO =============

unsafe extern "C" fn avio_read(opaque: *mut c_void, buf: *mut u8, buf_size: c_int) -> c_int {
    let reader = &mut *(opaque as *mut SourceReader);
    let slice = std::slice::from_raw_parts_mut(buf, buf_size.max(0) as usize);
    match reader.read(slice) {
        Ok(0) => ffi::AVERROR_EOF,
        Ok(n) => n as c_int,
        Err(e) if is_interrupt(&e) => ffi::AVERROR_EXIT,
        Err(e) => {
            warn!("⚠️ 字节源读取失败: {}", e);
            ffi::AVERROR_EXTERNAL
        }
    }
}

unsafe extern "C" fn avio_seek(opaque: *mut c_void, offset: i64, whence: c_int) -> i64 {
    let reader = &mut *(opaque as *mut SourceReader);
    if whence & AVSEEK_SIZE != 0 {
        return reader
            .source()
            .total_size()
            .map(|size| size as i64)
            .unwrap_or(-1);
    }
    let pos = match whence & !AVSEEK_FORCE {
        0 if offset >= 0 => SeekFrom::Start(offset as u64),
        1 => SeekFrom::Current(offset),
        2 => SeekFrom::End(offset),
        _ => return -1,
    };
    match reader.seek(pos) {
        Ok(position) => position as i64,
        Err(_) => -1,
    }
}

/// AVIO 上下文和它读取的字节源游标
///
/// 必须比使用它的 `format::context::Input` 活得更久。
struct IoContext {
    avio: *mut ffi::AVIOContext,
    reader: *mut SourceReader,
}

impl IoContext {
    fn new(reader: SourceReader) -> Result<Self> {
        let reader = Box::into_raw(Box::new(reader));
        unsafe {
            let buffer = ffi::av_malloc(AVIO_BUFFER_SIZE) as *mut u8;
            if buffer.is_null() {
                drop(Box::from_raw(reader));
                return Err(DecoderError::ContextError("AVIO 缓冲分配失败".to_string()));
            }
            let avio = ffi::avio_alloc_context(
                buffer,
                AVIO_BUFFER_SIZE as c_int,
                0,
                reader as *mut c_void,
                Some(avio_read),
                None,
                Some(avio_seek),
            );
            if avio.is_null() {
                ffi::av_free(buffer as *mut c_void);
                drop(Box::from_raw(reader));
                return Err(DecoderError::ContextError("AVIO 上下文分配失败".to_string()));
            }
            Ok(Self { avio, reader })
        }
    }

    /// 中断之后清掉 AVIO 的错误状态，恢复后可以继续读取
    fn clear_error(&self) {
        unsafe {
            (*self.avio).eof_reached = 0;
            (*self.avio).error = 0;
        }
    }
}

impl Drop for IoContext {
    fn drop(&mut self) {
        unsafe {
            // 缓冲可能已被 FFmpeg 重新分配，释放当前指针
            ffi::av_freep(&mut (*self.avio).buffer as *mut *mut u8 as *mut c_void);
            ffi::avio_context_free(&mut self.avio);
            drop(Box::from_raw(self.reader));
        }
    }
}

// ============= 解封装 =============

/// 解码器打开时需要的编解码参数（独立的一份拷贝，不引用 Input）
struct SendParameters(codec::Parameters);

// AVCodecParameters 只在打开解码器时被复制，不会被并发修改
unsafe impl Send for SendParameters {}
unsafe impl Sync for SendParameters {}

pub struct FfmpegDemuxer {
    input: format::context::Input,
    io: IoContext,
    streams: Vec<StreamInfo>,
    description: String,
}

// Input 只在解码线程上使用
unsafe impl Send for FfmpegDemuxer {}

impl FfmpegDemuxer {
    fn open(reader: SourceReader) -> Result<Self> {
        let description = reader.source().description();
        let io = IoContext::new(reader)?;

        let input = unsafe {
            let mut ctx = ffi::avformat_alloc_context();
            if ctx.is_null() {
                return Err(DecoderError::ContextError("格式上下文分配失败".to_string()));
            }
            (*ctx).pb = io.avio;
            (*ctx).flags |= ffi::AVFMT_FLAG_CUSTOM_IO as c_int;

            // 失败时 avformat_open_input 会释放 ctx
            let ret = ffi::avformat_open_input(&mut ctx, ptr::null(), ptr::null_mut(), ptr::null_mut());
            if ret < 0 {
                return Err(open_error(ret, &description));
            }
            let ret = ffi::avformat_find_stream_info(ctx, ptr::null_mut());
            if ret < 0 {
                ffi::avformat_close_input(&mut ctx);
                return Err(open_error(ret, &description));
            }
            format::context::Input::wrap(ctx)
        };

        let streams = input.streams().map(|stream| stream_info(&stream)).collect();
        info!(
            "📂 FFmpeg 打开成功: {} (格式: {})",
            description,
            input.format().name()
        );
        Ok(Self {
            input,
            io,
            streams,
            description,
        })
    }
}

fn open_error(ret: c_int, description: &str) -> DecoderError {
    match ffmpeg::Error::from(ret) {
        ffmpeg::Error::Exit => DecoderError::Interrupted,
        e => DecoderError::OpenError(format!("{}: {}", description, e)),
    }
}

fn stream_info(stream: &format::stream::Stream) -> StreamInfo {
    let params = stream.parameters();
    let kind = match params.medium() {
        media::Type::Video => Some(MediaKind::Video),
        media::Type::Audio => Some(MediaKind::Audio),
        _ => None,
    };
    let time_base = rational_to_f64(stream.time_base());
    let (width, height, sample_rate, channels, bit_rate) = unsafe {
        let raw = &*params.as_ptr();
        (
            raw.width.max(0) as u32,
            raw.height.max(0) as u32,
            raw.sample_rate.max(0) as u32,
            raw.ch_layout.nb_channels.max(0) as u16,
            raw.bit_rate.max(0) as u64,
        )
    };
    let duration = (stream.duration() > 0).then(|| stream.duration() as f64 * time_base);

    StreamInfo {
        index: stream.index(),
        kind,
        codec_name: params.id().name().to_string(),
        time_base,
        width,
        height,
        frame_rate: rational_to_f64(stream.avg_frame_rate()),
        sample_rate,
        channels,
        bit_rate,
        duration,
        frame_count: stream.frames().max(0) as u64,
        codec_private: Some(CodecPrivate(Arc::new(SendParameters(params.clone())))),
    }
}

impl Demuxer for FfmpegDemuxer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut self.input) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => return Ok(None),
            Err(ffmpeg::Error::Exit) => {
                self.io.clear_error();
                return Err(DecoderError::Interrupted);
            }
            // 数据源是否失效由 DemuxContext 根据字节源的状态判断
            Err(e) => {
                return Err(DecoderError::OpenError(format!(
                    "读取数据包失败 {}: {}",
                    self.description, e
                )))
            }
        }

        let index = packet.stream();
        let time_base = self.streams.get(index).map(|s| s.time_base).unwrap_or(0.0);
        Ok(Some(Packet {
            stream_index: index,
            pts: packet.pts().map(|ts| ts as f64 * time_base),
            dts: packet.dts().map(|ts| ts as f64 * time_base),
            key_frame: packet.is_key(),
            data: packet.data().map(<[u8]>::to_vec).unwrap_or_default(),
        }))
    }

    fn seek(&mut self, timestamp_us: i64) -> Result<()> {
        self.input
            .seek(timestamp_us, ..timestamp_us)
            .map_err(|e| match e {
                ffmpeg::Error::Exit => DecoderError::Interrupted,
                e => DecoderError::OpenError(format!("seek 失败 {}: {}", self.description, e)),
            })
    }

    fn duration(&self) -> Option<f64> {
        let duration = self.input.duration();
        (duration > 0).then(|| duration as f64 / ffi::AV_TIME_BASE as f64)
    }

    fn format_name(&self) -> String {
        self.input.format().name().to_string()
    }

    fn bit_rate(&self) -> u64 {
        unsafe { (*self.input.as_ptr()).bit_rate.max(0) as u64 }
    }
}

fn parameters_of(stream: &StreamInfo) -> Result<codec::Parameters> {
    stream
        .codec_private
        .as_ref()
        .and_then(|p| p.downcast_ref::<SendParameters>())
        .map(|p| p.0.clone())
        .ok_or_else(|| {
            DecoderError::UnsupportedCodec(format!("{} 不是 FFmpeg 解封装出的流", stream.codec_name))
        })
}

/// 引擎的数据包还原成 FFmpeg 数据包（时间戳换回流的时间基）
fn to_ffmpeg_packet(packet: &Packet, time_base: f64) -> ffmpeg::Packet {
    let mut pkt = ffmpeg::Packet::copy(&packet.data);
    if time_base > 0.0 {
        pkt.set_pts(packet.pts.map(|ts| (ts / time_base).round() as i64));
        pkt.set_dts(packet.dts.map(|ts| (ts / time_base).round() as i64));
    }
    if packet.key_frame {
        pkt.set_flags(codec::packet::Flags::KEY);
    }
    pkt
}

// ============= 送包 =============

/// 解码器的输入端
trait PacketInput {
    fn put(&mut self, packet: &ffmpeg::Packet) -> std::result::Result<(), ffmpeg::Error>;
    fn put_eof(&mut self) -> std::result::Result<(), ffmpeg::Error>;
}

impl PacketInput for codec::decoder::Opened {
    fn put(&mut self, packet: &ffmpeg::Packet) -> std::result::Result<(), ffmpeg::Error> {
        self.send_packet(packet)
    }

    fn put_eof(&mut self) -> std::result::Result<(), ffmpeg::Error> {
        self.send_eof()
    }
}

/// 待送入解码器的数据包
///
/// 解码器输出端积压时 `send_packet` 返回 EAGAIN，数据包留在这里，
/// 取走一帧之后下次再送，不会丢包。
#[derive(Default)]
struct PacketFeeder {
    backlog: VecDeque<ffmpeg::Packet>,
    eof_sent: bool,
}

impl PacketFeeder {
    fn push(&mut self, packet: ffmpeg::Packet) {
        self.backlog.push_back(packet);
    }

    /// 按顺序送入积压的包，遇到 EAGAIN 停下；送入失败的包直接丢弃
    fn feed(&mut self, decoder: &mut impl PacketInput) -> Result<()> {
        while let Some(packet) = self.backlog.front() {
            match decoder.put(packet) {
                Ok(()) => {
                    self.backlog.pop_front();
                }
                Err(e) if is_again(&e) => break,
                Err(e) => {
                    self.backlog.pop_front();
                    return Err(decode_error(e));
                }
            }
        }
        Ok(())
    }

    /// 输入结束：积压的包送完之后发送 EOF
    fn finish(&mut self, decoder: &mut impl PacketInput) -> Result<()> {
        self.feed(decoder)?;
        if self.backlog.is_empty() && !self.eof_sent {
            decoder.put_eof().map_err(decode_error)?;
            self.eof_sent = true;
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.backlog.clear();
        self.eof_sent = false;
    }
}

// ============= 视频解码 =============

pub struct FfmpegVideoDecoder {
    decoder: codec::decoder::Video,
    feeder: PacketFeeder,
    scaler: Option<software::scaling::Context>,
    time_base: f64,
}

// SwsContext 不是 Send，但每个解码器只在解码线程上使用
unsafe impl Send for FfmpegVideoDecoder {}

impl FfmpegVideoDecoder {
    fn open(stream: &StreamInfo) -> Result<Self> {
        let context = codec::context::Context::from_parameters(parameters_of(stream)?)?;
        let decoder = context.decoder().video()?;
        debug!(
            "🎬 FFmpeg 视频解码器: {} {}x{} {:?}",
            stream.codec_name,
            decoder.width(),
            decoder.height(),
            decoder.format()
        );
        Ok(Self {
            decoder,
            feeder: PacketFeeder::default(),
            scaler: None,
            time_base: stream.time_base,
        })
    }

    fn receive(&mut self, out: &mut VideoFrame) -> Result<bool> {
        let mut frame = util::frame::Video::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => {
                self.convert_frame(&frame, out)?;
                Ok(true)
            }
            Err(ffmpeg::Error::Eof) => Ok(false),
            Err(e) if is_again(&e) => Ok(false),
            Err(e) => Err(decode_error(e)),
        }
    }

    /// YUV → RGBA，逐行复制到槽位里（去掉行对齐）
    fn convert_frame(&mut self, frame: &util::frame::Video, out: &mut VideoFrame) -> Result<()> {
        let width = frame.width();
        let height = frame.height();

        let stale = self
            .scaler
            .as_ref()
            .is_some_and(|s| s.input().width != width || s.input().height != height);
        if stale {
            debug!("🔧 视频尺寸变化 → {}x{}，重建缩放器", width, height);
            self.scaler = None;
        }
        if self.scaler.is_none() {
            self.scaler = Some(software::scaling::Context::get(
                frame.format(),
                width,
                height,
                util::format::Pixel::RGBA,
                width,
                height,
                software::scaling::Flags::BILINEAR,
            )?);
        }
        let Some(scaler) = self.scaler.as_mut() else {
            return Err(DecoderError::ContextError("缩放器未初始化".to_string()));
        };

        let mut rgba = util::frame::Video::empty();
        scaler.run(frame, &mut rgba)?;

        let row_size = width as usize * 4;
        let stride = rgba.stride(0);
        let src = rgba.data(0);
        out.data.resize(row_size * height as usize, 0);
        for (y, row) in out.data.chunks_exact_mut(row_size).enumerate() {
            let offset = y * stride;
            row.copy_from_slice(&src[offset..offset + row_size]);
        }

        out.pts = frame.timestamp().map(|ts| ts as f64 * self.time_base).unwrap_or(0.0);
        out.width = width;
        out.height = height;
        out.format = PixelFormat::RGBA;
        out.key_frame = frame.is_key();
        Ok(())
    }
}

impl VideoDecoder for FfmpegVideoDecoder {
    fn decode(&mut self, packet: &Packet, out: &mut VideoFrame) -> Result<DecodeStatus> {
        self.feeder.push(to_ffmpeg_packet(packet, self.time_base));
        self.feeder.feed(&mut *self.decoder)?;
        Ok(if self.receive(out)? {
            DecodeStatus::Frame
        } else {
            DecodeStatus::NeedMoreData
        })
    }

    fn drain(&mut self, out: &mut VideoFrame) -> Result<DecodeStatus> {
        self.feeder.finish(&mut *self.decoder)?;
        Ok(if self.receive(out)? {
            DecodeStatus::Frame
        } else {
            DecodeStatus::Drained
        })
    }

    fn flush(&mut self) {
        self.feeder.clear();
        self.decoder.flush();
    }

    fn output_format(&self) -> PixelFormat {
        PixelFormat::RGBA
    }

    fn name(&self) -> String {
        format!("ffmpeg-sw ({})", self.decoder.id().name())
    }
}

// ============= 音频解码 =============

pub struct FfmpegAudioDecoder {
    decoder: codec::decoder::Audio,
    feeder: PacketFeeder,
    // 只在解码器输出 i16/f32 以外的格式时创建
    converter: Option<software::resampling::Context>,
    time_base: f64,
}

unsafe impl Send for FfmpegAudioDecoder {}

impl FfmpegAudioDecoder {
    fn open(stream: &StreamInfo) -> Result<Self> {
        let context = codec::context::Context::from_parameters(parameters_of(stream)?)?;
        let decoder = context.decoder().audio()?;
        debug!(
            "🔊 FFmpeg 音频解码器: {} {} Hz, {} 声道, 格式: {:?}",
            stream.codec_name,
            decoder.rate(),
            decoder.channels(),
            decoder.format()
        );
        Ok(Self {
            decoder,
            feeder: PacketFeeder::default(),
            converter: None,
            time_base: stream.time_base,
        })
    }

    fn receive(&mut self, out: &mut RawAudio) -> Result<bool> {
        let mut frame = util::frame::Audio::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => {
                self.convert_frame(&frame, out)?;
                Ok(true)
            }
            Err(ffmpeg::Error::Eof) => Ok(false),
            Err(e) if is_again(&e) => Ok(false),
            Err(e) => Err(decode_error(e)),
        }
    }

    fn convert_frame(&mut self, frame: &util::frame::Audio, out: &mut RawAudio) -> Result<()> {
        use util::format::sample::{Sample, Type};

        let channels = frame.channels();
        let direct = match frame.format() {
            Sample::I16(Type::Packed) => Some((SampleFormat::I16, false)),
            Sample::I16(Type::Planar) => Some((SampleFormat::I16, true)),
            Sample::F32(Type::Packed) => Some((SampleFormat::F32, false)),
            Sample::F32(Type::Planar) => Some((SampleFormat::F32, true)),
            _ => None,
        }
        // 超过 8 个平面时 data[] 放不下，走转换
        .filter(|(_, planar)| !*planar || channels <= 8);

        out.pts = frame.timestamp().map(|ts| ts as f64 * self.time_base).unwrap_or(0.0);
        out.sample_rate = frame.rate();
        out.channels = channels;

        match direct {
            Some((format, planar)) => {
                out.format = format;
                out.planar = planar;
                out.samples = frame.samples();
                copy_planes(frame, format.bytes_per_sample(), planar, out);
            }
            None => {
                if self.converter.is_none() {
                    let mut layout = frame.channel_layout();
                    if layout.is_empty() {
                        layout = util::channel_layout::ChannelLayout::default(channels as i32);
                    }
                    debug!("🔧 音频格式 {:?} 需要转换为 f32 packed", frame.format());
                    self.converter = Some(software::resampling::Context::get(
                        frame.format(),
                        layout,
                        frame.rate(),
                        Sample::F32(Type::Packed),
                        layout,
                        frame.rate(),
                    )?);
                }
                let Some(converter) = self.converter.as_mut() else {
                    return Err(DecoderError::ResamplerError("格式转换器未初始化".to_string()));
                };
                let mut converted = util::frame::Audio::empty();
                converter
                    .run(frame, &mut converted)
                    .map_err(|e| DecoderError::ResamplerError(e.to_string()))?;
                out.format = SampleFormat::F32;
                out.planar = false;
                out.samples = converted.samples();
                copy_planes(&converted, 4, false, out);
            }
        }
        Ok(())
    }
}

fn copy_planes(frame: &util::frame::Audio, bytes: usize, planar: bool, out: &mut RawAudio) {
    let channels = out.channels as usize;
    let (plane_count, plane_len) = if planar {
        (channels, out.samples * bytes)
    } else {
        (1, out.samples * bytes * channels)
    };
    out.planes.resize_with(plane_count, Vec::new);
    for (i, plane) in out.planes.iter_mut().enumerate() {
        let src = frame.data(i);
        plane.clear();
        plane.extend_from_slice(&src[..plane_len.min(src.len())]);
    }
}

impl AudioDecoder for FfmpegAudioDecoder {
    fn decode(&mut self, packet: &Packet, out: &mut RawAudio) -> Result<DecodeStatus> {
        self.feeder.push(to_ffmpeg_packet(packet, self.time_base));
        self.feeder.feed(&mut *self.decoder)?;
        Ok(if self.receive(out)? {
            DecodeStatus::Frame
        } else {
            DecodeStatus::NeedMoreData
        })
    }

    fn drain(&mut self, out: &mut RawAudio) -> Result<DecodeStatus> {
        self.feeder.finish(&mut *self.decoder)?;
        Ok(if self.receive(out)? {
            DecodeStatus::Frame
        } else {
            DecodeStatus::Drained
        })
    }

    fn flush(&mut self) {
        self.feeder.clear();
        self.decoder.flush();
    }

    fn name(&self) -> String {
        format!("ffmpeg ({})", self.decoder.id().name())
    }
}

// ============= 后端 =============

/// FFmpeg 后端（仅软件解码）
pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> Result<Self> {
        ffmpeg::init()?;
        Ok(Self)
    }
}

impl CodecBackend for FfmpegBackend {
    fn name(&self) -> String {
        "ffmpeg".to_string()
    }

    fn open_demuxer(&self, reader: SourceReader) -> Result<Box<dyn Demuxer>> {
        Ok(Box::new(FfmpegDemuxer::open(reader)?))
    }

    fn open_video_decoder(&self, stream: &StreamInfo) -> Result<Box<dyn VideoDecoder>> {
        Ok(Box::new(FfmpegVideoDecoder::open(stream)?))
    }

    fn open_audio_decoder(&self, stream: &StreamInfo) -> Result<Box<dyn AudioDecoder>> {
        Ok(Box::new(FfmpegAudioDecoder::open(stream)?))
    }
}
