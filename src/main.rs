use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use myy_stream_decoder::core::{DecodeType, DecoderError, PipelineConfig};
use myy_stream_decoder::engine::synthetic::{build_clip, AudioTrackSpec, ClipSpec, VideoTrackSpec};
use myy_stream_decoder::engine::{
    CodecBackend, DecodePipeline, MediaData, MemoryByteSource, NetworkByteSource, SyntheticBackend,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// 网络流解码引擎的命令行检查工具：解码一段媒体并输出格式信息和缓冲状态
#[derive(Parser, Debug)]
#[command(name = "myy-decode-inspect", version)]
struct Args {
    /// JSON 格式的管线配置文件
    #[arg(long)]
    config: Option<PathBuf>,

    /// 优先使用硬件解码
    #[arg(long)]
    hw: bool,

    /// 合成输入使用分离的音视频流
    #[arg(long)]
    separate: bool,

    /// 媒体文件（需要 ffmpeg 特性）；省略时使用合成片段
    path: Option<PathBuf>,
}

/// 有文件路径时使用 FFmpeg，否则使用合成后端
fn open_backend(args: &Args) -> Result<Arc<dyn CodecBackend>> {
    if let Some(path) = &args.path {
        #[cfg(feature = "ffmpeg")]
        {
            let _ = path;
            return Ok(Arc::new(
                myy_stream_decoder::engine::ffmpeg_backend::FfmpegBackend::new()?,
            ));
        }
        #[cfg(not(feature = "ffmpeg"))]
        bail!("打开 {} 需要启用 ffmpeg 特性", path.display());
    }
    let backend = SyntheticBackend::new();
    Ok(Arc::new(if args.hw {
        backend.with_hardware()
    } else {
        backend
    }))
}

fn open_media(args: &Args, pipeline: &DecodePipeline) -> Result<MediaData> {
    let backend = pipeline.backend().as_ref();
    let flags = pipeline.flags();
    if let Some(path) = &args.path {
        let bytes = std::fs::read(path).with_context(|| format!("读取 {} 失败", path.display()))?;
        let source: Arc<dyn NetworkByteSource> =
            Arc::new(MemoryByteSource::new(path.display().to_string(), bytes));
        return Ok(MediaData::open_muxed(backend, source, flags)?);
    }
    let data = if args.separate {
        let video: Arc<dyn NetworkByteSource> = Arc::new(MemoryByteSource::new(
            "synthetic-video",
            build_clip(&ClipSpec::video_only(VideoTrackSpec::default())),
        ));
        let audio: Arc<dyn NetworkByteSource> = Arc::new(MemoryByteSource::new(
            "synthetic-audio",
            build_clip(&ClipSpec::audio_only(AudioTrackSpec::default())),
        ));
        MediaData::open_separate(backend, video, audio, flags)?
    } else {
        let source: Arc<dyn NetworkByteSource> =
            Arc::new(MemoryByteSource::new("synthetic", build_clip(&ClipSpec::muxed())));
        MediaData::open_muxed(backend, source, flags)?
    };
    Ok(data)
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    config.request_hw_decoder |= args.hw;
    info!("🎬 myy-decode-inspect 启动, 配置: {:?}", config);

    let backend = open_backend(&args)?;
    let mut pipeline = DecodePipeline::new(backend, config.clone())?;
    let data = open_media(&args, &pipeline)?;
    pipeline.change_media_data(data, 0.0)?;
    pipeline.init(config.request_hw_decoder)?;

    let video_info = pipeline.get_video_info();
    let audio_info = pipeline.get_audio_info();
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "video": video_info,
            "audio": audio_info,
            "hw_decoder": pipeline.is_hw_decoder_enabled(),
        }))?
    );

    let mut consumer = pipeline.take_consumer().context("消费端已被取走")?;
    let done = Arc::new(AtomicBool::new(false));
    let consumer_done = Arc::clone(&done);
    let consumer_thread = thread::spawn(move || {
        let mut frames = 0usize;
        let mut blocks = 0usize;
        let mut last_pts = None;
        loop {
            let mut idle = true;
            while let Ok(frame) = consumer.get_decoded_video_frame() {
                frames += 1;
                last_pts = Some(frame.pts);
                idle = false;
            }
            while consumer.pop_audio().is_some() {
                blocks += 1;
                idle = false;
            }
            if idle {
                if consumer_done.load(Ordering::Acquire)
                    && consumer.video_frames_ready() == 0
                    && consumer.audio_blocks_ready() == 0
                {
                    break;
                }
                thread::sleep(Duration::from_millis(2));
            }
        }
        (frames, blocks, last_pts)
    });

    let started = Instant::now();
    let mut last_report = Instant::now();
    loop {
        let step = match pipeline.next_decode_type()? {
            DecodeType::Video => pipeline.decode_video().map(|_| ()),
            DecodeType::Audio => pipeline.decode_audio().map(|_| ()),
            DecodeType::EndOfStream => break,
            DecodeType::Interrupted => {
                warn!("⚠️ 解码被中断");
                break;
            }
        };
        match step {
            Ok(()) => {}
            // 消费端跟不上，稍等再试
            Err(DecoderError::OutputFull(_)) => thread::sleep(Duration::from_millis(1)),
            Err(e) if pipeline.flags().need_reinit() => {
                warn!("⚠️ 数据源失效，重新初始化: {}", e);
                pipeline.reinit()?;
            }
            Err(e) => return Err(e.into()),
        }
        if last_report.elapsed() > Duration::from_secs(1) {
            info!("📊 缓冲状态: {:?}", pipeline.buffer_status());
            last_report = Instant::now();
        }
    }
    // 硬件解码的最后几帧还在路上
    let deadline = Instant::now() + Duration::from_secs(2);
    while pipeline.buffer_status().pending_hw_frames > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    done.store(true, Ordering::Release);

    let (frames, blocks, last_pts) = consumer_thread
        .join()
        .map_err(|_| anyhow::anyhow!("消费线程异常退出"))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "video_frames": frames,
            "audio_blocks": blocks,
            "last_video_pts": last_pts,
            "elapsed_ms": started.elapsed().as_millis() as u64,
            "buffering": pipeline.get_buffering_progress_bars(20),
        }))?
    );

    pipeline.deinit(true);
    Ok(())
}
