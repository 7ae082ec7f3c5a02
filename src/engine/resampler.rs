use crate::core::{AudioFrame, DecoderError, RawAudio, Result, SampleFormat};
use log::debug;

/// 音频格式统一：任意采样格式 / 平面布局 / 声道数 → 交错 f32 + 目标声道数
///
/// 只做格式与声道转换，不改变采样率。
pub struct Resampler {
    source_channels: u16,
    target_channels: u16,
    format: SampleFormat,
    planar: bool,
}

impl Resampler {
    /// 源格式已经是交错 f32 且声道数一致时不需要重采样器
    pub fn is_needed(format: SampleFormat, planar: bool, channels: u16, target_channels: u16) -> bool {
        !(format == SampleFormat::F32 && (!planar || channels == 1) && channels == target_channels)
    }

    pub fn new(
        format: SampleFormat,
        planar: bool,
        source_channels: u16,
        target_channels: u16,
    ) -> Result<Self> {
        if source_channels == 0 || target_channels == 0 {
            return Err(DecoderError::ResamplerError(format!(
                "无效的声道配置: {}ch → {}ch",
                source_channels, target_channels
            )));
        }
        debug!(
            "🔧 初始化音频重采样器: {:?}{} {}ch → f32 {}ch",
            format,
            if planar { "(planar)" } else { "" },
            source_channels,
            target_channels
        );
        Ok(Self {
            source_channels,
            target_channels,
            format,
            planar,
        })
    }

    pub fn target_channels(&self) -> u16 {
        self.target_channels
    }

    /// 这块音频的格式和创建时一致
    pub fn accepts(&self, input: &RawAudio) -> bool {
        input.channels == self.source_channels
            && input.format == self.format
            && input.planar == self.planar
    }

    /// 转换一块音频，写入 `out`（复用其内存）
    pub fn run(&mut self, input: &RawAudio, out: &mut AudioFrame) -> Result<()> {
        if !self.accepts(input) {
            return Err(DecoderError::ResamplerError(format!(
                "输入格式在解码过程中发生变化: {:?}/{}ch",
                input.format, input.channels
            )));
        }

        let src = self.source_channels as usize;
        let dst = self.target_channels as usize;
        out.pts = input.pts;
        out.sample_rate = input.sample_rate;
        out.channels = self.target_channels;
        out.data.clear();
        out.data.reserve(input.samples * dst);

        let mut frame = vec![0f32; src];
        for i in 0..input.samples {
            for (ch, value) in frame.iter_mut().enumerate() {
                *value = self.sample(input, ch, i)?;
            }
            Self::mix_into(&frame, dst, &mut out.data);
        }
        Ok(())
    }

    fn sample(&self, input: &RawAudio, ch: usize, i: usize) -> Result<f32> {
        let bps = self.format.bytes_per_sample();
        let (plane, offset) = if self.planar {
            (input.planes.get(ch), i * bps)
        } else {
            (input.planes.first(), (i * self.source_channels as usize + ch) * bps)
        };
        let bytes = plane
            .and_then(|p| p.get(offset..offset + bps))
            .ok_or_else(|| DecoderError::ResamplerError("音频数据长度不足".to_string()))?;
        Ok(match self.format {
            SampleFormat::I16 => i16::from_ne_bytes([bytes[0], bytes[1]]) as f32 / 32768.0,
            SampleFormat::F32 => f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        })
    }

    // 单声道复制到所有声道；多声道下混时按 (源声道 % 目标声道) 分组求平均
    fn mix_into(frame: &[f32], dst: usize, out: &mut Vec<f32>) {
        let src = frame.len();
        if src == dst {
            out.extend_from_slice(frame);
        } else if src == 1 {
            out.extend(std::iter::repeat(frame[0]).take(dst));
        } else if src < dst {
            out.extend((0..dst).map(|c| frame[c % src]));
        } else {
            for c in 0..dst {
                let (sum, count) = frame
                    .iter()
                    .enumerate()
                    .filter(|(k, _)| k % dst == c)
                    .fold((0f32, 0usize), |(s, n), (_, v)| (s + v, n + 1));
                out.push(sum / count as f32);
            }
        }
    }
}

/// 不需要重采样时直接复制交错 f32 数据
pub fn copy_packed_f32(input: &RawAudio, out: &mut AudioFrame) -> Result<()> {
    let plane = input
        .planes
        .first()
        .ok_or_else(|| DecoderError::DecodeError("音频帧没有数据".to_string()))?;
    let count = input.samples * input.channels as usize;
    if plane.len() < count * 4 {
        return Err(DecoderError::DecodeError("音频数据长度不足".to_string()));
    }
    out.pts = input.pts;
    out.sample_rate = input.sample_rate;
    out.channels = input.channels;
    out.data.clear();
    out.data.extend(
        plane[..count * 4]
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]])),
    );
    Ok(())
}
