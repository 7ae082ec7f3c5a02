use crate::core::{DecoderError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 解码管线配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 视频环形缓冲容量（帧）
    pub video_buffer_frames: usize,
    /// 音频环形缓冲容量（块）
    pub audio_buffer_blocks: usize,
    /// 是否优先尝试硬件解码
    pub request_hw_decoder: bool,
    /// 音频输出声道数（重采样目标）
    pub audio_target_channels: u16,
    /// 数据包日志采样间隔
    pub packet_log_every: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            video_buffer_frames: 8,
            audio_buffer_blocks: 16,
            request_hw_decoder: false,
            audio_target_channels: 2,
            packet_log_every: 100,
        }
    }
}

impl PipelineConfig {
    /// 从 JSON 文件加载（缺省字段使用默认值）
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| DecoderError::Other(format!("配置文件解析失败: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.video_buffer_frames == 0 || self.audio_buffer_blocks == 0 {
            return Err(DecoderError::Other("缓冲容量必须大于 0".to_string()));
        }
        if !(1..=8).contains(&self.audio_target_channels) {
            return Err(DecoderError::Other(format!(
                "不支持的输出声道数: {}",
                self.audio_target_channels
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{ "video_buffer_frames": 4, "request_hw_decoder": true }"#)
                .unwrap();
        assert_eq!(config.video_buffer_frames, 4);
        assert!(config.request_hw_decoder);
        assert_eq!(config.audio_buffer_blocks, 16);
        assert_eq!(config.audio_target_channels, 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = PipelineConfig {
            audio_target_channels: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PipelineConfig {
            video_buffer_frames: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
