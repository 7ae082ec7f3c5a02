use crate::core::{AudioFrame, DecoderError, Result, VideoFrame};
use crate::engine::ring_buffer::RingBuffer;
use std::sync::Arc;

/// 消费端：运行在渲染 / 播放线程上，从两个环形缓冲里取解码结果
///
/// 环形缓冲是单消费者的，所以每个管线只有一个 `FrameConsumer`。
/// 取出的帧会和槽位交换内存（不复制），由消费端持有直到下一次取帧。
pub struct FrameConsumer {
    video: Arc<RingBuffer<VideoFrame>>,
    audio: Arc<RingBuffer<AudioFrame>>,
    current_video: VideoFrame,
    current_audio: AudioFrame,
    has_video: bool,
}

impl FrameConsumer {
    pub(crate) fn new(video: Arc<RingBuffer<VideoFrame>>, audio: Arc<RingBuffer<AudioFrame>>) -> Self {
        Self {
            video,
            audio,
            current_video: VideoFrame::default(),
            current_audio: AudioFrame::default(),
            has_video: false,
        }
    }

    /// 取出最早完成的一帧视频
    ///
    /// 返回的缓冲归引擎所有，下一次调用时会被复用；没有可用帧时返回 `NoFrame`。
    pub fn get_decoded_video_frame(&mut self) -> Result<&VideoFrame> {
        let current = &mut self.current_video;
        match self.video.pop_with(|slot| std::mem::swap(slot, current)) {
            Some(()) => {
                self.has_video = true;
                Ok(&self.current_video)
            }
            None => Err(DecoderError::NoFrame),
        }
    }

    /// 最近一次取出的视频帧
    pub fn current_video_frame(&self) -> Option<&VideoFrame> {
        self.has_video.then_some(&self.current_video)
    }

    /// 取出最早的一块音频
    pub fn pop_audio(&mut self) -> Option<&AudioFrame> {
        let current = &mut self.current_audio;
        self.audio
            .pop_with(|slot| std::mem::swap(slot, current))
            .map(|()| &self.current_audio)
    }

    pub fn video_frames_ready(&self) -> usize {
        self.video.size()
    }

    pub fn audio_blocks_ready(&self) -> usize {
        self.audio.size()
    }
}
