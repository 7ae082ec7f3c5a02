// 解码与缓冲引擎

pub mod buffering;
pub mod codec;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg_backend;
pub mod flags;
pub mod network_source;
pub mod output;
pub mod pipeline;
pub mod pts_set;
pub mod resampler;
pub mod ring_buffer;
pub mod synthetic;
pub mod track;

pub use buffering::{BufferingBar, BufferingMonitor};
pub use codec::{AudioDecoder, CodecBackend, DecodeStatus, Demuxer, HardwareVideoDecoder, VideoDecoder};
pub use flags::PipelineFlags;
pub use network_source::{MemoryByteSource, NetworkByteSource, SourceReader};
pub use output::FrameConsumer;
pub use pipeline::{AudioDecodeOutcome, DecodePipeline, VideoDecodeOutcome, VideoFrameInfo};
pub use pts_set::{HwFrameSink, PresentationTimestampSet};
pub use ring_buffer::RingBuffer;
pub use synthetic::SyntheticBackend;
pub use track::{MediaData, StreamSet, TrackContext};
