use crate::core::MediaKind;
use crate::engine::network_source::NetworkByteSource;
use crate::engine::track::{MediaData, Tracks};
use serde::Serialize;
use std::ops::Range;
use std::sync::Arc;

/// 一个网络流的缓冲进度条
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferingBar {
    /// 该网络流承载的轨道
    pub tracks: Vec<MediaKind>,
    /// 当前读取位置（占总大小的比例）
    pub read_position: f64,
    /// 每一格的下载完成度，取值 [0, 1]
    pub buckets: Vec<f64>,
}

struct SourceEntry {
    tracks: Vec<MediaKind>,
    source: Arc<dyn NetworkByteSource>,
    read_position: u64,
}

/// 缓冲进度监视器
///
/// 只用于界面显示，每次调用时重新计算，结果可以是近似值。
#[derive(Default)]
pub struct BufferingMonitor {
    sources: Vec<SourceEntry>,
}

impl BufferingMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source(
        &mut self,
        tracks: Vec<MediaKind>,
        source: Arc<dyn NetworkByteSource>,
        read_position: u64,
    ) {
        self.sources.push(SourceEntry {
            tracks,
            source,
            read_position,
        });
    }

    /// 从当前绑定的轨道上下文生成监视器
    pub fn from_media(data: &MediaData) -> Self {
        let mut monitor = Self::new();
        match data.tracks() {
            Tracks::Separate { video, audio } => {
                for (kind, st) in [(MediaKind::Video, video), (MediaKind::Audio, audio)] {
                    monitor.add_source(
                        vec![kind],
                        Arc::clone(st.demux.source()),
                        st.demux.read_position(),
                    );
                }
            }
            Tracks::Muxed {
                shared,
                video,
                audio,
            } => {
                let mut kinds = Vec::new();
                if video.is_some() {
                    kinds.push(MediaKind::Video);
                }
                if audio.is_some() {
                    kinds.push(MediaKind::Audio);
                }
                monitor.add_source(kinds, Arc::clone(shared.source()), shared.read_position());
            }
        }
        monitor
    }

    /// 把已下载的字节区间映射到 `length` 格进度条上
    pub fn get_buffering_progress_bars(&self, length: usize) -> Vec<BufferingBar> {
        self.sources
            .iter()
            .map(|entry| {
                let total = entry.source.total_size().unwrap_or(0);
                let ranges = entry.source.downloaded_ranges();
                BufferingBar {
                    tracks: entry.tracks.clone(),
                    read_position: if total == 0 {
                        0.0
                    } else {
                        (entry.read_position as f64 / total as f64).clamp(0.0, 1.0)
                    },
                    buckets: bucketize(&ranges, total, length),
                }
            })
            .collect()
    }
}

fn bucketize(ranges: &[Range<u64>], total: u64, length: usize) -> Vec<f64> {
    if total == 0 {
        return vec![0.0; length];
    }
    (0..length)
        .map(|i| {
            let start = total as f64 * i as f64 / length as f64;
            let end = total as f64 * (i + 1) as f64 / length as f64;
            let width = end - start;
            if width <= 0.0 {
                return 1.0;
            }
            let covered: f64 = ranges
                .iter()
                .map(|r| {
                    let lo = (r.start as f64).max(start);
                    let hi = (r.end as f64).min(end);
                    (hi - lo).max(0.0)
                })
                .sum();
            (covered / width).clamp(0.0, 1.0)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::network_source::MemoryByteSource;

    #[test]
    fn test_bucketize_partial_download() {
        let buckets = bucketize(&[0..150], 400, 4);
        assert_eq!(buckets, vec![1.0, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_bucketize_multiple_ranges() {
        let buckets = bucketize(&[0..50, 300..400], 400, 4);
        assert_eq!(buckets, vec![0.5, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_unknown_size_yields_empty_buckets() {
        assert_eq!(bucketize(&[0..10], 0, 3), vec![0.0; 3]);
        assert!(bucketize(&[0..10], 10, 0).is_empty());
    }

    #[test]
    fn test_monitor_reports_read_position() {
        let source = Arc::new(MemoryByteSource::with_available("mem", vec![0u8; 1000], 500));
        let mut monitor = BufferingMonitor::new();
        monitor.add_source(vec![MediaKind::Video], source, 250);
        let bars = monitor.get_buffering_progress_bars(2);
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].read_position, 0.25);
        assert_eq!(bars[0].buckets, vec![1.0, 0.0]);
        assert_eq!(bars[0].tracks, vec![MediaKind::Video]);
    }
}
