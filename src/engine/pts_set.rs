use crate::core::{PixelFormat, Pts, VideoFrame};
use crate::engine::ring_buffer::RingBuffer;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// 待输出时间戳的有序多重集合
///
/// 硬件解码器输出帧时不会告诉我们它对应哪个数据包，
/// 所以每次完成时取出最早的待定时间戳分配给这一帧。
#[derive(Debug, Default)]
pub struct PresentationTimestampSet {
    list: BTreeMap<Pts, usize>,
    len: usize,
}

impl PresentationTimestampSet {
    pub fn insert(&mut self, pts: f64) {
        *self.list.entry(Pts(pts)).or_insert(0) += 1;
        self.len += 1;
    }

    /// 取出最早的时间戳
    pub fn pop_earliest(&mut self) -> Option<f64> {
        let mut entry = self.list.first_entry()?;
        let pts = entry.key().0;
        *entry.get_mut() -= 1;
        if *entry.get() == 0 {
            entry.remove();
        }
        self.len -= 1;
        Some(pts)
    }

    /// 移除一个指定的时间戳
    pub fn remove(&mut self, pts: f64) -> bool {
        let Some(count) = self.list.get_mut(&Pts(pts)) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            self.list.remove(&Pts(pts));
        }
        self.len -= 1;
        true
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.list.clear();
        self.len = 0;
    }
}

struct HwShared {
    pending: Mutex<PresentationTimestampSet>,
    video: Arc<RingBuffer<VideoFrame>>,
}

/// 硬件解码完成回调的入口
///
/// 可在任意线程调用。时间戳集合和视频环形缓冲的写入端都由同一把锁保护，
/// 因此完成回调和解码线程上的 seek 清空不会同时写缓冲。
#[derive(Clone)]
pub struct HwFrameSink {
    shared: Arc<HwShared>,
}

impl HwFrameSink {
    pub(crate) fn new(video: Arc<RingBuffer<VideoFrame>>) -> Self {
        Self {
            shared: Arc::new(HwShared {
                pending: Mutex::new(PresentationTimestampSet::default()),
                video,
            }),
        }
    }

    /// 记录一个已提交数据包的时间戳（必须在提交之前调用）
    pub(crate) fn record_submission(&self, pts: f64) {
        self.shared.pending.lock().insert(pts);
    }

    /// 提交失败时撤销记录
    pub(crate) fn cancel_submission(&self, pts: f64) -> bool {
        self.shared.pending.lock().remove(pts)
    }

    /// 尚未输出的帧数
    pub fn pending(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// 丢弃全部待定时间戳和已缓冲的视频帧
    pub(crate) fn reset(&self) -> usize {
        let mut pending = self.shared.pending.lock();
        let dropped = pending.len();
        pending.clear();
        self.shared.video.clear();
        dropped
    }

    /// 只清空已缓冲的视频帧，仍在解码中的帧照常输出
    pub(crate) fn clear_output(&self) {
        let _pending = self.shared.pending.lock();
        self.shared.video.clear();
    }

    /// 一帧硬件解码完成：由 `write` 直接写入下一个缓冲槽位
    ///
    /// 分配最早的待定时间戳；没有待定时间戳（seek 之后迟到的帧）或缓冲已满时丢弃，返回 false。
    pub fn complete_with(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        write: impl FnOnce(&mut Vec<u8>),
    ) -> bool {
        let mut pending = self.shared.pending.lock();
        let Some(pts) = pending.pop_earliest() else {
            debug!("丢弃没有对应时间戳的硬件帧（可能是 seek 之前提交的）");
            return false;
        };
        let Some(mut slot) = self.shared.video.push_slot() else {
            warn!("⚠️ 视频缓冲已满，丢弃硬件解码输出 (pts={:.3})", pts);
            return false;
        };
        slot.pts = pts;
        slot.width = width;
        slot.height = height;
        slot.format = format;
        slot.key_frame = false;
        write(&mut slot.data);
        slot.commit();
        true
    }
}
