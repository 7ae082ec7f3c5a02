use crate::engine::network_source::NetworkByteSource;
use log::info;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 管线状态标志（解码线程写入，其它线程轮询）
///
/// `interrupt` 由消费侧设置，解码线程在每个阻塞点前后检查；
/// 设置时会顺便唤醒所有登记过的数据源，让正在阻塞的网络读取尽快返回。
#[derive(Default)]
pub struct PipelineFlags {
    ready: AtomicBool,
    need_reinit: AtomicBool,
    interrupt: AtomicBool,
    sources: Mutex<Vec<Arc<dyn NetworkByteSource>>>,
}

impl PipelineFlags {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn need_reinit(&self) -> bool {
        self.need_reinit.load(Ordering::Acquire)
    }

    pub(crate) fn set_need_reinit(&self, value: bool) {
        self.need_reinit.store(value, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Acquire)
    }

    /// 请求中断当前的阻塞读取 / 解码
    pub fn request_interrupt(&self) {
        info!("⏹ 请求中断解码管线");
        self.interrupt.store(true, Ordering::Release);
        for source in self.sources.lock().iter() {
            source.interrupt();
        }
    }

    /// 清除中断标志（重新开始播放前调用）
    pub fn clear_interrupt(&self) {
        self.interrupt.store(false, Ordering::Release);
        for source in self.sources.lock().iter() {
            source.clear_interrupt();
        }
    }

    pub(crate) fn register_source(&self, source: &Arc<dyn NetworkByteSource>) {
        let mut sources = self.sources.lock();
        if !sources.iter().any(|s| Arc::ptr_eq(s, source)) {
            sources.push(Arc::clone(source));
        }
    }

    pub(crate) fn unregister_source(&self, source: &Arc<dyn NetworkByteSource>) {
        self.sources.lock().retain(|s| !Arc::ptr_eq(s, source));
    }
}
