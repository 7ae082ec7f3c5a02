use crate::engine::flags::PipelineFlags;
use log::debug;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 网络字节源抽象接口
///
/// 由网络层实现：可随机读取、可能很慢、可能卡住。重试策略完全由实现方负责，
/// 引擎本身从不重试。被 `interrupt` 之后，阻塞中的 `read_at` 应该尽快返回。
pub trait NetworkByteSource: Send + Sync {
    /// 从 `offset` 开始读取，可能阻塞；返回 0 表示已经读到末尾
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// 总字节数（未知时为 None）
    fn total_size(&self) -> Option<u64>;

    /// 等待网络时给 UI 显示的状态文字
    fn waiting_status(&self) -> Option<String> {
        None
    }

    /// 已下载的字节区间（升序、互不重叠）
    fn downloaded_ranges(&self) -> Vec<Range<u64>>;

    /// 数据源是否已永久失效（例如地址过期，需要网络层重新协商）
    fn has_failed(&self) -> bool {
        false
    }

    /// 唤醒阻塞中的读取
    fn interrupt(&self) {}

    fn clear_interrupt(&self) {}

    /// 引擎不再需要该数据源（deinit 且不保留网络流时调用）
    fn close(&self) {}

    fn description(&self) -> String {
        "network source".to_string()
    }
}

/// 读取被中断时放在 io::Error 里的标记
#[derive(Debug)]
pub struct ReadInterrupted;

impl fmt::Display for ReadInterrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "读取被中断")
    }
}

impl std::error::Error for ReadInterrupted {}

pub fn interrupted_error() -> io::Error {
    io::Error::other(ReadInterrupted)
}

/// 判断 io 错误是否来自中断
pub fn is_interrupt(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<ReadInterrupted>())
}

/// 数据源上的读取游标（交给解封装器使用）
///
/// 读取位置通过 `Arc<AtomicU64>` 共享，缓冲进度条可以随时读取。
pub struct SourceReader {
    source: Arc<dyn NetworkByteSource>,
    position: Arc<AtomicU64>,
    flags: Arc<PipelineFlags>,
}

impl SourceReader {
    pub fn new(source: Arc<dyn NetworkByteSource>, flags: Arc<PipelineFlags>) -> Self {
        Self {
            source,
            position: Arc::new(AtomicU64::new(0)),
            flags,
        }
    }

    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub fn position_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.position)
    }

    pub fn source(&self) -> &Arc<dyn NetworkByteSource> {
        &self.source
    }
}

impl Read for SourceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.flags.is_interrupted() {
            return Err(interrupted_error());
        }
        let offset = self.position();
        let n = self.source.read_at(offset, buf)?;
        if self.flags.is_interrupted() {
            return Err(interrupted_error());
        }
        self.position.store(offset + n as u64, Ordering::Release);
        Ok(n)
    }
}

impl Seek for SourceReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position().checked_add_signed(delta),
            SeekFrom::End(delta) => {
                let size = self.source.total_size().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Unsupported, "数据源大小未知，无法从末尾定位")
                })?;
                size.checked_add_signed(delta)
            }
        };
        let target = target
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "定位到了负偏移"))?;
        self.position.store(target, Ordering::Release);
        Ok(target)
    }
}

struct MemoryState {
    available: u64,
    waiting_status: Option<String>,
    failed: bool,
    interrupted: bool,
}

/// 内存数据源：模拟边下载边播放的网络流
///
/// `available` 之前的数据视为已下载；读取未下载区域时阻塞等待，
/// 直到 `feed_until` 推进下载进度、被中断或被标记失效。
pub struct MemoryByteSource {
    data: Vec<u8>,
    state: Mutex<MemoryState>,
    changed: Condvar,
    name: String,
}

impl MemoryByteSource {
    /// 全部数据已就绪
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        let available = data.len() as u64;
        Self::with_available(name, data, available)
    }

    /// 只有前 `available` 字节已就绪
    pub fn with_available(name: impl Into<String>, data: Vec<u8>, available: u64) -> Self {
        Self {
            data,
            state: Mutex::new(MemoryState {
                available,
                waiting_status: None,
                failed: false,
                interrupted: false,
            }),
            changed: Condvar::new(),
            name: name.into(),
        }
    }

    /// 下载进度推进到 `available` 字节
    pub fn feed_until(&self, available: u64) {
        let mut state = self.state.lock();
        state.available = available.min(self.data.len() as u64).max(state.available);
        state.waiting_status = None;
        self.changed.notify_all();
    }

    /// 标记数据源失效
    pub fn fail(&self) {
        let mut state = self.state.lock();
        state.failed = true;
        self.changed.notify_all();
    }

    /// 网络层重新协商成功，数据源恢复可用
    pub fn recover(&self) {
        let mut state = self.state.lock();
        state.failed = false;
        self.changed.notify_all();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl NetworkByteSource for MemoryByteSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let total = self.data.len() as u64;
        let mut state = self.state.lock();
        loop {
            if state.failed {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "数据源已失效"));
            }
            if offset >= total || buf.is_empty() {
                return Ok(0);
            }
            if offset < state.available {
                let end = state.available.min(offset + buf.len() as u64);
                let n = (end - offset) as usize;
                buf[..n].copy_from_slice(&self.data[offset as usize..end as usize]);
                return Ok(n);
            }
            if state.interrupted {
                return Err(interrupted_error());
            }
            debug!("⏳ {} 等待数据: offset={}", self.name, offset);
            state.waiting_status = Some(format!("等待网络数据 ({} 字节处)", offset));
            self.changed.wait(&mut state);
        }
    }

    fn total_size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn waiting_status(&self) -> Option<String> {
        self.state.lock().waiting_status.clone()
    }

    fn downloaded_ranges(&self) -> Vec<Range<u64>> {
        let available = self.state.lock().available;
        if available == 0 {
            Vec::new()
        } else {
            vec![0..available]
        }
    }

    fn has_failed(&self) -> bool {
        self.state.lock().failed
    }

    fn interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupted = true;
        self.changed.notify_all();
    }

    fn clear_interrupt(&self) {
        self.state.lock().interrupted = false;
    }

    fn description(&self) -> String {
        format!("memory source: {}", self.name)
    }
}
