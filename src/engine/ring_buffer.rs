//! 单生产者 / 单消费者环形缓冲
//!
//! 解码线程把解码结果直接写进下一个空槽位（`push_slot` + `commit`），
//! 消费线程原地读取最早的槽位（`peek_next_to_pop`）后再 `pop`。
//! 内部分配 capacity + 1 个槽位并始终保留一个空槽，缓冲满时生产者的下一个槽位
//! 也不会是消费者正在读的那一个。
//!
//! head / tail 是只增不减的位置计数，槽位下标是位置对槽位数取模。
//! 这样 `clear` 之后旧的 tail 永远不会再次出现，迟到的 `pop` 不会误推进 tail。
//! head 只由生产者推进，tail 只由消费者推进（`clear` 例外，见下文）；
//! 两者都以 Release 写入、Acquire 读取，保证生产者在推进 head 之前写入的数据
//! 对观察到新 head 的消费者可见。`size` / `full` / `empty` 只读这两个原子量，不加锁。
//!
//! 槽位内容的交接并不是完全无锁的：每个槽位各带一把锁。正常情况下生产者和消费者
//! 永远不会同时访问同一个槽位，这把锁没有竞争。`clear` 之后 tail 被直接移到 head，
//! 消费者手里可能还拿着旧 tail 上的槽位；生产者绕回到这个槽位时会在锁上等待，
//! 直到消费者读完（`release` 返回 false）。消费者持有槽位的时间应尽量短。

use crossbeam::utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct RingBuffer<T> {
    slots: Box<[Mutex<T>]>,
    head: CachePadded<AtomicUsize>, // 下一个写入位置（计数）
    tail: CachePadded<AtomicUsize>, // 下一个读取位置（计数）
}

impl<T> RingBuffer<T> {
    /// 创建可容纳 `capacity` 个元素的缓冲，槽位由 `fill` 预先分配
    pub fn new(capacity: usize, mut fill: impl FnMut() -> T) -> Self {
        let slots = (0..capacity + 1)
            .map(|_| Mutex::new(fill()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// 可用容量（不含保留的空槽）
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    fn slot(&self, position: usize) -> &Mutex<T> {
        &self.slots[position % self.slots.len()]
    }

    /// 当前元素个数
    pub fn size(&self) -> usize {
        // 先读 tail：之后读到的 head 不会比它小
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    pub fn full(&self) -> bool {
        self.size() == self.capacity()
    }

    pub fn empty(&self) -> bool {
        self.size() == 0
    }

    /// 获取下一个可写槽位；缓冲已满时返回 None（不阻塞）
    pub fn push_slot(&self) -> Option<PushSlot<'_, T>> {
        if self.full() {
            return None;
        }
        let position = self.head.load(Ordering::Acquire);
        Some(PushSlot {
            ring: self,
            position,
            guard: self.slot(position).lock(),
        })
    }

    /// 便捷写法：整体替换下一个槽位的内容并提交
    pub fn push(&self, value: T) -> bool {
        match self.push_slot() {
            Some(mut slot) => {
                *slot = value;
                slot.commit();
                true
            }
            None => false,
        }
    }

    /// 查看下一个要弹出的元素；缓冲为空时返回 None
    pub fn peek_next_to_pop(&self) -> Option<PopSlot<'_, T>> {
        if self.empty() {
            return None;
        }
        let position = self.tail.load(Ordering::Acquire);
        Some(PopSlot {
            ring: self,
            position,
            guard: self.slot(position).lock(),
        })
    }

    /// 弹出最早的元素；缓冲为空时返回 false
    pub fn pop(&self) -> bool {
        if self.empty() {
            return false;
        }
        let tail = self.tail.load(Ordering::Acquire);
        self.advance_tail(tail)
    }

    /// 在槽位上执行 `f` 后弹出（例如把数据 swap 出来）
    pub fn pop_with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut slot = self.peek_next_to_pop()?;
        let result = f(&mut slot);
        if slot.release() {
            Some(result)
        } else {
            None
        }
    }

    // clear 可能同时移动了 tail，此时本次 pop 作废
    fn advance_tail(&self, from: usize) -> bool {
        self.tail
            .compare_exchange(from, from.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 丢弃全部已缓冲内容（不释放槽位内存）
    ///
    /// 把 tail 移到 head；两侧线程都可以调用。并发的 `pop` 会因为 CAS 失败而放弃。
    pub fn clear(&self) {
        let head = self.head.load(Ordering::Acquire);
        self.tail.store(head, Ordering::Release);
    }
}

/// 正在写入的槽位；`commit` 之后才对消费者可见，直接 drop 则丢弃本次写入
pub struct PushSlot<'a, T> {
    ring: &'a RingBuffer<T>,
    position: usize,
    guard: MutexGuard<'a, T>,
}

impl<'a, T> PushSlot<'a, T> {
    /// 推进 head（commit_push）
    pub fn commit(self) {
        let PushSlot {
            ring,
            position,
            guard,
        } = self;
        drop(guard);
        ring.head.store(position.wrapping_add(1), Ordering::Release);
    }
}

impl<T> Deref for PushSlot<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for PushSlot<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// 正在读取的槽位
pub struct PopSlot<'a, T> {
    ring: &'a RingBuffer<T>,
    position: usize,
    guard: MutexGuard<'a, T>,
}

impl<'a, T> PopSlot<'a, T> {
    /// 读取完毕并弹出；如果期间缓冲被 clear，返回 false
    pub fn release(self) -> bool {
        let PopSlot {
            ring,
            position,
            guard,
        } = self;
        drop(guard);
        ring.advance_tail(position)
    }
}

impl<T> Deref for PopSlot<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for PopSlot<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order_and_size() {
        let ring = RingBuffer::new(4, || 0u32);
        assert!(ring.empty());
        assert_eq!(ring.capacity(), 4);

        for i in 1..=3 {
            assert!(ring.push(i));
        }
        assert_eq!(ring.size(), 3);
        assert_eq!(*ring.peek_next_to_pop().unwrap(), 1);
        assert!(ring.pop());
        assert_eq!(ring.size(), 2);

        // 跨越回绕点继续写入
        assert!(ring.push(4));
        assert!(ring.push(5));
        assert!(ring.full());

        let mut popped = Vec::new();
        while let Some(v) = ring.pop_with(|v| *v) {
            popped.push(v);
        }
        assert_eq!(popped, vec![2, 3, 4, 5]);
        assert!(ring.empty());
    }

    #[test]
    fn test_interleaved_push_pop_keeps_fifo() {
        let ring = RingBuffer::new(3, || 0usize);
        let mut expected = 0;
        let mut next = 0;
        for round in 0..50 {
            let pushes = round % 3 + 1;
            for _ in 0..pushes {
                if ring.push(next) {
                    next += 1;
                }
            }
            assert_eq!(ring.size(), next - expected);
            let pops = (round + 1) % 3;
            for _ in 0..pops {
                if let Some(v) = ring.pop_with(|v| *v) {
                    assert_eq!(v, expected);
                    expected += 1;
                }
            }
        }
    }

    #[test]
    fn test_push_full_fails_without_corruption() {
        let ring = RingBuffer::new(2, || 0);
        assert!(ring.push(10));
        assert!(ring.push(20));
        assert!(ring.full());
        assert!(ring.push_slot().is_none());
        assert!(!ring.push(30));
        assert_eq!(ring.size(), 2);
        assert_eq!(ring.pop_with(|v| *v), Some(10));
        assert_eq!(ring.pop_with(|v| *v), Some(20));
    }

    #[test]
    fn test_pop_empty_fails_without_corruption() {
        let ring = RingBuffer::new(2, || 0);
        assert!(!ring.pop());
        assert!(ring.peek_next_to_pop().is_none());
        assert_eq!(ring.size(), 0);
        assert!(ring.push(7));
        assert_eq!(ring.pop_with(|v| *v), Some(7));
    }

    #[test]
    fn test_uncommitted_slot_is_discarded() {
        let ring = RingBuffer::new(2, || 0);
        {
            let mut slot = ring.push_slot().unwrap();
            *slot = 99;
        }
        assert!(ring.empty());
    }

    #[test]
    fn test_clear_empties_buffer() {
        let ring = RingBuffer::new(4, || 0);
        for i in 0..3 {
            ring.push(i);
        }
        ring.clear();
        assert!(ring.empty());
        assert!(!ring.pop());

        // clear 之后可以继续正常使用
        ring.push(42);
        assert_eq!(ring.pop_with(|v| *v), Some(42));
        ring.clear();
        assert!(ring.empty());
    }

    #[test]
    fn test_release_after_clear_reports_failure() {
        let ring = RingBuffer::new(4, || 0);
        ring.push(1);
        ring.push(2);
        let slot = ring.peek_next_to_pop().unwrap();
        assert_eq!(*slot, 1);
        ring.clear();
        assert!(!slot.release());
        assert!(ring.empty());
    }

    #[test]
    fn test_producer_waits_for_slot_held_across_clear() {
        let ring = Arc::new(RingBuffer::new(2, || 0));
        ring.push(1);
        let held = ring.peek_next_to_pop().unwrap();
        assert_eq!(*held, 1);

        // 生产者清空两次后绕回到消费者仍持有的 0 号槽位
        ring.clear();
        ring.push(2);
        ring.push(3);
        ring.clear();

        let written = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let producer = {
            let ring = Arc::clone(&ring);
            let written = Arc::clone(&written);
            thread::spawn(move || {
                let mut slot = ring.push_slot().unwrap();
                *slot = 4;
                slot.commit();
                written.store(true, Ordering::Release);
            })
        };
        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!written.load(Ordering::Acquire));

        assert!(!held.release());
        producer.join().unwrap();
        assert!(written.load(Ordering::Acquire));
        assert_eq!(ring.pop_with(|v| *v), Some(4));
    }

    #[test]
    fn test_spsc_threads_deliver_in_order() {
        const COUNT: usize = 10_000;
        let ring = Arc::new(RingBuffer::new(8, || 0usize));

        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut i = 0;
                while i < COUNT {
                    if let Some(mut slot) = ring.push_slot() {
                        *slot = i;
                        slot.commit();
                        i += 1;
                    } else {
                        thread::yield_now();
                    }
                }
            })
        };

        let mut received = Vec::with_capacity(COUNT);
        while received.len() < COUNT {
            match ring.pop_with(|v| *v) {
                Some(v) => received.push(v),
                None => thread::yield_now(),
            }
        }
        producer.join().unwrap();

        assert!(received.iter().enumerate().all(|(i, v)| i == *v));
        assert!(ring.empty());
    }
}
