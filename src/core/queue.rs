//! 有界阻塞队列 - 流水线各阶段之间唯一的同步原语
//!
//! 内部是一个固定容量的环形缓冲区（`VecDeque` 预先分配好容量，之后不再增长），
//! 另外有两把独立的锁：生产者锁和消费者锁。`lock_all()` 同时拿住这两把锁，
//! 外部协调者（流水线管理器）可以借此冻结队列、查看或清空内容。
//!
//! 阻塞在 `push`/`pop` 中等待的线程不会持有生产者/消费者锁，所以冻结队列不会
//! 和它们形成死锁：冻结期间它们只是排在锁后面，解冻后继续执行。

use crate::core::error::{PlayerError, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 队列中传递的消息
///
/// `Terminate` 表示上游阶段已经结束，是该阶段向这个队列推送的最后一项。
#[derive(Debug)]
pub enum Message<T> {
    Frame(T),
    Terminate,
}

impl<T> Message<T> {
    pub fn into_frame(self) -> Option<T> {
        match self {
            Message::Frame(frame) => Some(frame),
            Message::Terminate => None,
        }
    }

    pub fn is_terminate(&self) -> bool {
        matches!(self, Message::Terminate)
    }
}

/// 固定容量的线程安全 FIFO 队列
pub struct BoundedQueue<T> {
    ring: Mutex<VecDeque<T>>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
    push_lock: Mutex<()>,
    pop_lock: Mutex<()>,
}

impl<T> BoundedQueue<T> {
    /// 创建队列，容量为 0 或内存分配失败时返回错误
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(PlayerError::ZeroCapacity);
        }

        let mut ring = VecDeque::new();
        ring.try_reserve_exact(capacity).map_err(|e| {
            PlayerError::Allocation(format!("队列预分配 {} 项失败: {}", capacity, e))
        })?;

        Ok(Self {
            ring: Mutex::new(ring),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            push_lock: Mutex::new(()),
            pop_lock: Mutex::new(()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前元素个数（仅供诊断，读到的值随时可能过期）
    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 阻塞推入，直到有空位
    pub fn push(&self, item: T) {
        loop {
            {
                let _producer = self.push_lock.lock();
                let mut ring = self.ring.lock();
                if ring.len() < self.capacity {
                    ring.push_back(item);
                    self.not_empty.notify_all();
                    return;
                }
            }

            // 队列已满：放开生产者锁再等待
            let mut ring = self.ring.lock();
            while ring.len() >= self.capacity {
                self.not_full.wait(&mut ring);
            }
        }
    }

    /// 限时推入，超时后把元素原样还给调用方
    pub fn push_timeout(&self, item: T, timeout: Duration) -> std::result::Result<(), T> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let Some(_producer) = self.push_lock.try_lock_until(deadline) else {
                    return Err(item);
                };
                let mut ring = self.ring.lock();
                if ring.len() < self.capacity {
                    ring.push_back(item);
                    self.not_empty.notify_all();
                    return Ok(());
                }
            }

            let mut ring = self.ring.lock();
            while ring.len() >= self.capacity {
                if self.not_full.wait_until(&mut ring, deadline).timed_out() {
                    return Err(item);
                }
            }
        }
    }

    /// 阻塞弹出，直到有元素
    pub fn pop(&self) -> T {
        loop {
            {
                let _consumer = self.pop_lock.lock();
                let mut ring = self.ring.lock();
                if let Some(item) = ring.pop_front() {
                    self.not_full.notify_all();
                    return item;
                }
            }

            let mut ring = self.ring.lock();
            while ring.is_empty() {
                self.not_empty.wait(&mut ring);
            }
        }
    }

    /// 限时弹出，超时返回 `None`
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let _consumer = self.pop_lock.try_lock_until(deadline)?;
                let mut ring = self.ring.lock();
                if let Some(item) = ring.pop_front() {
                    self.not_full.notify_all();
                    return Some(item);
                }
            }

            let mut ring = self.ring.lock();
            while ring.is_empty() {
                if self.not_empty.wait_until(&mut ring, deadline).timed_out() {
                    return None;
                }
            }
        }
    }

    /// 非阻塞弹出
    pub fn try_pop(&self) -> Option<T> {
        self.pop_timeout(Duration::ZERO)
    }

    /// 同时锁住生产端和消费端，返回的守卫 drop 时解锁
    pub fn lock_all(&self) -> QueueLock<'_, T> {
        let push_guard = self.push_lock.lock();
        let pop_guard = self.pop_lock.lock();
        QueueLock {
            queue: self,
            _push_guard: push_guard,
            _pop_guard: pop_guard,
        }
    }
}

/// `lock_all()` 返回的冻结守卫
pub struct QueueLock<'a, T> {
    queue: &'a BoundedQueue<T>,
    _push_guard: MutexGuard<'a, ()>,
    _pop_guard: MutexGuard<'a, ()>,
}

impl<T> QueueLock<'_, T> {
    pub fn len(&self) -> usize {
        self.queue.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 取出全部元素（按 FIFO 顺序），并唤醒等待空位的生产者
    pub fn drain(&self) -> Vec<T> {
        let mut ring = self.queue.ring.lock();
        let items: Vec<T> = ring.drain(..).collect();
        if !items.is_empty() {
            self.queue.not_full.notify_all();
        }
        items
    }
}
