//! 流水线阶段的公共部分：控制通道、线程句柄、停止协议和在途帧计数

use crate::core::queue::QueueLock;
use crate::core::{BoundedQueue, CodecTarget, Message, PlayerError, Result, SeekMode};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use log::{debug, error, info};
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// 停止时向空输入队列注入终止标记的超时
pub const TERMINATE_PUSH_TIMEOUT: Duration = Duration::from_millis(5);

/// 停止阶段时，每次排空输出队列的等待时间
const DRAIN_POLL: Duration = Duration::from_millis(5);

pub(crate) fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

pub type FrameQueue<T> = BoundedQueue<Message<T>>;

/// 阶段控制命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageCommand {
    /// 只有 Demux 阶段处理
    Seek {
        target: u64,
        mode: SeekMode,
        tracks: CodecTarget,
    },
    Stop,
}

/// 阶段线程内查看控制通道
pub struct Control {
    rx: Receiver<StageCommand>,
}

impl Control {
    /// 非阻塞地取一条命令；发送端已经断开时视为 Stop
    pub fn poll(&self) -> Option<StageCommand> {
        match self.rx.try_recv() {
            Ok(cmd) => Some(cmd),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(StageCommand::Stop),
        }
    }

    /// 阻塞等待下一条命令
    pub fn wait(&self) -> StageCommand {
        self.rx.recv().unwrap_or(StageCommand::Stop)
    }

    /// 只关心停止的阶段用这个；其它命令被忽略
    pub fn stop_requested(&self) -> bool {
        while let Some(cmd) = self.poll() {
            if cmd == StageCommand::Stop {
                return true;
            }
        }
        false
    }
}

/// 一条轨道路径上还没有被消费掉的帧数（队列中 + 正在处理的）
///
/// 生产方在推入前调用 `produced`，帧被下游转换、丢弃或取走时调用 `consumed`。
#[derive(Debug, Clone, Default)]
pub struct FlowCounter(Arc<AtomicUsize>);

impl FlowCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn produced(&self, n: usize) {
        self.0.fetch_add(n, Ordering::SeqCst);
    }

    pub fn consumed(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)));
    }

    pub fn in_flight(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }
}

/// 排空一个已冻结的队列，返回丢掉的帧数
pub fn drain_locked<T>(lock: &QueueLock<'_, Message<T>>, flow: &FlowCounter) -> usize {
    let mut dropped = 0;
    for message in lock.drain() {
        if !message.is_terminate() {
            flow.consumed();
            dropped += 1;
        }
    }
    dropped
}

/// 阶段线程句柄
pub struct StageHandle {
    name: &'static str,
    control: Sender<StageCommand>,
    thread: Option<JoinHandle<()>>,
}

impl StageHandle {
    pub fn spawn<F>(name: &'static str, body: F) -> Result<Self>
    where
        F: FnOnce(Control) + Send + 'static,
    {
        let (tx, rx) = unbounded();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(Control { rx }))
            .map_err(|e| PlayerError::Other(format!("无法启动 {} 线程: {}", name, e)))?;
        debug!("{} ▶️ 阶段线程 {} 已启动", log_ctx(), name);
        Ok(Self {
            name,
            control: tx,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn send(&self, cmd: StageCommand) -> Result<()> {
        self.control
            .send(cmd)
            .map_err(|e| PlayerError::Other(format!("发送命令到 {} 失败: {}", self.name, e)))
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// 停止阶段线程
    ///
    /// - 发送 Stop
    /// - `wake`：输入队列为空时注入终止标记，唤醒阻塞在 pop 里的线程
    /// - 线程退出前反复调用 `drain`，避免它阻塞在满的输出队列上
    /// - join 线程，最后再 `drain` 一次
    pub fn stop(&mut self, wake: impl FnOnce(), mut drain: impl FnMut()) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        info!("{} 🛑 停止阶段 {}", log_ctx(), self.name);

        let _ = self.control.send(StageCommand::Stop);
        wake();

        while !thread.is_finished() {
            drain();
            thread::sleep(Duration::from_millis(1));
        }

        if thread.join().is_err() {
            error!("{} ❌ 阶段 {} 线程 panic", log_ctx(), self.name);
        }
        drain();
    }
}

impl Drop for StageHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.control.send(StageCommand::Stop);
        }
    }
}

/// `stop()` 的 wake 参数：输入为空时注入终止标记
pub fn wake_input<T>(input: &FrameQueue<T>) {
    if input.is_empty() {
        let _ = input.push_timeout(Message::Terminate, TERMINATE_PUSH_TIMEOUT);
    }
}

/// `stop()` 的 drain 参数：等一小会儿再把输出队列中的内容丢掉
pub fn drain_output<T>(output: &FrameQueue<T>, flow: &FlowCounter) {
    if let Some(Message::Frame(_)) = output.pop_timeout(DRAIN_POLL) {
        flow.consumed();
    }
    while let Some(message) = output.try_pop() {
        if !message.is_terminate() {
            flow.consumed();
        }
    }
}

/// 阶段结束时通知下游；下游可能已经停止，所以只等一小会儿
pub fn push_terminator<T>(output: &FrameQueue<T>) {
    if output
        .push_timeout(Message::Terminate, Duration::from_millis(100))
        .is_err()
    {
        debug!("{} 终止标记未能推入下游队列", log_ctx());
    }
}
