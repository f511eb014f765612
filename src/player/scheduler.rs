//! 帧调度：决定某条轨道上哪一帧是"当前帧"
//!
//! 每条轨道有一个当前帧槽位和一个预取的 `next`。调用方每次查询时：
//! 1. `next` 为空时非阻塞地从输出队列取一帧，每次调用最多取一次
//! 2. Seek 中：丢掉非哨兵帧，哨兵帧到达时结束该轨道的 Seek
//! 3. TIMED 模式下只要 `next` 到期就前移；FAST 模式每次调用最多前移一次
//! 4. 时间码回退说明文件循环回到了开头，该轨道标记为结束并停在这里，等待循环重新开始

use crate::core::{Message, PlaybackClock, PlaybackMode, TimedFrame, Track};
use crate::player::stage::{log_ctx, FlowCounter, FrameQueue};
use log::{debug, info};
use std::sync::Arc;

/// 当前帧槽位
#[derive(Debug)]
pub enum Slot<F> {
    /// 归流水线所有，下一帧成为当前帧时销毁
    Owned(F),
    /// 已被调用方取走，只保留时间码
    Released(u64),
}

impl<F: TimedFrame> Slot<F> {
    pub fn timecode(&self) -> u64 {
        match self {
            Slot::Owned(frame) => frame.timecode(),
            Slot::Released(tc) => *tc,
        }
    }
}

/// 单条轨道的调度状态
pub struct TrackScheduler<F> {
    track: Track,
    queue: Arc<FrameQueue<F>>,
    flow: FlowCounter,
    current: Option<Slot<F>>,
    next: Option<F>,
    /// 上次取帧之后当前帧是否换过
    fresh: bool,
    last_timecode: Option<u64>,
    /// 时间码回退，等待循环重新开始
    wrapped: bool,
    /// 上游已结束
    terminated: bool,
    promoted: usize,
}

impl<F: TimedFrame> TrackScheduler<F> {
    pub fn new(track: Track, queue: Arc<FrameQueue<F>>, flow: FlowCounter) -> Self {
        Self {
            track,
            queue,
            flow,
            current: None,
            next: None,
            fresh: false,
            last_timecode: None,
            wrapped: false,
            terminated: false,
            promoted: 0,
        }
    }

    pub fn track(&self) -> Track {
        self.track
    }

    /// 有没有新的当前帧还没被取过
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub fn is_wrapped(&self) -> bool {
        self.wrapped
    }

    /// 推进调度
    ///
    /// `demux_at_eof`：Demux 已经读到文件末尾并停在那里（WAIT 模式）。
    pub fn update(&mut self, clock: &PlaybackClock, mode: PlaybackMode, demux_at_eof: bool) {
        if !self.wrapped {
            self.advance(clock, mode);
        }

        // WAIT 模式：上游已经没有任何帧了
        if self.next.is_none() && demux_at_eof && self.flow.in_flight() == 0 {
            if clock.is_track_seeking(self.track) {
                info!("{} 📄 {}轨道 Seek 目标之后没有数据，按文件末尾处理", log_ctx(), self.track);
                clock.finish_seek(self.track);
            }
            if !clock.is_eof(self.track) {
                info!("{} 📄 {}轨道播放结束", log_ctx(), self.track);
                clock.mark_eof(self.track);
            }
        }
    }

    fn advance(&mut self, clock: &PlaybackClock, mode: PlaybackMode) {
        let mut popped = false;
        loop {
            if !self.fill_next(clock, &mut popped) {
                return;
            }
            let Some(next) = self.next.as_ref() else {
                return;
            };

            if clock.is_track_seeking(self.track) {
                // fill_next 只会留下哨兵帧
                debug!("{} ✓ {}轨道 Seek 完成 @{}ms", log_ctx(), self.track, next.timecode());
                clock.finish_seek(self.track);
                self.promote(clock);
                if mode == PlaybackMode::Fast {
                    return;
                }
                continue;
            }

            if !next.is_sentinel() && self.last_timecode.is_some_and(|last| next.timecode() < last) {
                info!(
                    "{} 🔁 {}轨道时间码回退 ({}ms)，等待循环",
                    log_ctx(),
                    self.track,
                    next.timecode()
                );
                self.wrapped = true;
                clock.mark_eof(self.track);
                return;
            }

            match mode {
                PlaybackMode::Timed => {
                    if next.timecode() > clock.now() {
                        return;
                    }
                    self.promote(clock);
                }
                PlaybackMode::Fast => {
                    self.promote(clock);
                    return;
                }
            }
        }
    }

    /// `next` 为空且本次调用还没取过时，非阻塞地从队列取一帧；返回 `next` 是否可用
    fn fill_next(&mut self, clock: &PlaybackClock, popped: &mut bool) -> bool {
        if self.next.is_some() {
            return true;
        }
        if self.terminated || *popped {
            return false;
        }
        *popped = true;

        match self.queue.try_pop() {
            Some(Message::Frame(frame)) => {
                self.flow.consumed();
                // Seek 中只留下哨兵帧
                if !clock.is_track_seeking(self.track) || frame.is_sentinel() {
                    self.next = Some(frame);
                }
            }
            Some(Message::Terminate) => {
                info!("{} {}输出队列已结束", log_ctx(), self.track);
                self.terminated = true;
            }
            None => {}
        }
        self.next.is_some()
    }

    fn promote(&mut self, clock: &PlaybackClock) {
        let Some(frame) = self.next.take() else {
            return;
        };
        self.last_timecode = Some(frame.timecode());
        // 旧的当前帧如果还归流水线所有，在这里销毁
        self.current = Some(Slot::Owned(frame));
        self.fresh = true;
        self.promoted += 1;
        clock.clear_eof(self.track);
    }

    /// 发起 Seek 之后：预取的旧帧作废，当前帧保留到哨兵帧到达
    pub fn reset_for_seek(&mut self) {
        self.next = None;
        self.last_timecode = None;
        self.wrapped = false;
    }

    /// 循环播放重新开始
    pub fn restart_loop(&mut self) {
        self.last_timecode = None;
        self.wrapped = false;
    }

    /// 当前帧（已被取走时为 None），并清除"新帧"标记
    pub fn current(&mut self) -> Option<&F> {
        self.fresh = false;
        match self.current.as_ref() {
            Some(Slot::Owned(frame)) => Some(frame),
            _ => None,
        }
    }

    /// 取走当前帧的所有权；之后调度器不会再碰这一帧
    pub fn take_current(&mut self) -> Option<F> {
        self.fresh = false;
        match self.current.take() {
            Some(Slot::Owned(frame)) => {
                self.current = Some(Slot::Released(frame.timecode()));
                Some(frame)
            }
            other => {
                self.current = other;
                None
            }
        }
    }

    pub fn current_timecode(&self) -> Option<u64> {
        self.current.as_ref().map(Slot::timecode)
    }

    pub fn promoted(&self) -> usize {
        self.promoted
    }
}

impl<F: TimedFrame + Clone> TrackScheduler<F> {
    /// 深拷贝当前帧，返回的副本归调用方所有
    pub fn clone_current(&mut self) -> Option<F> {
        self.fresh = false;
        match self.current.as_ref() {
            Some(Slot::Owned(frame)) => Some(frame.clone()),
            _ => None,
        }
    }
}
