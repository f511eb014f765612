use crate::core::types::{CodecTarget, Track};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// 播放时钟 - 把墙钟时间映射为媒体时间，并记录 Seek / 文件结束状态
///
/// 所有锚点字段放在同一把锁后面，Seek 发起方和帧调度器读写时不会读到撕裂的时间戳。
/// 带 `_at` 后缀的方法接受显式的 `Instant`，便于测试。
#[derive(Clone)]
pub struct PlaybackClock {
    inner: Arc<Mutex<ClockInner>>,
}

struct ClockInner {
    base_pts: u64,         // 基准媒体时间（毫秒）
    base_instant: Instant, // 基准时刻
    playback_rate: f64,    // 播放速率（1.0 = 正常）
    paused: bool,
    paused_at: u64, // 暂停时的位置
    seek_target: u64,
    seeking: CodecTarget, // 仍在等待 Seek 完成的轨道
    eof: CodecTarget,     // 已经播放到末尾的轨道
}

impl ClockInner {
    fn media_time_at(&self, at: Instant) -> u64 {
        if self.paused {
            self.paused_at
        } else {
            let elapsed_us = at.saturating_duration_since(self.base_instant).as_micros() as f64;
            self.base_pts + (elapsed_us * self.playback_rate / 1000.0) as u64
        }
    }

    fn anchor(&mut self, pts: u64, at: Instant) {
        self.base_pts = pts;
        self.base_instant = at;
        self.paused_at = pts;
    }
}

impl PlaybackClock {
    /// 新时钟处于暂停状态，位置为 0
    pub fn new(playback_rate: f64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClockInner {
                base_pts: 0,
                base_instant: Instant::now(),
                playback_rate,
                paused: true,
                paused_at: 0,
                seek_target: 0,
                seeking: CodecTarget::NONE,
                eof: CodecTarget::NONE,
            })),
        }
    }

    /// 获取当前播放时间（毫秒），Seek 期间返回 Seek 目标
    pub fn now(&self) -> u64 {
        self.now_at(Instant::now())
    }

    pub fn now_at(&self, at: Instant) -> u64 {
        let inner = self.inner.lock();
        if inner.seeking.is_empty() {
            inner.media_time_at(at)
        } else {
            inner.seek_target
        }
    }

    /// 设置播放位置
    pub fn set_time(&self, pts: u64) {
        self.set_time_at(pts, Instant::now());
    }

    pub fn set_time_at(&self, pts: u64, at: Instant) {
        self.inner.lock().anchor(pts, at);
    }

    /// 开始播放，已在播放时返回 false
    pub fn play(&self) -> bool {
        self.play_at(Instant::now())
    }

    pub fn play_at(&self, at: Instant) -> bool {
        let mut inner = self.inner.lock();
        if !inner.paused {
            return false;
        }
        inner.base_pts = inner.paused_at;
        inner.base_instant = at;
        inner.paused = false;
        true
    }

    /// 暂停播放，已暂停时返回 false
    pub fn pause(&self) -> bool {
        self.pause_at(Instant::now())
    }

    pub fn pause_at(&self, at: Instant) -> bool {
        let mut inner = self.inner.lock();
        if inner.paused {
            return false;
        }
        inner.paused_at = inner.media_time_at(at);
        inner.paused = true;
        true
    }

    /// 设置播放速率，从调用时刻开始生效
    pub fn set_rate(&self, rate: f64) {
        self.set_rate_at(rate, Instant::now());
    }

    pub fn set_rate_at(&self, rate: f64, at: Instant) {
        let mut inner = self.inner.lock();
        if !inner.paused {
            let current = inner.media_time_at(at);
            inner.base_pts = current;
            inner.base_instant = at;
        }
        inner.playback_rate = rate;
    }

    pub fn rate(&self) -> f64 {
        self.inner.lock().playback_rate
    }

    /// 是否暂停
    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// 标记一次 Seek 开始，`tracks` 中的轨道都要等到哨兵帧才算完成
    pub fn begin_seek(&self, target: u64, tracks: CodecTarget) {
        let mut inner = self.inner.lock();
        inner.seek_target = target;
        inner.seeking = tracks;
        inner.eof = CodecTarget::NONE;
    }

    /// 某个轨道收到了哨兵帧；全部轨道完成时把时钟重新锚定到 Seek 目标并返回 true
    pub fn finish_seek(&self, track: Track) -> bool {
        self.finish_seek_at(track, Instant::now())
    }

    pub fn finish_seek_at(&self, track: Track, at: Instant) -> bool {
        let mut inner = self.inner.lock();
        if !inner.seeking.contains(track.codec()) {
            return inner.seeking.is_empty();
        }
        inner.seeking.remove(track.codec());
        if inner.seeking.is_empty() {
            let target = inner.seek_target;
            inner.anchor(target, at);
            true
        } else {
            false
        }
    }

    pub fn is_seeking(&self) -> bool {
        !self.inner.lock().seeking.is_empty()
    }

    pub fn is_track_seeking(&self, track: Track) -> bool {
        self.inner.lock().seeking.contains(track.codec())
    }

    pub fn seek_target(&self) -> u64 {
        self.inner.lock().seek_target
    }

    pub fn mark_eof(&self, track: Track) {
        self.inner.lock().eof.insert(track.codec());
    }

    pub fn clear_eof(&self, track: Track) {
        self.inner.lock().eof.remove(track.codec());
    }

    pub fn is_eof(&self, track: Track) -> bool {
        self.inner.lock().eof.contains(track.codec())
    }

    /// `tracks` 中的轨道是否都已到末尾
    pub fn all_eof(&self, tracks: CodecTarget) -> bool {
        let inner = self.inner.lock();
        !tracks.is_empty() && inner.eof.contains(tracks)
    }

    /// 循环播放：清除结束标志并从 0 重新开始计时
    pub fn restart_loop_at(&self, at: Instant) {
        let mut inner = self.inner.lock();
        inner.eof = CodecTarget::NONE;
        inner.anchor(0, at);
    }
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new(1.0)
    }
}
