//! 对外的播放上下文
//!
//! 调用方在自己的线程里轮询 `*_frame_ready()`，然后用 `*_frame()` / `take_*` /
//! `clone_*` 取当前帧。这些调用不会等待解码，最多做有限次非阻塞的出队。

use crate::core::{
    AudioFrame, BufferStatus, CodecTarget, ErrorState, FileEndBehavior, PlaybackClock,
    PlaybackMode, PlayerError, ProcessingHooks, Result, SeekMode, Settings, Track, VideoFrame,
};
use crate::player::demuxer::WebmDemuxer;
use crate::player::demuxer_source::DemuxerSource;
use crate::player::manager::{Codecs, PipelineManager};
use crate::player::scheduler::TrackScheduler;
use crate::player::stage::log_ctx;
use log::{info, warn};
use std::io::{Read, Seek};
use std::sync::Arc;
use std::time::Instant;

/// 播放上下文
pub struct Player {
    settings: Settings,
    clock: PlaybackClock,
    errors: Arc<ErrorState>,
    video: Option<TrackScheduler<VideoFrame>>,
    audio: Option<TrackScheduler<AudioFrame>>,
    tracks: CodecTarget,
    loops: usize,
    pipeline: PipelineManager,
}

impl Player {
    /// 打开 `settings.file_path` 指定的 WebM 文件并启动流水线
    pub fn new(settings: Settings, codecs: Codecs, hooks: ProcessingHooks) -> Result<Self> {
        let path = settings
            .file_path
            .clone()
            .ok_or_else(|| PlayerError::OpenError("没有指定要播放的文件".into()))?;
        let demuxer = WebmDemuxer::open_path(&path)?;
        Self::with_source(Box::new(demuxer), settings, codecs, hooks)
    }

    /// 从内存或其它可 Seek 的数据源播放
    pub fn with_reader<R>(
        reader: R,
        settings: Settings,
        codecs: Codecs,
        hooks: ProcessingHooks,
    ) -> Result<Self>
    where
        R: Read + Seek + Send + 'static,
    {
        let demuxer = WebmDemuxer::new(reader, "<reader>")?;
        Self::with_source(Box::new(demuxer), settings, codecs, hooks)
    }

    /// 使用自定义的解封装数据源
    pub fn with_source(
        source: Box<dyn DemuxerSource>,
        settings: Settings,
        codecs: Codecs,
        hooks: ProcessingHooks,
    ) -> Result<Self> {
        settings.validate()?;
        let clock = PlaybackClock::new(settings.playback_speed);
        let errors = Arc::new(ErrorState::new());
        let pipeline = PipelineManager::start(
            source,
            &settings,
            codecs,
            hooks,
            clock.clone(),
            errors.clone(),
        )?;

        let video = pipeline.video_output().map(|queue| {
            let flow = pipeline.flow(Track::Video).unwrap_or_default();
            TrackScheduler::new(Track::Video, queue, flow)
        });
        let audio = pipeline.audio_output().map(|queue| {
            let flow = pipeline.flow(Track::Audio).unwrap_or_default();
            TrackScheduler::new(Track::Audio, queue, flow)
        });
        let tracks = pipeline.tracks();

        info!(
            "{} ✅ 播放上下文已创建: {:?} 模式, 文件结束时 {:?}",
            log_ctx(),
            settings.playback_mode,
            settings.on_file_end
        );
        Ok(Self {
            settings,
            clock,
            errors,
            video,
            audio,
            tracks,
            loops: 0,
            pipeline,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// 最近一次错误的描述
    pub fn last_error(&self) -> Option<String> {
        self.errors.last_message()
    }

    /// 记录错误信息后返回
    fn fail<T>(&self, error: PlayerError) -> Result<T> {
        self.errors.record(error.to_string());
        Err(error)
    }

    fn require(&self, track: Track) -> Result<()> {
        self.errors.check()?;
        if self.tracks.contains(track.codec()) {
            Ok(())
        } else {
            self.fail(PlayerError::TrackNotRequested(track.name()))
        }
    }

    /// 开始（继续）播放
    pub fn start_playback(&mut self) -> Result<()> {
        self.errors.check()?;
        if self.clock.is_seeking() {
            return self.fail(PlayerError::SeekInProgress);
        }
        if !self.clock.play() {
            return self.fail(PlayerError::AlreadyPlaying);
        }
        info!("{} ▶️ 开始播放 @{}ms", log_ctx(), self.clock.now());
        Ok(())
    }

    /// 暂停播放
    pub fn stop_playback(&mut self) -> Result<()> {
        self.errors.check()?;
        if self.clock.is_seeking() {
            return self.fail(PlayerError::SeekInProgress);
        }
        if !self.clock.pause() {
            return self.fail(PlayerError::AlreadyPaused);
        }
        info!("{} ⏸ 暂停播放 @{}ms", log_ctx(), self.clock.now());
        Ok(())
    }

    pub fn is_paused(&self) -> Result<bool> {
        self.errors.check()?;
        Ok(self.clock.is_paused())
    }

    pub fn playback_speed(&self) -> Result<f64> {
        self.errors.check()?;
        if self.settings.playback_mode == PlaybackMode::Fast {
            return self.fail(PlayerError::SpeedInFastMode);
        }
        Ok(self.clock.rate())
    }

    /// 设置播放速度，从调用时刻开始生效
    pub fn set_playback_speed(&mut self, speed: f64) -> Result<()> {
        self.errors.check()?;
        if self.settings.playback_mode == PlaybackMode::Fast {
            return self.fail(PlayerError::SpeedInFastMode);
        }
        if !speed.is_finite() || speed <= 0.0 {
            return self.fail(PlayerError::InvalidSpeed(speed));
        }
        self.clock.set_rate(speed);
        info!("{} ⏩ 播放速度: {}x", log_ctx(), speed);
        Ok(())
    }

    /// 当前播放位置（毫秒），不超过已知的时长
    pub fn playback_time(&self) -> Result<u64> {
        self.errors.check()?;
        let now = self.clock.now();
        Ok(match self.pipeline.duration() {
            Some(duration) => now.min(duration),
            None => now,
        })
    }

    /// 文件时长（毫秒）
    pub fn duration(&self) -> Result<u64> {
        self.errors.check()?;
        match self.pipeline.duration() {
            Some(duration) => Ok(duration),
            None => self.fail(PlayerError::DurationUnknown),
        }
    }

    /// Seek 到 `timecode`（毫秒）
    pub fn seek(&mut self, timecode: u64, mode: SeekMode) -> Result<()> {
        self.errors.check()?;
        if self.clock.is_seeking() {
            return self.fail(PlayerError::SeekInProgress);
        }
        if let Err(e) = self.pipeline.seek(timecode, mode) {
            return self.fail(e);
        }
        if let Some(video) = self.video.as_mut() {
            video.reset_for_seek();
        }
        if let Some(audio) = self.audio.as_mut() {
            audio.reset_for_seek();
        }
        Ok(())
    }

    /// WAIT 模式下所有请求的轨道都播放完毕
    pub fn is_at_end(&self) -> Result<bool> {
        self.errors.check()?;
        Ok(self.settings.on_file_end == FileEndBehavior::Wait && self.clock.all_eof(self.tracks))
    }

    /// 循环播放的次数
    pub fn loop_count(&self) -> usize {
        self.loops
    }

    /// 各队列的长度（仅供诊断）
    pub fn queue_status(&self) -> Result<BufferStatus> {
        self.errors.check()?;
        Ok(self.pipeline.queue_status())
    }

    /// 推进一条轨道的调度；LOOP 模式下所有轨道都回绕后重新从 0 开始计时
    fn pump(&mut self, track: Track) {
        let demux_at_eof = self.pipeline.demux_at_eof();
        let mode = self.settings.playback_mode;
        match track {
            Track::Video => {
                if let Some(video) = self.video.as_mut() {
                    video.update(&self.clock, mode, demux_at_eof);
                }
            }
            Track::Audio => {
                if let Some(audio) = self.audio.as_mut() {
                    audio.update(&self.clock, mode, demux_at_eof);
                }
            }
        }

        if self.settings.on_file_end == FileEndBehavior::Loop
            && !self.clock.is_seeking()
            && self.clock.all_eof(self.tracks)
        {
            self.loops += 1;
            info!("{} 🔁 所有轨道都到达末尾，第 {} 次循环", log_ctx(), self.loops);
            self.clock.restart_loop_at(Instant::now());
            if let Some(video) = self.video.as_mut() {
                video.restart_loop();
            }
            if let Some(audio) = self.audio.as_mut() {
                audio.restart_loop();
            }
        }
    }

    // ============= 视频帧 =============

    /// 是否有新的视频帧成为当前帧
    pub fn video_frame_ready(&mut self) -> Result<bool> {
        self.require(Track::Video)?;
        self.pump(Track::Video);
        Ok(self.video.as_ref().is_some_and(TrackScheduler::is_fresh))
    }

    /// 当前视频帧，仍归播放上下文所有；已被取走时返回 None
    pub fn video_frame(&mut self) -> Result<Option<&VideoFrame>> {
        self.require(Track::Video)?;
        Ok(self.video.as_mut().and_then(TrackScheduler::current))
    }

    /// 取走当前视频帧的所有权
    pub fn take_video_frame(&mut self) -> Result<Option<VideoFrame>> {
        self.require(Track::Video)?;
        Ok(self.video.as_mut().and_then(TrackScheduler::take_current))
    }

    /// 当前视频帧的深拷贝
    pub fn clone_video_frame(&mut self) -> Result<Option<VideoFrame>> {
        self.require(Track::Video)?;
        Ok(self.video.as_mut().and_then(TrackScheduler::clone_current))
    }

    // ============= 音频帧 =============

    pub fn audio_frame_ready(&mut self) -> Result<bool> {
        self.require(Track::Audio)?;
        self.pump(Track::Audio);
        Ok(self.audio.as_ref().is_some_and(TrackScheduler::is_fresh))
    }

    pub fn audio_frame(&mut self) -> Result<Option<&AudioFrame>> {
        self.require(Track::Audio)?;
        Ok(self.audio.as_mut().and_then(TrackScheduler::current))
    }

    pub fn take_audio_frame(&mut self) -> Result<Option<AudioFrame>> {
        self.require(Track::Audio)?;
        Ok(self.audio.as_mut().and_then(TrackScheduler::take_current))
    }

    pub fn clone_audio_frame(&mut self) -> Result<Option<AudioFrame>> {
        self.require(Track::Audio)?;
        Ok(self.audio.as_mut().and_then(TrackScheduler::clone_current))
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        if self.errors.is_critical() {
            warn!("{} ⚠️ 带着严重错误销毁播放上下文: {:?}", log_ctx(), self.errors.last_message());
        }
        self.pipeline.stop();
        info!("{} 🗑️ 播放上下文已销毁", log_ctx());
    }
}
