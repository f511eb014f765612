use crate::core::queue::QueueLock;
use crate::core::{
    AudioFrame, AudioHook, BoundedQueue, BufferStatus, CodecTarget, CompressedFrame, ErrorState, Message,
    Picture, PlaybackClock, PlayerError, ProcessingHooks, Result, SeekMode, Settings, Track,
    VideoFrame, VideoHook,
};
use crate::player::convert::{ColorConverter, ConvertStage, YuvConverter};
use crate::player::custom::CustomStage;
use crate::player::decoder::{AudioDecodeStage, AudioDecoder, VideoDecodeStage, VideoDecoder};
use crate::player::demuxer_source::DemuxerSource;
use crate::player::demuxer_thread::{DemuxConfig, DemuxerThread, TrackSink};
use crate::player::stage::{
    drain_locked, drain_output, log_ctx, wake_input, Control, FlowCounter, FrameQueue,
    StageHandle,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;

/// 外部提供的解码器和颜色转换器
#[derive(Default)]
pub struct Codecs {
    pub video: Option<Box<dyn VideoDecoder>>,
    pub audio: Option<Box<dyn AudioDecoder>>,
    /// 不提供时使用 `YuvConverter`
    pub converter: Option<Box<dyn ColorConverter>>,
}

impl Codecs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_video(mut self, decoder: impl VideoDecoder + 'static) -> Self {
        self.video = Some(Box::new(decoder));
        self
    }

    pub fn with_audio(mut self, decoder: impl AudioDecoder + 'static) -> Self {
        self.audio = Some(Box::new(decoder));
        self
    }

    pub fn with_converter(mut self, converter: impl ColorConverter + 'static) -> Self {
        self.converter = Some(Box::new(converter));
        self
    }
}

fn new_queue<T>(capacity: usize) -> Result<Arc<FrameQueue<T>>> {
    Ok(Arc::new(BoundedQueue::new(capacity)?))
}

/// 视频路径上的队列：压缩帧 -> YUV 图像 -> 转换后的帧 -> [自定义处理]
struct VideoQueues {
    packets: Arc<FrameQueue<CompressedFrame>>,
    pictures: Arc<FrameQueue<Picture>>,
    frames: Arc<FrameQueue<VideoFrame>>,
    custom: Option<Arc<FrameQueue<VideoFrame>>>,
    flow: FlowCounter,
}

/// 冻结的视频路径；字段按解锁顺序排列（与加锁顺序相反）
struct VideoFreeze<'a> {
    custom: Option<QueueLock<'a, Message<VideoFrame>>>,
    frames: QueueLock<'a, Message<VideoFrame>>,
    pictures: QueueLock<'a, Message<Picture>>,
    packets: QueueLock<'a, Message<CompressedFrame>>,
}

impl VideoQueues {
    fn new(capacity: usize, with_custom: bool) -> Result<Self> {
        Ok(Self {
            packets: new_queue(capacity)?,
            pictures: new_queue(capacity)?,
            frames: new_queue(capacity)?,
            custom: if with_custom {
                Some(new_queue(capacity)?)
            } else {
                None
            },
            flow: FlowCounter::new(),
        })
    }

    fn output(&self) -> Arc<FrameQueue<VideoFrame>> {
        self.custom.clone().unwrap_or_else(|| self.frames.clone())
    }

    fn freeze(&self) -> VideoFreeze<'_> {
        let packets = self.packets.lock_all();
        let pictures = self.pictures.lock_all();
        let frames = self.frames.lock_all();
        let custom = self.custom.as_ref().map(|q| q.lock_all());
        VideoFreeze {
            custom,
            frames,
            pictures,
            packets,
        }
    }
}

impl VideoFreeze<'_> {
    fn drain(&self, flow: &FlowCounter) -> usize {
        drain_locked(&self.packets, flow)
            + drain_locked(&self.pictures, flow)
            + drain_locked(&self.frames, flow)
            + self.custom.as_ref().map_or(0, |lock| drain_locked(lock, flow))
    }
}

/// 音频路径上的队列：压缩帧 -> PCM 帧 -> [自定义处理]
struct AudioQueues {
    packets: Arc<FrameQueue<CompressedFrame>>,
    frames: Arc<FrameQueue<AudioFrame>>,
    custom: Option<Arc<FrameQueue<AudioFrame>>>,
    flow: FlowCounter,
}

struct AudioFreeze<'a> {
    custom: Option<QueueLock<'a, Message<AudioFrame>>>,
    frames: QueueLock<'a, Message<AudioFrame>>,
    packets: QueueLock<'a, Message<CompressedFrame>>,
}

impl AudioQueues {
    fn new(capacity: usize, with_custom: bool) -> Result<Self> {
        Ok(Self {
            packets: new_queue(capacity)?,
            frames: new_queue(capacity)?,
            custom: if with_custom {
                Some(new_queue(capacity)?)
            } else {
                None
            },
            flow: FlowCounter::new(),
        })
    }

    fn output(&self) -> Arc<FrameQueue<AudioFrame>> {
        self.custom.clone().unwrap_or_else(|| self.frames.clone())
    }

    fn freeze(&self) -> AudioFreeze<'_> {
        let packets = self.packets.lock_all();
        let frames = self.frames.lock_all();
        let custom = self.custom.as_ref().map(|q| q.lock_all());
        AudioFreeze {
            custom,
            frames,
            packets,
        }
    }
}

impl AudioFreeze<'_> {
    fn drain(&self, flow: &FlowCounter) -> usize {
        drain_locked(&self.packets, flow)
            + drain_locked(&self.frames, flow)
            + self.custom.as_ref().map_or(0, |lock| drain_locked(lock, flow))
    }
}

type StageAction = Box<dyn Fn() + Send>;

/// 一个阶段线程，以及停止它时用来唤醒输入、排空输出的动作
struct PipelineStage {
    handle: StageHandle,
    wake: StageAction,
    drain: StageAction,
}

impl PipelineStage {
    fn spawn<B>(name: &'static str, body: B, wake: StageAction, drain: StageAction) -> Result<Self>
    where
        B: FnOnce(Control) + Send + 'static,
    {
        Ok(Self {
            handle: StageHandle::spawn(name, body)?,
            wake,
            drain,
        })
    }

    fn stop(&mut self) {
        let wake = &self.wake;
        let drain = &self.drain;
        self.handle.stop(|| wake(), || drain());
    }
}

/// 流水线管理器 - 创建队列、启动 / 停止各阶段线程、协调 Seek
///
/// 线程按依赖顺序启动：Demux、视频解码、颜色转换、视频自定义处理、音频解码、
/// 音频自定义处理；停止时按同样的顺序逐个停止并排空输出队列。
pub struct PipelineManager {
    demux: DemuxerThread,
    stages: Vec<PipelineStage>,
    video: Option<VideoQueues>,
    audio: Option<AudioQueues>,
    clock: PlaybackClock,
    seek_lock: Mutex<()>,
    stopped: bool,
}

impl PipelineManager {
    /// 检查轨道和解码器，创建所有队列并启动全部阶段线程
    pub fn start(
        source: Box<dyn DemuxerSource>,
        settings: &Settings,
        mut codecs: Codecs,
        hooks: ProcessingHooks,
        clock: PlaybackClock,
        errors: Arc<ErrorState>,
    ) -> Result<Self> {
        settings.validate()?;
        info!("{} 🎮 创建播放流水线: {}", log_ctx(), source.description());

        if settings.wants_video() && !source.has_track(Track::Video) {
            return Err(PlayerError::NoVideoStream);
        }
        if settings.wants_audio() && !source.has_track(Track::Audio) {
            return Err(PlayerError::NoAudioStream);
        }

        let video_decoder = if settings.wants_video() {
            let decoder = codecs.video.take().ok_or_else(|| {
                PlayerError::InvalidSettings("请求了视频轨道，但没有提供 AV1 解码器".into())
            })?;
            Some(decoder)
        } else {
            None
        };
        let audio_decoder = if settings.wants_audio() {
            let mut decoder = codecs.audio.take().ok_or_else(|| {
                PlayerError::InvalidSettings("请求了音频轨道，但没有提供 Opus 解码器".into())
            })?;
            decoder.open(settings.frequency, settings.channels)?;
            Some(decoder)
        } else {
            None
        };

        let capacity = settings.queue_size;
        let video = if video_decoder.is_some() {
            Some(VideoQueues::new(capacity, hooks.video.is_some())?)
        } else {
            None
        };
        let audio = if audio_decoder.is_some() {
            Some(AudioQueues::new(capacity, hooks.audio.is_some())?)
        } else {
            None
        };

        let config = DemuxConfig {
            video: video.as_ref().map(|q| TrackSink {
                queue: q.packets.clone(),
                flow: q.flow.clone(),
            }),
            audio: audio.as_ref().map(|q| TrackSink {
                queue: q.packets.clone(),
                flow: q.flow.clone(),
            }),
            on_file_end: settings.on_file_end,
            seek_lead_ms: settings.seek_lead_ms,
        };
        let demux = DemuxerThread::start(source, config, clock.clone(), errors.clone())?;

        // 之后任何一步失败，manager 被 drop 时会停止已经启动的线程
        let mut manager = Self {
            demux,
            stages: Vec::new(),
            video,
            audio,
            clock,
            seek_lock: Mutex::new(()),
            stopped: false,
        };

        if let Some(decoder) = video_decoder {
            let converter: Box<dyn ColorConverter> = match codecs.converter.take() {
                Some(converter) => converter,
                None => Box::new(YuvConverter),
            };
            manager.spawn_video(decoder, converter, settings, hooks.video, &errors)?;
        }
        if let Some(decoder) = audio_decoder {
            manager.spawn_audio(decoder, settings, hooks.audio, &errors)?;
        }

        info!(
            "{} ✅ 流水线已启动: {} 个阶段线程 + Demuxer",
            log_ctx(),
            manager.stages.len()
        );
        Ok(manager)
    }

    fn spawn_video(
        &mut self,
        decoder: Box<dyn VideoDecoder>,
        converter: Box<dyn ColorConverter>,
        settings: &Settings,
        hook: Option<VideoHook>,
        errors: &Arc<ErrorState>,
    ) -> Result<()> {
        let Some(q) = self.video.as_ref() else {
            return Ok(());
        };
        let (packets, pictures, frames, custom, flow) = (
            q.packets.clone(),
            q.pictures.clone(),
            q.frames.clone(),
            q.custom.clone(),
            q.flow.clone(),
        );

        let stage = VideoDecodeStage {
            decoder,
            input: packets.clone(),
            output: pictures.clone(),
            flow: flow.clone(),
            errors: errors.clone(),
        };
        self.stages.push(PipelineStage::spawn(
            "video-decode",
            move |control| stage.run(control),
            wake(packets),
            drain(pictures.clone(), flow.clone()),
        )?);

        let stage = ConvertStage {
            converter,
            format: settings.desired_pixel_format,
            input: pictures.clone(),
            output: frames.clone(),
            flow: flow.clone(),
            errors: errors.clone(),
        };
        self.stages.push(PipelineStage::spawn(
            "video-convert",
            move |control| stage.run(control),
            wake(pictures),
            drain(frames.clone(), flow.clone()),
        )?);

        if let (Some(hook), Some(output)) = (hook, custom) {
            let stage = CustomStage {
                name: "视频",
                hook,
                input: frames.clone(),
                output: output.clone(),
                flow: flow.clone(),
                errors: errors.clone(),
            };
            self.stages.push(PipelineStage::spawn(
                "video-custom",
                move |control| stage.run(control),
                wake(frames),
                drain(output, flow),
            )?);
        }
        Ok(())
    }

    fn spawn_audio(
        &mut self,
        decoder: Box<dyn AudioDecoder>,
        settings: &Settings,
        hook: Option<AudioHook>,
        errors: &Arc<ErrorState>,
    ) -> Result<()> {
        let Some(q) = self.audio.as_ref() else {
            return Ok(());
        };
        let (packets, frames, custom, flow) = (
            q.packets.clone(),
            q.frames.clone(),
            q.custom.clone(),
            q.flow.clone(),
        );

        let stage = AudioDecodeStage {
            decoder,
            sample_rate: settings.frequency,
            channels: settings.channels,
            input: packets.clone(),
            output: frames.clone(),
            flow: flow.clone(),
            errors: errors.clone(),
        };
        self.stages.push(PipelineStage::spawn(
            "audio-decode",
            move |control| stage.run(control),
            wake(packets),
            drain(frames.clone(), flow.clone()),
        )?);

        if let (Some(hook), Some(output)) = (hook, custom) {
            let stage = CustomStage {
                name: "音频",
                hook,
                input: frames.clone(),
                output: output.clone(),
                flow: flow.clone(),
                errors: errors.clone(),
            };
            self.stages.push(PipelineStage::spawn(
                "audio-custom",
                move |control| stage.run(control),
                wake(frames),
                drain(output, flow),
            )?);
        }
        Ok(())
    }

    /// 请求了的轨道
    pub fn tracks(&self) -> CodecTarget {
        let mut tracks = CodecTarget::NONE;
        if self.video.is_some() {
            tracks.insert(CodecTarget::AV1);
        }
        if self.audio.is_some() {
            tracks.insert(CodecTarget::OPUS);
        }
        tracks
    }

    /// 视频路径最后一个队列（调度器从这里取帧）
    pub fn video_output(&self) -> Option<Arc<FrameQueue<VideoFrame>>> {
        self.video.as_ref().map(VideoQueues::output)
    }

    pub fn audio_output(&self) -> Option<Arc<FrameQueue<AudioFrame>>> {
        self.audio.as_ref().map(AudioQueues::output)
    }

    /// 某条轨道路径上的在途帧计数
    pub fn flow(&self, track: Track) -> Option<FlowCounter> {
        match track {
            Track::Video => self.video.as_ref().map(|q| q.flow.clone()),
            Track::Audio => self.audio.as_ref().map(|q| q.flow.clone()),
        }
    }

    /// 容器时长，未知时为 None
    pub fn duration(&self) -> Option<u64> {
        self.demux.shared().duration()
    }

    /// Demux 是否停在文件末尾（WAIT 模式）
    pub fn demux_at_eof(&self) -> bool {
        self.demux.shared().is_at_eof()
    }

    /// Seek
    ///
    /// 1. 按流水线顺序冻结所有队列
    /// 2. 标记时钟进入 Seek，通知 Demux 重新定位
    /// 3. 清空所有冻结的队列，解冻
    ///
    /// 冻结期间各阶段线程最多把手上正在处理的一帧推进队列，这些旧帧没有哨兵标记，
    /// 调度器会在 Seek 完成前丢掉它们。
    pub fn seek(&self, target: u64, mode: SeekMode) -> Result<()> {
        let _guard = self.seek_lock.lock();
        let tracks = self.tracks();
        info!("{} 🎯 Seek 到: {}ms ({:?})", log_ctx(), target, mode);

        let video = self.video.as_ref().map(|q| (q.freeze(), &q.flow));
        let audio = self.audio.as_ref().map(|q| (q.freeze(), &q.flow));

        self.clock.begin_seek(target, tracks);
        if let Err(e) = self.demux.seek(target, mode, tracks) {
            warn!("{} ⚠️ Seek 命令发送失败: {}", log_ctx(), e);
            for track in [Track::Video, Track::Audio] {
                self.clock.finish_seek(track);
            }
            return Err(e);
        }

        let mut dropped = 0;
        if let Some((freeze, flow)) = video.as_ref() {
            dropped += freeze.drain(flow);
        }
        if let Some((freeze, flow)) = audio.as_ref() {
            dropped += freeze.drain(flow);
        }
        drop(audio);
        drop(video);

        if dropped > 0 {
            info!("{} 🧹 Seek 清空队列: {} 帧", log_ctx(), dropped);
        }
        Ok(())
    }

    /// 各队列当前长度（仅供诊断）
    pub fn queue_status(&self) -> BufferStatus {
        let mut status = BufferStatus::default();
        if let Some(q) = self.video.as_ref() {
            status.video_packets = q.packets.len();
            status.video_pictures = q.pictures.len();
            status.video_frames = q.frames.len();
            status.video_custom = q.custom.as_ref().map_or(0, |c| c.len());
        }
        if let Some(q) = self.audio.as_ref() {
            status.audio_packets = q.packets.len();
            status.audio_frames = q.frames.len();
            status.audio_custom = q.custom.as_ref().map_or(0, |c| c.len());
        }
        status
    }

    /// 先停 Demux，再沿流水线方向逐个停止各阶段，最后清空输出队列
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        info!("{} ⏹️ 停止播放流水线", log_ctx());

        self.demux.stop();
        for stage in self.stages.iter_mut() {
            debug!("{} 停止 {}", log_ctx(), stage.handle.name());
            stage.stop();
        }

        if let Some(q) = self.video.as_ref() {
            drain_output(&q.output(), &q.flow);
            q.flow.reset();
        }
        if let Some(q) = self.audio.as_ref() {
            drain_output(&q.output(), &q.flow);
            q.flow.reset();
        }
        info!("{} ✅ 流水线已停止，所有线程已清理", log_ctx());
    }
}

impl Drop for PipelineManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn wake<T: Send + 'static>(input: Arc<FrameQueue<T>>) -> StageAction {
    Box::new(move || wake_input(&input))
}

fn drain<T: Send + 'static>(output: Arc<FrameQueue<T>>, flow: FlowCounter) -> StageAction {
    Box::new(move || drain_output(&output, &flow))
}
