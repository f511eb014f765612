use crate::core::{
    CodecTarget, CompressedFrame, ErrorState, FileEndBehavior, Message, PlaybackClock, PlayerError,
    Result, SeekMode, Track,
};
use crate::player::demuxer_source::{DemuxEvent, DemuxerSource};
use crate::player::stage::{log_ctx, Control, FlowCounter, FrameQueue, StageCommand, StageHandle};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;

/// Cue 点：一个 Cluster 的时间码和字节位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CuePoint {
    pub timecode: u64,
    pub offset: u64,
}

/// 文件末尾状态；还有没处理的 Seek 命令时不能置位
#[derive(Debug, Default)]
struct EofState {
    at_eof: bool,
    pending_seeks: usize,
}

/// Demux 线程和外部共享的状态
#[derive(Debug, Default)]
pub struct DemuxShared {
    eof: Mutex<EofState>,
    duration: Mutex<Option<u64>>,
}

impl DemuxShared {
    pub fn is_at_eof(&self) -> bool {
        self.eof.lock().at_eof
    }

    fn seek_requested(&self) {
        let mut eof = self.eof.lock();
        eof.pending_seeks += 1;
        eof.at_eof = false;
    }

    fn seek_received(&self) {
        let mut eof = self.eof.lock();
        eof.pending_seeks = eof.pending_seeks.saturating_sub(1);
        eof.at_eof = false;
    }

    /// 返回是否真的进入了文件末尾状态
    fn reached_eof(&self) -> bool {
        let mut eof = self.eof.lock();
        eof.at_eof = eof.pending_seeks == 0;
        eof.at_eof
    }

    pub fn duration(&self) -> Option<u64> {
        *self.duration.lock()
    }
}

/// 一条轨道的输出端
#[derive(Clone)]
pub struct TrackSink {
    pub queue: Arc<FrameQueue<CompressedFrame>>,
    pub flow: FlowCounter,
}

/// Demux 线程的配置
pub struct DemuxConfig {
    pub video: Option<TrackSink>,
    pub audio: Option<TrackSink>,
    pub on_file_end: FileEndBehavior,
    pub seek_lead_ms: u64,
}

/// 正在进行的 Seek
#[derive(Debug, Clone, Copy)]
struct SeekRequest {
    target: u64,
    mode: SeekMode,
    tracks: CodecTarget,
    /// 还没有找到重新同步点的轨道
    pending: CodecTarget,
    /// 精确 Seek 时视频在目标之前的帧继续标记为丢弃
    video_discard_before_target: bool,
}

/// Demuxer 线程管理器
pub struct DemuxerThread {
    stage: StageHandle,
    shared: Arc<DemuxShared>,
    video: Option<TrackSink>,
    audio: Option<TrackSink>,
}

impl DemuxerThread {
    /// 启动 Demuxer 线程
    pub fn start(
        source: Box<dyn DemuxerSource>,
        config: DemuxConfig,
        clock: PlaybackClock,
        errors: Arc<ErrorState>,
    ) -> Result<Self> {
        let shared = Arc::new(DemuxShared::default());
        *shared.duration.lock() = source.duration_ms();

        let video = config.video.clone();
        let audio = config.audio.clone();
        let stage = {
            let shared = shared.clone();
            StageHandle::spawn("demux", move |control| {
                let mut worker = DemuxWorker::new(source, config, shared, clock, errors);
                worker.run(&control);
            })?
        };

        Ok(Self {
            stage,
            shared,
            video,
            audio,
        })
    }

    pub fn shared(&self) -> &Arc<DemuxShared> {
        &self.shared
    }

    /// 发送 Seek 命令，文件结束状态立即清除
    pub fn seek(&self, target: u64, mode: SeekMode, tracks: CodecTarget) -> Result<()> {
        self.shared.seek_requested();
        self.stage.send(StageCommand::Seek {
            target,
            mode,
            tracks,
        })
    }

    pub fn is_running(&self) -> bool {
        self.stage.is_running()
    }

    /// 停止线程：Demux 可能阻塞在 push 上，需要排空两个输出队列
    pub fn stop(&mut self) {
        let video = self.video.clone();
        let audio = self.audio.clone();
        self.stage.stop(
            || {},
            move || {
                for sink in video.iter().chain(audio.iter()) {
                    crate::player::stage::drain_output(&sink.queue, &sink.flow);
                }
            },
        );
    }
}

/// 日志只打印前几个和之后每 100 个
const LOG_FIRST_N: usize = 5;

enum Flow {
    Continue,
    Exit,
}

struct DemuxWorker {
    source: Box<dyn DemuxerSource>,
    config: DemuxConfig,
    shared: Arc<DemuxShared>,
    clock: PlaybackClock,
    errors: Arc<ErrorState>,
    cues: Vec<CuePoint>,
    /// 已经读到过文件末尾，Cue 列表完整
    cues_complete: bool,
    seek: Option<SeekRequest>,
    /// 只读 Cluster 头、丢弃帧，直到越过 Seek 目标
    skip_clusters: bool,
    /// 重新定位之后还没有送出视频帧
    video_discontinuity: bool,
    max_timecode: u64,
    video_count: usize,
    audio_count: usize,
    malformed_count: usize,
}

impl DemuxWorker {
    fn new(
        source: Box<dyn DemuxerSource>,
        config: DemuxConfig,
        shared: Arc<DemuxShared>,
        clock: PlaybackClock,
        errors: Arc<ErrorState>,
    ) -> Self {
        Self {
            source,
            config,
            shared,
            clock,
            errors,
            cues: Vec::new(),
            cues_complete: false,
            seek: None,
            skip_clusters: false,
            video_discontinuity: false,
            max_timecode: 0,
            video_count: 0,
            audio_count: 0,
            malformed_count: 0,
        }
    }

    fn run(&mut self, control: &Control) {
        info!("{} 🎬 Demuxer 线程启动: {}", log_ctx(), self.source.description());

        loop {
            // 优先处理所有命令（非阻塞）
            while let Some(cmd) = control.poll() {
                if let Flow::Exit = self.handle_command(cmd) {
                    return self.finish();
                }
            }

            if self.errors.is_critical() {
                warn!("{} ⚠️ 检测到严重错误，Demuxer 线程退出", log_ctx());
                self.terminate_downstream();
                return self.finish();
            }

            match self.source.next_event() {
                Ok(Some(DemuxEvent::Cluster { timecode, offset })) => {
                    self.on_cluster(timecode, offset);
                }
                Ok(Some(DemuxEvent::Frame(frame))) => {
                    if !self.skip_clusters {
                        self.on_frame(frame);
                    }
                }
                Ok(None) => {
                    if let Flow::Exit = self.on_end_of_file(control) {
                        return self.finish();
                    }
                }
                Err(PlayerError::Malformed(msg)) => {
                    self.malformed_count += 1;
                    if self.malformed_count <= LOG_FIRST_N || self.malformed_count % 100 == 0 {
                        warn!("{} ⚠️ 跳过损坏数据 #{}: {}", log_ctx(), self.malformed_count, msg);
                    }
                }
                Err(e) => {
                    // 读取错误：按文件末尾处理
                    error!("{} ❌ 读取失败: {}", log_ctx(), e);
                    if let Flow::Exit = self.on_end_of_file(control) {
                        return self.finish();
                    }
                }
            }
        }
    }

    fn finish(&self) {
        info!(
            "{} 🛑 Demuxer 线程退出（共读取 {} 视频帧，{} 音频帧）",
            log_ctx(),
            self.video_count,
            self.audio_count
        );
    }

    fn terminate_downstream(&self) {
        for sink in self.config.video.iter().chain(self.config.audio.iter()) {
            crate::player::stage::push_terminator(&sink.queue);
        }
    }

    fn requested(&self) -> CodecTarget {
        let mut tracks = CodecTarget::NONE;
        if self.config.video.is_some() {
            tracks.insert(CodecTarget::AV1);
        }
        if self.config.audio.is_some() {
            tracks.insert(CodecTarget::OPUS);
        }
        tracks
    }

    fn handle_command(&mut self, cmd: StageCommand) -> Flow {
        match cmd {
            StageCommand::Seek {
                target,
                mode,
                tracks,
            } => {
                info!("{} ⏩ Demuxer 线程收到 Seek 命令: {}ms ({:?})", log_ctx(), target, mode);
                self.seek = Some(SeekRequest {
                    target,
                    mode,
                    tracks,
                    pending: tracks,
                    video_discard_before_target: false,
                });
                self.shared.seek_received();
                self.reposition(target);
                Flow::Continue
            }
            StageCommand::Stop => {
                info!("{} ⏹ Demuxer 线程收到停止命令", log_ctx());
                Flow::Exit
            }
        }
    }

    /// 跳到目标之前最近的 Cue 点；Cue 列表还不完整且可能有更近的 Cluster 时先扫描
    fn reposition(&mut self, target: u64) {
        let index = self.cues.iter().rposition(|cue| cue.timecode <= target);
        let result = match index {
            Some(i) => self.source.seek_to_offset(self.cues[i].offset),
            None => self.source.rewind(),
        };
        if let Err(e) = result {
            error!("{} ❌ Seek 失败: {}", log_ctx(), e);
            return;
        }
        self.video_discontinuity = true;

        let is_last = match index {
            Some(i) => i + 1 == self.cues.len(),
            None => self.cues.is_empty(),
        };
        self.skip_clusters = !self.cues_complete && is_last;
        debug!(
            "{} Seek 定位到 Cue {:?}，扫描模式: {}",
            log_ctx(),
            index.map(|i| self.cues[i]),
            self.skip_clusters
        );
    }

    fn on_cluster(&mut self, timecode: u64, offset: u64) {
        if self.cues.last().map_or(true, |cue| timecode > cue.timecode) {
            self.cues.push(CuePoint { timecode, offset });
        }

        if self.skip_clusters {
            if let Some(seek) = self.seek {
                if timecode > seek.target {
                    self.reposition(seek.target);
                }
            }
        }
    }

    fn on_frame(&mut self, mut frame: CompressedFrame) {
        self.max_timecode = self.max_timecode.max(frame.timecode);

        let sink = match frame.track {
            Track::Video => self.config.video.clone(),
            Track::Audio => self.config.audio.clone(),
        };
        let Some(sink) = sink else {
            return;
        };

        if frame.track == Track::Video && self.video_discontinuity {
            frame.discontinuity = true;
            self.video_discontinuity = false;
        }

        if let Some(mut seek) = self.seek {
            self.mark_seek_flags(&mut seek, &mut frame);
            self.seek = if seek.pending.is_empty() && !seek.video_discard_before_target {
                debug!("{} ✓ Demuxer 端 Seek 标记完成", log_ctx());
                None
            } else {
                Some(seek)
            };
        }

        let count = match frame.track {
            Track::Video => {
                self.video_count += 1;
                self.video_count
            }
            Track::Audio => {
                self.audio_count += 1;
                self.audio_count
            }
        };
        if count <= LOG_FIRST_N || count % 100 == 0 {
            debug!(
                "{} 📦 Demuxer 读取{}帧 #{} @{}ms ({} 字节)",
                log_ctx(),
                frame.track,
                count,
                frame.timecode,
                frame.size()
            );
        }

        // 队列满时 push 会阻塞，起到背压作用
        sink.flow.produced(1);
        sink.queue.push(Message::Frame(frame));
    }

    fn mark_seek_flags(&self, seek: &mut SeekRequest, frame: &mut CompressedFrame) {
        let codec = frame.track.codec();
        let tc = frame.timecode;

        match frame.track {
            Track::Video if seek.pending.contains(codec) => {
                if tc.saturating_add(self.config.seek_lead_ms) < seek.target {
                    frame.discard = true;
                } else {
                    frame.sentinel = true;
                    if frame.keyframe {
                        // 重新同步点：快速模式从这里开始输出
                        seek.pending.remove(codec);
                        let accurate = seek.mode == SeekMode::Accurate;
                        frame.discard = accurate && tc < seek.target;
                        seek.video_discard_before_target = frame.discard;
                    } else {
                        frame.discard = true;
                    }
                }
            }
            Track::Video if seek.video_discard_before_target => {
                if tc < seek.target {
                    frame.discard = true;
                } else {
                    seek.video_discard_before_target = false;
                }
            }
            Track::Audio if seek.pending.contains(codec) => {
                if tc < seek.target {
                    frame.discard = true;
                } else {
                    frame.sentinel = true;
                    seek.pending.remove(codec);
                }
            }
            _ => {}
        }
    }

    fn on_end_of_file(&mut self, control: &Control) -> Flow {
        self.cues_complete = true;
        {
            let mut duration = self.shared.duration.lock();
            if duration.is_none() {
                *duration = Some(self.max_timecode);
                info!("{} 容器未声明时长，按最后一帧估计: {}ms", log_ctx(), self.max_timecode);
            }
        }

        // 扫描模式下到了末尾：Cue 列表已完整，重新定位
        if self.skip_clusters {
            if let Some(seek) = self.seek {
                self.reposition(seek.target);
                return Flow::Continue;
            }
            self.skip_clusters = false;
        }

        match self.config.on_file_end {
            FileEndBehavior::Loop => {
                if let Some(seek) = self.seek.take() {
                    if !seek.pending.is_empty() {
                        // 目标之后找不到同步点：改为从头开始
                        warn!("{} ⚠️ Seek 目标 {}ms 之后没有同步点，改为从 0 开始", log_ctx(), seek.target);
                        let tracks = self.requested() & seek.tracks;
                        self.clock.begin_seek(0, tracks);
                        self.seek = Some(SeekRequest {
                            target: 0,
                            mode: seek.mode,
                            tracks,
                            pending: tracks,
                            video_discard_before_target: false,
                        });
                    }
                }
                info!("{} 🔁 Demuxer 到达文件末尾，循环播放", log_ctx());
                if let Err(e) = self.source.rewind() {
                    error!("{} ❌ 回到文件开头失败: {}", log_ctx(), e);
                    return Flow::Exit;
                }
                self.video_discontinuity = true;
                Flow::Continue
            }
            FileEndBehavior::Wait => {
                // 未完成的 Seek 在这里结束，交给调度器按文件末尾处理
                self.seek = None;
                if self.shared.reached_eof() {
                    info!("{} 📄 Demuxer 到达文件末尾，等待命令（Seek/Stop）...", log_ctx());
                }

                match control.wait() {
                    StageCommand::Stop => {
                        info!("{} ⏹ Demuxer 线程收到停止命令", log_ctx());
                        Flow::Exit
                    }
                    cmd => self.handle_command(cmd),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eof_waits_for_pending_seek() {
        let shared = DemuxShared::default();
        assert!(!shared.is_at_eof());

        // Seek 命令还在通道里：读到末尾也不算结束
        shared.seek_requested();
        assert!(!shared.reached_eof());
        assert!(!shared.is_at_eof());

        shared.seek_received();
        assert!(shared.reached_eof());
        assert!(shared.is_at_eof());

        shared.seek_requested();
        assert!(!shared.is_at_eof());
    }
}
