//! 集成测试的公共部分：合成 WebM 文件、假的 AV1 / Opus 解码器
#![allow(dead_code)]

use av1_playback::player::obu::{self, ObuIter};
use av1_playback::{
    AudioDecoder, Codecs, DecodeError, DecodeResult, Picture, PictureLayout, Player,
    ProcessingHooks, Settings, VideoDecoder,
};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const VIDEO_TRACK: u8 = 1;
pub const AUDIO_TRACK: u8 = 2;

/// 合成文件的参数
#[derive(Debug, Clone)]
pub struct WebmSpec {
    pub seconds: u64,
    pub video_interval_ms: u64,
    pub keyframe_interval_ms: u64,
    pub audio_interval_ms: u64,
    pub with_video: bool,
    pub with_audio: bool,
    pub declare_duration: bool,
}

impl Default for WebmSpec {
    fn default() -> Self {
        Self {
            seconds: 10,
            video_interval_ms: 100,
            keyframe_interval_ms: 1000,
            audio_interval_ms: 40,
            with_video: true,
            with_audio: true,
            declare_duration: true,
        }
    }
}

impl WebmSpec {
    pub fn seconds(seconds: u64) -> Self {
        Self {
            seconds,
            ..Self::default()
        }
    }

    pub fn video_frames(&self) -> usize {
        if self.with_video {
            (self.seconds * 1000 / self.video_interval_ms) as usize
        } else {
            0
        }
    }

    pub fn audio_frames(&self) -> usize {
        if self.with_audio {
            (self.seconds * 1000 / self.audio_interval_ms) as usize
        } else {
            0
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.seconds * 1000
    }
}

/// 一个元素：ID + 8 字节大小字段 + 内容
pub fn el(id: &[u8], body: &[u8]) -> Vec<u8> {
    let mut out = id.to_vec();
    out.push(0x01);
    out.extend_from_slice(&(body.len() as u64).to_be_bytes()[1..]);
    out.extend_from_slice(body);
    out
}

fn uint(value: u64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

fn track_entry(number: u8, codec: &str) -> Vec<u8> {
    let mut body = el(&[0xD7], &[number]);
    body.extend(el(&[0x86], codec.as_bytes()));
    el(&[0xAE], &body)
}

fn simple_block(track: u8, relative: i16, keyframe: bool, payload: &[u8]) -> Vec<u8> {
    let mut body = vec![0x80 | track];
    body.extend_from_slice(&relative.to_be_bytes());
    body.push(if keyframe { 0x80 } else { 0x00 });
    body.extend_from_slice(payload);
    el(&[0xA3], &body)
}

/// AV1 temporal unit：关键帧带 sequence header；帧 OBU 第一个字节是关键帧标志
pub fn video_payload(timecode: u64, keyframe: bool) -> Vec<u8> {
    let mut data = Vec::new();
    obu::write_obu(obu::OBU_TEMPORAL_DELIMITER, &[], &mut data);
    if keyframe {
        obu::write_obu(obu::OBU_SEQUENCE_HEADER, &[0, 0, 0], &mut data);
    }
    let mut frame = vec![keyframe as u8];
    frame.extend_from_slice(&timecode.to_be_bytes());
    obu::write_obu(obu::OBU_FRAME, &frame, &mut data);
    data
}

/// 按参数生成完整的 WebM 文件：每秒一个 Cluster
pub fn build_webm(spec: &WebmSpec) -> Vec<u8> {
    let mut file = el(&[0x1A, 0x45, 0xDF, 0xA3], &el(&[0x42, 0x82], b"webm"));

    let mut info = el(&[0x2A, 0xD7, 0xB1], &uint(1_000_000));
    if spec.declare_duration {
        info.extend(el(&[0x44, 0x89], &(spec.duration_ms() as f64).to_be_bytes()));
    }

    let mut tracks = Vec::new();
    if spec.with_video {
        tracks.extend(track_entry(VIDEO_TRACK, "V_AV1"));
    }
    if spec.with_audio {
        tracks.extend(track_entry(AUDIO_TRACK, "A_OPUS"));
    }

    let mut segment = el(&[0x15, 0x49, 0xA9, 0x66], &info);
    segment.extend(el(&[0x16, 0x54, 0xAE, 0x6B], &tracks));

    for second in 0..spec.seconds {
        let base = second * 1000;
        let mut blocks: Vec<(u64, Vec<u8>)> = Vec::new();
        if spec.with_video {
            for tc in (base..base + 1000).step_by(spec.video_interval_ms as usize) {
                let key = tc % spec.keyframe_interval_ms == 0;
                let block = simple_block(VIDEO_TRACK, (tc - base) as i16, key, &video_payload(tc, key));
                blocks.push((tc, block));
            }
        }
        if spec.with_audio {
            let first = base.div_ceil(spec.audio_interval_ms) * spec.audio_interval_ms;
            for tc in (first..base + 1000).step_by(spec.audio_interval_ms as usize) {
                let block = simple_block(AUDIO_TRACK, (tc - base) as i16, true, &tc.to_be_bytes());
                blocks.push((tc, block));
            }
        }
        // 同一时间码视频在前
        blocks.sort_by_key(|(tc, _)| *tc);

        let mut cluster = el(&[0xE7], &uint(base));
        for (_, block) in blocks {
            cluster.extend(block);
        }
        segment.extend(el(&[0x1F, 0x43, 0xB6, 0x75], &cluster));
    }

    file.extend(el(&[0x18, 0x53, 0x80, 0x67], &segment));
    file
}

/// 假的 AV1 解码器：flush 之后必须先见到 sequence header 和关键帧才能出图
#[derive(Clone, Default)]
pub struct FakeAv1Decoder {
    has_header: bool,
    synced: bool,
    pub flushes: Arc<AtomicUsize>,
}

impl VideoDecoder for FakeAv1Decoder {
    fn decode(&mut self, data: &[u8]) -> DecodeResult<Vec<Picture>> {
        let mut keyframe = false;
        let mut seen_frame = false;
        for unit in ObuIter::new(data) {
            match unit.obu_type {
                obu::OBU_SEQUENCE_HEADER => self.has_header = true,
                obu::OBU_FRAME => {
                    seen_frame = true;
                    keyframe = unit.payload.first() == Some(&1);
                }
                _ => {}
            }
        }
        if !seen_frame {
            return Err(DecodeError::Malformed("没有帧数据".into()));
        }
        if !self.has_header {
            return Err(DecodeError::Malformed("缺少 sequence header".into()));
        }
        if keyframe {
            self.synced = true;
        }
        if !self.synced {
            return Err(DecodeError::Malformed("缺少参考帧".into()));
        }

        let (w, h) = (4, 2);
        Ok(vec![Picture {
            width: w,
            height: h,
            layout: PictureLayout::I420,
            y: vec![235; w * h],
            u: vec![128; 2],
            v: vec![128; 2],
            y_stride: w,
            uv_stride: 2,
            timecode: 0,
            sentinel: false,
        }])
    }

    fn flush(&mut self) {
        self.has_header = false;
        self.synced = false;
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

/// 假的 Opus 解码器：每个包固定 40ms 的 PCM，样本值取时间码的低 15 位
#[derive(Default)]
pub struct FakeOpusDecoder {
    samples_per_channel: usize,
    channels: usize,
}

impl AudioDecoder for FakeOpusDecoder {
    fn open(&mut self, sample_rate: u32, channels: u16) -> av1_playback::Result<()> {
        self.samples_per_channel = sample_rate as usize * 40 / 1000;
        self.channels = channels as usize;
        Ok(())
    }

    fn decode(&mut self, data: &[u8]) -> DecodeResult<Vec<i16>> {
        let bytes: [u8; 8] = data
            .try_into()
            .map_err(|_| DecodeError::Malformed("音频包长度不对".into()))?;
        let value = (u64::from_be_bytes(bytes) & 0x7FFF) as i16;
        Ok(vec![value; self.samples_per_channel * self.channels])
    }
}

pub fn fake_codecs() -> Codecs {
    Codecs::new()
        .with_video(FakeAv1Decoder::default())
        .with_audio(FakeOpusDecoder::default())
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 用内存中的合成文件创建播放上下文
pub fn open_player(spec: &WebmSpec, settings: Settings) -> Player {
    init_logger();
    Player::with_reader(
        Cursor::new(build_webm(spec)),
        settings,
        fake_codecs(),
        ProcessingHooks::default(),
    )
    .expect("创建播放上下文失败")
}

/// 带计数的解码器：返回的 flush 计数器和播放上下文共享
pub fn open_counting_flushes(spec: &WebmSpec, settings: Settings) -> (Player, Arc<AtomicUsize>) {
    init_logger();
    let video = FakeAv1Decoder::default();
    let flushes = video.flushes.clone();
    let codecs = Codecs::new()
        .with_video(video)
        .with_audio(FakeOpusDecoder::default());
    let player = Player::with_reader(
        Cursor::new(build_webm(spec)),
        settings,
        codecs,
        ProcessingHooks::default(),
    )
    .expect("创建播放上下文失败");
    (player, flushes)
}

/// 反复执行 `poll` 直到返回 true 或超时
pub fn wait_until(timeout: Duration, mut poll: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if poll() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

/// 从当前时间码读取视频帧：合成图像不带时间码，直接用帧元数据
pub fn video_timecodes(player: &mut Player) -> Option<u64> {
    if player.video_frame_ready().ok()? {
        player.video_frame().ok()?.map(|frame| frame.timecode)
    } else {
        None
    }
}

pub fn audio_timecodes(player: &mut Player) -> Option<u64> {
    if player.audio_frame_ready().ok()? {
        player.audio_frame().ok()?.map(|frame| frame.timecode)
    } else {
        None
    }
}
