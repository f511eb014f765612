use anyhow::{bail, Context, Result};
use av1_playback::{
    AudioDecoder, Codecs, DecodeResult, FileEndBehavior, Picture, PictureLayout, Player,
    ProcessingHooks, Settings, VideoDecoder,
};
use log::info;
use std::env;
use std::thread;
use std::time::{Duration, Instant};

/// 演示用视频解码器：不做真正的 AV1 解码，每个 temporal unit 输出一张灰色图像
struct BlankVideoDecoder;

impl VideoDecoder for BlankVideoDecoder {
    fn decode(&mut self, data: &[u8]) -> DecodeResult<Vec<Picture>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let (w, h) = (64, 36);
        Ok(vec![Picture {
            width: w,
            height: h,
            layout: PictureLayout::I420,
            y: vec![128; w * h],
            u: vec![128; (w / 2) * (h / 2)],
            v: vec![128; (w / 2) * (h / 2)],
            y_stride: w,
            uv_stride: w / 2,
            timecode: 0,
            sentinel: false,
        }])
    }

    fn flush(&mut self) {}
}

/// 演示用音频解码器：每个包输出 20ms 静音
struct SilenceDecoder {
    samples: usize,
}

impl AudioDecoder for SilenceDecoder {
    fn open(&mut self, sample_rate: u32, channels: u16) -> av1_playback::Result<()> {
        self.samples = sample_rate as usize / 50 * channels as usize;
        Ok(())
    }

    fn decode(&mut self, _data: &[u8]) -> DecodeResult<Vec<i16>> {
        Ok(vec![0; self.samples])
    }
}

fn main() -> Result<()> {
    // 初始化日志
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("🎬 av1_playback {} 无界面播放", av1_playback::version());

    let mut args = env::args().skip(1);
    let Some(path) = args.next() else {
        bail!("用法: av1_playback <文件.webm> [settings.json]");
    };
    let mut settings = match args.next() {
        Some(config) => Settings::from_json_file(&config)
            .with_context(|| format!("读取配置文件 {} 失败", config))?,
        None => Settings::default(),
    };
    settings.file_path = Some(path.into());
    // 无界面模式只播放一遍
    settings.on_file_end = FileEndBehavior::Wait;

    let codecs = Codecs::new()
        .with_video(BlankVideoDecoder)
        .with_audio(SilenceDecoder { samples: 0 });
    let mut player = Player::new(settings.clone(), codecs, ProcessingHooks::default())
        .context("创建播放上下文失败")?;
    player.start_playback()?;

    let started = Instant::now();
    let (mut video_frames, mut audio_frames) = (0usize, 0usize);
    let mut last_report = Instant::now();

    while !player.is_at_end()? {
        if settings.wants_video() && player.video_frame_ready()? && player.video_frame()?.is_some() {
            video_frames += 1;
        }
        if settings.wants_audio() && player.audio_frame_ready()? && player.audio_frame()?.is_some() {
            audio_frames += 1;
        }
        if last_report.elapsed() >= Duration::from_secs(1) {
            let status = player.queue_status()?;
            info!(
                "⏱ {}ms: {} 视频帧, {} 音频帧, 队列 {}",
                player.playback_time()?,
                video_frames,
                audio_frames,
                serde_json::to_string(&status)?
            );
            last_report = Instant::now();
        }
        thread::sleep(Duration::from_millis(1));
    }

    info!(
        "✅ 播放结束: {} 视频帧, {} 音频帧, 用时 {:.1}s",
        video_frames,
        audio_frames,
        started.elapsed().as_secs_f64()
    );
    Ok(())
}
