mod common;

use av1_playback::{
    FileEndBehavior, PixelFormat, PlaybackMode, Player, PlayerError, ProcessingHooks, SeekMode,
    Settings,
};
use common::*;
use std::io::Write;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(20);

fn fast_settings() -> Settings {
    Settings {
        playback_mode: PlaybackMode::Fast,
        ..Settings::default()
    }
}

/// 一直读到 WAIT 模式的文件末尾，返回看到的所有新帧的时间码
fn read_to_end(player: &mut Player) -> (Vec<u64>, Vec<u64>) {
    let wants_video = player.settings().wants_video();
    let wants_audio = player.settings().wants_audio();
    let (mut video, mut audio) = (Vec::new(), Vec::new());

    let finished = wait_until(TIMEOUT, || {
        if wants_video {
            if let Some(tc) = video_timecodes(player) {
                video.push(tc);
            }
        }
        if wants_audio {
            if let Some(tc) = audio_timecodes(player) {
                audio.push(tc);
            }
        }
        player.is_at_end().unwrap()
    });
    assert!(finished, "没有在超时前播放到末尾");
    (video, audio)
}

/// 在 `period` 内不停地取新帧
fn pull_for(player: &mut Player, period: Duration, video: &mut Vec<u64>, audio: &mut Vec<u64>) {
    let deadline = Instant::now() + period;
    while Instant::now() < deadline {
        if let Some(tc) = video_timecodes(player) {
            video.push(tc);
        }
        if let Some(tc) = audio_timecodes(player) {
            audio.push(tc);
        }
        thread::sleep(Duration::from_millis(1));
    }
}

fn strictly_increasing(timecodes: &[u64]) -> bool {
    timecodes.windows(2).all(|w| w[0] < w[1])
}

#[test]
fn test_fast_mode_delivers_every_frame() {
    let spec = WebmSpec::default();
    let mut player = open_player(&spec, fast_settings());

    let (video, audio) = read_to_end(&mut player);

    let expected_video: Vec<u64> = (0..spec.video_frames() as u64).map(|i| i * 100).collect();
    let expected_audio: Vec<u64> = (0..spec.audio_frames() as u64).map(|i| i * 40).collect();
    assert_eq!(video, expected_video);
    assert_eq!(audio, expected_audio);
    assert!(player.is_at_end().unwrap());
    assert_eq!(player.loop_count(), 0);
}

#[test]
fn test_timed_playback_follows_clock() {
    let spec = WebmSpec::seconds(3);
    let mut player = open_player(&spec, Settings::default());

    // 先等输出队列有数据
    let filled = wait_until(TIMEOUT, || {
        let status = player.queue_status().unwrap();
        status.video_frames > 0 && status.audio_frames > 0
    });
    assert!(filled);
    assert!(player.is_paused().unwrap());

    player.start_playback().unwrap();
    assert!(!player.is_paused().unwrap());

    let (mut video, mut audio) = (Vec::new(), Vec::new());
    let finished = wait_until(TIMEOUT, || {
        if let Some(tc) = video_timecodes(&mut player) {
            assert!(player.playback_time().unwrap() >= tc, "视频帧 {tc}ms 提前出现");
            video.push(tc);
        }
        if let Some(tc) = audio_timecodes(&mut player) {
            audio.push(tc);
        }
        player.is_at_end().unwrap()
    });
    assert!(finished);

    assert!(video.windows(2).all(|w| w[0] <= w[1]), "视频时间码回退: {video:?}");
    assert!(audio.windows(2).all(|w| w[0] <= w[1]), "音频时间码回退: {audio:?}");
    assert_eq!(video.first(), Some(&0));
    assert_eq!(video.last(), Some(&2900));
    assert_eq!(audio.last(), Some(&2960));
    assert!(video.len() >= 15, "视频帧太少: {}", video.len());
    assert!(audio.len() >= 35, "音频帧太少: {}", audio.len());

    // 时钟继续走，但播放位置不超过时长
    assert_eq!(player.duration().unwrap(), 3000);
    assert!(wait_until(TIMEOUT, || player.playback_time().unwrap() == 3000));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(player.playback_time().unwrap(), 3000);
}

#[test]
fn test_loop_restarts_from_zero() {
    let spec = WebmSpec::seconds(2);
    let settings = Settings {
        on_file_end: FileEndBehavior::Loop,
        ..fast_settings()
    };
    let (mut player, flushes) = open_counting_flushes(&spec, settings);

    let mut first_pass = Vec::new();
    let mut after_loop = None;
    let looped = wait_until(TIMEOUT, || {
        if let Some(tc) = video_timecodes(&mut player) {
            if player.loop_count() == 0 {
                first_pass.push(tc);
            } else {
                after_loop = Some(tc);
                return true;
            }
        }
        audio_timecodes(&mut player);
        false
    });
    assert!(looped, "没有循环播放");

    assert_eq!(first_pass.len(), spec.video_frames());
    assert_eq!(first_pass.last(), Some(&1900));
    assert_eq!(after_loop, Some(0));
    // 回到开头之前解码器先 flush
    assert!(flushes.load(Ordering::SeqCst) >= 1);
    assert_eq!(player.loop_count(), 1);
    assert!(player.playback_time().unwrap() < 1000);
    // LOOP 模式下永远不会结束
    assert!(!player.is_at_end().unwrap());
}

#[test]
fn test_seek_past_end_in_loop_mode_restarts_from_zero() {
    let spec = WebmSpec::seconds(2);
    let settings = Settings {
        on_file_end: FileEndBehavior::Loop,
        seek_lead_ms: 1000,
        ..fast_settings()
    };
    let mut player = open_player(&spec, settings);

    // 目标之后没有同步点，Seek 改为从 0 开始
    player.seek(60_000, SeekMode::Fast).unwrap();
    let (mut video, mut audio) = (Vec::new(), Vec::new());
    assert!(wait_until(TIMEOUT, || {
        if video.len() < 2 {
            if let Some(tc) = video_timecodes(&mut player) {
                video.push(tc);
            }
        }
        if audio.len() < 2 {
            if let Some(tc) = audio_timecodes(&mut player) {
                audio.push(tc);
            }
        }
        video.len() == 2 && audio.len() == 2
    }));

    assert_eq!(video, vec![0, 100]);
    assert_eq!(audio, vec![0, 40]);
    assert!(player.playback_time().unwrap() < 1000);
    assert_eq!(player.loop_count(), 0);
    assert!(!player.is_at_end().unwrap());
    // 重新定位到 0 之后可以正常 Seek
    player.seek(1000, SeekMode::Fast).unwrap();
}

#[test]
fn test_speed_change() {
    let spec = WebmSpec::default();
    let mut player = open_player(&spec, Settings::default());

    assert_eq!(player.playback_speed().unwrap(), 1.0);
    player.set_playback_speed(4.0).unwrap();
    assert_eq!(player.playback_speed().unwrap(), 4.0);

    let (mut video, mut audio) = (Vec::new(), Vec::new());
    player.start_playback().unwrap();
    pull_for(&mut player, Duration::from_millis(500), &mut video, &mut audio);
    let t1 = player.playback_time().unwrap();
    assert!((1500..=4000).contains(&t1), "4 倍速 500ms 后位置为 {t1}ms");
    let (video_before, audio_before) = (video.len(), audio.len());
    assert!(video_before > 0 && audio_before > 0);

    player.set_playback_speed(1.0).unwrap();
    let t2 = player.playback_time().unwrap();
    pull_for(&mut player, Duration::from_millis(300), &mut video, &mut audio);
    let t3 = player.playback_time().unwrap();
    assert!(t2 >= t1);
    assert!((200..=1000).contains(&(t3 - t2)), "1 倍速 300ms 前进了 {}ms", t3 - t2);

    // 换速前后拿到的帧时间码一直向前，不会重复出现
    assert!(video.len() > video_before && audio.len() > audio_before);
    assert!(strictly_increasing(&video), "视频时间码: {video:?}");
    assert!(strictly_increasing(&audio), "音频时间码: {audio:?}");

    player.stop_playback().unwrap();
    let paused_at = player.playback_time().unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(player.playback_time().unwrap(), paused_at);
}

#[test]
fn test_frame_ownership() {
    let spec = WebmSpec::default();
    let mut player = open_player(&spec, fast_settings());

    assert!(wait_until(TIMEOUT, || player.video_frame_ready().unwrap()));
    let taken = player.take_video_frame().unwrap().expect("应该能取走当前帧");
    assert_eq!(taken.timecode, 0);
    assert_eq!((taken.width, taken.height), (4, 2));
    assert_eq!(taken.pixel_format, PixelFormat::RGBA);
    assert_eq!(taken.size(), taken.stride * taken.height);

    // 取走之后槽位为空
    assert!(player.video_frame().unwrap().is_none());
    assert!(player.take_video_frame().unwrap().is_none());
    assert!(player.clone_video_frame().unwrap().is_none());

    assert!(wait_until(TIMEOUT, || player.video_frame_ready().unwrap()));
    let copy = player.clone_video_frame().unwrap().expect("应该能拷贝当前帧");
    assert_eq!(copy.timecode, 100);
    assert_eq!(player.video_frame().unwrap(), Some(&copy));
    // 取走的帧在播放上下文里的帧更新之后依然有效
    assert_eq!(taken.data.len(), copy.data.len());

    assert!(wait_until(TIMEOUT, || player.audio_frame_ready().unwrap()));
    let audio = player.take_audio_frame().unwrap().expect("应该能取走音频帧");
    assert_eq!(audio.timecode, 0);
    assert_eq!(audio.sample_rate, 48000);
    assert_eq!(audio.channels, 2);
    assert_eq!(audio.samples_per_channel(), 48000 * 40 / 1000);
    assert_eq!(audio.duration, 40);
    assert!(player.audio_frame().unwrap().is_none());
}

#[test]
fn test_open_from_path() {
    init_logger();
    let spec = WebmSpec::seconds(1);
    let mut file = tempfile::Builder::new().suffix(".webm").tempfile().unwrap();
    file.write_all(&build_webm(&spec)).unwrap();
    file.flush().unwrap();

    let settings = Settings {
        playback_mode: PlaybackMode::Fast,
        ..Settings::for_file(file.path())
    };
    let mut player = Player::new(settings, fake_codecs(), ProcessingHooks::default()).unwrap();
    assert_eq!(player.duration().unwrap(), 1000);

    let (video, audio) = read_to_end(&mut player);
    assert_eq!(video.len(), spec.video_frames());
    assert_eq!(audio.len(), spec.audio_frames());
}

#[test]
fn test_open_missing_file() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::for_file(dir.path().join("missing.webm"));
    let result = Player::new(settings, fake_codecs(), ProcessingHooks::default());
    assert!(matches!(result, Err(PlayerError::OpenError(_))));

    let result = Player::new(Settings::default(), fake_codecs(), ProcessingHooks::default());
    assert!(matches!(result, Err(PlayerError::OpenError(_))));
}

#[test]
fn test_video_only_request() {
    let spec = WebmSpec::seconds(2);
    let settings = Settings {
        codec_target: av1_playback::CodecTarget::AV1,
        ..fast_settings()
    };
    let mut player = open_player(&spec, settings);

    let (video, audio) = read_to_end(&mut player);
    assert_eq!(video.len(), spec.video_frames());
    assert!(audio.is_empty());
    assert!(matches!(
        player.audio_frame_ready(),
        Err(PlayerError::TrackNotRequested(_))
    ));
    assert!(player.last_error().is_some());
}

#[test]
fn test_duration_from_last_frame() {
    let spec = WebmSpec {
        declare_duration: false,
        ..WebmSpec::default()
    };
    let settings = Settings {
        queue_size: 4,
        ..fast_settings()
    };
    let mut player = open_player(&spec, settings);

    // 队列很小，Demux 读不到文件末尾
    assert!(matches!(player.duration(), Err(PlayerError::DurationUnknown)));

    read_to_end(&mut player);
    assert_eq!(player.duration().unwrap(), 9960);
}
