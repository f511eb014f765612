//! 播放配置
//!
//! `Settings` 可以序列化为 JSON 保存；自定义处理回调放在单独的 `ProcessingHooks` 里，
//! 不参与序列化。

use crate::core::error::{PlayerError, Result};
use crate::core::types::{
    AudioFrame, CodecTarget, FileEndBehavior, PixelFormat, PlaybackMode, VideoFrame,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const AUDIO_FREQ_8KHZ: u32 = 8000;
pub const AUDIO_FREQ_12KHZ: u32 = 12000;
pub const AUDIO_FREQ_16KHZ: u32 = 16000;
pub const AUDIO_FREQ_24KHZ: u32 = 24000;
pub const AUDIO_FREQ_48KHZ: u32 = 48000;

pub const AUDIO_MONO: u16 = 1;
pub const AUDIO_STEREO: u16 = 2;

/// 默认的 Seek 提前量（毫秒）
pub const DEFAULT_SEEK_LEAD_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// 要播放的 WebM 文件
    pub file_path: Option<PathBuf>,

    /// 需要解码的轨道
    pub codec_target: CodecTarget,

    /// 输出像素格式
    pub desired_pixel_format: PixelFormat,

    /// 每个阶段队列的容量
    pub queue_size: usize,

    /// 音频输出采样率
    pub frequency: u32,

    /// 音频输出声道数
    pub channels: u16,

    pub playback_mode: PlaybackMode,

    pub on_file_end: FileEndBehavior,

    /// 初始播放速度
    pub playback_speed: f64,

    /// Seek 时在目标之前多远开始寻找可重新同步的关键帧
    pub seek_lead_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            file_path: None,
            codec_target: CodecTarget::AV1 | CodecTarget::OPUS,
            desired_pixel_format: PixelFormat::RGBA,
            queue_size: 20,
            frequency: AUDIO_FREQ_48KHZ,
            channels: AUDIO_STEREO,
            playback_mode: PlaybackMode::Timed,
            on_file_end: FileEndBehavior::Wait,
            playback_speed: 1.0,
            seek_lead_ms: DEFAULT_SEEK_LEAD_MS,
        }
    }
}

impl Settings {
    /// 默认配置 + 文件路径
    pub fn for_file(path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let settings: Settings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn wants_video(&self) -> bool {
        self.codec_target.contains(CodecTarget::AV1)
    }

    pub fn wants_audio(&self) -> bool {
        self.codec_target.contains(CodecTarget::OPUS)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_size == 0 {
            return Err(PlayerError::ZeroCapacity);
        }
        if self.codec_target.is_empty() {
            return Err(PlayerError::InvalidSettings("没有选择任何轨道".into()));
        }
        if !self.playback_speed.is_finite() || self.playback_speed <= 0.0 {
            return Err(PlayerError::InvalidSpeed(self.playback_speed));
        }
        if ![
            AUDIO_FREQ_8KHZ,
            AUDIO_FREQ_12KHZ,
            AUDIO_FREQ_16KHZ,
            AUDIO_FREQ_24KHZ,
            AUDIO_FREQ_48KHZ,
        ]
        .contains(&self.frequency)
        {
            return Err(PlayerError::InvalidSettings(format!(
                "不支持的采样率: {}",
                self.frequency
            )));
        }
        if self.channels != AUDIO_MONO && self.channels != AUDIO_STEREO {
            return Err(PlayerError::InvalidSettings(format!(
                "不支持的声道数: {}",
                self.channels
            )));
        }
        Ok(())
    }
}

/// 自定义视频处理：返回 `Ok(None)` 表示丢弃这一帧，返回错误会结束该阶段
pub type VideoHook = Box<dyn FnMut(VideoFrame) -> Result<Option<VideoFrame>> + Send>;

/// 自定义音频处理
pub type AudioHook = Box<dyn FnMut(AudioFrame) -> Result<Option<AudioFrame>> + Send>;

/// 插入到视频 / 音频输出之前的自定义处理回调
#[derive(Default)]
pub struct ProcessingHooks {
    pub video: Option<VideoHook>,
    pub audio: Option<AudioHook>,
}

impl ProcessingHooks {
    pub fn with_video<F>(mut self, hook: F) -> Self
    where
        F: FnMut(VideoFrame) -> Result<Option<VideoFrame>> + Send + 'static,
    {
        self.video = Some(Box::new(hook));
        self
    }

    pub fn with_audio<F>(mut self, hook: F) -> Self
    where
        F: FnMut(AudioFrame) -> Result<Option<AudioFrame>> + Send + 'static,
    {
        self.audio = Some(Box::new(hook));
        self
    }
}
