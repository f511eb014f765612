use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr};

/// 编解码目标位掩码（AV1 视频 = 1，Opus 音频 = 2）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodecTarget(u8);

impl CodecTarget {
    pub const NONE: CodecTarget = CodecTarget(0);
    pub const AV1: CodecTarget = CodecTarget(1);
    pub const OPUS: CodecTarget = CodecTarget(2);
    pub const ALL: CodecTarget = CodecTarget(1 | 2);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        CodecTarget(bits & Self::ALL.0)
    }

    pub fn contains(self, other: CodecTarget) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: CodecTarget) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: CodecTarget) {
        self.0 &= !other.0;
    }
}

impl BitOr for CodecTarget {
    type Output = CodecTarget;

    fn bitor(self, rhs: Self) -> Self::Output {
        CodecTarget(self.0 | rhs.0)
    }
}

impl BitAnd for CodecTarget {
    type Output = CodecTarget;

    fn bitand(self, rhs: Self) -> Self::Output {
        CodecTarget(self.0 & rhs.0)
    }
}

/// 轨道类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Track {
    Video,
    Audio,
}

impl Track {
    pub fn codec(self) -> CodecTarget {
        match self {
            Track::Video => CodecTarget::AV1,
            Track::Audio => CodecTarget::OPUS,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Track::Video => "视频",
            Track::Audio => "音频",
        }
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 输出像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    #[default]
    RGBA,
    ARGB,
    BGRA,
    ABGR,
    RGB,
    BGR,
    YUY2,
    UYVY,
    YVYU,
}

impl PixelFormat {
    /// 每像素字节数
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::RGBA | PixelFormat::ARGB | PixelFormat::BGRA | PixelFormat::ABGR => 4,
            PixelFormat::RGB | PixelFormat::BGR => 3,
            PixelFormat::YUY2 | PixelFormat::UYVY | PixelFormat::YVYU => 2,
        }
    }
}

/// 播放模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackMode {
    /// 按播放时钟出帧
    #[default]
    Timed,
    /// 每次调用最多前进一帧，不看时间（缩略图、幻灯片等场景）
    Fast,
}

/// 文件结束后的行为
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEndBehavior {
    #[default]
    Wait,
    Loop,
}

/// Seek 模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeekMode {
    /// 从重新同步的关键帧开始出帧，可能略早于目标
    #[default]
    Fast,
    /// 只输出目标时间及之后的帧
    Accurate,
}

/// 解封装输出的压缩帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedFrame {
    pub data: Vec<u8>,
    pub timecode: u64, // 毫秒
    pub track: Track,
    pub keyframe: bool,
    /// Seek 期间：重新同步候选点
    pub sentinel: bool,
    /// Seek 期间：解码但不输出
    pub discard: bool,
    /// Demux 重新定位（Seek 或循环回到开头）之后的第一帧，解码器要先 flush
    pub discontinuity: bool,
}

impl CompressedFrame {
    pub fn new(track: Track, timecode: u64, keyframe: bool, data: Vec<u8>) -> Self {
        Self {
            data,
            timecode,
            track,
            keyframe,
            sentinel: false,
            discard: false,
            discontinuity: false,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// 色度采样布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureLayout {
    I400,
    I420,
    I422,
    I444,
}

impl PictureLayout {
    /// (水平, 垂直) 色度下采样倍数
    pub fn chroma_subsampling(self) -> (usize, usize) {
        match self {
            PictureLayout::I420 => (2, 2),
            PictureLayout::I422 => (2, 1),
            PictureLayout::I400 | PictureLayout::I444 => (1, 1),
        }
    }
}

/// 视频解码器输出的 YUV 图像（8 bit 平面格式）
#[derive(Debug, Clone)]
pub struct Picture {
    pub width: usize,
    pub height: usize,
    pub layout: PictureLayout,
    pub y: Vec<u8>,
    pub u: Vec<u8>,
    pub v: Vec<u8>,
    pub y_stride: usize,
    pub uv_stride: usize,
    pub timecode: u64,
    pub sentinel: bool,
}

/// 转换完成的视频帧
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub data: Vec<u8>,
    pub stride: usize,
    pub width: usize,
    pub height: usize,
    pub timecode: u64, // 显示时间戳（毫秒）
    pub duration: u64, // 帧持续时间（毫秒），未知时为 0
    pub pixel_format: PixelFormat,
    pub color_depth: u8,
    pub sentinel: bool,
}

impl VideoFrame {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// 解码后的音频帧（交错 16 bit PCM）
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub data: Vec<i16>,
    pub timecode: u64, // 显示时间戳（毫秒）
    pub duration: u64, // 毫秒
    pub sample_rate: u32,
    pub channels: u16,
    pub sentinel: bool,
}

impl AudioFrame {
    /// 数据字节数
    pub fn size(&self) -> usize {
        self.data.len() * std::mem::size_of::<i16>()
    }

    /// 每声道采样数
    pub fn samples_per_channel(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.data.len() / self.channels as usize
        }
    }
}

/// 带时间戳的帧，供调度器统一处理音视频
pub trait TimedFrame {
    fn timecode(&self) -> u64;
    fn is_sentinel(&self) -> bool;
    fn mark_sentinel(&mut self);
}

impl TimedFrame for VideoFrame {
    fn timecode(&self) -> u64 {
        self.timecode
    }

    fn is_sentinel(&self) -> bool {
        self.sentinel
    }

    fn mark_sentinel(&mut self) {
        self.sentinel = true;
    }
}

impl TimedFrame for AudioFrame {
    fn timecode(&self) -> u64 {
        self.timecode
    }

    fn is_sentinel(&self) -> bool {
        self.sentinel
    }

    fn mark_sentinel(&mut self) {
        self.sentinel = true;
    }
}

/// 缓冲状态信息（用于监控和调试，数值不保证精确）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferStatus {
    /// 视频压缩帧队列长度
    pub video_packets: usize,

    /// 解码后 YUV 图像队列长度
    pub video_pictures: usize,

    /// 视频自定义处理队列长度
    pub video_custom: usize,

    /// 视频输出队列长度
    pub video_frames: usize,

    /// 音频压缩帧队列长度
    pub audio_packets: usize,

    /// 音频自定义处理队列长度
    pub audio_custom: usize,

    /// 音频输出队列长度
    pub audio_frames: usize,
}
