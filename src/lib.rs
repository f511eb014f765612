//! AV1 + Opus WebM 播放引擎
//!
//! 多线程流水线：Demux -> 视频解码 -> 颜色转换 -> [自定义处理] 和
//! Demux -> 音频解码 -> [自定义处理]，调用方通过 [`Player`] 按播放时钟拉取当前帧。
//! AV1 / Opus 解码器由调用方通过 [`VideoDecoder`] / [`AudioDecoder`] 提供。

pub mod core;
pub mod player;

pub use crate::core::{
    AudioFrame, BufferStatus, CodecTarget, FileEndBehavior, Picture, PictureLayout, PixelFormat,
    PlaybackMode, PlayerError, ProcessingHooks, Result, SeekMode, Settings, VideoFrame,
};
pub use crate::player::{
    AudioDecoder, Codecs, ColorConverter, DecodeError, DecodeResult, Player, VideoDecoder,
};

/// 库版本
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
