//! 视频 / 音频解码阶段和解码器接口

use crate::core::{AudioFrame, CompressedFrame, ErrorState, Message, Picture, Result};
use crate::player::obu;
use crate::player::seek_state::{Emit, FrameTraits, SeekState};
use crate::player::stage::{log_ctx, push_terminator, Control, FlowCounter, FrameQueue};
use log::{debug, info, warn};
use std::sync::Arc;
use thiserror::Error;

/// 解码器返回的软错误，不会上报给调用方
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// 解码器暂时不能接收数据，稍后重试
    #[error("解码器忙，需要重试")]
    TryAgain,

    #[error("数据损坏: {0}")]
    Malformed(String),
}

pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// AV1 视频解码器接口（有状态）
///
/// 不连续的输入（Seek 之后）之前必须先调用 `flush`，之后需要重新看到
/// sequence header 和关键帧才能继续出图。
pub trait VideoDecoder: Send {
    /// 送入一个 temporal unit，返回解码出的图像（可能为空）
    fn decode(&mut self, data: &[u8]) -> DecodeResult<Vec<Picture>>;

    /// 丢弃内部状态和缓存的图像
    fn flush(&mut self);
}

/// Opus 音频解码器接口
pub trait AudioDecoder: Send {
    /// 按输出采样率和声道数初始化，只调用一次
    fn open(&mut self, sample_rate: u32, channels: u16) -> Result<()>;

    /// 解码一个包，返回交错的 16 bit PCM
    fn decode(&mut self, data: &[u8]) -> DecodeResult<Vec<i16>>;
}

/// 解码，忙时重试一次
fn decode_with_retry<T>(mut decode: impl FnMut() -> DecodeResult<T>) -> DecodeResult<T> {
    match decode() {
        Err(DecodeError::TryAgain) => decode(),
        other => other,
    }
}

/// 日志只打印前几个和之后每 100 个
const LOG_FIRST_N: usize = 5;

// ============= 视频解码阶段 =============

pub struct VideoDecodeStage {
    pub decoder: Box<dyn VideoDecoder>,
    pub input: Arc<FrameQueue<CompressedFrame>>,
    pub output: Arc<FrameQueue<Picture>>,
    pub flow: FlowCounter,
    pub errors: Arc<ErrorState>,
}

impl VideoDecodeStage {
    pub fn run(mut self, control: Control) {
        info!("{} 🎞 视频解码线程启动", log_ctx());
        let mut state = SeekState::Idle;
        let mut decoded: usize = 0;

        loop {
            if control.stop_requested() {
                break;
            }
            if self.errors.is_critical() {
                warn!("{} ⚠️ 检测到严重错误，视频解码线程退出", log_ctx());
                push_terminator(&self.output);
                break;
            }

            let frame = match self.input.pop() {
                Message::Frame(frame) => frame,
                Message::Terminate => {
                    self.output.push(Message::Terminate);
                    break;
                }
            };

            let traits = FrameTraits {
                sentinel: frame.sentinel,
                discard: frame.discard,
                keyframe: frame.keyframe,
                sequence_header: obu::has_sequence_header(&frame.data),
                discontinuity: frame.discontinuity,
            };
            let (next, step) = state.advance(traits);
            if next != state {
                debug!("{} Seek 状态 {:?} -> {:?} @{}ms", log_ctx(), state, next, frame.timecode);
            }
            state = next;

            if step.flush {
                info!("{} 🔄 输入不连续 @{}ms，flush 视频解码器", log_ctx(), frame.timecode);
                self.decoder.flush();
            }

            if step.feed {
                match decode_with_retry(|| self.decoder.decode(&frame.data)) {
                    Ok(pictures) => {
                        for mut picture in pictures {
                            picture.timecode = frame.timecode;
                            match step.emit {
                                Emit::Drop => continue,
                                Emit::Sentinel if state == SeekState::Resynced => {
                                    info!("{} ✓ 视频重新同步完成 @{}ms", log_ctx(), frame.timecode);
                                    picture.sentinel = true;
                                    state = state.landed();
                                }
                                _ => {}
                            }

                            decoded += 1;
                            if decoded <= LOG_FIRST_N || decoded % 100 == 0 {
                                debug!("{} 🖼 视频帧 #{} @{}ms", log_ctx(), decoded, picture.timecode);
                            }
                            self.flow.produced(1);
                            self.output.push(Message::Frame(picture));
                        }
                    }
                    Err(e) => debug!("{} 跳过视频帧 @{}ms: {}", log_ctx(), frame.timecode, e),
                }
            }

            // 压缩帧已经处理完
            self.flow.consumed();
        }

        info!("{} 🛑 视频解码线程退出（共输出 {} 帧）", log_ctx(), decoded);
    }
}

// ============= 音频解码阶段 =============

pub struct AudioDecodeStage {
    pub decoder: Box<dyn AudioDecoder>,
    pub sample_rate: u32,
    pub channels: u16,
    pub input: Arc<FrameQueue<CompressedFrame>>,
    pub output: Arc<FrameQueue<AudioFrame>>,
    pub flow: FlowCounter,
    pub errors: Arc<ErrorState>,
}

impl AudioDecodeStage {
    pub fn run(mut self, control: Control) {
        info!(
            "{} 🔊 音频解码线程启动: {}Hz {} 声道",
            log_ctx(),
            self.sample_rate,
            self.channels
        );
        let mut decoded: usize = 0;

        loop {
            if control.stop_requested() {
                break;
            }
            if self.errors.is_critical() {
                warn!("{} ⚠️ 检测到严重错误，音频解码线程退出", log_ctx());
                push_terminator(&self.output);
                break;
            }

            let frame = match self.input.pop() {
                Message::Frame(frame) => frame,
                Message::Terminate => {
                    self.output.push(Message::Terminate);
                    break;
                }
            };

            match decode_with_retry(|| self.decoder.decode(&frame.data)) {
                Ok(samples) if !frame.discard => {
                    let audio = self.make_frame(samples, &frame);
                    decoded += 1;
                    if decoded <= LOG_FIRST_N || decoded % 100 == 0 {
                        debug!(
                            "{} 🔊 音频帧 #{} @{}ms ({}ms)",
                            log_ctx(),
                            decoded,
                            audio.timecode,
                            audio.duration
                        );
                    }
                    self.flow.produced(1);
                    self.output.push(Message::Frame(audio));
                }
                Ok(_) => {}
                Err(e) => debug!("{} 跳过音频帧 @{}ms: {}", log_ctx(), frame.timecode, e),
            }

            self.flow.consumed();
        }

        info!("{} 🛑 音频解码线程退出（共输出 {} 帧）", log_ctx(), decoded);
    }

    fn make_frame(&self, samples: Vec<i16>, frame: &CompressedFrame) -> AudioFrame {
        let per_channel = samples.len() as u64 / self.channels.max(1) as u64;
        AudioFrame {
            duration: per_channel * 1000 / self.sample_rate.max(1) as u64,
            data: samples,
            timecode: frame.timecode,
            sample_rate: self.sample_rate,
            channels: self.channels,
            sentinel: frame.sentinel,
        }
    }
}
