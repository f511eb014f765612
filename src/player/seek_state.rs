//! 视频解码端的 Seek 重新同步状态机
//!
//! AV1 解码器在不连续的输入之后，必须先看到 sequence header 再看到关键帧才能继续解码。
//! Demux 线程在 Seek 期间给压缩帧打上 `sentinel` / `discard` 标记，这里根据标记、
//! 关键帧和 sequence header 决定：是否 flush 解码器、是否把这一帧送进解码器、
//! 解码出的图像怎么处理。

/// 决定状态转移所需的帧特征
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameTraits {
    pub sentinel: bool,
    pub discard: bool,
    pub keyframe: bool,
    pub sequence_header: bool,
    /// Demux 刚刚重新定位过
    pub discontinuity: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SeekState {
    /// 没有在 Seek
    #[default]
    Idle,
    /// 已 flush，还没见到哨兵帧
    AwaitingSentinel,
    /// 见到了哨兵帧，等关键帧
    AwaitingKeyframe,
    /// 哨兵 + 关键帧都有了，等 sequence header
    AwaitingSequenceHeader,
    /// 先见到了 sequence header，还没见到哨兵帧
    HeaderFound,
    /// sequence header + 哨兵帧，等关键帧
    HeaderAndSentinel,
    /// 已重新同步，下一张可输出的图像标记为 Seek 完成
    Resynced,
}

/// 解码出的图像怎么处理
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emit {
    /// 丢弃
    Drop,
    /// 正常放入输出队列
    Queue,
    /// 第一张图像打上 Seek 完成标记后放入输出队列
    Sentinel,
}

/// 处理一帧的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// 送入这一帧之前先 flush 解码器
    pub flush: bool,
    /// 是否把这一帧送进解码器
    pub feed: bool,
    pub emit: Emit,
}

impl SeekState {
    pub fn is_seeking(self) -> bool {
        self != SeekState::Idle
    }

    /// 解码器是否已经拿到了 sequence header
    fn has_header(self) -> bool {
        matches!(
            self,
            SeekState::HeaderFound | SeekState::HeaderAndSentinel | SeekState::Resynced
        )
    }

    fn promote(self, frame: FrameTraits) -> SeekState {
        match self {
            SeekState::AwaitingSentinel if frame.sentinel => SeekState::AwaitingKeyframe,
            SeekState::AwaitingSentinel if frame.sequence_header => SeekState::HeaderFound,
            SeekState::AwaitingKeyframe if frame.keyframe => SeekState::AwaitingSequenceHeader,
            SeekState::AwaitingKeyframe if frame.sequence_header => SeekState::HeaderAndSentinel,
            SeekState::AwaitingSequenceHeader if frame.sequence_header => SeekState::Resynced,
            SeekState::HeaderFound if frame.sentinel => SeekState::HeaderAndSentinel,
            SeekState::HeaderAndSentinel if frame.keyframe => SeekState::Resynced,
            other => other,
        }
    }

    /// 处理一帧压缩数据，返回新状态和要执行的动作
    pub fn advance(self, frame: FrameTraits) -> (SeekState, Step) {
        // 新的 Seek 或循环回绕：上一次没走完的同步过程作废
        let mut flush = frame.discontinuity;
        let mut state = if frame.discontinuity {
            SeekState::Idle
        } else {
            self
        };

        if state == SeekState::Idle {
            if !frame.sentinel && !frame.discard {
                return (
                    SeekState::Idle,
                    Step {
                        flush,
                        feed: true,
                        emit: Emit::Queue,
                    },
                );
            }
            // 第一次见到 Seek 标记：丢掉解码器里的旧状态
            flush = true;
            state = SeekState::AwaitingSentinel;
        }

        // 同一帧可能一次满足多个条件
        loop {
            let next = state.promote(frame);
            if next == state {
                break;
            }
            state = next;
        }

        let emit = if state == SeekState::Resynced && !frame.discard {
            Emit::Sentinel
        } else {
            Emit::Drop
        };

        (
            state,
            Step {
                flush,
                feed: state.has_header(),
                emit,
            },
        )
    }

    /// 带完成标记的图像已经输出
    pub fn landed(self) -> SeekState {
        match self {
            SeekState::Resynced => SeekState::Idle,
            other => other,
        }
    }
}
