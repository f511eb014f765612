//! 用户自定义处理阶段：在帧交给调度器之前调用回调

use crate::core::{ErrorState, Message, Result, TimedFrame};
use crate::player::stage::{log_ctx, push_terminator, Control, FlowCounter, FrameQueue};
use log::{error, info, warn};
use std::sync::Arc;

pub type Hook<F> = Box<dyn FnMut(F) -> Result<Option<F>> + Send>;

pub struct CustomStage<F> {
    pub name: &'static str,
    pub hook: Hook<F>,
    pub input: Arc<FrameQueue<F>>,
    pub output: Arc<FrameQueue<F>>,
    pub flow: FlowCounter,
    pub errors: Arc<ErrorState>,
}

impl<F: TimedFrame + Send + 'static> CustomStage<F> {
    pub fn run(mut self, control: Control) {
        info!("{} 🧩 {}自定义处理线程启动", log_ctx(), self.name);
        let mut processed: usize = 0;
        // 回调丢掉了哨兵帧，完成标记转移到下一个输出的帧上
        let mut carry_sentinel = false;

        loop {
            if control.stop_requested() {
                break;
            }
            if self.errors.is_critical() {
                warn!("{} ⚠️ 检测到严重错误，{}自定义处理线程退出", log_ctx(), self.name);
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
            let sentinel = frame.is_sentinel();
            let timecode = frame.timecode();

            match (self.hook)(frame) {
                Ok(Some(mut out)) => {
                    if carry_sentinel {
                        out.mark_sentinel();
                        carry_sentinel = false;
                    }
                    processed += 1;
                    self.flow.produced(1);
                    self.output.push(Message::Frame(out));
                }
                Ok(None) => carry_sentinel |= sentinel,
                Err(e) => {
                    error!("{} ❌ {}自定义处理失败 @{}ms: {}", log_ctx(), self.name, timecode, e);
                    self.errors.record(e.to_string());
                    self.flow.consumed();
                    push_terminator(&self.output);
                    break;
                }
            }
            self.flow.consumed();
        }

        info!(
            "{} 🛑 {}自定义处理线程退出（共处理 {} 帧）",
            log_ctx(),
            self.name,
            processed
        );
    }
}
