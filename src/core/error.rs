use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("无法打开文件: {0}")]
    OpenError(String),

    #[error("配置无效: {0}")]
    InvalidSettings(String),

    #[error("配置文件解析失败: {0}")]
    SettingsParse(#[from] serde_json::Error),

    #[error("队列容量必须大于 0")]
    ZeroCapacity,

    #[error("内存分配失败: {0}")]
    Allocation(String),

    #[error("容器数据损坏: {0}")]
    Malformed(String),

    #[error("解码错误: {0}")]
    DecodeError(String),

    #[error("无法找到视频流")]
    NoVideoStream,

    #[error("无法找到音频流")]
    NoAudioStream,

    #[error("未请求{0}轨道")]
    TrackNotRequested(&'static str),

    #[error("已经在播放")]
    AlreadyPlaying,

    #[error("已经暂停")]
    AlreadyPaused,

    #[error("正在 Seek，请稍后再试")]
    SeekInProgress,

    #[error("FAST 模式下不能设置播放速度")]
    SpeedInFastMode,

    #[error("播放速度无效: {0}")]
    InvalidSpeed(f64),

    #[error("时长未知")]
    DurationUnknown,

    #[error("严重错误，播放上下文已失效: {0}")]
    Critical(String),

    #[error("其他错误: {0}")]
    Other(String),
}

impl PlayerError {
    /// 对外的负数错误码，保持稳定
    pub fn code(&self) -> i32 {
        match self {
            PlayerError::IoError(_) => -1,
            PlayerError::OpenError(_) => -2,
            PlayerError::InvalidSettings(_) | PlayerError::SettingsParse(_) => -3,
            PlayerError::ZeroCapacity => -4,
            PlayerError::Allocation(_) => -5,
            PlayerError::Malformed(_) => -6,
            PlayerError::DecodeError(_) => -7,
            PlayerError::NoVideoStream | PlayerError::NoAudioStream => -8,
            PlayerError::TrackNotRequested(_) => -9,
            PlayerError::AlreadyPlaying | PlayerError::AlreadyPaused => -10,
            PlayerError::SeekInProgress => -11,
            PlayerError::SpeedInFastMode | PlayerError::InvalidSpeed(_) => -12,
            PlayerError::DurationUnknown => -13,
            PlayerError::Critical(_) => -100,
            PlayerError::Other(_) => -99,
        }
    }

    /// 是否会让整个上下文失效
    pub fn is_critical(&self) -> bool {
        matches!(self, PlayerError::Allocation(_) | PlayerError::Critical(_))
    }
}

pub type Result<T> = std::result::Result<T, PlayerError>;

/// 上下文级别的错误状态，在各阶段线程与调用方之间共享
///
/// 严重错误标志一旦置位就不会再清除，之后所有公开操作都直接失败。
#[derive(Debug, Default)]
pub struct ErrorState {
    critical: AtomicBool,
    message: Mutex<Option<String>>,
}

impl ErrorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录最近一次错误信息
    pub fn record(&self, message: impl Into<String>) {
        *self.message.lock() = Some(message.into());
    }

    /// 置位严重错误标志
    pub fn raise_critical(&self, message: impl Into<String>) {
        self.record(message);
        self.critical.store(true, Ordering::SeqCst);
    }

    pub fn is_critical(&self) -> bool {
        self.critical.load(Ordering::SeqCst)
    }

    pub fn last_message(&self) -> Option<String> {
        self.message.lock().clone()
    }

    /// 严重错误时返回 `Err(Critical)`
    pub fn check(&self) -> Result<()> {
        if self.is_critical() {
            let msg = self.last_message().unwrap_or_default();
            return Err(PlayerError::Critical(msg));
        }
        Ok(())
    }
}
