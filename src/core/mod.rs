// 核心数据结构和类型定义

pub mod clock;
pub mod error;
pub mod queue;
pub mod settings;
pub mod types;

pub use clock::*;
pub use error::*;
pub use queue::{BoundedQueue, Message};
pub use settings::*;
pub use types::*;
