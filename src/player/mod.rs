// 播放器核心模块：解封装、解码、转换、自定义处理、流水线管理和帧调度

pub mod convert;
pub mod custom;
pub mod decoder;
pub mod demuxer;
pub mod demuxer_source; // Demuxer 抽象接口
pub mod demuxer_thread; // Demuxer 线程管理
pub mod manager;
pub mod obu;
pub mod playback;
pub mod scheduler;
pub mod seek_state;
pub mod stage;

pub use convert::{ColorConverter, YuvConverter};
pub use decoder::{AudioDecoder, DecodeError, DecodeResult, VideoDecoder};
pub use demuxer::WebmDemuxer;
pub use demuxer_source::{DemuxEvent, DemuxerSource};
pub use demuxer_thread::DemuxerThread;
pub use manager::{Codecs, PipelineManager};
pub use playback::Player;
