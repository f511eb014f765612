use crate::core::{CompressedFrame, Result, Track};

/// 解封装事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemuxEvent {
    /// 读到了一个新 Cluster 的时间码，`offset` 是该 Cluster 在文件中的字节位置
    Cluster { timecode: u64, offset: u64 },
    /// 一个压缩帧
    Frame(CompressedFrame),
}

/// Demuxer 数据源抽象接口
///
/// 解封装线程只通过这个 trait 访问容器，不关心具体的元素解析。
pub trait DemuxerSource: Send {
    /// 读取下一个事件
    ///
    /// 返回：
    /// - Ok(Some(event)): 成功读取
    /// - Ok(None): 到达文件末尾
    /// - Err(PlayerError::Malformed(_)): 这一段数据损坏，已经跳过，可以继续读取
    /// - Err(e): 其它读取错误
    fn next_event(&mut self) -> Result<Option<DemuxEvent>>;

    /// 把读取位置移动到某个 Cluster 的起始字节
    fn seek_to_offset(&mut self, offset: u64) -> Result<()>;

    /// 回到第一个 Cluster
    fn rewind(&mut self) -> Result<()>;

    /// 容器声明的时长（毫秒）
    fn duration_ms(&self) -> Option<u64>;

    /// 文件中是否存在该轨道
    fn has_track(&self, track: Track) -> bool;

    /// 获取描述信息（用于调试）
    fn description(&self) -> String;
}
