use crate::core::{CompressedFrame, PlayerError, Result, Track};
use crate::player::demuxer_source::{DemuxEvent, DemuxerSource};
use log::{debug, info, warn};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

/// 用到的 EBML / WebM 元素 ID（包含 VINT 标记位）
mod ids {
    pub const EBML: u32 = 0x1A45DFA3;
    pub const DOC_TYPE: u32 = 0x4282;
    pub const SEGMENT: u32 = 0x18538067;
    pub const INFO: u32 = 0x1549A966;
    pub const TIMECODE_SCALE: u32 = 0x2AD7B1;
    pub const DURATION: u32 = 0x4489;
    pub const TRACKS: u32 = 0x1654AE6B;
    pub const TRACK_ENTRY: u32 = 0xAE;
    pub const TRACK_NUMBER: u32 = 0xD7;
    pub const CODEC_ID: u32 = 0x86;
    pub const CODEC_DELAY: u32 = 0x56AA;
    pub const CLUSTER: u32 = 0x1F43B675;
    pub const TIMECODE: u32 = 0xE7;
    pub const SIMPLE_BLOCK: u32 = 0xA3;
    pub const BLOCK_GROUP: u32 = 0xA0;
    pub const BLOCK: u32 = 0xA1;
    pub const REFERENCE_BLOCK: u32 = 0xFB;
}

const DEFAULT_TIMECODE_SCALE: u64 = 1_000_000;

/// 单个元素的大小上限，防止损坏的文件导致巨量分配
const MAX_ELEMENT_SIZE: u64 = 64 * 1024 * 1024;

pub const AV1_CODEC_ID: &str = "V_AV1";
pub const OPUS_CODEC_ID: &str = "A_OPUS";

/// 解析 VINT，返回 (去掉标记位的值, 字节数, 是否全 1)
fn parse_vint(data: &[u8]) -> Option<(u64, usize, bool)> {
    let first = *data.first()?;
    if first == 0 {
        return None;
    }
    let len = first.leading_zeros() as usize + 1;
    if data.len() < len {
        return None;
    }
    let mask = 0xFFu8 >> len;
    let mut value = (first & mask) as u64;
    for byte in &data[1..len] {
        value = (value << 8) | *byte as u64;
    }
    let all_ones = value == (1u64 << (7 * len)) - 1;
    Some((value, len, all_ones))
}

/// 解析元素 ID（保留标记位，最长 4 字节）
fn parse_id(data: &[u8]) -> Option<(u32, usize)> {
    let first = *data.first()?;
    if first == 0 {
        return None;
    }
    let len = first.leading_zeros() as usize + 1;
    if len > 4 || data.len() < len {
        return None;
    }
    let id = data[..len]
        .iter()
        .fold(0u32, |acc, byte| (acc << 8) | *byte as u32);
    Some((id, len))
}

/// 把一段主元素内容拆成 (ID, 内容) 列表
fn children(mut data: &[u8]) -> Result<Vec<(u32, &[u8])>> {
    let mut out = Vec::new();
    while !data.is_empty() {
        let (id, id_len) =
            parse_id(data).ok_or_else(|| PlayerError::Malformed("元素 ID 无效".into()))?;
        let (size, size_len, unknown) = parse_vint(&data[id_len..])
            .ok_or_else(|| PlayerError::Malformed("元素大小无效".into()))?;
        if unknown {
            return Err(PlayerError::Malformed(format!(
                "子元素 0x{:X} 的大小未知",
                id
            )));
        }
        let start = id_len + size_len;
        let end = start
            .checked_add(size as usize)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| PlayerError::Malformed(format!("子元素 0x{:X} 越界", id)))?;
        out.push((id, &data[start..end]));
        data = &data[end..];
    }
    Ok(out)
}

fn read_uint(data: &[u8]) -> Result<u64> {
    if data.len() > 8 {
        return Err(PlayerError::Malformed("整数元素超过 8 字节".into()));
    }
    Ok(data.iter().fold(0u64, |acc, byte| (acc << 8) | *byte as u64))
}

fn read_float(data: &[u8]) -> Result<f64> {
    match data.len() {
        0 => Ok(0.0),
        4 => Ok(f32::from_be_bytes([data[0], data[1], data[2], data[3]]) as f64),
        8 => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(data);
            Ok(f64::from_be_bytes(bytes))
        }
        n => Err(PlayerError::Malformed(format!("浮点元素长度无效: {}", n))),
    }
}

#[derive(Debug, Clone, Copy)]
struct ElementHeader {
    id: u32,
    size: Option<u64>,
    offset: u64,
}

#[derive(Debug, Clone, Default)]
struct TrackEntry {
    number: u64,
    codec_id: String,
    codec_delay_ns: u64,
}

/// WebM 解封装器 - 只认识 AV1 视频和 Opus 音频轨道
///
/// 顺序扫描 Cluster，把 SimpleBlock / BlockGroup 转成带毫秒时间码的压缩帧。
/// 每进入一个 Cluster 会先产出一个 `DemuxEvent::Cluster`，上层据此记录 Cue 点。
pub struct WebmDemuxer<R> {
    reader: BufReader<R>,
    pos: u64,
    timecode_scale: u64,
    duration_ms: Option<u64>,
    video_track: Option<TrackEntry>,
    audio_track: Option<TrackEntry>,
    first_cluster_offset: u64,
    cluster_offset: u64,
    cluster_timecode: u64,
    source: String,
}

impl WebmDemuxer<File> {
    /// 打开本地文件
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("正在打开文件: {}", path.display());
        let file = File::open(path).map_err(|e| {
            PlayerError::OpenError(format!("无法打开文件 {}: {}", path.display(), e))
        })?;
        Self::new(file, path.display().to_string())
    }
}

impl<R: Read + Seek> WebmDemuxer<R> {
    /// 从任意可 Seek 的数据源创建，立即解析文件头和轨道信息
    pub fn new(reader: R, source: impl Into<String>) -> Result<Self> {
        let mut demuxer = Self {
            reader: BufReader::new(reader),
            pos: 0,
            timecode_scale: DEFAULT_TIMECODE_SCALE,
            duration_ms: None,
            video_track: None,
            audio_track: None,
            first_cluster_offset: 0,
            cluster_offset: 0,
            cluster_timecode: 0,
            source: source.into(),
        };

        demuxer.read_headers().map_err(|e| match e {
            PlayerError::OpenError(_) => e,
            other => PlayerError::OpenError(format!("文件头解析失败: {}", other)),
        })?;

        info!(
            "✓ WebM 打开成功: {} (视频: {}, 音频: {}, 时长: {:?}ms)",
            demuxer.source,
            demuxer.video_track.is_some(),
            demuxer.audio_track.is_some(),
            demuxer.duration_ms
        );
        Ok(demuxer)
    }

    fn read_headers(&mut self) -> Result<()> {
        let header = self
            .read_header()?
            .ok_or_else(|| PlayerError::OpenError("文件为空".into()))?;
        if header.id != ids::EBML {
            return Err(PlayerError::OpenError("不是 EBML 文件".into()));
        }
        let body = self.read_body(header)?;
        let doc_type = children(&body)?
            .into_iter()
            .find(|(id, _)| *id == ids::DOC_TYPE)
            .map(|(_, data)| String::from_utf8_lossy(data).trim_end_matches('\0').to_string())
            .unwrap_or_default();
        if doc_type != "webm" && doc_type != "matroska" {
            return Err(PlayerError::OpenError(format!(
                "不支持的文档类型: {:?}",
                doc_type
            )));
        }

        let segment = self
            .read_header()?
            .ok_or_else(|| PlayerError::OpenError("缺少 Segment".into()))?;
        if segment.id != ids::SEGMENT {
            return Err(PlayerError::OpenError("缺少 Segment".into()));
        }

        // 读取到第一个 Cluster 为止
        loop {
            let Some(header) = self.read_header()? else {
                self.first_cluster_offset = self.pos;
                break;
            };
            match header.id {
                ids::CLUSTER => {
                    self.first_cluster_offset = header.offset;
                    self.seek_to(header.offset)?;
                    break;
                }
                ids::INFO => {
                    let body = self.read_body(header)?;
                    self.parse_info(&body)?;
                }
                ids::TRACKS => {
                    let body = self.read_body(header)?;
                    self.parse_tracks(&body)?;
                }
                _ => match header.size {
                    Some(size) => self.skip(size)?,
                    None => {
                        return Err(PlayerError::Malformed(format!(
                            "顶层元素 0x{:X} 大小未知",
                            header.id
                        )))
                    }
                },
            }
        }

        if let Some(duration) = self.duration_ms {
            debug!("时长: {}ms, TimecodeScale: {}", duration, self.timecode_scale);
        }
        if self.video_track.is_none() && self.audio_track.is_none() {
            return Err(PlayerError::OpenError("没有找到 AV1 或 Opus 轨道".into()));
        }
        Ok(())
    }

    fn parse_info(&mut self, body: &[u8]) -> Result<()> {
        let mut raw_duration = None;
        for (id, data) in children(body)? {
            match id {
                ids::TIMECODE_SCALE => {
                    let scale = read_uint(data)?;
                    if scale > 0 {
                        self.timecode_scale = scale;
                    }
                }
                ids::DURATION => raw_duration = Some(read_float(data)?),
                _ => {}
            }
        }
        // Duration 的单位是 TimecodeScale，必须等 Info 全部读完再换算
        self.duration_ms = raw_duration
            .filter(|d| d.is_finite() && *d >= 0.0)
            .map(|d| (d * self.timecode_scale as f64 / 1_000_000.0) as u64);
        Ok(())
    }

    fn parse_tracks(&mut self, body: &[u8]) -> Result<()> {
        for (id, data) in children(body)? {
            if id != ids::TRACK_ENTRY {
                continue;
            }
            let mut entry = TrackEntry::default();
            for (child, value) in children(data)? {
                match child {
                    ids::TRACK_NUMBER => entry.number = read_uint(value)?,
                    ids::CODEC_ID => {
                        entry.codec_id = String::from_utf8_lossy(value)
                            .trim_end_matches('\0')
                            .to_string()
                    }
                    ids::CODEC_DELAY => entry.codec_delay_ns = read_uint(value)?,
                    _ => {}
                }
            }

            debug!("轨道 #{}: {}", entry.number, entry.codec_id);
            if entry.codec_id == AV1_CODEC_ID {
                self.video_track.get_or_insert(entry);
            } else if entry.codec_id == OPUS_CODEC_ID {
                self.audio_track.get_or_insert(entry);
            }
        }
        Ok(())
    }

    // ============= 底层读取 =============

    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        self.reader.read_exact(buf)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    /// 读取元素头，在元素边界遇到文件末尾时返回 `None`
    fn read_header(&mut self) -> Result<Option<ElementHeader>> {
        let offset = self.pos;
        let mut first = [0u8; 1];
        match self.reader.read(&mut first)? {
            0 => return Ok(None),
            _ => self.pos += 1,
        }

        let id_len = first[0].leading_zeros() as usize + 1;
        if first[0] == 0 || id_len > 4 {
            return Err(PlayerError::Malformed(format!(
                "偏移 {} 处的元素 ID 无效",
                offset
            )));
        }
        let mut id_bytes = [0u8; 4];
        id_bytes[0] = first[0];
        self.fill(&mut id_bytes[1..id_len])?;
        let (id, _) = parse_id(&id_bytes[..id_len])
            .ok_or_else(|| PlayerError::Malformed("元素 ID 无效".into()))?;

        let mut size_bytes = [0u8; 8];
        self.fill(&mut size_bytes[..1])?;
        if size_bytes[0] == 0 {
            return Err(PlayerError::Malformed(format!(
                "偏移 {} 处的元素大小无效",
                offset
            )));
        }
        let size_len = size_bytes[0].leading_zeros() as usize + 1;
        self.fill(&mut size_bytes[1..size_len])?;
        let (size, _, unknown) = parse_vint(&size_bytes[..size_len])
            .ok_or_else(|| PlayerError::Malformed("元素大小无效".into()))?;

        Ok(Some(ElementHeader {
            id,
            size: if unknown { None } else { Some(size) },
            offset,
        }))
    }

    fn read_body(&mut self, header: ElementHeader) -> Result<Vec<u8>> {
        let size = header.size.ok_or_else(|| {
            PlayerError::Malformed(format!("元素 0x{:X} 大小未知", header.id))
        })?;
        if size > MAX_ELEMENT_SIZE {
            self.skip(size)?;
            return Err(PlayerError::Malformed(format!(
                "元素 0x{:X} 过大: {} 字节",
                header.id, size
            )));
        }
        let mut body = vec![0u8; size as usize];
        self.fill(&mut body)?;
        Ok(body)
    }

    fn skip(&mut self, size: u64) -> Result<()> {
        let offset = i64::try_from(size)
            .map_err(|_| PlayerError::Malformed(format!("跳过长度无效: {}", size)))?;
        self.reader.seek_relative(offset)?;
        self.pos += size;
        Ok(())
    }

    fn seek_to(&mut self, offset: u64) -> Result<()> {
        self.reader.seek(SeekFrom::Start(offset))?;
        self.pos = offset;
        Ok(())
    }

    // ============= Cluster / Block =============

    fn ticks_to_ms(&self, ticks: i128) -> u64 {
        (ticks.max(0) * self.timecode_scale as i128 / 1_000_000) as u64
    }

    fn parse_block(&self, data: &[u8], keyframe: Option<bool>) -> Result<Option<CompressedFrame>> {
        let (track_number, len, _) =
            parse_vint(data).ok_or_else(|| PlayerError::Malformed("Block 轨道号无效".into()))?;
        if data.len() < len + 3 {
            return Err(PlayerError::Malformed("Block 头太短".into()));
        }
        let relative = i16::from_be_bytes([data[len], data[len + 1]]);
        let flags = data[len + 2];

        let (track, entry) = match (&self.video_track, &self.audio_track) {
            (Some(video), _) if video.number == track_number => (Track::Video, video),
            (_, Some(audio)) if audio.number == track_number => (Track::Audio, audio),
            _ => return Ok(None),
        };

        if (flags >> 1) & 0x03 != 0 {
            return Err(PlayerError::Malformed(format!(
                "{}轨道的 Block 使用了 lacing，不支持",
                track
            )));
        }

        let keyframe = keyframe.unwrap_or(flags & 0x80 != 0);
        let ns = (self.cluster_timecode as i128 + relative as i128) * self.timecode_scale as i128
            - entry.codec_delay_ns as i128;
        let timecode = (ns.max(0) / 1_000_000) as u64;

        Ok(Some(CompressedFrame::new(
            track,
            timecode,
            keyframe,
            data[len + 3..].to_vec(),
        )))
    }

    fn read_event(&mut self) -> Result<Option<DemuxEvent>> {
        loop {
            let Some(header) = self.read_header()? else {
                return Ok(None);
            };

            match header.id {
                // Cluster 是容器：进入它，继续读子元素
                ids::CLUSTER => {
                    self.cluster_offset = header.offset;
                    self.cluster_timecode = 0;
                }
                ids::TIMECODE => {
                    let body = self.read_body(header)?;
                    self.cluster_timecode = read_uint(&body)?;
                    return Ok(Some(DemuxEvent::Cluster {
                        timecode: self.ticks_to_ms(self.cluster_timecode as i128),
                        offset: self.cluster_offset,
                    }));
                }
                ids::SIMPLE_BLOCK => {
                    let body = self.read_body(header)?;
                    if let Some(frame) = self.parse_block(&body, None)? {
                        return Ok(Some(DemuxEvent::Frame(frame)));
                    }
                }
                ids::BLOCK_GROUP => {
                    let body = self.read_body(header)?;
                    let mut block = None;
                    let mut has_reference = false;
                    for (id, data) in children(&body)? {
                        match id {
                            ids::BLOCK => block = Some(data),
                            ids::REFERENCE_BLOCK => has_reference = true,
                            _ => {}
                        }
                    }
                    if let Some(data) = block {
                        if let Some(frame) = self.parse_block(data, Some(!has_reference))? {
                            return Ok(Some(DemuxEvent::Frame(frame)));
                        }
                    }
                }
                // 大小未知的其他主元素：直接扫描它的子元素
                _ => {
                    if let Some(size) = header.size {
                        self.skip(size)?;
                    }
                }
            }
        }
    }
}

impl<R: Read + Seek + Send> DemuxerSource for WebmDemuxer<R> {
    fn next_event(&mut self) -> Result<Option<DemuxEvent>> {
        match self.read_event() {
            Err(PlayerError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!("⚠️ 文件在偏移 {} 处被截断，按文件末尾处理", self.pos);
                Ok(None)
            }
            other => other,
        }
    }

    fn seek_to_offset(&mut self, offset: u64) -> Result<()> {
        debug!("Demuxer 跳转到偏移 {}", offset);
        self.seek_to(offset)
    }

    fn rewind(&mut self) -> Result<()> {
        self.seek_to(self.first_cluster_offset)
    }

    fn duration_ms(&self) -> Option<u64> {
        self.duration_ms
    }

    fn has_track(&self, track: Track) -> bool {
        match track {
            Track::Video => self.video_track.is_some(),
            Track::Audio => self.audio_track.is_some(),
        }
    }

    fn description(&self) -> String {
        format!("WebM: {}", self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// 用 8 字节大小字段拼一个元素
    fn el(id: &[u8], body: &[u8]) -> Vec<u8> {
        let mut out = id.to_vec();
        out.push(0x01);
        out.extend_from_slice(&(body.len() as u64).to_be_bytes()[1..]);
        out.extend_from_slice(body);
        out
    }

    fn block(track: u8, relative: i16, flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0x80 | track];
        out.extend_from_slice(&relative.to_be_bytes());
        out.push(flags);
        out.extend_from_slice(payload);
        out
    }

    fn sample_file() -> Vec<u8> {
        let mut file = el(&[0x1A, 0x45, 0xDF, 0xA3], &el(&[0x42, 0x82], b"webm"));

        let mut info = el(&[0x2A, 0xD7, 0xB1], &[0x0F, 0x42, 0x40]);
        info.extend(el(&[0x44, 0x89], &2000.0f64.to_be_bytes()));

        let mut video = el(&[0xD7], &[1]);
        video.extend(el(&[0x86], b"V_AV1"));
        let mut audio = el(&[0xD7], &[2]);
        audio.extend(el(&[0x86], b"A_OPUS"));
        audio.extend(el(&[0x56, 0xAA], &6_500_000u32.to_be_bytes()));
        let mut tracks = el(&[0xAE], &video);
        tracks.extend(el(&[0xAE], &audio));

        let mut cluster = el(&[0xE7], &[0x03, 0xE8]); // 1000
        cluster.extend(el(&[0xA3], &block(1, 0, 0x80, b"key")));
        cluster.extend(el(&[0xA3], &block(2, 10, 0x80, b"opus")));
        cluster.extend(el(&[0xA3], &block(3, 20, 0x80, b"other track")));
        cluster.extend(el(&[0xA3], &block(1, 40, 0x82, b"laced")));
        let mut group = el(&[0xA1], &block(1, 80, 0x00, b"inter"));
        group.extend(el(&[0xFB], &[0xD8]));
        cluster.extend(el(&[0xA0], &group));

        let mut segment = el(&[0x15, 0x49, 0xA9, 0x66], &info);
        segment.extend(el(&[0x16, 0x54, 0xAE, 0x6B], &tracks));
        segment.extend(el(&[0x1F, 0x43, 0xB6, 0x75], &cluster));
        file.extend(el(&[0x18, 0x53, 0x80, 0x67], &segment));
        file
    }

    #[test]
    fn test_parse_vint() {
        assert_eq!(parse_vint(&[0x81]), Some((1, 1, false)));
        assert_eq!(parse_vint(&[0x40, 0x02]), Some((2, 2, false)));
        assert_eq!(parse_vint(&[0xFF]), Some((0x7F, 1, true)));
        assert_eq!(parse_vint(&[0x00]), None);
        assert_eq!(parse_vint(&[0x40]), None);
        assert_eq!(parse_id(&[0x1A, 0x45, 0xDF, 0xA3]), Some((ids::EBML, 4)));
    }

    #[test]
    fn test_read_events() {
        let mut demuxer = WebmDemuxer::new(Cursor::new(sample_file()), "内存").unwrap();
        assert_eq!(demuxer.duration_ms(), Some(2000));
        assert!(demuxer.has_track(Track::Video));
        assert!(demuxer.has_track(Track::Audio));

        let cluster_offset = demuxer.first_cluster_offset;
        assert_eq!(
            demuxer.next_event().unwrap(),
            Some(DemuxEvent::Cluster {
                timecode: 1000,
                offset: cluster_offset
            })
        );

        let Some(DemuxEvent::Frame(key)) = demuxer.next_event().unwrap() else {
            panic!("应为视频帧");
        };
        assert_eq!((key.track, key.timecode, key.keyframe), (Track::Video, 1000, true));
        assert_eq!(key.data, b"key");

        // Opus 轨道减去 6.5ms 的 CodecDelay
        let Some(DemuxEvent::Frame(opus)) = demuxer.next_event().unwrap() else {
            panic!("应为音频帧");
        };
        assert_eq!((opus.track, opus.timecode), (Track::Audio, 1003));

        // 未知轨道被跳过，lacing 作为软错误报告
        assert!(matches!(
            demuxer.next_event(),
            Err(PlayerError::Malformed(_))
        ));

        let Some(DemuxEvent::Frame(inter)) = demuxer.next_event().unwrap() else {
            panic!("应为 BlockGroup 帧");
        };
        assert_eq!((inter.timecode, inter.keyframe), (1080, false));

        assert_eq!(demuxer.next_event().unwrap(), None);

        // 回到开头重新读
        demuxer.rewind().unwrap();
        assert!(matches!(
            demuxer.next_event().unwrap(),
            Some(DemuxEvent::Cluster { timecode: 1000, .. })
        ));
    }

    #[test]
    fn test_truncated_file_ends_cleanly() {
        let mut data = sample_file();
        data.truncate(data.len() - 6);
        let mut demuxer = WebmDemuxer::new(Cursor::new(data), "截断").unwrap();
        let mut events = 0;
        loop {
            match demuxer.next_event() {
                Ok(Some(_)) => events += 1,
                Ok(None) => break,
                Err(PlayerError::Malformed(_)) => continue,
                Err(e) => panic!("意外错误: {e}"),
            }
        }
        assert!(events >= 3);
    }

    #[test]
    fn test_rejects_non_webm() {
        assert!(matches!(
            WebmDemuxer::new(Cursor::new(b"RIFF....WAVE".to_vec()), "wav"),
            Err(PlayerError::OpenError(_))
        ));
        assert!(matches!(
            WebmDemuxer::new(Cursor::new(Vec::new()), "空"),
            Err(PlayerError::OpenError(_))
        ));
    }
}
