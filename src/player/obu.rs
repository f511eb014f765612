//! AV1 OBU 扫描
//!
//! WebM 里的 AV1 帧是一个 temporal unit，由若干个带大小字段的 OBU 组成。
//! 这里只关心 OBU 类型，用来判断一帧里有没有 sequence header。

pub const OBU_SEQUENCE_HEADER: u8 = 1;
pub const OBU_TEMPORAL_DELIMITER: u8 = 2;
pub const OBU_FRAME_HEADER: u8 = 3;
pub const OBU_FRAME: u8 = 6;

/// 一个 OBU 的类型和负载
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Obu<'a> {
    pub obu_type: u8,
    pub payload: &'a [u8],
}

/// 读取 LEB128，返回 (值, 字节数)
fn read_leb128(data: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, byte) in data.iter().take(8).enumerate() {
        value |= ((byte & 0x7F) as u64) << (i * 7);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// 按顺序遍历 temporal unit 中的 OBU，遇到损坏数据就停止
pub struct ObuIter<'a> {
    data: &'a [u8],
}

impl<'a> ObuIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for ObuIter<'a> {
    type Item = Obu<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let header = *self.data.first()?;

        // forbidden bit 必须为 0
        if header & 0x80 != 0 {
            self.data = &[];
            return None;
        }

        let obu_type = (header >> 3) & 0x0F;
        let has_extension = (header >> 2) & 1 == 1;
        let has_size = (header >> 1) & 1 == 1;
        let mut offset = if has_extension { 2 } else { 1 };
        if offset > self.data.len() {
            self.data = &[];
            return None;
        }

        let payload = if has_size {
            let Some((size, len)) = read_leb128(&self.data[offset..]) else {
                self.data = &[];
                return None;
            };
            offset += len;
            let end = offset.checked_add(size as usize)?;
            if end > self.data.len() {
                self.data = &[];
                return None;
            }
            let payload = &self.data[offset..end];
            self.data = &self.data[end..];
            payload
        } else {
            // 没有大小字段时占满剩余数据
            let payload = &self.data[offset..];
            self.data = &[];
            payload
        };

        Some(Obu { obu_type, payload })
    }
}

/// 这一帧里是否带有 sequence header OBU
pub fn has_sequence_header(data: &[u8]) -> bool {
    ObuIter::new(data).any(|obu| obu.obu_type == OBU_SEQUENCE_HEADER)
}

/// 构造一个带大小字段的 OBU（主要用于测试和合成数据）
pub fn write_obu(obu_type: u8, payload: &[u8], out: &mut Vec<u8>) {
    out.push((obu_type & 0x0F) << 3 | 0x02);
    let mut size = payload.len() as u64;
    loop {
        let byte = (size & 0x7F) as u8;
        size >>= 7;
        if size == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out.extend_from_slice(payload);
}
