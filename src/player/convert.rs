//! 颜色空间转换：解码器输出的 YUV 平面图像 -> 输出像素格式

use crate::core::{
    ErrorState, Message, Picture, PictureLayout, PixelFormat, PlayerError, Result, VideoFrame,
};
use crate::player::stage::{log_ctx, push_terminator, Control, FlowCounter, FrameQueue};
use log::{debug, error, info, warn};
use std::sync::Arc;

/// 颜色转换接口
pub trait ColorConverter: Send {
    fn convert(&mut self, picture: &Picture, format: PixelFormat) -> Result<VideoFrame>;
}

/// BT.601 limited range，8 bit 输入
#[derive(Debug, Default, Clone, Copy)]
pub struct YuvConverter;

#[inline]
fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    [
        clamp_u8((298 * c + 409 * e + 128) >> 8),
        clamp_u8((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp_u8((298 * c + 516 * d + 128) >> 8),
    ]
}

fn write_rgb(format: PixelFormat, [r, g, b]: [u8; 3], px: &mut [u8]) {
    match format {
        PixelFormat::RGBA => px.copy_from_slice(&[r, g, b, 255]),
        PixelFormat::ARGB => px.copy_from_slice(&[255, r, g, b]),
        PixelFormat::BGRA => px.copy_from_slice(&[b, g, r, 255]),
        PixelFormat::ABGR => px.copy_from_slice(&[255, b, g, r]),
        PixelFormat::RGB => px.copy_from_slice(&[r, g, b]),
        PixelFormat::BGR => px.copy_from_slice(&[b, g, r]),
        PixelFormat::YUY2 | PixelFormat::UYVY | PixelFormat::YVYU => {}
    }
}

fn write_packed_yuv(format: PixelFormat, y0: u8, y1: u8, u: u8, v: u8, px: &mut [u8]) {
    match format {
        PixelFormat::YUY2 => px.copy_from_slice(&[y0, u, y1, v]),
        PixelFormat::UYVY => px.copy_from_slice(&[u, y0, v, y1]),
        PixelFormat::YVYU => px.copy_from_slice(&[y0, v, y1, u]),
        _ => {}
    }
}

fn invalid(msg: impl Into<String>) -> PlayerError {
    PlayerError::DecodeError(msg.into())
}

/// 检查各平面的大小是否和宽高、步长一致
fn check_planes(picture: &Picture) -> Result<()> {
    let (w, h) = (picture.width, picture.height);
    if w == 0 || h == 0 {
        return Err(invalid("图像尺寸为 0"));
    }
    if picture.y_stride < w || picture.y.len() < (h - 1) * picture.y_stride + w {
        return Err(invalid("Y 平面数据不足"));
    }
    if picture.layout != PictureLayout::I400 {
        let (sx, sy) = picture.layout.chroma_subsampling();
        let cw = w.div_ceil(sx);
        let ch = h.div_ceil(sy);
        let need = (ch - 1) * picture.uv_stride + cw;
        if picture.uv_stride < cw || picture.u.len() < need || picture.v.len() < need {
            return Err(invalid("色度平面数据不足"));
        }
    }
    Ok(())
}

impl YuvConverter {
    #[inline]
    fn chroma_at(picture: &Picture, x: usize, y: usize) -> (u8, u8) {
        if picture.layout == PictureLayout::I400 {
            return (128, 128);
        }
        let (sx, sy) = picture.layout.chroma_subsampling();
        let i = (y / sy) * picture.uv_stride + x / sx;
        (picture.u[i], picture.v[i])
    }

    /// 输出缓冲区按需分配，分配失败作为严重错误上报
    fn allocate(len: usize) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|e| PlayerError::Allocation(format!("视频帧分配 {} 字节失败: {}", len, e)))?;
        data.resize(len, 0);
        Ok(data)
    }
}

impl ColorConverter for YuvConverter {
    fn convert(&mut self, picture: &Picture, format: PixelFormat) -> Result<VideoFrame> {
        check_planes(picture)?;
        let (w, h) = (picture.width, picture.height);

        let packed = matches!(
            format,
            PixelFormat::YUY2 | PixelFormat::UYVY | PixelFormat::YVYU
        );
        let stride = if packed {
            w.div_ceil(2) * 4
        } else {
            w * format.bytes_per_pixel()
        };
        let mut data = Self::allocate(stride * h)?;

        for (row, line) in data.chunks_exact_mut(stride).enumerate() {
            let luma = &picture.y[row * picture.y_stride..row * picture.y_stride + w];
            if packed {
                for (pair, px) in line.chunks_exact_mut(4).enumerate() {
                    let x0 = pair * 2;
                    let x1 = (x0 + 1).min(w - 1);
                    let (u, v) = Self::chroma_at(picture, x0, row);
                    write_packed_yuv(format, luma[x0], luma[x1], u, v, px);
                }
            } else {
                let bpp = format.bytes_per_pixel();
                for (x, px) in line.chunks_exact_mut(bpp).enumerate() {
                    let (u, v) = Self::chroma_at(picture, x, row);
                    write_rgb(format, yuv_to_rgb(luma[x], u, v), px);
                }
            }
        }

        Ok(VideoFrame {
            data,
            stride,
            width: w,
            height: h,
            timecode: picture.timecode,
            duration: 0,
            pixel_format: format,
            color_depth: 8,
            sentinel: picture.sentinel,
        })
    }
}

// ============= 颜色转换阶段 =============

pub struct ConvertStage {
    pub converter: Box<dyn ColorConverter>,
    pub format: PixelFormat,
    pub input: Arc<FrameQueue<Picture>>,
    pub output: Arc<FrameQueue<VideoFrame>>,
    pub flow: FlowCounter,
    pub errors: Arc<ErrorState>,
}

impl ConvertStage {
    pub fn run(mut self, control: Control) {
        info!("{} 🎨 颜色转换线程启动: {:?}", log_ctx(), self.format);
        let mut converted: usize = 0;

        loop {
            if control.stop_requested() {
                break;
            }
            if self.errors.is_critical() {
                warn!("{} ⚠️ 检测到严重错误，颜色转换线程退出", log_ctx());
                push_terminator(&self.output);
                break;
            }

            let picture = match self.input.pop() {
                Message::Frame(picture) => picture,
                Message::Terminate => {
                    self.output.push(Message::Terminate);
                    break;
                }
            };

            match self.converter.convert(&picture, self.format) {
                Ok(frame) => {
                    converted += 1;
                    self.flow.produced(1);
                    self.output.push(Message::Frame(frame));
                }
                Err(e) if e.is_critical() => {
                    error!("{} ❌ 颜色转换失败: {}", log_ctx(), e);
                    self.errors.raise_critical(e.to_string());
                    self.flow.consumed();
                    push_terminator(&self.output);
                    break;
                }
                Err(e) => debug!("{} 跳过无法转换的图像 @{}ms: {}", log_ctx(), picture.timecode, e),
            }
            self.flow.consumed();
        }

        info!("{} 🛑 颜色转换线程退出（共转换 {} 帧）", log_ctx(), converted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn picture(layout: PictureLayout, w: usize, h: usize, y: Vec<u8>, u: Vec<u8>, v: Vec<u8>, uv_stride: usize) -> Picture {
        Picture {
            width: w,
            height: h,
            layout,
            y,
            u,
            v,
            y_stride: w,
            uv_stride,
            timecode: 123,
            sentinel: true,
        }
    }

    #[test]
    fn test_black_white_red() {
        let pic = picture(
            PictureLayout::I444,
            3,
            1,
            vec![16, 235, 81],
            vec![128, 128, 90],
            vec![128, 128, 240],
            3,
        );
        let frame = YuvConverter.convert(&pic, PixelFormat::RGBA).unwrap();
        assert_eq!(frame.stride, 12);
        assert_eq!(
            frame.data,
            vec![0, 0, 0, 255, 255, 255, 255, 255, 255, 0, 0, 255]
        );
        assert_eq!(frame.timecode, 123);
        assert!(frame.sentinel);

        let frame = YuvConverter.convert(&pic, PixelFormat::BGR).unwrap();
        assert_eq!(frame.data, vec![0, 0, 0, 255, 255, 255, 0, 0, 255]);

        let frame = YuvConverter.convert(&pic, PixelFormat::ARGB).unwrap();
        assert_eq!(&frame.data[8..12], &[255, 255, 0, 0]);
    }

    #[test]
    fn test_packed_yuv_orders() {
        let pic = picture(
            PictureLayout::I444,
            3,
            1,
            vec![10, 20, 30],
            vec![1, 2, 3],
            vec![4, 5, 6],
            3,
        );
        let yuy2 = YuvConverter.convert(&pic, PixelFormat::YUY2).unwrap();
        assert_eq!(yuy2.stride, 8);
        assert_eq!(yuy2.data, vec![10, 1, 20, 4, 30, 3, 30, 6]);

        let uyvy = YuvConverter.convert(&pic, PixelFormat::UYVY).unwrap();
        assert_eq!(uyvy.data, vec![1, 10, 4, 20, 3, 30, 6, 30]);

        let yvyu = YuvConverter.convert(&pic, PixelFormat::YVYU).unwrap();
        assert_eq!(yvyu.data, vec![10, 4, 20, 1, 30, 6, 30, 3]);
    }

    #[test]
    fn test_subsampled_and_gray() {
        // 4x2 I420：色度平面 2x1
        let pic = picture(
            PictureLayout::I420,
            4,
            2,
            vec![235; 8],
            vec![128, 128],
            vec![128, 128],
            2,
        );
        let frame = YuvConverter.convert(&pic, PixelFormat::RGB).unwrap();
        assert_eq!(frame.data.len(), 4 * 2 * 3);
        assert!(frame.data.iter().all(|b| *b == 255));

        let gray = picture(PictureLayout::I400, 2, 1, vec![16, 16], Vec::new(), Vec::new(), 0);
        let frame = YuvConverter.convert(&gray, PixelFormat::BGRA).unwrap();
        assert_eq!(frame.data, vec![0, 0, 0, 255, 0, 0, 0, 255]);
    }

    #[test]
    fn test_short_planes_rejected() {
        let pic = picture(PictureLayout::I420, 4, 4, vec![0; 8], vec![0; 4], vec![0; 4], 2);
        assert!(matches!(
            YuvConverter.convert(&pic, PixelFormat::RGBA),
            Err(PlayerError::DecodeError(_))
        ));
    }
}
