use ffmpeg_next as ffmpeg;
use image::{DynamicImage, ImageOutputFormat};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::Path;
use tracing::{debug, warn};

/// 视频基本信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    /// 容器声明的总帧数（部分格式只能估算）
    pub total_frames: u64,
    /// 帧率，未知时为 0
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// 时长（秒）= 总帧数 / 帧率
    pub duration_seconds: f64,
}

impl VideoInfo {
    pub fn new(total_frames: u64, fps: f64, width: u32, height: u32) -> Self {
        let duration_seconds = if fps > 0.0 {
            total_frames as f64 / fps
        } else {
            0.0
        };
        Self {
            total_frames,
            fps,
            width,
            height,
            duration_seconds,
        }
    }
}

/// 解码后的单帧
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// 从 0 开始的帧序号
    pub index: u64,
    pub image: DynamicImage,
}

/// 顺序读取视频帧的数据源
pub trait VideoSource {
    fn info(&self) -> &VideoInfo;

    /// 读取并解码下一帧，流结束时返回 `None`
    fn read_next(&mut self) -> Result<Option<VideoFrame>>;

    /// 跳过下一帧（仍需解码以保持流位置），流结束时返回 `false`
    ///
    /// 默认实现直接调用 `read_next`，实现方可以省掉像素格式转换。
    fn skip_next(&mut self) -> Result<bool> {
        Ok(self.read_next()?.is_some())
    }
}

/// 基于 FFmpeg 的顺序解码器
pub struct FfmpegVideoSource {
    ictx: ffmpeg::format::context::Input,
    decoder: ffmpeg::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    stream_index: usize,
    info: VideoInfo,
    next_index: u64,
    eof_sent: bool,
}

impl FfmpegVideoSource {
    /// 打开视频文件；打不开或没有视频流时直接返回错误
    pub fn open(input_path: impl AsRef<Path>) -> Result<Self> {
        ffmpeg::init().context("初始化 FFmpeg 失败")?;

        // 只输出错误级别的 FFmpeg 日志
        ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Error);

        let input_path = input_path.as_ref();
        let ictx = ffmpeg::format::input(&input_path)
            .with_context(|| format!("无法打开视频文件: {}", input_path.display()))?;

        let video_stream = ictx
            .streams()
            .best(ffmpeg::media::Type::Video)
            .context("未找到视频流")?;
        let stream_index = video_stream.index();

        let decoder_context = ffmpeg::codec::context::Context::from_parameters(video_stream.parameters())
            .context("无法创建解码器上下文")?;
        let decoder = decoder_context.decoder()
            .video()
            .context("无法创建视频解码器")?;

        let rate = video_stream.avg_frame_rate();
        let fps = if rate.numerator() > 0 && rate.denominator() > 0 {
            rate.numerator() as f64 / rate.denominator() as f64
        } else {
            0.0
        };

        // nb_frames 缺失时按容器时长估算
        let declared_frames = video_stream.frames();
        let total_frames = if declared_frames > 0 {
            declared_frames as u64
        } else if ictx.duration() > 0 && fps > 0.0 {
            let seconds = ictx.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64;
            (seconds * fps).round() as u64
        } else {
            0
        };

        let scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::format::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::Flags::BILINEAR,
        ).context("无法创建缩放器")?;

        let info = VideoInfo::new(total_frames, fps, decoder.width(), decoder.height());
        debug!("🎞️ 打开视频: {} ({}x{}, {:.2} fps, {} 帧)",
            input_path.display(), info.width, info.height, info.fps, info.total_frames);

        Ok(Self {
            ictx,
            decoder,
            scaler,
            stream_index,
            info,
            next_index: 0,
            eof_sent: false,
        })
    }

    /// 从解码器取出下一帧原始数据，必要时继续读取数据包
    fn next_decoded(&mut self) -> Result<Option<ffmpeg::frame::Video>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return Ok(Some(decoded));
            }
            if self.eof_sent {
                return Ok(None);
            }

            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.ictx) {
                Ok(()) => {
                    if packet.stream() != self.stream_index {
                        continue;
                    }
                    if let Err(e) = self.decoder.send_packet(&packet) {
                        // 损坏的数据包直接跳过
                        debug!("跳过无法解码的数据包: {}", e);
                    }
                }
                Err(e) => {
                    if !matches!(e, ffmpeg::Error::Eof) {
                        warn!("⚠️  读取数据包失败，按流结束处理: {}", e);
                    }
                    self.eof_sent = true;
                    self.decoder.send_eof().context("刷新解码器失败")?;
                }
            }
        }
    }

    /// 将 FFmpeg 帧转换为 DynamicImage
    fn frame_to_image(&mut self, decoded: &ffmpeg::frame::Video) -> Result<DynamicImage> {
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        self.scaler.run(decoded, &mut rgb_frame)
            .context("像素格式转换失败")?;

        let width = rgb_frame.width();
        let height = rgb_frame.height();
        let stride = rgb_frame.stride(0);
        let data = rgb_frame.data(0);

        // RGB24 格式：每个像素 3 字节，行尾可能有对齐填充
        let row_len = width as usize * 3;
        let mut pixels = Vec::with_capacity(row_len * height as usize);
        for y in 0..height as usize {
            let start = y * stride;
            let row = data.get(start..start + row_len)
                .context("RGB 帧数据不完整")?;
            pixels.extend_from_slice(row);
        }

        let img = image::RgbImage::from_raw(width, height, pixels)
            .context("构建 RGB 图像失败")?;
        Ok(DynamicImage::ImageRgb8(img))
    }
}

impl VideoSource for FfmpegVideoSource {
    fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn read_next(&mut self) -> Result<Option<VideoFrame>> {
        let Some(decoded) = self.next_decoded()? else {
            return Ok(None);
        };
        // 先推进序号，转换失败时后续帧序号依然正确
        let index = self.next_index;
        self.next_index += 1;
        let image = self.frame_to_image(&decoded)
            .with_context(|| format!("第 {} 帧转换失败", index))?;
        Ok(Some(VideoFrame { index, image }))
    }

    fn skip_next(&mut self) -> Result<bool> {
        if self.next_decoded()?.is_none() {
            return Ok(false);
        }
        self.next_index += 1;
        Ok(true)
    }
}

/// 将帧编码为 JPEG（统一转成 RGB8，JPEG 不支持透明通道）
pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    let mut buffer = Cursor::new(Vec::new());
    rgb.write_to(&mut buffer, ImageOutputFormat::Jpeg(quality))
        .context("JPEG 编码失败")?;
    Ok(buffer.into_inner())
}

/// 内存中的帧序列，用于测试和已解码好的帧
pub struct InMemoryVideoSource {
    info: VideoInfo,
    frames: std::vec::IntoIter<DynamicImage>,
    next_index: u64,
}

impl InMemoryVideoSource {
    pub fn new(fps: f64, frames: Vec<DynamicImage>) -> Self {
        let (width, height) = frames
            .first()
            .map(|f| (f.width(), f.height()))
            .unwrap_or((0, 0));
        Self {
            info: VideoInfo::new(frames.len() as u64, fps, width, height),
            frames: frames.into_iter(),
            next_index: 0,
        }
    }
}

impl VideoSource for InMemoryVideoSource {
    fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn read_next(&mut self) -> Result<Option<VideoFrame>> {
        Ok(self.frames.next().map(|image| {
            let index = self.next_index;
            self.next_index += 1;
            VideoFrame { index, image }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ImageBuffer;

    fn solid(value: u8) -> DynamicImage {
        DynamicImage::ImageLuma8(ImageBuffer::from_fn(8, 8, |_, _| image::Luma([value])))
    }

    #[test]
    fn test_video_info_duration() {
        let info = VideoInfo::new(300, 30.0, 640, 480);
        assert_eq!(info.duration_seconds, 10.0);

        let unknown = VideoInfo::new(300, 0.0, 640, 480);
        assert_eq!(unknown.duration_seconds, 0.0);
    }

    #[test]
    fn test_in_memory_source_indices() {
        let mut source = InMemoryVideoSource::new(25.0, vec![solid(10), solid(20), solid(30)]);
        assert_eq!(source.info().total_frames, 3);
        assert_eq!((source.info().width, source.info().height), (8, 8));

        assert_eq!(source.read_next().unwrap().unwrap().index, 0);
        assert!(source.skip_next().unwrap());
        assert_eq!(source.read_next().unwrap().unwrap().index, 2);
        assert!(source.read_next().unwrap().is_none());
        assert!(!source.skip_next().unwrap());
    }

    #[test]
    fn test_encode_jpeg() {
        let jpeg = encode_jpeg(&solid(200), 80).unwrap();
        // JPEG SOI 标记
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 8));
    }

    #[test]
    fn test_open_missing_file_fails() {
        let result = FfmpegVideoSource::open("/definitely/not/here.mp4");
        assert!(result.is_err());
    }
}
