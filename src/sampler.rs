use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::classifier::EmotionClassifier;
use crate::emotion::{dominant_of, top_k_emotions, EmotionScore, DEFAULT_TOP_K};
use crate::metadata::FrameSummary;
use crate::video_processor::{encode_jpeg, VideoFrame, VideoSource};

/// 默认采样间隔（每 30 帧分析一帧）
pub const DEFAULT_FRAME_INTERVAL: u64 = 30;

/// 默认 JPEG 质量
pub const DEFAULT_JPEG_QUALITY: u8 = 85;

/// 连续读帧失败超过该次数时视为流已损坏，停止采样
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 16;

/// 单个采样帧的分析结果，创建后不再修改
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    frame_index: u64,
    timestamp_seconds: f64,
    top_k: Vec<EmotionScore>,
    dominant_emotion: Option<String>,
    dominant_confidence: Option<f64>,
    frame_image: Vec<u8>,
}

impl FrameRecord {
    pub fn new(
        frame_index: u64,
        timestamp_seconds: f64,
        top_k: Vec<EmotionScore>,
        frame_image: Vec<u8>,
    ) -> Self {
        let (dominant_emotion, dominant_confidence) = dominant_of(&top_k);
        Self {
            frame_index,
            timestamp_seconds,
            top_k,
            dominant_emotion,
            dominant_confidence,
            frame_image,
        }
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn timestamp_seconds(&self) -> f64 {
        self.timestamp_seconds
    }

    pub fn top_k(&self) -> &[EmotionScore] {
        &self.top_k
    }

    pub fn dominant_emotion(&self) -> Option<&str> {
        self.dominant_emotion.as_deref()
    }

    pub fn dominant_confidence(&self) -> Option<f64> {
        self.dominant_confidence
    }

    /// JPEG 编码后的原始帧
    pub fn frame_image(&self) -> &[u8] {
        &self.frame_image
    }

    /// 不含图像数据的视图
    pub fn summary(&self) -> FrameSummary {
        FrameSummary {
            frame_number: self.frame_index,
            timestamp: self.timestamp_seconds,
            top_k_emotions: self.top_k.clone(),
            dominant_emotion: self.dominant_emotion.clone(),
            dominant_confidence: self.dominant_confidence,
        }
    }
}

/// 采样统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingStats {
    /// 实际遍历的帧数
    pub total_frames: u64,
    /// 命中采样间隔的帧数
    pub sampled_frames: u64,
    /// 分析成功的帧数
    pub analyzed_frames: u64,
    /// 分析失败被跳过的帧数
    pub failed_frames: u64,
}

/// 采样输出
#[derive(Debug, Clone)]
pub struct SamplingOutput {
    /// 按帧序号升序排列
    pub records: Vec<FrameRecord>,
    pub stats: SamplingStats,
}

/// 单帧处理结果
#[derive(Debug)]
pub(crate) enum FrameOutcome {
    Analyzed(FrameRecord),
    Failed { frame_index: u64, error: anyhow::Error },
}

/// 帧采样器：按固定间隔挑帧并调用分类器
#[derive(Debug, Clone)]
pub struct FrameSampler {
    stride: u64,
    top_k: usize,
    jpeg_quality: u8,
}

impl FrameSampler {
    pub fn new(stride: u64) -> anyhow::Result<Self> {
        if stride == 0 {
            anyhow::bail!("采样间隔必须为正整数");
        }
        Ok(Self {
            stride,
            top_k: DEFAULT_TOP_K,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        })
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_jpeg_quality(mut self, jpeg_quality: u8) -> Self {
        self.jpeg_quality = jpeg_quality;
        self
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    /// 从头遍历视频流，对序号能被采样间隔整除的帧进行分析
    ///
    /// 单帧分类失败只会跳过该帧；读帧出错时按流结束处理，已有结果照常返回。
    pub fn sample<S, C>(&self, source: &mut S, classifier: &C) -> SamplingOutput
    where
        S: VideoSource + ?Sized,
        C: EmotionClassifier + ?Sized,
    {
        let fps = source.info().fps;
        let expected_frames = source.info().total_frames;
        let log_interval = if expected_frames > 0 {
            (expected_frames / 10).max(1)
        } else {
            300
        };

        let start = Instant::now();
        let mut records = Vec::new();
        let mut stats = SamplingStats::default();
        let mut index: u64 = 0;
        let mut consecutive_errors = 0u32;

        loop {
            if index % self.stride == 0 {
                match source.read_next() {
                    Ok(Some(frame)) => {
                        consecutive_errors = 0;
                        stats.sampled_frames += 1;
                        match self.analyze_frame(&frame, fps, classifier) {
                            FrameOutcome::Analyzed(record) => {
                                stats.analyzed_frames += 1;
                                records.push(record);
                            }
                            FrameOutcome::Failed { frame_index, error } => {
                                stats.failed_frames += 1;
                                warn!("⚠️  [帧采样] 第 {} 帧分析失败，已跳过: {:#}", frame_index, error);
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        // 读帧失败也算一次采样失败，流位置已前进
                        consecutive_errors += 1;
                        stats.sampled_frames += 1;
                        stats.failed_frames += 1;
                        warn!("⚠️  [帧采样] 第 {} 帧读取失败: {:#}", index, e);
                        if consecutive_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                            warn!("⚠️  [帧采样] 连续 {} 次读帧失败，提前结束", consecutive_errors);
                            index += 1;
                            stats.total_frames = index;
                            break;
                        }
                    }
                }
            } else {
                match source.skip_next() {
                    Ok(true) => consecutive_errors = 0,
                    Ok(false) => break,
                    Err(e) => {
                        warn!("⚠️  [帧采样] 第 {} 帧解码失败，按流结束处理: {:#}", index, e);
                        break;
                    }
                }
            }

            index += 1;
            stats.total_frames = index;

            if index % log_interval == 0 {
                let elapsed = start.elapsed().as_secs_f64();
                info!("📈 [帧采样] 已遍历 {}/{} 帧，成功分析 {} 帧，失败 {} 帧，已用 {:.1}s",
                    index, expected_frames, stats.analyzed_frames, stats.failed_frames, elapsed);
            }
        }

        info!("✅ [帧采样] 完成：遍历 {} 帧，采样 {} 帧，成功 {} 帧，失败 {} 帧，耗时 {:.2}s",
            stats.total_frames, stats.sampled_frames, stats.analyzed_frames,
            stats.failed_frames, start.elapsed().as_secs_f64());

        SamplingOutput { records, stats }
    }

    fn analyze_frame<C>(&self, frame: &VideoFrame, fps: f64, classifier: &C) -> FrameOutcome
    where
        C: EmotionClassifier + ?Sized,
    {
        let frame_index = frame.index;
        let scores = match classifier.classify(&frame.image) {
            Ok(scores) => scores,
            Err(error) => return FrameOutcome::Failed { frame_index, error },
        };
        let frame_image = match encode_jpeg(&frame.image, self.jpeg_quality) {
            Ok(bytes) => bytes,
            Err(error) => return FrameOutcome::Failed { frame_index, error },
        };

        let timestamp = frame_timestamp(frame_index, fps);
        let top_k = top_k_emotions(&scores, self.top_k);
        debug!("🔍 [帧采样] 第 {} 帧 ({:.2}s): {:?}", frame_index, timestamp,
            top_k.first().map(|e| e.emotion.as_str()));

        FrameOutcome::Analyzed(FrameRecord::new(frame_index, timestamp, top_k, frame_image))
    }
}

/// 帧序号换算为时间戳（秒），帧率未知时为 0
pub fn frame_timestamp(frame_index: u64, fps: f64) -> f64 {
    if fps > 0.0 {
        frame_index as f64 / fps
    } else {
        0.0
    }
}
