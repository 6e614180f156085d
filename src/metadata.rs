use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregator::{round2, AggregationSummary};
use crate::emotion::EmotionScore;
use crate::sampler::SamplingStats;
use crate::video_processor::VideoInfo;

/// 单帧分析结果（不含图像数据）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSummary {
    /// 帧序号
    pub frame_number: u64,
    /// 时间戳（秒）
    pub timestamp: f64,
    pub top_k_emotions: Vec<EmotionScore>,
    pub dominant_emotion: Option<String>,
    pub dominant_confidence: Option<f64>,
}

/// 视频概况
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoOverview {
    pub total_frames: u64,
    /// 成功分析的帧数
    pub analyzed_frames: u64,
    pub duration_seconds: f64,
    pub fps: f64,
}

impl VideoOverview {
    pub fn new(info: &VideoInfo, stats: &SamplingStats) -> Self {
        Self {
            total_frames: info.total_frames,
            analyzed_frames: stats.analyzed_frames,
            duration_seconds: round2(info.duration_seconds),
            fps: round2(info.fps),
        }
    }
}

/// 整个视频的分析报告（即 metadata.json 的内容）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoReport {
    /// 入库后的 ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<DateTime<Utc>>,
    pub video_info: VideoOverview,
    /// 逐帧结果，不含图像
    pub frame_by_frame: Vec<FrameSummary>,
    pub aggregated_emotions: AggregationSummary,
}

/// 单张图片的分析结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAnalysis {
    pub top_k_emotions: Vec<EmotionScore>,
    pub dominant_emotion: Option<String>,
    pub dominant_confidence: Option<f64>,
}
