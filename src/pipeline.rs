use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn, error, debug};

use crate::aggregator::{aggregate, AggregationSummary};
use crate::classifier::{EmotionClassifier, HttpClassifier};
use crate::emotion::{dominant_of, top_k_emotions, DEFAULT_TOP_K};
use crate::metadata::{FrameSummary, ImageAnalysis, VideoOverview, VideoReport};
use crate::sampler::{FrameRecord, FrameSampler, SamplingStats, DEFAULT_FRAME_INTERVAL, DEFAULT_JPEG_QUALITY};
use crate::video_processor::{FfmpegVideoSource, VideoInfo, VideoSource};

/// 分析配置
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzeConfig {
    /// 采样间隔（帧）
    pub frame_interval: u64,
    /// 每帧保留的情绪数量
    pub top_k: usize,
    /// 帧图像 JPEG 质量（1-100）
    pub jpeg_quality: u8,
    /// 分类服务地址
    pub classifier_url: String,
    /// 分类服务超时（秒）
    pub classifier_timeout_secs: u64,
    /// Webhook URL（处理完成后回调）
    pub webhook_url: Option<String>,
}

impl AnalyzeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.frame_interval == 0 {
            anyhow::bail!("frame_interval 必须为正整数");
        }
        if self.top_k == 0 {
            anyhow::bail!("top_k 必须为正整数");
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            anyhow::bail!("jpeg_quality 必须在 1-100 之间: {}", self.jpeg_quality);
        }
        Ok(())
    }

    pub fn sampler(&self) -> Result<FrameSampler> {
        Ok(FrameSampler::new(self.frame_interval)?
            .with_top_k(self.top_k)
            .with_jpeg_quality(self.jpeg_quality))
    }

    /// 按配置创建 HTTP 分类器（内部使用阻塞客户端，需在阻塞线程中创建和使用）
    pub fn http_classifier(&self) -> Result<HttpClassifier> {
        HttpClassifier::new(
            self.classifier_url.clone(),
            Duration::from_secs(self.classifier_timeout_secs),
            self.jpeg_quality,
        )
    }
}

impl Default for AnalyzeConfig {
    fn default() -> Self {
        Self {
            frame_interval: DEFAULT_FRAME_INTERVAL,
            top_k: DEFAULT_TOP_K,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            classifier_url: "http://127.0.0.1:5005/analyze".to_string(),
            classifier_timeout_secs: 30,
            webhook_url: None,
        }
    }
}

/// 一次视频分析的完整结果
#[derive(Debug, Clone)]
pub struct VideoAnalysis {
    pub video_info: VideoInfo,
    /// 按帧序号升序，包含帧图像
    pub records: Vec<FrameRecord>,
    pub summary: AggregationSummary,
    pub stats: SamplingStats,
}

impl VideoAnalysis {
    /// 逐帧结果（不含图像数据）
    pub fn frame_by_frame(&self) -> Vec<FrameSummary> {
        self.records.iter().map(FrameRecord::summary).collect()
    }

    /// 按帧序号取帧图像
    pub fn frame_image(&self, frame_index: u64) -> Option<&[u8]> {
        self.records
            .binary_search_by_key(&frame_index, FrameRecord::frame_index)
            .ok()
            .map(|i| self.records[i].frame_image())
    }

    pub fn overview(&self) -> VideoOverview {
        VideoOverview::new(&self.video_info, &self.stats)
    }

    /// 分析报告，不含图像数据
    pub fn report(&self) -> VideoReport {
        VideoReport {
            id: None,
            upload_date: None,
            video_info: self.overview(),
            frame_by_frame: self.frame_by_frame(),
            aggregated_emotions: self.summary.clone(),
        }
    }
}

/// 采样 + 聚合
pub fn analyze_stream<S, C>(source: &mut S, classifier: &C, config: &AnalyzeConfig) -> Result<VideoAnalysis>
where
    S: VideoSource + ?Sized,
    C: EmotionClassifier + ?Sized,
{
    let sampler = config.sampler()?;
    let video_info = source.info().clone();

    let sample_start = Instant::now();
    info!("⏳ [情绪分析] 正在采样视频帧（间隔: {} 帧）...", sampler.stride());
    let output = sampler.sample(source, classifier);
    info!("✅ [情绪分析] 帧采样完成，耗时: {:.2}秒", sample_start.elapsed().as_secs_f64());

    let aggregate_start = Instant::now();
    let summary = aggregate(&output.records);
    info!("✅ [情绪分析] 聚合完成，耗时: {:.2}ms", aggregate_start.elapsed().as_secs_f64() * 1000.0);
    info!("  • 主导情绪: {} ({:?})",
        summary.dominant_emotion.as_deref().unwrap_or("无"),
        summary.dominant_average_confidence);

    Ok(VideoAnalysis {
        video_info,
        records: output.records,
        summary,
        stats: output.stats,
    })
}

/// 打开视频文件并分析；文件无法打开时直接失败，不产生部分结果
pub fn analyze_video_file<C>(input_path: impl AsRef<Path>, classifier: &C, config: &AnalyzeConfig) -> Result<VideoAnalysis>
where
    C: EmotionClassifier + ?Sized,
{
    let mut source = open_video(input_path)?;
    analyze_stream(&mut source, classifier, config)
}

/// 打开视频文件并记录基本信息
pub fn open_video(input_path: impl AsRef<Path>) -> Result<FfmpegVideoSource> {
    let input_path = input_path.as_ref();
    let init_start = Instant::now();
    let source = FfmpegVideoSource::open(input_path)
        .map_err(|e| {
            error!("❌ [情绪分析] 打开视频失败: {:#}", e);
            e
        })?;
    let info = source.info();
    info!("✅ [情绪分析] 打开视频完成，耗时: {:.2}秒", init_start.elapsed().as_secs_f64());
    info!("  • 分辨率: {}x{}", info.width, info.height);
    info!("  • 帧率: {:.2} fps", info.fps);
    info!("  • 总帧数: {}", info.total_frames);
    Ok(source)
}

/// 单张图片分析：只做 top-k，不做聚合
pub fn analyze_image<C>(image_bytes: &[u8], classifier: &C, top_k: usize) -> Result<ImageAnalysis>
where
    C: EmotionClassifier + ?Sized,
{
    let image = image::load_from_memory(image_bytes).context("无法解码图片数据")?;
    let scores = classifier.classify(&image).context("情绪分类失败")?;
    let top_k_emotions = top_k_emotions(&scores, top_k);
    let (dominant_emotion, dominant_confidence) = dominant_of(&top_k_emotions);
    debug!("🖼️ [图片分析] 主导情绪: {:?}", dominant_emotion);

    Ok(ImageAnalysis {
        top_k_emotions,
        dominant_emotion,
        dominant_confidence,
    })
}

/// 处理结果
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// 输出目录
    pub output_dir: PathBuf,
    /// 分析报告
    pub report: VideoReport,
    /// 帧图像文件列表（相对 output_dir）
    pub frame_files: Vec<String>,
}

/// 处理视频文件：分析后把报告和帧图像写入输出目录
pub async fn process_video(
    input_video_path: impl AsRef<Path>,
    output_dir: impl AsRef<Path>,
    config: AnalyzeConfig,
) -> Result<ProcessOutput> {
    let input_video_path = input_video_path.as_ref().to_path_buf();
    let output_dir = output_dir.as_ref();

    let total_start = Instant::now();
    info!("🎬 [情绪分析] 开始处理视频: {}", input_video_path.display());
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    std::fs::create_dir_all(output_dir)
        .context("创建输出目录失败")?;

    // 解码和分类都是阻塞调用，放到阻塞线程执行
    let task_config = config.clone();
    let task_path = input_video_path.clone();
    let analysis = tokio::task::spawn_blocking(move || {
        let classifier = task_config.http_classifier()?;
        analyze_video_file(&task_path, &classifier, &task_config)
    })
    .await
    .context("分析任务异常退出")??;

    let write_start = Instant::now();
    let (report, frame_files) = write_output(&analysis, output_dir)?;
    info!("✅ [情绪分析] 结果写入完成，耗时: {:.2}秒", write_start.elapsed().as_secs_f64());

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("🎉 [情绪分析] 处理完成！总耗时: {:.2}秒", total_start.elapsed().as_secs_f64());
    info!("📁 [情绪分析] 输出目录: {}", output_dir.display());
    info!("📸 [情绪分析] 分析帧数: {}/{}", analysis.stats.analyzed_frames, analysis.stats.total_frames);

    let result = ProcessOutput {
        output_dir: output_dir.to_path_buf(),
        report,
        frame_files,
    };

    // 调用 webhook 回调（如果配置了）
    if let Some(webhook_url) = &config.webhook_url {
        info!("⏳ [情绪分析] 正在调用 Webhook 回调...");
        if let Err(e) = call_webhook(webhook_url, &input_video_path, &result).await {
            warn!("⚠️  [情绪分析] Webhook 回调失败: {:#}", e);
        } else {
            info!("✅ [情绪分析] Webhook 回调成功");
        }
    }

    Ok(result)
}

/// 写出 metadata.json 和 frames/frame_XXXXXX.jpg
pub fn write_output(analysis: &VideoAnalysis, output_dir: &Path) -> Result<(VideoReport, Vec<String>)> {
    let frames_dir = output_dir.join("frames");
    std::fs::create_dir_all(&frames_dir)
        .context("创建帧目录失败")?;

    let mut frame_files = Vec::with_capacity(analysis.records.len());
    for record in &analysis.records {
        let filename = format!("frames/frame_{:06}.jpg", record.frame_index());
        std::fs::write(output_dir.join(&filename), record.frame_image())
            .with_context(|| format!("保存帧图像失败: {}", filename))?;
        debug!("💾 [情绪分析] 已保存帧图像: {}", filename);
        frame_files.push(filename);
    }

    let report = analysis.report();
    let metadata_path = output_dir.join("metadata.json");
    let metadata_json = serde_json::to_string_pretty(&report)
        .context("序列化分析报告失败")?;
    std::fs::write(&metadata_path, metadata_json)
        .with_context(|| format!("写入元数据文件失败: {}", metadata_path.display()))?;

    Ok((report, frame_files))
}

/// Webhook 回调数据结构
#[derive(Debug, serde::Serialize)]
struct WebhookPayload<'a> {
    /// 处理状态
    status: &'static str,
    /// 输入视频路径
    input_video: String,
    /// 输出目录
    output_dir: String,
    /// 成功分析的帧数
    analyzed_frames: u64,
    dominant_emotion: Option<&'a str>,
    summary: &'a AggregationSummary,
    /// 处理时间戳
    timestamp: String,
}

/// 调用 webhook 回调
async fn call_webhook(webhook_url: &str, input_video: &Path, result: &ProcessOutput) -> Result<()> {
    use chrono::Utc;

    let summary = &result.report.aggregated_emotions;
    let payload = WebhookPayload {
        status: "success",
        input_video: input_video.to_string_lossy().to_string(),
        output_dir: result.output_dir.to_string_lossy().to_string(),
        analyzed_frames: result.report.video_info.analyzed_frames,
        dominant_emotion: summary.dominant_emotion.as_deref(),
        summary,
        timestamp: Utc::now().to_rfc3339(),
    };

    let client = reqwest::Client::new();
    let response = client
        .post(webhook_url)
        .json(&payload)
        .timeout(Duration::from_secs(30))
        .send()
        .await
        .context("Webhook 请求失败")?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        warn!("Webhook 回调返回错误状态: {} - {}", status, error_text);
        anyhow::bail!("Webhook 返回错误状态: {}", status);
    }

    Ok(())
}
