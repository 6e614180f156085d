//! 分析结果的文件系统存储
//!
//! 目录结构：
//!
//! ```text
//! <root>/images/<id>/record.json
//! <root>/images/<id>/original
//! <root>/videos/<id>/record.json
//! <root>/videos/<id>/frames/frame_XXXXXX.jpg
//! <root>/.staging/<id>/...
//! ```
//!
//! 写入先落到 `.staging`，完成后整个目录 rename 到目标位置，
//! 因此不会出现只有报告没有帧图像的视频记录。

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metadata::{FrameSummary, ImageAnalysis, VideoReport};
use crate::pipeline::VideoAnalysis;

const RECORD_FILE: &str = "record.json";
const IMAGE_FILE: &str = "original";
const FRAMES_DIR: &str = "frames";
const STAGING_DIR: &str = ".staging";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("{kind} with filename '{filename}' already exists")]
    Conflict { kind: &'static str, filename: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    fn dir_name(self) -> &'static str {
        match self {
            MediaKind::Image => "images",
            MediaKind::Video => "videos",
        }
    }

    fn label(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }
}

/// 已保存的图片分析
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredImage {
    pub id: Uuid,
    pub filename: String,
    pub content_type: String,
    pub upload_date: DateTime<Utc>,
    pub analysis: ImageAnalysis,
}

/// 图片列表项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSummary {
    pub id: Uuid,
    pub filename: String,
    pub upload_date: DateTime<Utc>,
    pub dominant_emotion: Option<String>,
    pub dominant_confidence: Option<f64>,
}

impl From<&StoredImage> for ImageSummary {
    fn from(image: &StoredImage) -> Self {
        Self {
            id: image.id,
            filename: image.filename.clone(),
            upload_date: image.upload_date,
            dominant_emotion: image.analysis.dominant_emotion.clone(),
            dominant_confidence: image.analysis.dominant_confidence,
        }
    }
}

/// 已保存的视频分析（帧图像单独存放）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredVideo {
    pub id: Uuid,
    pub filename: String,
    pub content_type: String,
    pub upload_date: DateTime<Utc>,
    pub frame_interval: u64,
    pub report: VideoReport,
}

/// 视频列表项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoSummary {
    pub id: Uuid,
    pub filename: String,
    pub upload_date: DateTime<Utc>,
    pub duration_seconds: f64,
    pub total_frames: u64,
    pub analyzed_frames: u64,
    pub fps: f64,
    pub dominant_emotion: Option<String>,
    pub dominant_confidence: Option<f64>,
}

impl From<&StoredVideo> for VideoSummary {
    fn from(video: &StoredVideo) -> Self {
        let info = &video.report.video_info;
        let summary = &video.report.aggregated_emotions;
        Self {
            id: video.id,
            filename: video.filename.clone(),
            upload_date: video.upload_date,
            duration_seconds: info.duration_seconds,
            total_frames: info.total_frames,
            analyzed_frames: info.analyzed_frames,
            fps: info.fps,
            dominant_emotion: summary.dominant_emotion.clone(),
            dominant_confidence: summary.dominant_average_confidence,
        }
    }
}

/// 基于目录的分析结果存储
pub struct AnalysisStore {
    root: PathBuf,
    // 同名检查和落盘需要串行
    write_lock: Mutex<()>,
}

impl AnalysisStore {
    /// 打开（必要时创建）存储目录
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        for dir in [MediaKind::Image.dir_name(), MediaKind::Video.dir_name(), STAGING_DIR] {
            fs::create_dir_all(root.join(dir))?;
        }
        info!("📁 [存储] 数据目录: {}", root.display());
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn save_image(
        &self,
        filename: &str,
        content_type: &str,
        bytes: &[u8],
        analysis: ImageAnalysis,
    ) -> StoreResult<StoredImage> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.ensure_unique(MediaKind::Image, filename)?;

        let record = StoredImage {
            id: Uuid::new_v4(),
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            upload_date: Utc::now(),
            analysis,
        };

        self.commit(MediaKind::Image, record.id, |staging| {
            fs::write(staging.join(IMAGE_FILE), bytes)?;
            write_json(&staging.join(RECORD_FILE), &record)
        })?;
        info!("💾 [存储] 已保存图片分析: {} ({})", record.filename, record.id);
        Ok(record)
    }

    /// 同名图片已存在时返回 Conflict
    pub fn check_image_filename(&self, filename: &str) -> StoreResult<()> {
        self.ensure_unique(MediaKind::Image, filename)
    }

    /// 按上传时间倒序
    pub fn list_images(&self) -> StoreResult<Vec<ImageSummary>> {
        let mut images: Vec<StoredImage> = self.load_all(MediaKind::Image)?;
        images.sort_by(|a, b| b.upload_date.cmp(&a.upload_date).then(a.id.cmp(&b.id)));
        Ok(images.iter().map(ImageSummary::from).collect())
    }

    pub fn load_image(&self, id: Uuid) -> StoreResult<StoredImage> {
        self.load_record(MediaKind::Image, id)
    }

    /// 原始图片内容和 content type
    pub fn image_file(&self, id: Uuid) -> StoreResult<(String, Vec<u8>)> {
        let record = self.load_image(id)?;
        let bytes = fs::read(self.entry_dir(MediaKind::Image, id).join(IMAGE_FILE))?;
        Ok((record.content_type, bytes))
    }

    pub fn delete_image(&self, id: Uuid) -> StoreResult<()> {
        self.delete(MediaKind::Image, id)
    }

    /// 保存视频分析报告及全部帧图像
    pub fn save_video(
        &self,
        filename: &str,
        content_type: &str,
        frame_interval: u64,
        analysis: &VideoAnalysis,
    ) -> StoreResult<StoredVideo> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.ensure_unique(MediaKind::Video, filename)?;

        let id = Uuid::new_v4();
        let upload_date = Utc::now();
        let mut report = analysis.report();
        report.id = Some(id);
        report.upload_date = Some(upload_date);

        let record = StoredVideo {
            id,
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            upload_date,
            frame_interval,
            report,
        };

        self.commit(MediaKind::Video, id, |staging| {
            let frames_dir = staging.join(FRAMES_DIR);
            fs::create_dir_all(&frames_dir)?;
            for record in &analysis.records {
                fs::write(frames_dir.join(frame_file_name(record.frame_index())), record.frame_image())?;
            }
            write_json(&staging.join(RECORD_FILE), &record)
        })?;
        info!("💾 [存储] 已保存视频分析: {} ({}，{} 帧)",
            record.filename, record.id, analysis.records.len());
        Ok(record)
    }

    /// 同名视频已存在时返回 Conflict
    pub fn check_video_filename(&self, filename: &str) -> StoreResult<()> {
        self.ensure_unique(MediaKind::Video, filename)
    }

    /// 按上传时间倒序
    pub fn list_videos(&self) -> StoreResult<Vec<VideoSummary>> {
        let mut videos: Vec<StoredVideo> = self.load_all(MediaKind::Video)?;
        videos.sort_by(|a, b| b.upload_date.cmp(&a.upload_date).then(a.id.cmp(&b.id)));
        Ok(videos.iter().map(VideoSummary::from).collect())
    }

    pub fn load_video(&self, id: Uuid) -> StoreResult<StoredVideo> {
        self.load_record(MediaKind::Video, id)
    }

    /// 单帧分析结果
    pub fn frame(&self, id: Uuid, frame_number: u64) -> StoreResult<FrameSummary> {
        let video = self.load_video(id)?;
        video
            .report
            .frame_by_frame
            .into_iter()
            .find(|f| f.frame_number == frame_number)
            .ok_or_else(|| StoreError::NotFound {
                kind: "frame",
                id: format!("{}/{}", id, frame_number),
            })
    }

    /// 单帧 JPEG 图像
    pub fn frame_image(&self, id: Uuid, frame_number: u64) -> StoreResult<Vec<u8>> {
        let path = self
            .entry_dir(MediaKind::Video, id)
            .join(FRAMES_DIR)
            .join(frame_file_name(frame_number));
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                kind: "frame",
                id: format!("{}/{}", id, frame_number),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn delete_video(&self, id: Uuid) -> StoreResult<()> {
        self.delete(MediaKind::Video, id)
    }

    fn entry_dir(&self, kind: MediaKind, id: Uuid) -> PathBuf {
        self.root.join(kind.dir_name()).join(id.to_string())
    }

    fn ensure_unique(&self, kind: MediaKind, filename: &str) -> StoreResult<()> {
        let exists = match kind {
            MediaKind::Image => self
                .load_all::<StoredImage>(kind)?
                .iter()
                .any(|r| r.filename == filename),
            MediaKind::Video => self
                .load_all::<StoredVideo>(kind)?
                .iter()
                .any(|r| r.filename == filename),
        };
        if exists {
            return Err(StoreError::Conflict {
                kind: kind.label(),
                filename: filename.to_string(),
            });
        }
        Ok(())
    }

    /// 在 staging 目录中写入，成功后整体 rename 到目标位置
    fn commit<F>(&self, kind: MediaKind, id: Uuid, write: F) -> StoreResult<()>
    where
        F: FnOnce(&Path) -> StoreResult<()>,
    {
        let staging = self.root.join(STAGING_DIR).join(id.to_string());
        fs::create_dir_all(&staging)?;

        let result = write(&staging)
            .and_then(|_| fs::rename(&staging, self.entry_dir(kind, id)).map_err(StoreError::from));
        if result.is_err() {
            if let Err(e) = fs::remove_dir_all(&staging) {
                warn!("⚠️  [存储] 清理临时目录失败: {}: {}", staging.display(), e);
            }
        }
        result
    }

    fn load_record<T: DeserializeOwned>(&self, kind: MediaKind, id: Uuid) -> StoreResult<T> {
        let path = self.entry_dir(kind, id).join(RECORD_FILE);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                kind: kind.label(),
                id: id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn load_all<T: DeserializeOwned>(&self, kind: MediaKind) -> StoreResult<Vec<T>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(self.root.join(kind.dir_name()))? {
            let path = entry?.path().join(RECORD_FILE);
            match fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!("⚠️  [存储] 跳过无法解析的记录: {}: {}", path.display(), e),
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("跳过不完整的记录目录: {}", path.display());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(records)
    }

    fn delete(&self, kind: MediaKind, id: Uuid) -> StoreResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let dir = self.entry_dir(kind, id);
        if !dir.join(RECORD_FILE).exists() {
            return Err(StoreError::NotFound {
                kind: kind.label(),
                id: id.to_string(),
            });
        }
        fs::remove_dir_all(&dir)?;
        info!("🗑️ [存储] 已删除{}分析: {}", kind.label(), id);
        Ok(())
    }
}

fn frame_file_name(frame_number: u64) -> String {
    format!("frame_{:06}.jpg", frame_number)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    fs::write(path, serde_json::to_vec_pretty(value)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::FnClassifier;
    use crate::emotion::{EmotionScore, EmotionScoreMap};
    use crate::pipeline::{analyze_stream, AnalyzeConfig};
    use crate::video_processor::InMemoryVideoSource;
    use image::{DynamicImage, ImageBuffer};

    fn sample_analysis() -> VideoAnalysis {
        let frames = (0..6)
            .map(|i| DynamicImage::ImageLuma8(ImageBuffer::from_fn(4, 4, move |_, _| image::Luma([i * 40]))))
            .collect();
        let mut source = InMemoryVideoSource::new(3.0, frames);
        let classifier = FnClassifier::new(|_: &DynamicImage| {
            Ok(EmotionScoreMap::from([("neutral".to_string(), 0.7), ("happy".to_string(), 0.3)]))
        });
        let config = AnalyzeConfig {
            frame_interval: 2,
            ..AnalyzeConfig::default()
        };
        analyze_stream(&mut source, &classifier, &config).unwrap()
    }

    fn image_analysis() -> ImageAnalysis {
        ImageAnalysis {
            top_k_emotions: vec![EmotionScore::new("happy", 0.8)],
            dominant_emotion: Some("happy".to_string()),
            dominant_confidence: Some(0.8),
        }
    }

    #[test]
    fn test_image_crud() {
        let dir = tempfile::tempdir().unwrap();
        let store = AnalysisStore::open(dir.path()).unwrap();

        let saved = store.save_image("face.png", "image/png", b"png-bytes", image_analysis()).unwrap();
        let loaded = store.load_image(saved.id).unwrap();
        assert_eq!(loaded, saved);

        let (content_type, bytes) = store.image_file(saved.id).unwrap();
        assert_eq!(content_type, "image/png");
        assert_eq!(bytes, b"png-bytes");

        let list = store.list_images().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].dominant_emotion.as_deref(), Some("happy"));

        store.delete_image(saved.id).unwrap();
        assert!(matches!(store.load_image(saved.id), Err(StoreError::NotFound { .. })));
        assert!(matches!(store.delete_image(saved.id), Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn test_duplicate_filename_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = AnalysisStore::open(dir.path()).unwrap();

        store.save_image("a.jpg", "image/jpeg", b"1", image_analysis()).unwrap();
        let second = store.save_image("a.jpg", "image/jpeg", b"2", image_analysis());
        assert!(matches!(second, Err(StoreError::Conflict { .. })));

        // 同名但不同类型互不影响
        let analysis = sample_analysis();
        store.save_video("a.jpg", "video/mp4", 2, &analysis).unwrap();
        let dup = store.save_video("a.jpg", "video/mp4", 2, &analysis);
        assert!(matches!(dup, Err(StoreError::Conflict { .. })));
    }

    #[test]
    fn test_video_crud() {
        let dir = tempfile::tempdir().unwrap();
        let store = AnalysisStore::open(dir.path()).unwrap();
        let analysis = sample_analysis();

        let saved = store.save_video("clip.mp4", "video/mp4", 2, &analysis).unwrap();
        assert_eq!(saved.report.id, Some(saved.id));
        assert_eq!(saved.report.frame_by_frame.len(), 3);

        let loaded = store.load_video(saved.id).unwrap();
        assert_eq!(loaded.filename, "clip.mp4");
        assert_eq!(loaded.frame_interval, 2);

        let frame = store.frame(saved.id, 4).unwrap();
        assert_eq!(frame.frame_number, 4);
        assert_eq!(frame.dominant_emotion.as_deref(), Some("neutral"));
        assert!(matches!(store.frame(saved.id, 3), Err(StoreError::NotFound { .. })));

        let jpeg = store.frame_image(saved.id, 2).unwrap();
        assert_eq!(jpeg, analysis.frame_image(2).unwrap());
        assert!(matches!(store.frame_image(saved.id, 5), Err(StoreError::NotFound { .. })));

        let list = store.list_videos().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].analyzed_frames, 3);
        assert_eq!(list[0].dominant_emotion.as_deref(), Some("neutral"));

        store.delete_video(saved.id).unwrap();
        assert!(store.list_videos().unwrap().is_empty());
        assert!(matches!(store.frame_image(saved.id, 2), Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn test_list_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = AnalysisStore::open(dir.path()).unwrap();

        let first = store.save_image("1.jpg", "image/jpeg", b"1", image_analysis()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = store.save_image("2.jpg", "image/jpeg", b"2", image_analysis()).unwrap();

        let ids: Vec<Uuid> = store.list_images().unwrap().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[test]
    fn test_corrupt_record_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = AnalysisStore::open(dir.path()).unwrap();
        let saved = store.save_image("ok.jpg", "image/jpeg", b"1", image_analysis()).unwrap();

        let broken = dir.path().join("images").join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join(RECORD_FILE), "{ not json").unwrap();

        let list = store.list_images().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, saved.id);

        // 其余记录照常参与同名检查，新上传不受影响
        assert!(matches!(store.check_image_filename("ok.jpg"), Err(StoreError::Conflict { .. })));
        store.save_image("new.jpg", "image/jpeg", b"2", image_analysis()).unwrap();
    }

    #[test]
    fn test_failed_commit_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = AnalysisStore::open(dir.path()).unwrap();
        let id = Uuid::new_v4();

        let result = store.commit(MediaKind::Video, id, |_| {
            Err(StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
        });
        assert!(result.is_err());
        assert!(!dir.path().join(STAGING_DIR).join(id.to_string()).exists());
        assert!(matches!(store.load_video(id), Err(StoreError::NotFound { .. })));
    }
}
