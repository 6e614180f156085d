use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json as ResponseJson, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, error, warn};
use uuid::Uuid;

use crate::classifier::EmotionClassifier;
use crate::metadata::{FrameSummary, ImageAnalysis, VideoReport};
use crate::pipeline::{analyze_image, analyze_stream, open_video, AnalyzeConfig};
use crate::store::{AnalysisStore, ImageSummary, StoreError, StoredImage, StoredVideo, VideoSummary};

const IMAGE_CONTENT_TYPES: &[&str] = &["image/jpeg", "image/png"];
const VIDEO_CONTENT_TYPES: &[&str] = &["video/mp4", "video/quicktime", "video/x-msvideo"];

/// 上传大小上限
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

type HandlerResult<T> = Result<T, (StatusCode, String)>;

/// 服务共享状态
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<AnalysisStore>,
    pub config: Arc<AnalyzeConfig>,
    /// 分类调用是阻塞的，只在阻塞线程中使用
    pub classifier: Arc<dyn EmotionClassifier>,
}

impl AppState {
    pub fn new(store: AnalysisStore, config: AnalyzeConfig, classifier: Arc<dyn EmotionClassifier>) -> Self {
        Self {
            store: Arc::new(store),
            config: Arc::new(config),
            classifier,
        }
    }
}

/// 构建路由
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/image", post(upload_image))
        .route("/images", get(list_images))
        .route("/image/:id", get(get_image).delete(delete_image))
        .route("/image/:id/file", get(get_image_file))
        .route("/video", post(upload_video))
        .route("/videos", get(list_videos))
        .route("/video/:id", get(get_video).delete(delete_video))
        .route("/video/:id/frame/:frame_number", get(get_frame))
        .route("/video/:id/frame/:frame_number/file", get(get_frame_file))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// 健康检查
pub async fn health_check() -> &'static str {
    "OK"
}

#[derive(Debug, Serialize)]
pub struct ImageUploadResponse {
    pub id: Uuid,
    pub upload_date: DateTime<Utc>,
    #[serde(flatten)]
    pub analysis: ImageAnalysis,
}

#[derive(Debug, Serialize)]
pub struct ImageListResponse {
    pub total: usize,
    pub images: Vec<ImageSummary>,
}

#[derive(Debug, Serialize)]
pub struct VideoListResponse {
    pub total: usize,
    pub videos: Vec<VideoSummary>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub detail: String,
}

/// multipart 中上传的文件
struct UploadedFile {
    filename: String,
    content_type: String,
    bytes: Bytes,
}

/// 读取 multipart 表单：`file` 字段为文件，其余字段按文本收集
async fn read_upload(mut multipart: Multipart) -> HandlerResult<(UploadedFile, Vec<(String, String)>)> {
    let mut file = None;
    let mut fields = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("解析上传表单失败: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let filename = field.file_name().unwrap_or("upload").to_string();
            let content_type = field.content_type().unwrap_or_default().to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| (StatusCode::BAD_REQUEST, format!("读取上传文件失败: {}", e)))?;
            file = Some(UploadedFile { filename, content_type, bytes });
        } else {
            let value = field
                .text()
                .await
                .map_err(|e| (StatusCode::BAD_REQUEST, format!("读取表单字段失败: {}", e)))?;
            fields.push((name, value));
        }
    }

    let file = file.ok_or_else(|| (StatusCode::BAD_REQUEST, "缺少 file 字段".to_string()))?;
    Ok((file, fields))
}

fn validate_content_type(file: &UploadedFile, allowed: &[&str]) -> HandlerResult<()> {
    if !allowed.contains(&file.content_type.as_str()) {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("不支持的文件类型: {}，允许: {}", file.content_type, allowed.join(", ")),
        ));
    }
    Ok(())
}

fn store_error(e: StoreError) -> (StatusCode, String) {
    let status = match &e {
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::Conflict { .. } => StatusCode::CONFLICT,
        StoreError::Io(_) | StoreError::Json(_) => {
            error!("❌ [存储] {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, e.to_string())
}

/// 上传并分析图片
pub async fn upload_image(
    State(state): State<AppState>,
    multipart: Multipart,
) -> HandlerResult<ResponseJson<ImageUploadResponse>> {
    let (file, _) = read_upload(multipart).await?;
    validate_content_type(&file, IMAGE_CONTENT_TYPES)?;
    info!("收到图片上传: {} ({} 字节)", file.filename, file.bytes.len());

    if image::load_from_memory(&file.bytes).is_err() {
        return Err((StatusCode::BAD_REQUEST, "无效的图片数据".to_string()));
    }
    state.store.check_image_filename(&file.filename).map_err(store_error)?;

    let classifier = state.classifier.clone();
    let top_k = state.config.top_k;
    let bytes = file.bytes.clone();
    let analysis = tokio::task::spawn_blocking(move || analyze_image(&bytes, classifier.as_ref(), top_k))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("分析任务异常退出: {}", e)))?
        .map_err(|e| {
            error!("图片分析失败: {:#}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("图片分析失败: {:#}", e))
        })?;

    let stored = state
        .store
        .save_image(&file.filename, &file.content_type, &file.bytes, analysis)
        .map_err(store_error)?;

    Ok(ResponseJson(ImageUploadResponse {
        id: stored.id,
        upload_date: stored.upload_date,
        analysis: stored.analysis,
    }))
}

pub async fn list_images(State(state): State<AppState>) -> HandlerResult<ResponseJson<ImageListResponse>> {
    let images = state.store.list_images().map_err(store_error)?;
    Ok(ResponseJson(ImageListResponse {
        total: images.len(),
        images,
    }))
}

pub async fn get_image(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> HandlerResult<ResponseJson<StoredImage>> {
    state.store.load_image(id).map(ResponseJson).map_err(store_error)
}

/// 原始图片文件
pub async fn get_image_file(State(state): State<AppState>, Path(id): Path<Uuid>) -> HandlerResult<Response> {
    let (content_type, bytes) = state.store.image_file(id).map_err(store_error)?;
    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}

pub async fn delete_image(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> HandlerResult<ResponseJson<DeleteResponse>> {
    state.store.delete_image(id).map_err(store_error)?;
    Ok(ResponseJson(DeleteResponse {
        detail: "Image analysis deleted successfully".to_string(),
    }))
}

/// 上传并分析视频
///
/// 表单字段 `frame_interval` 可覆盖默认采样间隔。
pub async fn upload_video(
    State(state): State<AppState>,
    multipart: Multipart,
) -> HandlerResult<ResponseJson<VideoReport>> {
    let (file, fields) = read_upload(multipart).await?;
    validate_content_type(&file, VIDEO_CONTENT_TYPES)?;
    info!("收到视频上传: {} ({} 字节)", file.filename, file.bytes.len());

    let mut config = (*state.config).clone();
    if let Some((_, value)) = fields.iter().find(|(name, _)| name == "frame_interval") {
        config.frame_interval = value
            .trim()
            .parse()
            .map_err(|_| (StatusCode::BAD_REQUEST, format!("无效的 frame_interval: {}", value)))?;
    }
    config
        .validate()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    state.store.check_video_filename(&file.filename).map_err(store_error)?;

    // 解码器需要文件路径，先写入临时文件
    let temp_path = temp_upload_path(&file.filename);
    tokio::fs::write(&temp_path, &file.bytes)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("写入临时文件失败: {}", e)))?;

    let classifier = state.classifier.clone();
    let task_config = config.clone();
    let task_path = temp_path.clone();
    let result = tokio::task::spawn_blocking(move || {
        let mut source = open_video(&task_path)
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("无法打开视频文件: {:#}", e)))?;
        analyze_stream(&mut source, classifier.as_ref(), &task_config).map_err(|e| {
            error!("视频分析失败: {:#}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("视频分析失败: {:#}", e))
        })
    })
    .await;

    if let Err(e) = tokio::fs::remove_file(&temp_path).await {
        warn!("⚠️  清理临时文件失败: {}: {}", temp_path.display(), e);
    }

    let analysis = result
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("分析任务异常退出: {}", e)))??;

    let stored = state
        .store
        .save_video(&file.filename, &file.content_type, config.frame_interval, &analysis)
        .map_err(store_error)?;

    Ok(ResponseJson(stored.report))
}

fn temp_upload_path(filename: &str) -> PathBuf {
    let extension = std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("mp4");
    std::env::temp_dir().join(format!("emotion-parse-{}.{}", Uuid::new_v4(), extension))
}

pub async fn list_videos(State(state): State<AppState>) -> HandlerResult<ResponseJson<VideoListResponse>> {
    let videos = state.store.list_videos().map_err(store_error)?;
    Ok(ResponseJson(VideoListResponse {
        total: videos.len(),
        videos,
    }))
}

/// 视频分析详情（逐帧结果不含图像）
pub async fn get_video(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> HandlerResult<ResponseJson<StoredVideo>> {
    state.store.load_video(id).map(ResponseJson).map_err(store_error)
}

pub async fn get_frame(
    State(state): State<AppState>,
    Path((id, frame_number)): Path<(Uuid, u64)>,
) -> HandlerResult<ResponseJson<FrameSummary>> {
    state.store.frame(id, frame_number).map(ResponseJson).map_err(store_error)
}

/// 帧图像（JPEG）
pub async fn get_frame_file(
    State(state): State<AppState>,
    Path((id, frame_number)): Path<(Uuid, u64)>,
) -> HandlerResult<Response> {
    let bytes = state.store.frame_image(id, frame_number).map_err(store_error)?;
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], bytes).into_response())
}

pub async fn delete_video(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> HandlerResult<ResponseJson<DeleteResponse>> {
    state.store.delete_video(id).map_err(store_error)?;
    Ok(ResponseJson(DeleteResponse {
        detail: "Video analysis and associated frames deleted successfully".to_string(),
    }))
}
