//! 情绪分类器接口
//!
//! 分类器本身是外部服务（如 DeepFace），这里只约定输入输出：
//! 输入一帧图像，输出 `情绪标签 -> 置信度` 映射，单次调用允许失败。

use anyhow::{Context, Result};
use image::DynamicImage;
use reqwest::blocking::multipart::{Form, Part};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::emotion::EmotionScoreMap;
use crate::video_processor::encode_jpeg;

pub trait EmotionClassifier: Send + Sync {
    fn classify(&self, image: &DynamicImage) -> Result<EmotionScoreMap>;
}

/// 用闭包实现的分类器，方便测试和嵌入调用
pub struct FnClassifier<F> {
    f: F,
}

impl<F> FnClassifier<F>
where
    F: Fn(&DynamicImage) -> Result<EmotionScoreMap> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> EmotionClassifier for FnClassifier<F>
where
    F: Fn(&DynamicImage) -> Result<EmotionScoreMap> + Send + Sync,
{
    fn classify(&self, image: &DynamicImage) -> Result<EmotionScoreMap> {
        (self.f)(image)
    }
}

/// 通过 HTTP 调用远程分类服务
///
/// 以 `multipart/form-data` 上传 JPEG（字段名 `file`），响应体可以是
/// `{"emotion": {...}}`，也可以是这种对象的数组（多张人脸时取第一张）。
pub struct HttpClassifier {
    client: reqwest::blocking::Client,
    endpoint: String,
    jpeg_quality: u8,
}

impl HttpClassifier {
    pub fn new(endpoint: impl Into<String>, timeout: Duration, jpeg_quality: u8) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("创建分类服务 HTTP 客户端失败")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            jpeg_quality,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl EmotionClassifier for HttpClassifier {
    fn classify(&self, image: &DynamicImage) -> Result<EmotionScoreMap> {
        let jpeg = encode_jpeg(image, self.jpeg_quality)?;
        let part = Part::bytes(jpeg)
            .file_name("frame.jpg")
            .mime_str("image/jpeg")
            .context("构建上传数据失败")?;
        let form = Form::new().part("file", part);

        let response = self.client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .with_context(|| format!("分类服务请求失败: {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().unwrap_or_default();
            anyhow::bail!("分类服务返回错误状态: {} - {}", status, error_text);
        }

        let body: Value = response.json().context("解析分类服务响应失败")?;
        let scores = parse_emotion_response(&body)?;
        debug!("分类结果: {} 个情绪", scores.len());
        Ok(scores)
    }
}

/// 解析分类服务的响应体
pub(crate) fn parse_emotion_response(body: &Value) -> Result<EmotionScoreMap> {
    let analysis = match body {
        Value::Array(items) => items.first().context("分类服务返回空列表")?,
        other => other,
    };

    let emotions = analysis
        .get("emotion")
        .and_then(Value::as_object)
        .context("分类服务响应缺少 emotion 字段")?;

    emotions
        .iter()
        .map(|(label, value)| {
            let confidence = value
                .as_f64()
                .with_context(|| format!("情绪 {} 的置信度不是数值: {}", label, value))?;
            Ok((label.clone(), confidence))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ImageBuffer;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gray_frame() -> DynamicImage {
        DynamicImage::ImageLuma8(ImageBuffer::from_fn(16, 16, |_, _| image::Luma([120u8])))
    }

    #[test]
    fn test_parse_object_response() {
        let body = json!({"emotion": {"happy": 91.5, "sad": 2.0}, "dominant_emotion": "happy"});
        let scores = parse_emotion_response(&body).unwrap();
        assert_eq!(scores.len(), 2);
        assert_eq!(scores["happy"], 91.5);
    }

    #[test]
    fn test_parse_list_response_uses_first_face() {
        let body = json!([
            {"emotion": {"angry": 70.0}},
            {"emotion": {"happy": 99.0}}
        ]);
        let scores = parse_emotion_response(&body).unwrap();
        assert_eq!(scores.len(), 1);
        assert_eq!(scores["angry"], 70.0);
    }

    #[test]
    fn test_parse_rejects_malformed_response() {
        assert!(parse_emotion_response(&json!([])).is_err());
        assert!(parse_emotion_response(&json!({"age": 31})).is_err());
        assert!(parse_emotion_response(&json!({"emotion": {"happy": "lots"}})).is_err());
    }

    #[test]
    fn test_fn_classifier() {
        let classifier = FnClassifier::new(|_img: &DynamicImage| {
            Ok(EmotionScoreMap::from([("neutral".to_string(), 0.5)]))
        });
        let scores = classifier.classify(&gray_frame()).unwrap();
        assert_eq!(scores["neutral"], 0.5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_http_classifier_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/analyze"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"emotion": {"happy": 80.0, "surprise": 15.0, "neutral": 5.0}}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let endpoint = format!("{}/analyze", server.uri());
        let scores = tokio::task::spawn_blocking(move || {
            let classifier = HttpClassifier::new(endpoint, Duration::from_secs(5), 85)?;
            classifier.classify(&gray_frame())
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(scores.len(), 3);
        assert_eq!(scores["surprise"], 15.0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_http_classifier_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/analyze"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model crashed"))
            .mount(&server)
            .await;

        let endpoint = format!("{}/analyze", server.uri());
        let result = tokio::task::spawn_blocking(move || {
            let classifier = HttpClassifier::new(endpoint, Duration::from_secs(5), 85)?;
            classifier.classify(&gray_frame())
        })
        .await
        .unwrap();

        let err = result.unwrap_err().to_string();
        assert!(err.contains("500"));
    }
}
