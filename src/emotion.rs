use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// 默认保留的情绪数量
pub const DEFAULT_TOP_K: usize = 3;

/// 分类器输出：情绪标签 -> 原始置信度
///
/// 置信度的取值范围由分类器决定，不保证归一化到 0-1，也不保证总和为 1。
pub type EmotionScoreMap = HashMap<String, f64>;

/// 单个情绪及其置信度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionScore {
    pub emotion: String,
    pub confidence: f64,
}

impl EmotionScore {
    pub fn new(emotion: impl Into<String>, confidence: f64) -> Self {
        Self {
            emotion: emotion.into(),
            confidence,
        }
    }
}

/// 提取置信度最高的 K 个情绪
///
/// 按置信度降序排列；置信度相同时按标签字典序升序，保证结果与 map 的迭代顺序无关。
/// 空输入返回空列表，`k` 大于情绪数量时返回全部。
pub fn top_k_emotions(scores: &EmotionScoreMap, k: usize) -> Vec<EmotionScore> {
    let mut sorted: Vec<EmotionScore> = scores
        .iter()
        .map(|(emotion, confidence)| EmotionScore::new(emotion.clone(), *confidence))
        .collect();

    sorted.sort_by(|a, b| rank_desc(a.confidence, &a.emotion, b.confidence, &b.emotion));
    sorted.truncate(k);
    sorted
}

/// 取 top-k 的第一项作为主导情绪
pub fn dominant_of(top_k: &[EmotionScore]) -> (Option<String>, Option<f64>) {
    match top_k.first() {
        Some(first) => (Some(first.emotion.clone()), Some(first.confidence)),
        None => (None, None),
    }
}

/// 分数降序、标签升序的比较函数，聚合器排序也复用它
pub(crate) fn rank_desc(score_a: f64, label_a: &str, score_b: f64, label_b: &str) -> Ordering {
    score_b
        .total_cmp(&score_a)
        .then_with(|| label_a.cmp(label_b))
}
