//! 按时间加权聚合逐帧情绪结果
//!
//! 每个采样帧的权重是它"生效"的时长：到下一个采样帧的时间差，
//! 最后一帧没有后继，固定取 [`DEFAULT_LAST_FRAME_WEIGHT`]。
//! 权重按序列中相邻记录的时间戳计算，因此中途有帧分析失败被丢弃时依然成立。

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::emotion::rank_desc;
use crate::sampler::FrameRecord;

/// 最后一个采样帧的默认权重（秒）
pub const DEFAULT_LAST_FRAME_WEIGHT: f64 = 1.0;

/// 单个情绪的聚合统计，数值均保留两位小数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmotionStat {
    /// 时间加权平均置信度（仅统计该情绪出现的帧）
    pub average: f64,
    pub simple_average: f64,
    pub max: f64,
    pub min: f64,
    /// 总体标准差
    pub std: f64,
    /// 该情绪出现在 top-k 中的时长占比，0-100
    pub presence_percentage: f64,
}

/// 整段视频的聚合结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationSummary {
    /// 按 average 降序排列
    pub emotions: IndexMap<String, EmotionStat>,
    pub dominant_emotion: Option<String>,
    pub dominant_average_confidence: Option<f64>,
}

impl AggregationSummary {
    pub fn is_empty(&self) -> bool {
        self.emotions.is_empty()
    }
}

/// 单个情绪的累加器，只在一次 `aggregate` 调用内存在
#[derive(Debug, Default)]
struct EmotionAccumulator {
    weighted_sum: f64,
    total_weight: f64,
    scores: Vec<f64>,
}

impl EmotionAccumulator {
    fn add(&mut self, confidence: f64, weight: f64) {
        self.weighted_sum += confidence * weight;
        self.total_weight += weight;
        self.scores.push(confidence);
    }

    fn finish(&self, elapsed_seconds: f64) -> EmotionStat {
        let count = self.scores.len() as f64;
        let mean = self.scores.iter().sum::<f64>() / count;
        let variance = self.scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / count;
        let max = self.scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = self.scores.iter().copied().fold(f64::INFINITY, f64::min);

        // 所有出现都落在零时长的帧上时，加权平均退化为简单平均
        let average = if self.total_weight > 0.0 {
            self.weighted_sum / self.total_weight
        } else {
            mean
        };

        EmotionStat {
            average: round2(average),
            simple_average: round2(mean),
            max: round2(max),
            min: round2(min),
            std: round2(variance.sqrt()),
            presence_percentage: round2(presence_percentage(self.total_weight, elapsed_seconds)),
        }
    }
}

/// 聚合逐帧结果
///
/// `records` 必须按帧序号升序。空输入返回空结果，主导情绪为 `None`。
/// 纯函数：同样的输入总是得到完全相同的输出。
pub fn aggregate(records: &[FrameRecord]) -> AggregationSummary {
    let Some(last) = records.last() else {
        return AggregationSummary::default();
    };
    let elapsed_seconds = last.timestamp_seconds();

    let mut accumulators: HashMap<&str, EmotionAccumulator> = HashMap::new();
    for (i, record) in records.iter().enumerate() {
        let weight = match records.get(i + 1) {
            Some(next) => next.timestamp_seconds() - record.timestamp_seconds(),
            None => DEFAULT_LAST_FRAME_WEIGHT,
        };

        for score in record.top_k() {
            accumulators
                .entry(score.emotion.as_str())
                .or_default()
                .add(score.confidence, weight);
        }
    }

    let mut stats: Vec<(String, EmotionStat)> = accumulators
        .into_iter()
        .map(|(emotion, acc)| (emotion.to_string(), acc.finish(elapsed_seconds)))
        .collect();
    // 平均值相同时按标签排序，保证结果确定
    stats.sort_by(|(label_a, a), (label_b, b)| rank_desc(a.average, label_a, b.average, label_b));

    let (dominant_emotion, dominant_average_confidence) = match stats.first() {
        Some((emotion, stat)) => (Some(emotion.clone()), Some(stat.average)),
        None => (None, None),
    };

    AggregationSummary {
        emotions: stats.into_iter().collect(),
        dominant_emotion,
        dominant_average_confidence,
    }
}

/// 出现时长占比
///
/// 视频时长（最后一帧时间戳）为 0 时无法相除：只要该情绪有正权重就记为 100%，否则为 0。
/// 最后一帧带有默认权重，累计时长可能超过视频时长，结果截断到 100。
fn presence_percentage(total_weight: f64, elapsed_seconds: f64) -> f64 {
    if elapsed_seconds <= 0.0 {
        return if total_weight > 0.0 { 100.0 } else { 0.0 };
    }
    (total_weight / elapsed_seconds * 100.0).clamp(0.0, 100.0)
}

/// 保留两位小数
///
/// 按数值的精确十进制展开取舍，恰好为中点时取偶数，
/// 避免先乘 100 再取整带来的二次舍入（如 0.015 实际略小于 0.015）。
pub fn round2(value: f64) -> f64 {
    format!("{:.2}", value).parse().unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emotion::EmotionScore;

    fn record(frame_index: u64, timestamp: f64, emotions: &[(&str, f64)]) -> FrameRecord {
        let top_k = emotions
            .iter()
            .map(|(e, c)| EmotionScore::new(*e, *c))
            .collect();
        FrameRecord::new(frame_index, timestamp, top_k, Vec::new())
    }

    #[test]
    fn test_empty_input() {
        let summary = aggregate(&[]);
        assert!(summary.emotions.is_empty());
        assert_eq!(summary.dominant_emotion, None);
        assert_eq!(summary.dominant_average_confidence, None);
    }

    #[test]
    fn test_single_record() {
        let summary = aggregate(&[record(0, 0.0, &[("joy", 0.9)])]);

        let joy = summary.emotions["joy"];
        assert_eq!(joy.average, 0.9);
        assert_eq!(joy.simple_average, 0.9);
        assert_eq!(joy.max, 0.9);
        assert_eq!(joy.min, 0.9);
        assert_eq!(joy.std, 0.0);
        assert_eq!(summary.dominant_emotion.as_deref(), Some("joy"));
        assert_eq!(summary.dominant_average_confidence, Some(0.9));
    }

    #[test]
    fn test_zero_span_presence_policy() {
        // 单帧且时间戳为 0：按 100% 计
        let summary = aggregate(&[record(0, 0.0, &[("joy", 0.9)])]);
        assert_eq!(summary.emotions["joy"].presence_percentage, 100.0);

        // 帧率未知时所有时间戳都是 0，只有最后一帧带权重
        let summary = aggregate(&[
            record(0, 0.0, &[("sad", 0.6)]),
            record(30, 0.0, &[("joy", 0.8)]),
        ]);
        assert_eq!(summary.emotions["joy"].presence_percentage, 100.0);
        assert_eq!(summary.emotions["sad"].presence_percentage, 0.0);
        // 零权重时 average 退化为简单平均
        assert_eq!(summary.emotions["sad"].average, 0.6);
        assert!(summary.emotions.values().all(|s| s.presence_percentage.is_finite()));
    }

    #[test]
    fn test_two_records_weighted() {
        let summary = aggregate(&[
            record(0, 0.0, &[("joy", 0.8)]),
            record(60, 2.0, &[("joy", 0.4)]),
        ]);

        let joy = summary.emotions["joy"];
        // (0.8 * 2.0 + 0.4 * 1.0) / 3.0 = 0.667
        assert_eq!(joy.average, 0.67);
        assert_eq!(joy.simple_average, 0.6);
        assert_eq!(joy.max, 0.8);
        assert_eq!(joy.min, 0.4);
        assert_eq!(joy.std, 0.2);
        // 累计 3 秒 / 时长 2 秒，截断到 100
        assert_eq!(joy.presence_percentage, 100.0);
    }

    #[test]
    fn test_presence_is_weighted_by_duration() {
        let summary = aggregate(&[
            record(0, 0.0, &[("happy", 0.9), ("neutral", 0.1)]),
            record(30, 1.0, &[("happy", 0.8)]),
            record(60, 2.0, &[("sad", 0.7)]),
            record(90, 3.0, &[("happy", 0.6)]),
            record(120, 4.0, &[("happy", 0.5)]),
        ]);

        assert_eq!(summary.emotions["neutral"].presence_percentage, 25.0);
        assert_eq!(summary.emotions["sad"].presence_percentage, 25.0);
        // 1 + 1 + 1 + 1（最后一帧默认权重）= 4 秒 / 4 秒
        assert_eq!(summary.emotions["happy"].presence_percentage, 100.0);
        assert_eq!(summary.emotions["happy"].simple_average, 0.7);
    }

    #[test]
    fn test_weights_follow_dropped_frames() {
        // 第 30 帧分析失败被丢弃，第 0 帧的权重应延续到第 60 帧
        let summary = aggregate(&[
            record(0, 0.0, &[("angry", 0.2)]),
            record(60, 2.0, &[("angry", 0.8)]),
        ]);
        // (0.2 * 2 + 0.8 * 1) / 3 = 0.4
        assert_eq!(summary.emotions["angry"].average, 0.4);
    }

    #[test]
    fn test_sorted_desc_and_dominant() {
        let summary = aggregate(&[
            record(0, 0.0, &[("sad", 0.3), ("happy", 0.6), ("fear", 0.1)]),
            record(10, 1.0, &[("happy", 0.5), ("sad", 0.4), ("surprise", 0.1)]),
        ]);

        let averages: Vec<f64> = summary.emotions.values().map(|s| s.average).collect();
        assert!(averages.windows(2).all(|w| w[0] >= w[1]));

        let (top_label, top_stat) = summary.emotions.first().unwrap();
        assert_eq!(summary.dominant_emotion.as_deref(), Some(top_label.as_str()));
        assert_eq!(summary.dominant_average_confidence, Some(top_stat.average));
        assert_eq!(top_label, "happy");
    }

    #[test]
    fn test_tie_breaks_by_label() {
        let summary = aggregate(&[record(0, 0.0, &[("surprise", 0.5), ("angry", 0.5)])]);
        let labels: Vec<&str> = summary.emotions.keys().map(String::as_str).collect();
        assert_eq!(labels, vec!["angry", "surprise"]);
        assert_eq!(summary.dominant_emotion.as_deref(), Some("angry"));
    }

    #[test]
    fn test_records_without_emotions() {
        let summary = aggregate(&[record(0, 0.0, &[]), record(30, 1.0, &[])]);
        assert!(summary.is_empty());
        assert_eq!(summary.dominant_emotion, None);
    }

    #[test]
    fn test_idempotent() {
        let records = vec![
            record(0, 0.0, &[("happy", 0.71), ("sad", 0.13)]),
            record(15, 0.5, &[("neutral", 0.42), ("happy", 0.40)]),
            record(30, 1.0, &[("sad", 0.55)]),
        ];
        let first = aggregate(&records);
        let second = aggregate(&records);
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_json_shape_keeps_order() {
        let summary = aggregate(&[
            record(0, 0.0, &[("angry", 0.1), ("sad", 0.9)]),
            record(30, 1.0, &[("angry", 0.2), ("sad", 0.8)]),
        ]);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["dominant_emotion"], "sad");
        assert_eq!(json["emotions"]["sad"]["presence_percentage"], 100.0);

        let text = serde_json::to_string(&summary).unwrap();
        assert!(text.find("\"sad\"").unwrap() < text.find("\"angry\"").unwrap());

        let empty = serde_json::to_value(aggregate(&[])).unwrap();
        assert!(empty["dominant_emotion"].is_null());
        assert!(empty["dominant_average_confidence"].is_null());
        assert_eq!(empty["emotions"], serde_json::json!({}));
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(0.666_666), 0.67);
        assert_eq!(round2(0.6000000000000001), 0.6);
        assert_eq!(round2(12.344), 12.34);
        assert_eq!(round2(0.015), 0.01);
        assert_eq!(round2(0.155), 0.15);
        assert_eq!(round2(0.205), 0.2);
        assert_eq!(round2(0.125), 0.12);
    }

    #[test]
    fn test_stats_round_from_exact_value() {
        for (confidence, expected) in [(0.015, 0.01), (0.155, 0.15), (0.125, 0.12)] {
            let summary = aggregate(&[record(0, 0.0, &[("joy", confidence)])]);
            let joy = summary.emotions["joy"];
            assert_eq!(joy.max, expected);
            assert_eq!(joy.min, expected);
        }
    }
}
