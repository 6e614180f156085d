use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use tracing::warn;
pub use crate::pipeline::AnalyzeConfig;

/// 配置文件名（默认搜索位置见 [`ConfigLoader::default_locations`]）
pub const CONFIG_FILE_NAME: &str = "emotion-parse.ini";

/// 服务端配置（在分析配置之外加上存储目录和日志级别）
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// 视频/图片分析配置
    pub analyze: AnalyzeConfig,
    /// 分析结果存储目录
    pub data_dir: PathBuf,
    /// 日志级别（trace, debug, info, warn, error）
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            analyze: AnalyzeConfig::default(),
            data_dir: PathBuf::from("./emotion_data"),
            log_level: "info".to_string(),
        }
    }
}

/// 从某一个来源读到的配置，未设置的字段为 None
#[derive(Debug, Clone, Default)]
struct PartialConfig {
    frame_interval: Option<u64>,
    top_k: Option<usize>,
    jpeg_quality: Option<u8>,
    classifier_url: Option<String>,
    classifier_timeout_secs: Option<u64>,
    webhook_url: Option<String>,
    data_dir: Option<PathBuf>,
    log_level: Option<String>,
}

impl PartialConfig {
    /// 用 `lower` 补齐自身未设置的字段
    fn or(self, lower: PartialConfig) -> PartialConfig {
        PartialConfig {
            frame_interval: self.frame_interval.or(lower.frame_interval),
            top_k: self.top_k.or(lower.top_k),
            jpeg_quality: self.jpeg_quality.or(lower.jpeg_quality),
            classifier_url: self.classifier_url.or(lower.classifier_url),
            classifier_timeout_secs: self.classifier_timeout_secs.or(lower.classifier_timeout_secs),
            webhook_url: self.webhook_url.or(lower.webhook_url),
            data_dir: self.data_dir.or(lower.data_dir),
            log_level: self.log_level.or(lower.log_level),
        }
    }

    fn into_analyze_config(self) -> AnalyzeConfig {
        let defaults = AnalyzeConfig::default();
        AnalyzeConfig {
            frame_interval: self.frame_interval.unwrap_or(defaults.frame_interval),
            top_k: self.top_k.unwrap_or(defaults.top_k),
            jpeg_quality: self.jpeg_quality.unwrap_or(defaults.jpeg_quality),
            classifier_url: self.classifier_url.unwrap_or(defaults.classifier_url),
            classifier_timeout_secs: self.classifier_timeout_secs.unwrap_or(defaults.classifier_timeout_secs),
            webhook_url: self.webhook_url.or(defaults.webhook_url),
        }
    }
}

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从多个源加载分析配置，优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    pub fn load_config(
        config_file: Option<&Path>,
        frame_interval: Option<u64>,
        top_k: Option<usize>,
        classifier_url: Option<String>,
        webhook_url: Option<String>,
    ) -> Result<AnalyzeConfig> {
        let args = PartialConfig {
            frame_interval,
            top_k,
            classifier_url,
            webhook_url,
            ..Default::default()
        };

        let merged = args
            .or(Self::load_from_env(|key| env::var(key).ok()))
            .or(Self::load_file_layer(config_file)?);

        let config = merged.into_analyze_config();
        config.validate()?;
        Ok(config)
    }

    /// 加载服务端配置（环境变量 > 配置文件 > 默认值）
    pub fn load_server_config(config_file: Option<&Path>) -> Result<ServerConfig> {
        let merged = Self::load_from_env(|key| env::var(key).ok())
            .or(Self::load_file_layer(config_file)?);

        let defaults = ServerConfig::default();
        let data_dir = merged.data_dir.clone().unwrap_or(defaults.data_dir);
        let log_level = merged.log_level.clone().unwrap_or(defaults.log_level);
        let analyze = merged.into_analyze_config();
        analyze.validate()?;

        Ok(ServerConfig {
            analyze,
            data_dir,
            log_level,
        })
    }

    /// 指定了配置文件时必须能读取；未指定时依次尝试默认位置，找不到则跳过
    fn load_file_layer(config_file: Option<&Path>) -> Result<PartialConfig> {
        match config_file {
            Some(path) => Self::load_from_file(path),
            None => Ok(Self::load_first_readable(Self::default_locations())),
        }
    }

    /// 按顺序取第一个能解析的配置文件，解析失败的文件记录警告后跳过
    fn load_first_readable(locations: Vec<PathBuf>) -> PartialConfig {
        locations
            .into_iter()
            .filter(|p| p.exists())
            .find_map(|p| match Self::load_from_file(&p) {
                Ok(partial) => Some(partial),
                Err(e) => {
                    warn!("⚠️  配置文件 {} 读取失败，已忽略: {:#}", p.display(), e);
                    None
                }
            })
            .unwrap_or_default()
    }

    /// 从环境变量加载配置
    fn load_from_env<F>(lookup: F) -> PartialConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        PartialConfig {
            frame_interval: lookup("EMOTION_PARSE_FRAME_INTERVAL").and_then(|v| v.parse().ok()),
            top_k: lookup("EMOTION_PARSE_TOP_K").and_then(|v| v.parse().ok()),
            jpeg_quality: lookup("EMOTION_PARSE_JPEG_QUALITY").and_then(|v| v.parse().ok()),
            classifier_url: lookup("EMOTION_PARSE_CLASSIFIER_URL").filter(|v| !v.is_empty()),
            classifier_timeout_secs: lookup("EMOTION_PARSE_CLASSIFIER_TIMEOUT").and_then(|v| v.parse().ok()),
            webhook_url: lookup("EMOTION_PARSE_WEBHOOK_URL").filter(|v| !v.is_empty()),
            data_dir: lookup("EMOTION_PARSE_DATA_DIR").filter(|v| !v.is_empty()).map(PathBuf::from),
            log_level: lookup("LOG_LEVEL").filter(|v| !v.is_empty()),
        }
    }

    /// 从INI配置文件加载配置
    fn load_from_file(config_path: &Path) -> Result<PartialConfig> {
        if !config_path.exists() {
            return Err(anyhow::anyhow!("配置文件不存在: {}", config_path.display()));
        }

        let mut config_parser = configparser::ini::Ini::new();
        config_parser.load(config_path)
            .map_err(|e| anyhow::anyhow!("读取配置文件失败: {}: {}", config_path.display(), e))?;

        // 优先读取 [emotion_parse] 节，没有则使用 [DEFAULT] 节
        let get = |section: &str, key: &str| {
            config_parser.get(section, key)
                .or_else(|| config_parser.get("DEFAULT", key))
                .filter(|v| !v.is_empty())
        };

        Ok(PartialConfig {
            frame_interval: get("emotion_parse", "frame_interval").and_then(|v| v.parse().ok()),
            top_k: get("emotion_parse", "top_k").and_then(|v| v.parse().ok()),
            jpeg_quality: get("emotion_parse", "jpeg_quality").and_then(|v| v.parse().ok()),
            classifier_url: get("emotion_parse", "classifier_url"),
            classifier_timeout_secs: get("emotion_parse", "classifier_timeout_secs").and_then(|v| v.parse().ok()),
            webhook_url: get("emotion_parse", "webhook_url"),
            data_dir: get("server", "data_dir").map(PathBuf::from),
            log_level: get("logging", "level"),
        })
    }

    /// 默认配置文件搜索位置
    fn default_locations() -> Vec<PathBuf> {
        let mut locations = vec![
            PathBuf::from(CONFIG_FILE_NAME),
            PathBuf::from(format!(".{}", CONFIG_FILE_NAME)),
        ];
        if let Some(home) = env::var_os("HOME") {
            locations.push(PathBuf::from(home).join(format!(".{}", CONFIG_FILE_NAME)));
        }
        locations.push(PathBuf::from("/etc").join(CONFIG_FILE_NAME));
        locations
    }

    /// 创建默认配置文件
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let defaults = ServerConfig::default();
        let mut config_parser = configparser::ini::Ini::new();
        config_parser.set("emotion_parse", "frame_interval", Some(defaults.analyze.frame_interval.to_string()));
        config_parser.set("emotion_parse", "top_k", Some(defaults.analyze.top_k.to_string()));
        config_parser.set("emotion_parse", "jpeg_quality", Some(defaults.analyze.jpeg_quality.to_string()));
        config_parser.set("emotion_parse", "classifier_url", Some(defaults.analyze.classifier_url.clone()));
        config_parser.set("emotion_parse", "classifier_timeout_secs", Some(defaults.analyze.classifier_timeout_secs.to_string()));
        config_parser.set("emotion_parse", "webhook_url", Some("".to_string()));
        config_parser.set("server", "data_dir", Some(defaults.data_dir.to_string_lossy().to_string()));
        config_parser.set("logging", "level", Some(defaults.log_level));

        if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context("创建配置目录失败")?;
        }
        config_parser.write(config_path)
            .map_err(|e| anyhow::anyhow!("写入配置文件失败: {}: {}", config_path.display(), e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_layer() {
        let partial = ConfigLoader::load_from_env(env_of(&[
            ("EMOTION_PARSE_FRAME_INTERVAL", "15"),
            ("EMOTION_PARSE_TOP_K", "not-a-number"),
            ("EMOTION_PARSE_WEBHOOK_URL", ""),
            ("LOG_LEVEL", "debug"),
        ]));
        assert_eq!(partial.frame_interval, Some(15));
        assert_eq!(partial.top_k, None);
        assert_eq!(partial.webhook_url, None);
        assert_eq!(partial.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_default_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join(CONFIG_FILE_NAME);
        ConfigLoader::create_default_config(&path).unwrap();

        let partial = ConfigLoader::load_from_file(&path).unwrap();
        let analyze = partial.clone().into_analyze_config();
        assert_eq!(analyze, AnalyzeConfig::default());
        assert_eq!(partial.data_dir, Some(PathBuf::from("./emotion_data")));
        assert_eq!(partial.log_level.as_deref(), Some("info"));
    }

    #[test]
    fn test_priority_args_over_env_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            "[emotion_parse]\nframe_interval = 10\ntop_k = 5\njpeg_quality = 60\nclassifier_url = http://file/analyze\n",
        )
        .unwrap();

        let file = ConfigLoader::load_from_file(&path).unwrap();
        let env = ConfigLoader::load_from_env(env_of(&[
            ("EMOTION_PARSE_TOP_K", "4"),
            ("EMOTION_PARSE_CLASSIFIER_URL", "http://env/analyze"),
        ]));
        let args = PartialConfig {
            classifier_url: Some("http://args/analyze".to_string()),
            ..Default::default()
        };

        let config = args.or(env).or(file).into_analyze_config();
        assert_eq!(config.frame_interval, 10);
        assert_eq!(config.top_k, 4);
        assert_eq!(config.jpeg_quality, 60);
        assert_eq!(config.classifier_url, "http://args/analyze");
        assert_eq!(config.classifier_timeout_secs, AnalyzeConfig::default().classifier_timeout_secs);
    }

    #[test]
    fn test_broken_discovered_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.ini");
        // 非 UTF-8 内容，读取失败
        std::fs::write(&broken, b"[emotion_parse]\nframe_interval = \xff\xfe7\n").unwrap();
        let good = dir.path().join("good.ini");
        std::fs::write(&good, "[emotion_parse]\ntop_k = 2\n").unwrap();

        let partial = ConfigLoader::load_first_readable(vec![
            dir.path().join("missing.ini"),
            broken.clone(),
            good,
        ]);
        assert_eq!(partial.top_k, Some(2));
        assert_eq!(partial.frame_interval, None);

        let none = ConfigLoader::load_first_readable(vec![broken]);
        assert_eq!(none.top_k, None);
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let result = ConfigLoader::load_config(
            Some(Path::new("/no/such/emotion-parse.ini")),
            None,
            None,
            None,
            None,
        );
        assert!(result.is_err());
    }
}
