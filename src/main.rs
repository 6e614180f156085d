use clap::{Parser, Subcommand};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use emotion_parse::{
    analyze_image, process_video, AnalysisStore, AppState, ConfigLoader, EmotionClassifier,
};

/// 视频情绪分析工具 - 按间隔采样视频帧，识别情绪并按时长加权汇总
#[derive(Parser, Debug)]
#[command(name = "emotion-parse")]
#[command(about = "视频情绪分析工具：逐帧情绪识别、加权聚合、结果存储", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 分析本地视频文件
    Video {
        /// 输入视频文件路径
        #[arg(short, long)]
        input: PathBuf,

        /// 输出目录
        #[arg(short, long, default_value = "./output")]
        output: PathBuf,

        /// 配置文件路径（可选，支持 .ini 格式）
        /// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
        #[arg(long)]
        config: Option<PathBuf>,

        /// 采样间隔（每隔多少帧分析一帧）
        /// 可通过环境变量 EMOTION_PARSE_FRAME_INTERVAL 或配置文件设置
        #[arg(long)]
        frame_interval: Option<u64>,

        /// 每帧保留的情绪数量
        #[arg(long)]
        top_k: Option<usize>,

        /// 分类服务地址
        #[arg(long)]
        classifier_url: Option<String>,
    },
    /// 分析单张图片，输出 JSON
    Image {
        /// 输入图片路径
        #[arg(short, long)]
        input: PathBuf,

        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        top_k: Option<usize>,

        #[arg(long)]
        classifier_url: Option<String>,
    },
    /// Web 服务模式
    Serve {
        /// 监听地址（默认从环境变量 EMOTION_PARSE_PORT 读取，如果不存在则使用 0.0.0.0:8000）
        #[arg(short, long)]
        bind: Option<String>,

        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// 生成默认配置文件
    InitConfig {
        #[arg(long, default_value = emotion_parse::config::CONFIG_FILE_NAME)]
        path: PathBuf,
    },
}

impl Commands {
    fn config_file(&self) -> Option<&Path> {
        match self {
            Commands::Video { config, .. }
            | Commands::Image { config, .. }
            | Commands::Serve { config, .. } => config.as_deref(),
            Commands::InitConfig { .. } => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志：RUST_LOG 优先，其次为配置中的日志级别
    let log_level = ConfigLoader::load_server_config(args.command.config_file())
        .map(|c| c.log_level)
        .unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.command {
        Commands::Video {
            input,
            output,
            config: config_file,
            frame_interval,
            top_k,
            classifier_url,
        } => {
            let config = ConfigLoader::load_config(
                config_file.as_deref(),
                frame_interval,
                top_k,
                classifier_url,
                None, // webhook_url 从配置文件或环境变量读取
            )
            .context("加载配置失败")?;

            println!("使用配置: frame_interval={}, top_k={}, classifier_url={}",
                config.frame_interval, config.top_k, config.classifier_url);

            let result = process_video(&input, &output, config)
                .await
                .context("处理视频失败")?;

            let summary = &result.report.aggregated_emotions;
            println!("分析完成: {}/{} 帧，主导情绪: {}，结果目录: {}",
                result.report.video_info.analyzed_frames,
                result.report.video_info.total_frames,
                summary.dominant_emotion.as_deref().unwrap_or("无"),
                result.output_dir.display());
        }
        Commands::Image {
            input,
            config: config_file,
            top_k,
            classifier_url,
        } => {
            let config = ConfigLoader::load_config(config_file.as_deref(), None, top_k, classifier_url, None)
                .context("加载配置失败")?;
            let bytes = std::fs::read(&input)
                .with_context(|| format!("读取图片失败: {}", input.display()))?;

            let analysis = tokio::task::spawn_blocking(move || {
                let classifier = config.http_classifier()?;
                analyze_image(&bytes, &classifier, config.top_k)
            })
            .await
            .context("分析任务异常退出")??;

            println!("{}", serde_json::to_string_pretty(&analysis)?);
        }
        Commands::Serve { bind, config } => {
            // 优先使用命令行参数，其次使用环境变量 EMOTION_PARSE_PORT，最后使用默认值 8000
            let bind_addr = bind.unwrap_or_else(|| {
                std::env::var("EMOTION_PARSE_PORT")
                    .map(|port| format!("0.0.0.0:{}", port))
                    .unwrap_or_else(|_| "0.0.0.0:8000".to_string())
            });
            start_web_server(&bind_addr, config.as_deref()).await?;
        }
        Commands::InitConfig { path } => {
            ConfigLoader::create_default_config(&path)?;
            println!("已生成默认配置文件: {}", path.display());
        }
    }

    Ok(())
}

async fn start_web_server(bind: &str, config_file: Option<&Path>) -> Result<()> {
    let server_config = ConfigLoader::load_server_config(config_file)
        .context("加载配置失败")?;

    let store = AnalysisStore::open(&server_config.data_dir)
        .with_context(|| format!("打开数据目录失败: {}", server_config.data_dir.display()))?;

    // 阻塞 HTTP 客户端不能在异步上下文中创建
    let analyze_config = server_config.analyze.clone();
    let classifier = tokio::task::spawn_blocking(move || analyze_config.http_classifier())
        .await
        .context("创建分类器异常退出")??;
    tracing::info!("分类服务: {}", classifier.endpoint());
    let classifier: Arc<dyn EmotionClassifier> = Arc::new(classifier);

    let app = emotion_parse::build_router(AppState::new(store, server_config.analyze, classifier));

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .context(format!("绑定地址失败: {}", bind))?;

    tracing::info!("Web 服务器启动在: http://{}", bind);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("可用端点:");
    tracing::info!("  • 健康检查: GET  http://{}/health", bind);
    tracing::info!("  • 图片分析: POST http://{}/image", bind);
    tracing::info!("  • 图片列表: GET  http://{}/images", bind);
    tracing::info!("  • 视频分析: POST http://{}/video", bind);
    tracing::info!("  • 视频列表: GET  http://{}/videos", bind);
    tracing::info!("  • 单帧图像: GET  http://{}/video/<id>/frame/<n>/file", bind);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    axum::serve(listener, app)
        .await
        .context("启动服务器失败")?;

    Ok(())
}
