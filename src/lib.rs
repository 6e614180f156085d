pub mod emotion;
pub mod video_processor;
pub mod classifier;
pub mod sampler;
pub mod aggregator;
pub mod metadata;
pub mod pipeline;
pub mod store;
pub mod handler;
pub mod config;

pub use emotion::{top_k_emotions, EmotionScore, EmotionScoreMap};
pub use video_processor::{FfmpegVideoSource, InMemoryVideoSource, VideoFrame, VideoInfo, VideoSource};
pub use classifier::{EmotionClassifier, FnClassifier, HttpClassifier};
pub use sampler::{FrameRecord, FrameSampler, SamplingOutput, SamplingStats};
pub use aggregator::{aggregate, AggregationSummary, EmotionStat};
pub use metadata::{FrameSummary, ImageAnalysis, VideoOverview, VideoReport};
pub use pipeline::{
    analyze_image, analyze_stream, analyze_video_file, process_video, AnalyzeConfig, ProcessOutput, VideoAnalysis,
};
pub use store::{AnalysisStore, StoreError};
pub use handler::{build_router, AppState};
pub use config::{ConfigLoader, ServerConfig};
