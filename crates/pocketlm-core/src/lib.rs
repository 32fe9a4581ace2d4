//! On-device inference runtime: device probing, load planning, the engine
//! boundary, prompt formatting, streaming sessions and background summaries.

pub mod config;
pub mod device;
pub mod engine;
pub mod planner;
pub mod prompt;
pub mod session;
pub mod summarizer;

pub use config::{ConfigError, RuntimeConfig};
pub use device::{DeviceMemory, FixedProbe, MemoryProbe, SystemProbe};
pub use engine::{
    EngineAvailability, EngineError, EngineRegistry, EngineSession, GenerateOptions,
    InferenceEngine, SamplingParams, StreamChunk, StreamHandle,
};
pub use planner::{LoadConfig, LoadPlanner, PlanError, PlannerConfig};
pub use prompt::{PromptSource, TemplateStrategy, Templater, TemplaterConfig};
pub use session::{
    Generation, GenerationStream, InferenceSession, LoadRequest, ModelHost, SessionConfig,
    SessionError,
};
pub use summarizer::{
    InMemorySummaryStore, SummarizeError, Summarizer, SummarizerConfig, SummaryStore,
};
