pub mod types;
pub mod config;
pub mod store;
pub mod pool;
pub mod fetcher;
pub mod parser;
pub mod ingest;
pub mod llm_adapter;
pub mod scoring;
pub mod dedup;
pub mod assign;
pub mod generator;
pub mod workflow;
pub mod trigger;
pub mod pipeline;
pub mod api;
pub mod utils;

pub use types::*;
pub use config::PipelineConfig;
pub use fetcher::Fetcher;
pub use parser::FeedParser;
pub use ingest::{FeedIngester, IngestReport};
pub use llm_adapter::{LlmAdapter, MockLlmAdapter, OpenAiAdapter};
pub use pipeline::{IssuePipeline, OutcomeKind, PhaseOutcome};
pub use store::{ContentStore, InMemoryStore, PgStore};
pub use trigger::{ChannelTrigger, HttpPhaseTrigger, LoggingTrigger, PhaseTrigger, RecordingTrigger};
pub use workflow::{IssueStatus, OperatorAction, Phase};
