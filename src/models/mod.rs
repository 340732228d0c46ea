// src/models/mod.rs

//! Domain models for the enrichment pipeline.

mod config;
mod discovery;
mod record;

// Re-export all public types
pub use config::{
    Config, EngineConfig, ExtractionConfig, ExtractionProvider, HttpConfig, StoreBackend,
    StoreConfig, SummarizationConfig, require_env,
};
pub use discovery::{Discovery, Tuition, UniversityDetails};
pub use record::{ErrorInfo, Identity, ProgramRecord, RawContent, Stage};
