//! External collaborators of the reconciliation engine.
//!
//! This module contains the narrow contracts and their implementations for:
//! - Discovery sources (`DiscoverySource`)
//! - Content extraction (`Extractor`)
//! - Summarization (`Summarizer`)

mod discovery;
mod extraction;
mod summarize;

pub use discovery::{DiscoverySource, FileDiscovery, StaticDiscovery};
pub use extraction::{Extractor, FirecrawlClient, HtmlExtractor};
pub use summarize::{GeminiClient, Summarizer, check_input_size};
