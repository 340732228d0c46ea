// src/pipeline/setup.rs

//! Builds an [`Engine`] from configuration.

use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::models::{Config, ExtractionProvider, StoreBackend};
use crate::pipeline::engine::{Engine, EngineSettings};
use crate::services::{Extractor, FirecrawlClient, GeminiClient, HtmlExtractor, Summarizer};
use crate::storage::{LocalStore, NotionStore, RecordStore};
use crate::utils::http;

/// Open the configured record store.
///
/// The local backend lives at `{storage_dir}/{store.records_dir}`.
pub fn open_store(config: &Config, storage_dir: &Path) -> Result<Arc<dyn RecordStore>> {
    let store: Arc<dyn RecordStore> = match config.store.backend {
        StoreBackend::Local => {
            let root = storage_dir.join(&config.store.records_dir);
            log::debug!("Using local record store at {}", root.display());
            Arc::new(LocalStore::new(root))
        }
        StoreBackend::Notion => {
            log::debug!("Using Notion record store");
            let client = http::create_async_client(&config.http)?;
            Arc::new(NotionStore::from_config(client, &config.store)?)
        }
    };
    Ok(store)
}

/// Wire store, extractor and summarizer into an engine.
///
/// Missing credentials surface here as configuration errors, before any
/// record is touched. Without a FireCrawl key the engine extracts pages
/// directly.
pub fn build_engine(config: &Config, storage_dir: &Path) -> Result<Engine> {
    config.validate()?;

    let store = open_store(config, storage_dir)?;
    let client = http::create_async_client(&config.http)?;

    let extractor: Arc<dyn Extractor> = match config.extraction.provider {
        ExtractionProvider::Firecrawl => {
            match FirecrawlClient::from_config(client.clone(), &config.extraction) {
                Ok(firecrawl) => Arc::new(firecrawl),
                Err(e) => {
                    log::warn!("{e}; falling back to direct page extraction");
                    Arc::new(HtmlExtractor::from_config(client.clone(), &config.extraction))
                }
            }
        }
        ExtractionProvider::Html => {
            Arc::new(HtmlExtractor::from_config(client.clone(), &config.extraction))
        }
    };
    let summarizer: Arc<dyn Summarizer> =
        Arc::new(GeminiClient::from_config(client, &config.summarization)?);

    Ok(Engine::new(
        store,
        extractor,
        summarizer,
        EngineSettings::from_config(config),
    ))
}
