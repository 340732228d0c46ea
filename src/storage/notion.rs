//! Notion database record store.
//!
//! Each record is one page in a Notion database. The page carries a few
//! human-facing properties plus the full record as JSON:
//!
//! | Property           | Type      | Content                          |
//! |--------------------|-----------|----------------------------------|
//! | `Name`             | title     | university name                  |
//! | `Official Website` | url       | canonical program URL            |
//! | `State`            | rich_text | state / province, when known     |
//! | `Identity`         | rich_text | identity key (lookup filter)     |
//! | `Stage`            | select    | enrichment stage                 |
//! | `Revision`         | number    | optimistic-concurrency revision  |
//! | `Summary`          | rich_text | summary text                     |
//! | `Record`           | rich_text | `ProgramRecord` without markdown |
//!
//! Extracted markdown lives in the page body as paragraph blocks, since a
//! whole page rarely fits the rich-text property limit.
//!
//! Notion has no compare-and-swap, so the revision check is a read followed
//! by a write. The per-identity guard in the engine keeps this process from
//! racing itself; other writers are caught on their next read.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde_json::{Value, json};

use crate::error::{AppError, Result};
use crate::models::{Identity, ProgramRecord, StoreConfig, require_env};
use crate::storage::{RecordStore, check_revision, next_revision};

const NOTION_VERSION: &str = "2022-06-28";
/// Notion caps a single rich-text object at 2000 characters.
const RICH_TEXT_CHUNK: usize = 2000;
/// ...and a rich-text property at 100 objects.
const RICH_TEXT_MAX_CHUNKS: usize = 100;
/// Most blocks accepted by one append request.
const BLOCK_BATCH: usize = 100;

/// Record store backed by a Notion database.
pub struct NotionStore {
    client: Client,
    endpoint: String,
    api_key: String,
    database_id: String,
    timeout: Duration,
}

impl NotionStore {
    pub fn new(
        client: Client,
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        database_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            database_id: database_id.into(),
            timeout,
        }
    }

    /// Build from config; credentials come from the environment.
    pub fn from_config(client: Client, config: &StoreConfig) -> Result<Self> {
        let api_key = require_env(&config.notion_api_key_env)?;
        let database_id = require_env(&config.notion_database_env)?;
        Ok(Self::new(
            client,
            &config.notion_endpoint,
            api_key,
            database_id,
            Duration::from_millis(config.timeout_ms),
        ))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.endpoint, path))
            .bearer_auth(&self.api_key)
            .header("Notion-Version", NOTION_VERSION)
            .timeout(self.timeout)
    }

    async fn send(&self, builder: RequestBuilder, context: &str) -> Result<Value> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::store(format!(
                "Notion {context} failed with HTTP {status}: {body}"
            )));
        }
        Ok(response.json().await?)
    }

    async fn query(&self, filter: Option<Value>) -> Result<Vec<Value>> {
        let path = format!("/databases/{}/query", self.database_id);
        let mut pages = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut body = json!({ "page_size": 100 });
            if let Some(filter) = &filter {
                body["filter"] = filter.clone();
            }
            if let Some(cursor) = &cursor {
                body["start_cursor"] = json!(cursor);
            }

            let response = self
                .send(self.request(Method::POST, &path).json(&body), "query")
                .await?;
            if let Some(results) = response["results"].as_array() {
                pages.extend(results.iter().cloned());
            }

            match (response["has_more"].as_bool(), response["next_cursor"].as_str()) {
                (Some(true), Some(next)) => cursor = Some(next.to_string()),
                _ => break,
            }
        }

        Ok(pages)
    }

    async fn find_page(&self, identity: &Identity) -> Result<Option<Value>> {
        let filter = json!({
            "property": "Identity",
            "rich_text": { "equals": identity.as_str() }
        });
        Ok(self.query(Some(filter)).await?.into_iter().next())
    }

    /// All child block objects of a page.
    async fn children(&self, page_id: &str) -> Result<Vec<Value>> {
        let mut blocks = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut path = format!("/blocks/{page_id}/children?page_size=100");
            if let Some(cursor) = &cursor {
                path.push_str(&format!("&start_cursor={cursor}"));
            }
            let response = self
                .send(self.request(Method::GET, &path), "block list")
                .await?;
            if let Some(results) = response["results"].as_array() {
                blocks.extend(results.iter().cloned());
            }

            match (response["has_more"].as_bool(), response["next_cursor"].as_str()) {
                (Some(true), Some(next)) => cursor = Some(next.to_string()),
                _ => break,
            }
        }

        Ok(blocks)
    }

    /// Replace the page body with `markdown`, or clear it.
    async fn replace_content(&self, page_id: &str, markdown: Option<&str>) -> Result<()> {
        for block in self.children(page_id).await? {
            if let Some(block_id) = block["id"].as_str() {
                self.send(
                    self.request(Method::DELETE, &format!("/blocks/{block_id}")),
                    "block delete",
                )
                .await?;
            }
        }

        let blocks = markdown.map(content_blocks).unwrap_or_default();
        for batch in blocks.chunks(BLOCK_BATCH) {
            let body = json!({ "children": batch });
            self.send(
                self.request(Method::PATCH, &format!("/blocks/{page_id}/children"))
                    .json(&body),
                "block append",
            )
            .await?;
        }
        Ok(())
    }

    /// Read a page into a record, loading the markdown from the page body.
    async fn load(&self, page: &Value) -> Result<ProgramRecord> {
        let mut record = page_to_record(page)?;
        if let (Some(content), Some(page_id)) = (record.raw_content.as_mut(), page["id"].as_str()) {
            content.markdown = blocks_text(&self.children(page_id).await?);
        }
        Ok(record)
    }
}

#[async_trait]
impl RecordStore for NotionStore {
    async fn get(&self, identity: &Identity) -> Result<Option<ProgramRecord>> {
        match self.find_page(identity).await? {
            Some(page) => self.load(&page).await.map(Some),
            None => Ok(None),
        }
    }

    async fn upsert(&self, record: &ProgramRecord) -> Result<ProgramRecord> {
        let page = self.find_page(&record.identity).await?;
        let stored_revision = page.as_ref().map(page_revision);
        check_revision(record, stored_revision)?;

        let stored = next_revision(record);
        let properties = record_properties(&stored)?;
        let previous_fetch = page
            .as_ref()
            .and_then(|p| page_to_record(p).ok())
            .and_then(|r| r.raw_content)
            .map(|c| c.fetched_at);
        let content = stored.raw_content.as_ref();

        let (page_id, content_changed) = match page.as_ref().and_then(|p| p["id"].as_str()) {
            Some(page_id) => {
                let body = json!({ "properties": properties });
                self.send(
                    self.request(Method::PATCH, &format!("/pages/{page_id}"))
                        .json(&body),
                    "page update",
                )
                .await?;
                (page_id.to_string(), previous_fetch != content.map(|c| c.fetched_at))
            }
            None => {
                let body = json!({
                    "parent": { "database_id": self.database_id },
                    "properties": properties,
                });
                let created = self
                    .send(self.request(Method::POST, "/pages").json(&body), "page create")
                    .await?;
                let page_id = created["id"]
                    .as_str()
                    .ok_or_else(|| AppError::store("Notion page create returned no id"))?;
                (page_id.to_string(), content.is_some())
            }
        };

        if content_changed {
            self.replace_content(&page_id, content.map(|c| c.markdown.as_str()))
                .await?;
        }

        log::debug!("Notion page for {} at revision {}", stored.identity, stored.revision);
        Ok(stored)
    }

    async fn list(&self) -> Result<Vec<ProgramRecord>> {
        let mut records = Vec::new();
        for page in self.query(None).await? {
            match self.load(&page).await {
                Ok(record) => records.push(record),
                Err(e) => log::warn!("Skipping Notion page without a readable record: {e}"),
            }
        }
        records.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(records)
    }
}

/// Split text into Notion rich-text objects.
fn rich_text(text: &str) -> Result<Value> {
    let chars: Vec<char> = text.chars().collect();
    let chunks: Vec<Value> = chars
        .chunks(RICH_TEXT_CHUNK)
        .map(|chunk| {
            let content: String = chunk.iter().collect();
            json!({ "type": "text", "text": { "content": content } })
        })
        .collect();
    if chunks.len() > RICH_TEXT_MAX_CHUNKS {
        return Err(AppError::store(format!(
            "text of {} characters exceeds the Notion rich-text limit",
            chars.len()
        )));
    }
    Ok(Value::Array(chunks))
}

/// Concatenate the plain text of a rich-text or title property.
fn plain_text(property: &Value, kind: &str) -> String {
    property[kind]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p["plain_text"].as_str().or_else(|| p["text"]["content"].as_str()))
                .collect()
        })
        .unwrap_or_default()
}

fn record_properties(record: &ProgramRecord) -> Result<Value> {
    let state = record
        .details
        .as_ref()
        .and_then(|d| d.state.clone())
        .unwrap_or_default();
    let mut slim = record.clone();
    if let Some(content) = slim.raw_content.as_mut() {
        content.markdown.clear();
    }
    let serialized = serde_json::to_string(&slim)?;

    Ok(json!({
        "Name": { "title": rich_text(&record.university)? },
        "Official Website": { "url": record.url },
        "State": { "rich_text": rich_text(&state)? },
        "Identity": { "rich_text": rich_text(record.identity.as_str())? },
        "Stage": { "select": { "name": record.stage.as_str() } },
        "Revision": { "number": record.revision },
        "Summary": { "rich_text": rich_text(record.summary.as_deref().unwrap_or_default())? },
        "Record": { "rich_text": rich_text(&serialized)? },
    }))
}

/// Paragraph blocks carrying `markdown`, one rich-text object per block.
fn content_blocks(markdown: &str) -> Vec<Value> {
    let chars: Vec<char> = markdown.chars().collect();
    chars
        .chunks(RICH_TEXT_CHUNK)
        .map(|chunk| {
            let content: String = chunk.iter().collect();
            json!({
                "object": "block",
                "type": "paragraph",
                "paragraph": {
                    "rich_text": [{ "type": "text", "text": { "content": content } }]
                }
            })
        })
        .collect()
}

/// Concatenated text of the paragraph blocks written by `content_blocks`.
fn blocks_text(blocks: &[Value]) -> String {
    blocks
        .iter()
        .filter(|b| b["type"] == "paragraph")
        .map(|b| plain_text(&b["paragraph"], "rich_text"))
        .collect()
}

fn page_revision(page: &Value) -> u64 {
    page["properties"]["Revision"]["number"]
        .as_u64()
        .unwrap_or(0)
}

fn page_to_record(page: &Value) -> Result<ProgramRecord> {
    let raw = plain_text(&page["properties"]["Record"], "rich_text");
    if raw.is_empty() {
        return Err(AppError::store("Notion page has an empty Record property"));
    }
    let mut record: ProgramRecord = serde_json::from_str(&raw)?;
    record.revision = page_revision(page);
    Ok(record)
}
