// src/services/extraction.rs

//! Content extraction clients.
//!
//! - `FirecrawlClient`: FireCrawl `/v1/scrape`, markdown output
//! - `HtmlExtractor`: direct fetch, text pulled from headings, paragraphs,
//!   list items and table cells

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::json;

use crate::error::{ExternalError, Result};
use crate::models::{ExtractionConfig, RawContent, require_env};
use crate::utils::http::{classify_status, fetch_page_async, parse_page};
use crate::utils::normalize_whitespace;

/// Turns a program page URL into raw content.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, url: &str) -> std::result::Result<RawContent, ExternalError>;
}

/// FireCrawl scrape API client.
pub struct FirecrawlClient {
    client: Client,
    endpoint: String,
    api_key: String,
    timeout: Duration,
    only_main_content: bool,
}

#[derive(Debug, Deserialize)]
struct ScrapeResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Option<ScrapeData>,
}

#[derive(Debug, Deserialize)]
struct ScrapeData {
    #[serde(default)]
    markdown: Option<String>,
    #[serde(default)]
    metadata: Option<ScrapeMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScrapeMetadata {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    status_code: Option<u16>,
}

impl FirecrawlClient {
    pub fn new(client: Client, endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(60),
            only_main_content: true,
        }
    }

    /// Build from config; the API key comes from the environment.
    pub fn from_config(client: Client, config: &ExtractionConfig) -> Result<Self> {
        let api_key = require_env(&config.api_key_env)?;
        let mut firecrawl = Self::new(client, &config.endpoint, api_key);
        firecrawl.timeout = Duration::from_millis(config.timeout_ms);
        firecrawl.only_main_content = config.only_main_content;
        Ok(firecrawl)
    }
}

#[async_trait]
impl Extractor for FirecrawlClient {
    async fn extract(&self, url: &str) -> std::result::Result<RawContent, ExternalError> {
        let body = json!({
            "url": url,
            "formats": ["markdown"],
            "onlyMainContent": self.only_main_content,
        });

        let response = self
            .client
            .post(format!("{}/v1/scrape", self.endpoint))
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), format!("scrape {url}")));
        }

        let text = response.text().await?;
        parse_scrape_response(url, &text)
    }
}

fn parse_scrape_response(
    url: &str,
    body: &str,
) -> std::result::Result<RawContent, ExternalError> {
    let parsed: ScrapeResponse = serde_json::from_str(body)
        .map_err(|e| ExternalError::server(format!("unreadable scrape response for {url}: {e}")))?;

    if !parsed.success {
        let reason = parsed.error.unwrap_or_else(|| "unknown error".into());
        return Err(ExternalError::server(format!("scrape of {url} failed: {reason}")));
    }

    let data = parsed
        .data
        .ok_or_else(|| ExternalError::server(format!("scrape of {url} returned no data")))?;
    let metadata = data.metadata.unwrap_or(ScrapeMetadata {
        title: None,
        status_code: None,
    });

    // FireCrawl reports the target page's own status separately.
    if let Some(code) = metadata.status_code {
        if code >= 400 {
            return Err(classify_status(code, format!("target page {url}")));
        }
    }

    match data.markdown {
        Some(markdown) if !markdown.trim().is_empty() => Ok(RawContent::new(markdown, metadata.title)),
        _ => Err(ExternalError::not_found(format!("no content extracted from {url}"))),
    }
}

/// Extractor that fetches the page itself and keeps its readable text.
pub struct HtmlExtractor {
    client: Client,
    timeout: Duration,
}

impl HtmlExtractor {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub fn from_config(client: Client, config: &ExtractionConfig) -> Self {
        Self::new(client, Duration::from_millis(config.timeout_ms))
    }
}

#[async_trait]
impl Extractor for HtmlExtractor {
    async fn extract(&self, url: &str) -> std::result::Result<RawContent, ExternalError> {
        let body = fetch_page_async(&self.client, url, self.timeout).await?;
        extract_page_text(url, &body)
    }
}

fn extract_page_text(url: &str, body: &str) -> std::result::Result<RawContent, ExternalError> {
    let document = parse_page(body);
    let title = select_first_text(&document, "title");

    let content_selector = Selector::parse("h1, h2, h3, h4, p, li, th, td")
        .map_err(|e| ExternalError::server(format!("invalid content selector: {e}")))?;

    let mut lines: Vec<String> = Vec::new();
    for element in document.select(&content_selector) {
        let text = normalize_whitespace(&element.text().collect::<String>());
        if text.is_empty() || lines.last() == Some(&text) {
            continue;
        }
        let line = match element.value().name() {
            "h1" => format!("# {text}"),
            "h2" => format!("## {text}"),
            "h3" | "h4" => format!("### {text}"),
            "li" => format!("- {text}"),
            _ => text,
        };
        lines.push(line);
    }

    if lines.is_empty() {
        return Err(ExternalError::not_found(format!("no readable text at {url}")));
    }
    Ok(RawContent::new(lines.join("\n"), title))
}

fn select_first_text(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    document
        .select(&selector)
        .next()
        .map(|el| normalize_whitespace(&el.text().collect::<String>()))
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExternalErrorKind;

    #[test]
    fn test_parse_successful_scrape() {
        let body = r##"{"success":true,"data":{"markdown":"# MS in Data Science","metadata":{"title":"Data Science | MIT","statusCode":200}}}"##;
        let content = parse_scrape_response("https://mit.edu/ds", body).unwrap();
        assert_eq!(content.markdown, "# MS in Data Science");
        assert_eq!(content.title.as_deref(), Some("Data Science | MIT"));
    }

    #[test]
    fn test_parse_target_not_found() {
        let body = r#"{"success":true,"data":{"markdown":"Not Found","metadata":{"statusCode":404}}}"#;
        let err = parse_scrape_response("https://mit.edu/ds", body).unwrap_err();
        assert_eq!(err.kind, ExternalErrorKind::NotFound);
    }

    #[test]
    fn test_parse_failed_scrape() {
        let body = r#"{"success":false,"error":"upstream overloaded"}"#;
        let err = parse_scrape_response("https://mit.edu/ds", body).unwrap_err();
        assert_eq!(err.kind, ExternalErrorKind::ServerError);
        assert!(err.message.contains("upstream overloaded"));
    }

    #[test]
    fn test_parse_garbage_is_server_error() {
        let err = parse_scrape_response("https://mit.edu/ds", "<html>").unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_extract_page_text() {
        let html = r#"
            <html><head><title> CMU  Data Science </title>
            <script>var tracking = 1;</script></head>
            <body>
              <nav><a href="/">Home</a></nav>
              <h1>Master of Data Science</h1>
              <p>A  16-month   program.</p>
              <ul><li>Machine Learning</li><li>Statistics</li></ul>
            </body></html>"#;
        let content = extract_page_text("https://cmu.edu/ds", html).unwrap();
        assert_eq!(content.title.as_deref(), Some("CMU Data Science"));
        assert_eq!(
            content.markdown,
            "# Master of Data Science\nA 16-month program.\n- Machine Learning\n- Statistics"
        );
    }

    #[test]
    fn test_extract_empty_page() {
        let err = extract_page_text("https://cmu.edu/ds", "<html><body></body></html>")
            .unwrap_err();
        assert_eq!(err.kind, ExternalErrorKind::NotFound);
    }
}
