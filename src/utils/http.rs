// src/utils/http.rs

//! HTTP client utilities.

use std::time::Duration;

use scraper::Html;

use crate::error::{ExternalError, Result};
use crate::models::HttpConfig;

/// Create a configured asynchronous HTTP client.
///
/// Per-request timeouts are applied by the individual clients; the value
/// here is an outer bound for connection setup.
pub fn create_async_client(config: &HttpConfig) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(&config.user_agent)
        .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
        .build()?;
    Ok(client)
}

/// Fetch a page asynchronously and return its body text.
pub async fn fetch_page_async(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> std::result::Result<String, ExternalError> {
    let response = client.get(url).timeout(timeout).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(classify_status(status.as_u16(), format!("GET {url}")));
    }
    Ok(response.text().await?)
}

/// Parse a document body as HTML.
pub fn parse_page(body: &str) -> Html {
    Html::parse_document(body)
}

/// Map a non-success HTTP status to an external error category.
pub fn classify_status(status: u16, context: impl Into<String>) -> ExternalError {
    let message = format!("HTTP {status} ({})", context.into());
    match status {
        429 => ExternalError::rate_limited(message),
        408 | 504 => ExternalError::timeout(message),
        404 | 410 => ExternalError::not_found(message),
        413 => ExternalError::too_large(message),
        _ => ExternalError::server(message),
    }
}
