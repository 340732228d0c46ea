// src/services/discovery.rs

//! Discovery sources: producers of `(university, url)` candidates.

use std::path::PathBuf;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::error::{AppError, Result};
use crate::models::Discovery;

/// A lazy, finite sequence of discoveries. Items may repeat.
pub trait DiscoverySource: Send {
    fn discoveries(&mut self) -> BoxStream<'_, Result<Discovery>>;
}

/// In-memory list of discoveries.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    items: Vec<Discovery>,
}

impl StaticDiscovery {
    pub fn new(items: Vec<Discovery>) -> Self {
        Self { items }
    }

    /// Build from `(university, url)` pairs.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self::new(pairs.into_iter().map(|(u, url)| Discovery::new(u, url)).collect())
    }
}

impl DiscoverySource for StaticDiscovery {
    fn discoveries(&mut self) -> BoxStream<'_, Result<Discovery>> {
        stream::iter(self.items.clone().into_iter().map(Ok)).boxed()
    }
}

/// Discoveries read from a file.
///
/// Accepts either a JSON array of discoveries or JSON Lines (one object per
/// line, blank lines and `#` comments skipped). JSON Lines files are read
/// lazily; a malformed line yields an error item and reading continues.
#[derive(Debug, Clone)]
pub struct FileDiscovery {
    path: PathBuf,
}

impl FileDiscovery {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DiscoverySource for FileDiscovery {
    fn discoveries(&mut self) -> BoxStream<'_, Result<Discovery>> {
        let path = self.path.clone();
        stream::once(async move { open_source(path).await })
            .flat_map(|opened| match opened {
                Ok(items) => items,
                Err(e) => stream::iter(vec![Err(e)]).boxed(),
            })
            .boxed()
    }
}

async fn open_source(path: PathBuf) -> Result<BoxStream<'static, Result<Discovery>>> {
    let file = tokio::fs::File::open(&path).await.map_err(|e| {
        AppError::config(format!("cannot open discovery file {}: {e}", path.display()))
    })?;
    let mut reader = BufReader::new(file);

    // Peek at the first non-whitespace byte to pick the format.
    let is_array = loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            break false;
        }
        match buf.iter().position(|b| !b.is_ascii_whitespace()) {
            Some(idx) => {
                let first = buf[idx];
                reader.consume(idx);
                break first == b'[';
            }
            None => {
                let len = buf.len();
                reader.consume(len);
            }
        }
    };

    if is_array {
        let mut body = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut reader, &mut body).await?;
        let items: Vec<Discovery> = serde_json::from_str(&body)?;
        return Ok(stream::iter(items.into_iter().map(Ok)).boxed());
    }

    let lines = reader.lines();
    let stream = stream::unfold(Some((lines, 0usize)), |state| async move {
        let (mut lines, mut line_no) = state?;
        loop {
            line_no += 1;
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() || trimmed.starts_with('#') {
                        continue;
                    }
                    let item = serde_json::from_str::<Discovery>(trimmed).map_err(|e| {
                        AppError::validation(format!("discovery line {line_no}: {e}"))
                    });
                    return Some((item, Some((lines, line_no))));
                }
                Ok(None) => return None,
                // An unreadable file ends the stream after reporting once.
                Err(e) => return Some((Err(AppError::Io(e)), None)),
            }
        }
    });
    Ok(stream.boxed())
}
