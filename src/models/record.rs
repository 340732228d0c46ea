//! Program record, identity and enrichment stage.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ExternalError, Result};
use crate::models::UniversityDetails;
use crate::utils::url::{canonical_url, normalize_name, normalize_url, parse_program_url};

/// Stable deduplication key: normalized university name plus normalized URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Derive an identity from raw discovery input.
    pub fn derive(university: &str, url: &str) -> Result<Self> {
        let name = normalize_name(university)?;
        let url = parse_program_url(url)?;
        Ok(Self(format!("{}::{}", name, normalize_url(&url))))
    }

    /// Wrap an identity string read back from storage or the CLI.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// SHA-256 hex digest, used as a storage key.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position of a record in the enrichment state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Discovered,
    BasicStored,
    ExtractionPending,
    ExtractionDone,
    SummaryPending,
    SummaryDone,
    Failed,
}

impl Stage {
    /// Forward order of the non-failed stages. `Failed` has no rank.
    pub fn rank(self) -> Option<u8> {
        match self {
            Stage::Discovered => Some(0),
            Stage::BasicStored => Some(1),
            Stage::ExtractionPending => Some(2),
            Stage::ExtractionDone => Some(3),
            Stage::SummaryPending => Some(4),
            Stage::SummaryDone => Some(5),
            Stage::Failed => None,
        }
    }

    /// Terminal stages are skipped by batch reconciliation.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::SummaryDone | Stage::Failed)
    }

    /// Whether moving from `self` to `next` respects forward-only ordering.
    ///
    /// Entering `Failed` is always allowed; leaving it only through re-drive.
    pub fn can_move_to(self, next: Stage) -> bool {
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (Some(from), Some(to)) => to >= from,
            (None, Some(_)) => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Discovered => "discovered",
            Stage::BasicStored => "basic_stored",
            Stage::ExtractionPending => "extraction_pending",
            Stage::ExtractionDone => "extraction_done",
            Stage::SummaryPending => "summary_pending",
            Stage::SummaryDone => "summary_done",
            Stage::Failed => "failed",
        }
    }

    pub const ALL: [Stage; 7] = [
        Stage::Discovered,
        Stage::BasicStored,
        Stage::ExtractionPending,
        Stage::ExtractionDone,
        Stage::SummaryPending,
        Stage::SummaryDone,
        Stage::Failed,
    ];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content returned by the extraction client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawContent {
    /// Page body as markdown or plain text
    pub markdown: String,

    /// Page title, when the extractor reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// When the content was fetched
    pub fetched_at: DateTime<Utc>,
}

impl RawContent {
    pub fn new(markdown: impl Into<String>, title: Option<String>) -> Self {
        Self {
            markdown: markdown.into(),
            title,
            fetched_at: Utc::now(),
        }
    }
}

/// Diagnostic descriptor of the last failure on a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Failure category (`rate_limited`, `timeout`, ..., `budget_exhausted`)
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ErrorInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            at: Utc::now(),
        }
    }
}

impl From<&ExternalError> for ErrorInfo {
    fn from(err: &ExternalError) -> Self {
        Self::new(err.kind.as_str(), err.message.clone())
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// One discovered data-science program page and its enrichment state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramRecord {
    pub identity: Identity,

    /// University name as first observed
    pub university: String,

    /// Canonical program page URL
    pub url: String,

    pub stage: Stage,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_content: Option<RawContent>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    /// Attempts made in the current stage transition
    #[serde(default)]
    pub attempt_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorInfo>,

    /// Stage the record was in when it entered `Failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_from: Option<Stage>,

    /// University metadata from the ranking source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<UniversityDetails>,

    /// Optimistic-concurrency counter maintained by the store
    #[serde(default)]
    pub revision: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProgramRecord {
    /// Build a fresh `Discovered` record from raw discovery input.
    pub fn discovered(university: &str, url: &str) -> Result<Self> {
        let identity = Identity::derive(university, url)?;
        let canonical = canonical_url(&parse_program_url(url)?);
        let now = Utc::now();
        Ok(Self {
            identity,
            university: crate::utils::normalize_whitespace(university),
            url: canonical.to_string(),
            stage: Stage::Discovered,
            raw_content: None,
            summary: None,
            attempt_count: 0,
            last_error: None,
            failed_from: None,
            details: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Move to the next stage, resetting retry bookkeeping.
    pub(crate) fn enter(&mut self, stage: Stage) {
        debug_assert!(self.stage.can_move_to(stage));
        self.stage = stage;
        self.attempt_count = 0;
        self.last_error = None;
        self.touch();
    }

    /// Record a failed attempt without changing stage.
    pub(crate) fn record_attempt_failure(&mut self, error: ErrorInfo) {
        self.attempt_count += 1;
        self.last_error = Some(error);
        self.touch();
    }

    /// Enter `Failed`, remembering where the record came from.
    pub(crate) fn fail(&mut self, error: ErrorInfo) {
        if self.stage != Stage::Failed {
            self.failed_from = Some(self.stage);
        }
        self.stage = Stage::Failed;
        self.last_error = Some(error);
        self.touch();
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Check the field/stage invariants of a record.
    pub fn is_consistent(&self) -> bool {
        let content_ok = match self.stage.rank() {
            Some(rank) if rank < 3 => self.raw_content.is_none(),
            Some(_) => self.raw_content.is_some(),
            None => true,
        };
        let summary_ok = match self.stage {
            Stage::SummaryDone => self.summary.is_some(),
            Stage::Failed => true,
            _ => self.summary.is_none(),
        };
        content_ok && summary_ok
    }
}
