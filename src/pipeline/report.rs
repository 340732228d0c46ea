//! Run reports for ingestion and batch reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ErrorInfo, Identity, ProgramRecord, Stage};

/// What `observe` did with a discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// A new record was inserted
    Created,
    /// Existing record, details refreshed
    Updated,
    /// Existing record, nothing to change
    Unchanged,
}

/// Result of feeding a discovery source through `observe`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestReport {
    pub seen: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub invalid: usize,
    pub cancelled: bool,
}

impl IngestReport {
    pub(crate) fn count(&mut self, observation: Observation) {
        match observation {
            Observation::Created => self.created += 1,
            Observation::Updated => self.updated += 1,
            Observation::Unchanged => self.unchanged += 1,
        }
    }

    pub fn log_summary(&self) {
        log::info!("[SUMMARY] Ingest");
        log::info!("    seen: {}", self.seen);
        log::info!("    created: {}", self.created);
        log::info!("    updated: {}", self.updated);
        log::info!("    unchanged: {}", self.unchanged);
        log::info!("    invalid: {}", self.invalid);
        if self.cancelled {
            log::warn!("    ingest was cancelled before the source was drained");
        }
    }
}

/// Per-record result of one batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub identity: Identity,
    pub from: Stage,
    pub to: Stage,
    /// Error that stopped the record short of a terminal stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A record sitting in `Failed`, with its diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedRecord {
    pub identity: Identity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_from: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorInfo>,
}

impl From<&ProgramRecord> for FailedRecord {
    fn from(record: &ProgramRecord) -> Self {
        Self {
            identity: record.identity.clone(),
            failed_from: record.failed_from,
            last_error: record.last_error.clone(),
        }
    }
}

/// Completion report of `reconcile_all`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Records whose stage moved forward (includes `completed`)
    pub advanced: usize,
    /// Records processed without a stage change
    pub unchanged: usize,
    /// Records that entered `Failed` during this run
    pub newly_failed: usize,
    /// Records already in `Failed` before the run
    pub already_failed: usize,
    /// Records that reached `SummaryDone` during this run
    pub completed: usize,
    /// Records already in `SummaryDone` before the run
    pub already_complete: usize,
    /// The run stopped early on request
    pub cancelled: bool,
    pub outcomes: Vec<RecordOutcome>,
    /// Every record in `Failed` once the run ended
    pub failed: Vec<FailedRecord>,
}

impl RunReport {
    pub(crate) fn new() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            advanced: 0,
            unchanged: 0,
            newly_failed: 0,
            already_failed: 0,
            completed: 0,
            already_complete: 0,
            cancelled: false,
            outcomes: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Tally one record processed by the run.
    pub(crate) fn record(&mut self, outcome: RecordOutcome) {
        if outcome.to == Stage::Failed && outcome.from != Stage::Failed {
            self.newly_failed += 1;
        } else if outcome.to != outcome.from {
            self.advanced += 1;
            if outcome.to == Stage::SummaryDone {
                self.completed += 1;
            }
        } else {
            self.unchanged += 1;
        }
        self.outcomes.push(outcome);
    }

    /// Records that hit a non-retryable engine error (store failure etc.).
    pub fn errored(&self) -> impl Iterator<Item = &RecordOutcome> {
        self.outcomes.iter().filter(|o| o.error.is_some())
    }

    pub fn log_summary(&self) {
        let elapsed = self.finished_at - self.started_at;
        log::info!("[SUMMARY] Reconcile ({}ms)", elapsed.num_milliseconds());
        log::info!("    advanced: {} ({} completed)", self.advanced, self.completed);
        log::info!("    unchanged: {}", self.unchanged);
        log::info!("    newly failed: {}", self.newly_failed);
        log::info!("    already failed: {}", self.already_failed);
        log::info!("    already complete: {}", self.already_complete);
        if self.cancelled {
            log::warn!("    run was cancelled; remaining records keep their last committed stage");
        }
        for outcome in self.errored() {
            log::warn!(
                "    error on {} at {}: {}",
                outcome.identity,
                outcome.to,
                outcome.error.as_deref().unwrap_or_default()
            );
        }
        for failed in &self.failed {
            match &failed.last_error {
                Some(error) => log::warn!("    FAILED {}: {}", failed.identity, error),
                None => log::warn!("    FAILED {}", failed.identity),
            }
        }
    }
}

/// Record counts per stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub total: usize,
    pub by_stage: Vec<(Stage, usize)>,
    pub failed: Vec<FailedRecord>,
}

impl StatusReport {
    pub fn from_records(records: &[ProgramRecord]) -> Self {
        let by_stage = Stage::ALL
            .iter()
            .map(|stage| (*stage, records.iter().filter(|r| r.stage == *stage).count()))
            .collect();
        let failed = records
            .iter()
            .filter(|r| r.stage == Stage::Failed)
            .map(FailedRecord::from)
            .collect();
        Self {
            total: records.len(),
            by_stage,
            failed,
        }
    }

    pub fn count(&self, stage: Stage) -> usize {
        self.by_stage
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}
