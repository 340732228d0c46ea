// src/pipeline/engine.rs

//! Reconciliation engine.
//!
//! Owns the mapping from discovered pages to `ProgramRecord` state and
//! drives every record through its stage machine:
//!
//! ```text
//! Discovered → BasicStored → ExtractionPending → ExtractionDone
//!            → SummaryPending → SummaryDone
//!   (any) ───────────────────────────────────→ Failed ──redrive──┐
//!                                                 ↑ prior stage ←┘
//! ```
//!
//! Every commit is a read-modify-write against the record store. Work on a
//! single identity is serialized through [`IdentityLocks`]; distinct
//! identities run in parallel up to `worker_concurrency`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::stream::{self, StreamExt};

use crate::error::{AppError, ExternalError, Result};
use crate::models::{Config, Discovery, ErrorInfo, Identity, ProgramRecord, RawContent, Stage};
use crate::pipeline::guard::IdentityLocks;
use crate::pipeline::report::{
    FailedRecord, IngestReport, Observation, RecordOutcome, RunReport, StatusReport,
};
use crate::pipeline::retry::{RetryPolicy, with_timeout};
use crate::services::{DiscoverySource, Extractor, Summarizer};
use crate::storage::RecordStore;
use crate::utils::truncate_graphemes;

/// Tunables of the engine, derived from [`Config`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub retry: RetryPolicy,
    pub extraction_timeout: Duration,
    pub summarization_timeout: Duration,
    pub worker_concurrency: usize,
    pub max_summary_chars: usize,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry: RetryPolicy::from_config(&config.engine),
            extraction_timeout: Duration::from_millis(config.extraction.timeout_ms),
            summarization_timeout: Duration::from_millis(config.summarization.timeout_ms),
            worker_concurrency: config.engine.worker_concurrency.max(1),
            max_summary_chars: config.summarization.max_summary_chars,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Which external call a pending stage is waiting on.
#[derive(Debug, Clone, Copy)]
enum Call {
    Extract,
    Summarize,
}

impl Call {
    fn pending(self) -> Stage {
        match self {
            Call::Extract => Stage::ExtractionPending,
            Call::Summarize => Stage::SummaryPending,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Call::Extract => "extraction",
            Call::Summarize => "summarization",
        }
    }
}

/// Successful result of an external call.
enum CallOutput {
    Content(RawContent),
    Summary(String),
}

/// The reconciliation engine.
pub struct Engine {
    store: Arc<dyn RecordStore>,
    extractor: Arc<dyn Extractor>,
    summarizer: Arc<dyn Summarizer>,
    settings: EngineSettings,
    locks: IdentityLocks,
    cancelled: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        extractor: Arc<dyn Extractor>,
        summarizer: Arc<dyn Summarizer>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            extractor,
            summarizer,
            settings,
            locks: IdentityLocks::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Shared flag that stops batch work at the next record boundary.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    // --- Observation ---

    /// Register a discovered `(university, url)` pair.
    ///
    /// Idempotent: repeated calls with an equivalent pair leave the store
    /// untouched after the first.
    pub async fn observe(&self, university: &str, url: &str) -> Result<Identity> {
        let (identity, _) = self
            .observe_discovery(&Discovery::new(university, url))
            .await?;
        Ok(identity)
    }

    /// Register a discovery, attaching any university details it carries.
    pub async fn observe_discovery(&self, discovery: &Discovery) -> Result<(Identity, Observation)> {
        let mut fresh = ProgramRecord::discovered(&discovery.university, &discovery.url)?;
        fresh.details = discovery.details.clone().filter(|d| !d.is_empty());
        let identity = fresh.identity.clone();

        let _guard = self.locks.lock(&identity).await;
        let mut conflicts = 0;

        loop {
            let attempt = match self.store.get(&identity).await? {
                None => self.store.upsert(&fresh).await.map(|_| Observation::Created),
                Some(existing) => match &fresh.details {
                    Some(details) if existing.details.as_ref() != Some(details) => {
                        let mut updated = existing;
                        updated.details = Some(details.clone());
                        updated.touch();
                        self.store.upsert(&updated).await.map(|_| Observation::Updated)
                    }
                    _ => Ok(Observation::Unchanged),
                },
            };

            match attempt {
                Ok(observation) => {
                    if observation == Observation::Created {
                        log::info!("Discovered {}", identity);
                    }
                    return Ok((identity, observation));
                }
                Err(e) if e.is_conflict() && conflicts < self.settings.retry.budget => {
                    conflicts += 1;
                    log::warn!("Store conflict observing {identity}, re-reading ({conflicts})");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Observe every item of a discovery source.
    ///
    /// Invalid items are logged and counted; store failures abort.
    pub async fn ingest(&self, source: &mut dyn DiscoverySource) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        let mut items = source.discoveries();

        while let Some(item) = items.next().await {
            if self.is_cancelled() {
                report.cancelled = true;
                break;
            }
            report.seen += 1;

            let discovery = match item {
                Ok(discovery) => discovery,
                Err(AppError::Validation(message)) => {
                    log::warn!("Skipping discovery: {message}");
                    report.invalid += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self.observe_discovery(&discovery).await {
                Ok((_, observation)) => report.count(observation),
                Err(AppError::Validation(message)) => {
                    log::warn!(
                        "Skipping discovery ({}, {}): {}",
                        discovery.university,
                        discovery.url,
                        message
                    );
                    report.invalid += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }

    // --- Transitions ---

    /// Drive one record a single step forward and return its new stage.
    ///
    /// Steps that call an external service retry within the stage budget.
    /// Terminal records are returned unchanged.
    pub async fn advance(&self, identity: &Identity) -> Result<Stage> {
        let _guard = self.locks.lock(identity).await;
        let record = self.load(identity).await?;

        match record.stage {
            Stage::Discovered => {
                let stored = self
                    .commit(record, Stage::Discovered, |r| r.enter(Stage::BasicStored))
                    .await?;
                Ok(stored.stage)
            }
            Stage::BasicStored => {
                let pending = self
                    .commit(record, Stage::BasicStored, |r| r.enter(Stage::ExtractionPending))
                    .await?;
                self.run_call(pending, Call::Extract).await
            }
            Stage::ExtractionPending => self.run_call(record, Call::Extract).await,
            Stage::ExtractionDone => {
                if record.raw_content.is_none() {
                    let failed = self
                        .commit(record, Stage::ExtractionDone, |r| {
                            r.fail(ErrorInfo::new("missing_content", "no raw content to summarize"))
                        })
                        .await?;
                    return Ok(failed.stage);
                }
                let pending = self
                    .commit(record, Stage::ExtractionDone, |r| r.enter(Stage::SummaryPending))
                    .await?;
                self.run_call(pending, Call::Summarize).await
            }
            Stage::SummaryPending => self.run_call(record, Call::Summarize).await,
            Stage::SummaryDone | Stage::Failed => Ok(record.stage),
        }
    }

    /// Reset a `Failed` record to the stage it failed from.
    pub async fn redrive(&self, identity: &Identity) -> Result<Stage> {
        let _guard = self.locks.lock(identity).await;
        let record = self.load(identity).await?;
        if record.stage != Stage::Failed {
            return Ok(record.stage);
        }

        let stored = self
            .commit(record, Stage::Failed, |r| {
                let fallback = if r.raw_content.is_some() {
                    Stage::ExtractionDone
                } else {
                    Stage::BasicStored
                };
                let prior = match r.failed_from {
                    // Content-bearing stages need the content they were built on.
                    Some(stage) if stage.rank() >= Some(3) && r.raw_content.is_none() => {
                        Stage::BasicStored
                    }
                    Some(stage) => stage,
                    None => fallback,
                };
                r.stage = prior;
                r.failed_from = None;
                r.attempt_count = 0;
                r.last_error = None;
                r.touch();
            })
            .await?;
        log::info!("Re-driving {} from {}", stored.identity, stored.stage);
        Ok(stored.stage)
    }

    /// Re-drive every `Failed` record. Returns how many were reset.
    pub async fn redrive_failed(&self) -> Result<usize> {
        let failed: Vec<Identity> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|r| r.stage == Stage::Failed)
            .map(|r| r.identity)
            .collect();

        let mut reset = 0;
        for identity in &failed {
            if self.redrive(identity).await? != Stage::Failed {
                reset += 1;
            }
        }
        Ok(reset)
    }

    /// Discard extracted content and summary so the record is fetched again.
    ///
    /// Records that have no content yet are left alone.
    pub async fn reextract(&self, identity: &Identity) -> Result<Stage> {
        let _guard = self.locks.lock(identity).await;
        let record = self.load(identity).await?;
        if record.raw_content.is_none() && record.stage != Stage::Failed {
            return Ok(record.stage);
        }

        let expected = record.stage;
        let stored = self
            .commit(record, expected, |r| {
                r.raw_content = None;
                r.summary = None;
                r.stage = Stage::BasicStored;
                r.failed_from = None;
                r.attempt_count = 0;
                r.last_error = None;
                r.touch();
            })
            .await?;
        log::info!("Scheduled re-extraction of {}", stored.identity);
        Ok(stored.stage)
    }

    // --- Batch ---

    /// Drive every non-terminal record to a terminal stage.
    ///
    /// Per-record failures are collected into the report; they never stop
    /// the batch. Cancellation is honoured between records and between
    /// committed transitions.
    pub async fn reconcile_all(&self) -> Result<RunReport> {
        let mut report = RunReport::new();
        let mut pending = Vec::new();

        for record in self.store.list().await? {
            match record.stage {
                Stage::Failed => report.already_failed += 1,
                Stage::SummaryDone => report.already_complete += 1,
                stage => pending.push((record.identity, stage)),
            }
        }

        log::info!(
            "Reconciling {} record(s) with {} worker(s)",
            pending.len(),
            self.settings.worker_concurrency
        );

        let mut outcomes = stream::iter(pending)
            .map(|(identity, stage)| async move { self.drive(identity, stage).await })
            .buffer_unordered(self.settings.worker_concurrency);

        while let Some(outcome) = outcomes.next().await {
            report.record(outcome);
        }
        drop(outcomes);

        report.cancelled = self.is_cancelled();
        report.failed = self
            .store
            .list()
            .await?
            .iter()
            .filter(|r| r.stage == Stage::Failed)
            .map(FailedRecord::from)
            .collect();
        report.finished_at = chrono::Utc::now();
        Ok(report)
    }

    /// Counts per stage plus failed diagnostics.
    pub async fn status(&self) -> Result<StatusReport> {
        Ok(StatusReport::from_records(&self.store.list().await?))
    }

    /// Advance one record until it is terminal, stalls or the run is cancelled.
    async fn drive(&self, identity: Identity, initial: Stage) -> RecordOutcome {
        let mut stage = initial;
        let mut error = None;

        while !stage.is_terminal() && !self.is_cancelled() {
            match self.advance(&identity).await {
                Ok(next) if next == stage => break,
                Ok(next) => stage = next,
                Err(e) => {
                    log::error!("Reconciling {identity} stopped at {stage}: {e}");
                    error = Some(e.to_string());
                    break;
                }
            }
        }

        RecordOutcome {
            identity,
            from: initial,
            to: stage,
            error,
        }
    }

    // --- Internals ---

    async fn load(&self, identity: &Identity) -> Result<ProgramRecord> {
        self.store
            .get(identity)
            .await?
            .ok_or_else(|| AppError::NotFound(identity.to_string()))
    }

    /// Apply `mutate` to the record and write it back.
    ///
    /// On a store conflict the record is re-read and the mutation re-applied
    /// to the fresh copy. If the fresh copy is no longer at `expected`, it is
    /// returned untouched.
    async fn commit<F>(&self, record: ProgramRecord, expected: Stage, mutate: F) -> Result<ProgramRecord>
    where
        F: Fn(&mut ProgramRecord) + Send + Sync,
    {
        let mut current = record;
        let mut conflicts = 0;

        loop {
            if current.stage != expected {
                log::warn!(
                    "{} moved to {} concurrently, expected {}",
                    current.identity,
                    current.stage,
                    expected
                );
                return Ok(current);
            }

            let mut next = current.clone();
            mutate(&mut next);
            debug_assert!(next.is_consistent(), "inconsistent record {:?}", next.identity);

            match self.store.upsert(&next).await {
                Ok(stored) => return Ok(stored),
                Err(e) if e.is_conflict() && conflicts < self.settings.retry.budget => {
                    conflicts += 1;
                    log::warn!("{e}; re-reading ({conflicts})");
                    current = self.load(&next.identity).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run the external call a pending stage waits on, with retries.
    async fn run_call(&self, record: ProgramRecord, call: Call) -> Result<Stage> {
        let pending = call.pending();
        let policy = self.settings.retry.clone();
        let mut record = record;

        loop {
            if record.stage != pending {
                return Ok(record.stage);
            }

            if policy.is_exhausted(record.attempt_count) {
                let attempts = record.attempt_count;
                log::warn!(
                    "{}",
                    AppError::BudgetExhausted {
                        identity: record.identity.to_string(),
                        attempts,
                    }
                );
                record = self
                    .commit(record, pending, move |r| {
                        let error = r.last_error.clone().unwrap_or_else(|| {
                            ErrorInfo::new(
                                "budget_exhausted",
                                format!("{attempts} attempt(s) without success"),
                            )
                        });
                        r.fail(error);
                    })
                    .await?;
                return Ok(record.stage);
            }

            if record.attempt_count > 0 {
                let delay = policy.delay(record.attempt_count - 1);
                if !delay.is_zero() {
                    log::debug!("Backing off {}ms before retrying {}", delay.as_millis(), record.identity);
                    tokio::time::sleep(delay).await;
                }
            }

            match self.call(&record, call).await {
                Ok(output) => {
                    let done = self
                        .commit(record.clone(), pending, move |r| match &output {
                            CallOutput::Content(content) => {
                                r.raw_content = Some(content.clone());
                                r.summary = None;
                                r.enter(Stage::ExtractionDone);
                            }
                            CallOutput::Summary(summary) => {
                                r.summary = Some(summary.clone());
                                r.enter(Stage::SummaryDone);
                            }
                        })
                        .await;
                    match done {
                        Ok(stored) => {
                            log::info!("{} {} done", stored.identity, call.name());
                            return Ok(stored.stage);
                        }
                        // The result could not be saved; spend an attempt instead
                        // of repeating the call on every run.
                        Err(e) if !e.is_conflict() => {
                            log::warn!(
                                "{} {} result not stored: {}",
                                record.identity,
                                call.name(),
                                e
                            );
                            let info = ErrorInfo::new("store_error", e.to_string());
                            record = self.record_failure(record, pending, info).await?;
                            if record.stage == Stage::Failed {
                                return Ok(record.stage);
                            }
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(err) if !err.is_retryable() => {
                    log::warn!("{} {} failed permanently: {}", record.identity, call.name(), err);
                    let info = ErrorInfo::from(&err);
                    record = self.commit(record, pending, move |r| r.fail(info.clone())).await?;
                    return Ok(record.stage);
                }
                Err(err) => {
                    let info = ErrorInfo::from(&err);
                    log::warn!(
                        "{} {} attempt {}/{} failed: {}",
                        record.identity,
                        call.name(),
                        record.attempt_count + 1,
                        policy.budget,
                        AppError::from(err)
                    );
                    record = self.record_failure(record, pending, info).await?;
                    if record.stage == Stage::Failed {
                        return Ok(record.stage);
                    }
                }
            }
        }
    }

    /// Persist one failed attempt, failing the record once the budget is spent.
    async fn record_failure(
        &self,
        record: ProgramRecord,
        pending: Stage,
        info: ErrorInfo,
    ) -> Result<ProgramRecord> {
        let budget = self.settings.retry.budget;
        let record = self
            .commit(record, pending, move |r| {
                r.record_attempt_failure(info.clone());
                if r.attempt_count >= budget {
                    r.fail(info.clone());
                }
            })
            .await?;
        if record.stage == Stage::Failed {
            log::warn!(
                "{}",
                AppError::BudgetExhausted {
                    identity: record.identity.to_string(),
                    attempts: record.attempt_count,
                }
            );
        }
        Ok(record)
    }

    async fn call(
        &self,
        record: &ProgramRecord,
        call: Call,
    ) -> std::result::Result<CallOutput, ExternalError> {
        match call {
            Call::Extract => {
                let content = with_timeout(
                    self.settings.extraction_timeout,
                    "extraction",
                    self.extractor.extract(&record.url),
                )
                .await?;
                Ok(CallOutput::Content(content))
            }
            Call::Summarize => {
                let content = record
                    .raw_content
                    .as_ref()
                    .ok_or_else(|| ExternalError::server("no raw content to summarize"))?;
                let summary = with_timeout(
                    self.settings.summarization_timeout,
                    "summarization",
                    self.summarizer.summarize(content),
                )
                .await?;
                let summary = truncate_graphemes(&summary, self.settings.max_summary_chars);
                if summary.is_empty() {
                    return Err(ExternalError::server("summarizer returned empty text"));
                }
                Ok(CallOutput::Summary(summary))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use crate::error::ExternalErrorKind;
    use crate::models::UniversityDetails;
    use crate::services::StaticDiscovery;
    use crate::storage::MemoryStore;

    /// Extractor whose failures are scripted per URL fragment.
    #[derive(Default)]
    struct ScriptedExtractor {
        script: Mutex<HashMap<String, VecDeque<ExternalError>>>,
        always: Mutex<HashMap<String, ExternalError>>,
        delay: Duration,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        cancel_on_call: Mutex<Option<Arc<AtomicBool>>>,
    }

    impl ScriptedExtractor {
        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        fn fail_next(&self, fragment: &str, errors: Vec<ExternalError>) {
            self.script
                .lock()
                .unwrap()
                .insert(fragment.to_string(), errors.into());
        }

        fn fail_always(&self, fragment: &str, error: ExternalError) {
            self.always.lock().unwrap().insert(fragment.to_string(), error);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn scripted_failure(&self, url: &str) -> Option<ExternalError> {
            if let Some((_, err)) = self.always.lock().unwrap().iter().find(|(f, _)| url.contains(f.as_str())) {
                return Some(err.clone());
            }
            let mut script = self.script.lock().unwrap();
            script
                .iter_mut()
                .find(|(f, _)| url.contains(f.as_str()))
                .and_then(|(_, queue)| queue.pop_front())
        }
    }

    #[async_trait]
    impl Extractor for ScriptedExtractor {
        async fn extract(&self, url: &str) -> std::result::Result<RawContent, ExternalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if let Some(flag) = self.cancel_on_call.lock().unwrap().as_ref() {
                flag.store(true, Ordering::SeqCst);
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let result = match self.scripted_failure(url) {
                Some(err) => Err(err),
                None => Ok(RawContent::new(
                    format!("# Data Science\n\nProgram page at {url}"),
                    Some("Data Science".to_string()),
                )),
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    #[derive(Default)]
    struct ScriptedSummarizer {
        failures: Mutex<VecDeque<ExternalError>>,
        reply: Option<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Summarizer for ScriptedSummarizer {
        async fn summarize(&self, content: &RawContent) -> std::result::Result<String, ExternalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(self
                .reply
                .clone()
                .unwrap_or_else(|| format!("Summary: {}", content.title.as_deref().unwrap_or("?"))))
        }
    }

    /// Memory store that keeps a write history and can bump a record
    /// behind the engine's back once.
    #[derive(Default)]
    struct TestStore {
        inner: MemoryStore,
        history: Mutex<Vec<(Identity, Stage)>>,
        meddle: AtomicBool,
    }

    #[async_trait]
    impl RecordStore for TestStore {
        async fn get(&self, identity: &Identity) -> Result<Option<ProgramRecord>> {
            self.inner.get(identity).await
        }

        async fn upsert(&self, record: &ProgramRecord) -> Result<ProgramRecord> {
            if self.meddle.swap(false, Ordering::SeqCst) {
                if let Some(current) = self.inner.get(&record.identity).await? {
                    self.inner.upsert(&current).await?;
                }
            }
            let stored = self.inner.upsert(record).await?;
            self.history
                .lock()
                .unwrap()
                .push((stored.identity.clone(), stored.stage));
            Ok(stored)
        }

        async fn list(&self) -> Result<Vec<ProgramRecord>> {
            self.inner.list().await
        }
    }

    struct Harness {
        engine: Engine,
        store: Arc<TestStore>,
        extractor: Arc<ScriptedExtractor>,
        summarizer: Arc<ScriptedSummarizer>,
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            retry: RetryPolicy::immediate(3),
            extraction_timeout: Duration::from_secs(2),
            summarization_timeout: Duration::from_secs(2),
            worker_concurrency: 4,
            max_summary_chars: 1_500,
        }
    }

    fn harness_with(extractor: ScriptedExtractor, summarizer: ScriptedSummarizer) -> Harness {
        let store = Arc::new(TestStore::default());
        let extractor = Arc::new(extractor);
        let summarizer = Arc::new(summarizer);
        let engine = Engine::new(
            store.clone(),
            extractor.clone(),
            summarizer.clone(),
            settings(),
        );
        Harness {
            engine,
            store,
            extractor,
            summarizer,
        }
    }

    fn harness() -> Harness {
        harness_with(ScriptedExtractor::default(), ScriptedSummarizer::default())
    }

    async fn record(h: &Harness, identity: &Identity) -> ProgramRecord {
        h.store.get(identity).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_observe_is_idempotent() {
        let h = harness();
        let first = h.engine.observe("MIT", "mit.edu/ds").await.unwrap();
        let writes = h.store.inner.write_count();

        let second = h.engine.observe("  mit", "https://www.mit.edu/ds/").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.store.inner.write_count(), writes);
        assert_eq!(h.store.inner.len().await, 1);
        assert_eq!(record(&h, &first).await.stage, Stage::Discovered);
    }

    #[tokio::test]
    async fn test_observe_rejects_invalid_input() {
        let h = harness();
        let err = h.engine.observe("", "mit.edu/ds").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        let err = h.engine.observe("MIT", "not a url").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(h.store.inner.is_empty().await);
    }

    #[tokio::test]
    async fn test_observe_refreshes_details() {
        let h = harness();
        let details = UniversityDetails {
            state: Some("MA".to_string()),
            ..UniversityDetails::default()
        };
        let discovery = Discovery::new("MIT", "mit.edu/ds").with_details(details.clone());

        let (id, first) = h.engine.observe_discovery(&discovery).await.unwrap();
        assert_eq!(first, Observation::Created);
        let (_, again) = h.engine.observe_discovery(&discovery).await.unwrap();
        assert_eq!(again, Observation::Unchanged);

        let changed = Discovery::new("MIT", "mit.edu/ds").with_details(UniversityDetails {
            state: Some("Massachusetts".to_string()),
            ..details
        });
        let (_, updated) = h.engine.observe_discovery(&changed).await.unwrap();
        assert_eq!(updated, Observation::Updated);
        assert_eq!(
            record(&h, &id).await.details.unwrap().state.as_deref(),
            Some("Massachusetts")
        );
    }

    #[tokio::test]
    async fn test_ingest_then_reconcile_dedups_and_completes() {
        let h = harness();
        let mut source = StaticDiscovery::from_pairs([
            ("MIT", "mit.edu/ds"),
            ("MIT", "https://mit.edu/ds/"),
            ("CMU", "cmu.edu/ds"),
            ("", "bad.edu/ds"),
        ]);

        let ingest = h.engine.ingest(&mut source).await.unwrap();
        assert_eq!(ingest.seen, 4);
        assert_eq!(ingest.created, 2);
        assert_eq!(ingest.unchanged, 1);
        assert_eq!(ingest.invalid, 1);

        let report = h.engine.reconcile_all().await.unwrap();
        assert_eq!(report.completed, 2);
        assert!(report.failed.is_empty());
        assert!(!report.cancelled);

        let status = h.engine.status().await.unwrap();
        assert_eq!(status.total, 2);
        assert_eq!(status.count(Stage::SummaryDone), 2);

        for record in h.store.list().await.unwrap() {
            assert!(record.raw_content.is_some());
            assert_eq!(record.summary.as_deref(), Some("Summary: Data Science"));
            assert!(record.is_consistent());
        }
        assert_eq!(h.extractor.calls(), 2);
        assert_eq!(h.summarizer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_advance_steps_one_stage_at_a_time() {
        let h = harness();
        let id = h.engine.observe("MIT", "mit.edu/ds").await.unwrap();

        assert_eq!(h.engine.advance(&id).await.unwrap(), Stage::BasicStored);
        assert_eq!(h.engine.advance(&id).await.unwrap(), Stage::ExtractionDone);
        assert_eq!(h.engine.advance(&id).await.unwrap(), Stage::SummaryDone);
        assert_eq!(h.engine.advance(&id).await.unwrap(), Stage::SummaryDone);
    }

    #[tokio::test]
    async fn test_advance_unknown_identity() {
        let h = harness();
        let err = h
            .engine
            .advance(&Identity::from_raw("nobody::nowhere.edu"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_transient_failures_within_budget_recover() {
        let h = harness();
        h.extractor.fail_next(
            "mit.edu",
            vec![ExternalError::timeout("slow"), ExternalError::rate_limited("429")],
        );
        let id = h.engine.observe("MIT", "mit.edu/ds").await.unwrap();
        h.engine.advance(&id).await.unwrap();

        assert_eq!(h.engine.advance(&id).await.unwrap(), Stage::ExtractionDone);
        assert_eq!(h.extractor.calls(), 3);
        let stored = record(&h, &id).await;
        assert_eq!(stored.attempt_count, 0);
        assert!(stored.last_error.is_none());
    }

    #[tokio::test]
    async fn test_exhausted_budget_fails_record() {
        let h = harness();
        h.extractor
            .fail_always("mit.edu", ExternalError::server("HTTP 503 (scrape)"));
        let id = h.engine.observe("MIT", "mit.edu/ds").await.unwrap();
        h.engine.advance(&id).await.unwrap();

        assert_eq!(h.engine.advance(&id).await.unwrap(), Stage::Failed);
        assert_eq!(h.extractor.calls(), 3);

        let stored = record(&h, &id).await;
        assert_eq!(stored.failed_from, Some(Stage::ExtractionPending));
        assert_eq!(stored.attempt_count, 3);
        assert_eq!(stored.last_error.unwrap().kind, "server_error");

        // Failed records are not retried by later calls.
        assert_eq!(h.engine.advance(&id).await.unwrap(), Stage::Failed);
        assert_eq!(h.extractor.calls(), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_fail_immediately() {
        let h = harness();
        h.extractor.fail_always("gone.edu", ExternalError::not_found("HTTP 404 (scrape)"));
        h.extractor.fail_always("huge.edu", ExternalError::too_large("HTTP 413 (scrape)"));
        let gone = h.engine.observe("Gone", "gone.edu/ds").await.unwrap();
        let huge = h.engine.observe("Huge", "huge.edu/ds").await.unwrap();

        h.engine.reconcile_all().await.unwrap();

        assert_eq!(h.extractor.calls(), 2);
        let gone = record(&h, &gone).await;
        assert_eq!(gone.stage, Stage::Failed);
        assert_eq!(gone.last_error.unwrap().kind, ExternalErrorKind::NotFound.as_str());
        let huge = record(&h, &huge).await;
        assert_eq!(huge.last_error.unwrap().kind, ExternalErrorKind::ContentTooLarge.as_str());
    }

    #[tokio::test]
    async fn test_failure_is_isolated_to_its_record() {
        let h = harness();
        h.extractor.fail_always("bad.edu", ExternalError::timeout("slow"));
        let good = h.engine.observe("Good", "good.edu/ds").await.unwrap();
        let bad = h.engine.observe("Bad", "bad.edu/ds").await.unwrap();

        let report = h.engine.reconcile_all().await.unwrap();
        assert_eq!(report.newly_failed, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].identity, bad);

        assert_eq!(record(&h, &good).await.stage, Stage::SummaryDone);
        assert_eq!(record(&h, &bad).await.stage, Stage::Failed);

        // A second run leaves the failed record alone.
        let again = h.engine.reconcile_all().await.unwrap();
        assert_eq!(again.already_failed, 1);
        assert_eq!(again.already_complete, 1);
        assert!(again.outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_summary_is_truncated_and_empty_summary_retried() {
        let summarizer = ScriptedSummarizer {
            reply: Some("word ".repeat(1_000)),
            ..ScriptedSummarizer::default()
        };
        let h = harness_with(ScriptedExtractor::default(), summarizer);
        let id = h.engine.observe("MIT", "mit.edu/ds").await.unwrap();
        h.engine.reconcile_all().await.unwrap();

        let summary = record(&h, &id).await.summary.unwrap();
        assert!(summary.chars().count() <= 1_500);
        assert!(summary.ends_with('…'));

        let summarizer = ScriptedSummarizer {
            reply: Some("   ".to_string()),
            ..ScriptedSummarizer::default()
        };
        let h = harness_with(ScriptedExtractor::default(), summarizer);
        let id = h.engine.observe("MIT", "mit.edu/ds").await.unwrap();
        h.engine.reconcile_all().await.unwrap();
        let stored = record(&h, &id).await;
        assert_eq!(stored.stage, Stage::Failed);
        assert_eq!(stored.failed_from, Some(Stage::SummaryPending));
        assert_eq!(h.summarizer.calls.load(Ordering::SeqCst), 3);
        assert!(stored.raw_content.is_some());
    }

    #[tokio::test]
    async fn test_one_transition_in_flight_per_identity() {
        let h = harness_with(
            ScriptedExtractor::slow(Duration::from_millis(40)),
            ScriptedSummarizer::default(),
        );
        let id = h.engine.observe("MIT", "mit.edu/ds").await.unwrap();
        h.engine.advance(&id).await.unwrap();

        let (a, b) = tokio::join!(h.engine.advance(&id), h.engine.advance(&id));
        a.unwrap();
        b.unwrap();

        assert_eq!(h.extractor.calls(), 1);
        assert_eq!(h.extractor.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(record(&h, &id).await.stage, Stage::SummaryDone);
    }

    #[tokio::test]
    async fn test_distinct_identities_run_in_parallel() {
        let h = harness_with(
            ScriptedExtractor::slow(Duration::from_millis(40)),
            ScriptedSummarizer::default(),
        );
        for name in ["A", "B", "C", "D"] {
            let url = format!("{}.edu/ds", name.to_lowercase());
            h.engine.observe(name, &url).await.unwrap();
        }

        let report = h.engine.reconcile_all().await.unwrap();
        assert_eq!(report.completed, 4);
        assert!(h.extractor.max_in_flight.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_stages_only_move_forward() {
        let h = harness();
        h.extractor.fail_next("b.edu", vec![ExternalError::timeout("slow")]);
        h.extractor.fail_always("c.edu", ExternalError::server("boom"));
        for (name, url) in [("A", "a.edu/ds"), ("B", "b.edu/ds"), ("C", "c.edu/ds")] {
            h.engine.observe(name, url).await.unwrap();
        }
        h.engine.reconcile_all().await.unwrap();

        let history = h.store.history.lock().unwrap().clone();
        let mut last: HashMap<Identity, Stage> = HashMap::new();
        for (identity, stage) in history {
            if let Some(previous) = last.get(&identity) {
                assert!(
                    previous.can_move_to(stage),
                    "{identity} moved {previous} -> {stage}"
                );
            }
            last.insert(identity, stage);
        }
    }

    #[tokio::test]
    async fn test_cancel_before_run_leaves_records_untouched() {
        let h = harness();
        let id = h.engine.observe("MIT", "mit.edu/ds").await.unwrap();
        h.engine.cancel();

        let report = h.engine.reconcile_all().await.unwrap();
        assert!(report.cancelled);
        assert_eq!(record(&h, &id).await.stage, Stage::Discovered);
        assert_eq!(h.extractor.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_mid_run_stops_at_committed_stage() {
        let h = harness();
        let mut settings = settings();
        settings.worker_concurrency = 1;
        let engine = Engine::new(
            h.store.clone(),
            h.extractor.clone(),
            h.summarizer.clone(),
            settings,
        );
        *h.extractor.cancel_on_call.lock().unwrap() = Some(engine.cancel_flag());

        let first = engine.observe("A", "a.edu/ds").await.unwrap();
        let second = engine.observe("B", "b.edu/ds").await.unwrap();

        let report = engine.reconcile_all().await.unwrap();
        assert!(report.cancelled);

        let first = record(&h, &first).await;
        assert_eq!(first.stage, Stage::ExtractionDone);
        assert!(first.is_consistent());
        assert_eq!(record(&h, &second).await.stage, Stage::Discovered);
        assert_eq!(h.summarizer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_redrive_resumes_from_failed_stage() {
        let h = harness();
        h.extractor.fail_next(
            "mit.edu",
            vec![
                ExternalError::timeout("1"),
                ExternalError::timeout("2"),
                ExternalError::timeout("3"),
            ],
        );
        let id = h.engine.observe("MIT", "mit.edu/ds").await.unwrap();
        h.engine.reconcile_all().await.unwrap();
        assert_eq!(record(&h, &id).await.stage, Stage::Failed);

        assert_eq!(h.engine.redrive(&id).await.unwrap(), Stage::ExtractionPending);
        let stored = record(&h, &id).await;
        assert_eq!(stored.attempt_count, 0);
        assert!(stored.last_error.is_none());
        assert!(stored.failed_from.is_none());

        h.engine.reconcile_all().await.unwrap();
        assert_eq!(record(&h, &id).await.stage, Stage::SummaryDone);
    }

    #[tokio::test]
    async fn test_redrive_failed_resets_every_failed_record() {
        let h = harness();
        h.extractor.fail_next("a.edu", vec![ExternalError::not_found("404")]);
        h.extractor.fail_next("b.edu", vec![ExternalError::not_found("404")]);
        h.engine.observe("A", "a.edu/ds").await.unwrap();
        h.engine.observe("B", "b.edu/ds").await.unwrap();
        h.engine.observe("C", "c.edu/ds").await.unwrap();
        h.engine.reconcile_all().await.unwrap();

        assert_eq!(h.engine.redrive_failed().await.unwrap(), 2);
        let report = h.engine.reconcile_all().await.unwrap();
        assert_eq!(report.completed, 2);
        assert_eq!(h.engine.status().await.unwrap().count(Stage::SummaryDone), 3);
    }

    #[tokio::test]
    async fn test_redrive_ignores_healthy_records() {
        let h = harness();
        let id = h.engine.observe("MIT", "mit.edu/ds").await.unwrap();
        let writes = h.store.inner.write_count();
        assert_eq!(h.engine.redrive(&id).await.unwrap(), Stage::Discovered);
        assert_eq!(h.store.inner.write_count(), writes);
    }

    #[tokio::test]
    async fn test_reextract_discards_content() {
        let h = harness();
        let id = h.engine.observe("MIT", "mit.edu/ds").await.unwrap();
        h.engine.reconcile_all().await.unwrap();

        assert_eq!(h.engine.reextract(&id).await.unwrap(), Stage::BasicStored);
        let stored = record(&h, &id).await;
        assert!(stored.raw_content.is_none());
        assert!(stored.summary.is_none());
        assert!(stored.is_consistent());

        h.engine.reconcile_all().await.unwrap();
        assert_eq!(record(&h, &id).await.stage, Stage::SummaryDone);
        assert_eq!(h.extractor.calls(), 2);
    }

    #[tokio::test]
    async fn test_reextract_without_content_is_noop() {
        let h = harness();
        let id = h.engine.observe("MIT", "mit.edu/ds").await.unwrap();
        assert_eq!(h.engine.reextract(&id).await.unwrap(), Stage::Discovered);
    }

    #[tokio::test]
    async fn test_store_conflict_is_reapplied_on_fresh_copy() {
        let h = harness();
        let id = h.engine.observe("MIT", "mit.edu/ds").await.unwrap();
        assert_eq!(record(&h, &id).await.revision, 1);

        h.store.meddle.store(true, Ordering::SeqCst);
        assert_eq!(h.engine.advance(&id).await.unwrap(), Stage::BasicStored);

        let stored = record(&h, &id).await;
        assert_eq!(stored.stage, Stage::BasicStored);
        assert_eq!(stored.revision, 3);
    }

    /// Store that refuses every write carrying extracted content.
    #[derive(Default)]
    struct ContentRejectingStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl RecordStore for ContentRejectingStore {
        async fn get(&self, identity: &Identity) -> Result<Option<ProgramRecord>> {
            self.inner.get(identity).await
        }

        async fn upsert(&self, record: &ProgramRecord) -> Result<ProgramRecord> {
            if record.raw_content.is_some() {
                return Err(AppError::store("record too large for the backend"));
            }
            self.inner.upsert(record).await
        }

        async fn list(&self) -> Result<Vec<ProgramRecord>> {
            self.inner.list().await
        }
    }

    #[tokio::test]
    async fn test_unstorable_result_spends_budget() {
        let store = Arc::new(ContentRejectingStore::default());
        let extractor = Arc::new(ScriptedExtractor::default());
        let engine = Engine::new(
            store.clone(),
            extractor.clone(),
            Arc::new(ScriptedSummarizer::default()),
            settings(),
        );
        let id = engine.observe("MIT", "mit.edu/ds").await.unwrap();

        let report = engine.reconcile_all().await.unwrap();
        assert_eq!(report.newly_failed, 1);
        assert_eq!(extractor.calls(), 3);

        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.stage, Stage::Failed);
        assert_eq!(stored.failed_from, Some(Stage::ExtractionPending));
        assert_eq!(stored.last_error.unwrap().kind, "store_error");

        // Later runs do not pay for more extractions.
        for _ in 0..3 {
            engine.reconcile_all().await.unwrap();
        }
        assert_eq!(extractor.calls(), 3);
    }

    #[tokio::test]
    async fn test_slow_extraction_times_out_per_attempt() {
        let h = harness_with(
            ScriptedExtractor::slow(Duration::from_millis(200)),
            ScriptedSummarizer::default(),
        );
        let mut settings = settings();
        settings.extraction_timeout = Duration::from_millis(20);
        let engine = Engine::new(
            h.store.clone(),
            h.extractor.clone(),
            h.summarizer.clone(),
            settings,
        );
        let id = engine.observe("MIT", "mit.edu/ds").await.unwrap();
        engine.advance(&id).await.unwrap();

        assert_eq!(engine.advance(&id).await.unwrap(), Stage::Failed);
        assert_eq!(h.extractor.calls(), 3);
        let stored = record(&h, &id).await;
        assert_eq!(stored.attempt_count, 3);
        assert_eq!(stored.last_error.unwrap().kind, ExternalErrorKind::Timeout.as_str());
    }

    #[tokio::test]
    async fn test_spent_budget_fails_without_another_call() {
        let h = harness();
        let mut seeded = ProgramRecord::discovered("MIT", "mit.edu/ds").unwrap();
        seeded.stage = Stage::ExtractionPending;
        seeded.attempt_count = 3;
        seeded.last_error = Some(ErrorInfo::new("rate_limited", "HTTP 429 (scrape)"));
        h.store.upsert(&seeded).await.unwrap();

        let id = seeded.identity.clone();
        assert_eq!(h.engine.advance(&id).await.unwrap(), Stage::Failed);
        assert_eq!(h.extractor.calls(), 0);

        let stored = record(&h, &id).await;
        assert_eq!(stored.failed_from, Some(Stage::ExtractionPending));
        assert_eq!(stored.last_error.unwrap().kind, "rate_limited");
    }
}
