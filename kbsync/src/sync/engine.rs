use std::fmt;
use std::sync::Arc;

use futures_util::TryStreamExt;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::apply::{
    ActionKind, ActionReport, AdoptionIndex, DedupError, DedupReport, Outcome, SinkApplier,
};
use super::clock::now_millis;
use super::diff::compute_diff;
use super::enumerate::{EnumerateError, SourceEnumerator};
use super::ledger::{LedgerError, LedgerStore, SyncScope};
use super::remote::{FileSource, KnowledgeSink, RemoteError};
use super::retry::RetryPolicy;

pub const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Enumerate(EnumerateError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("source authentication failed: {0}")]
    Authentication(String),
}

impl From<EnumerateError> for EngineError {
    fn from(err: EnumerateError) -> Self {
        match err {
            EnumerateError::Remote(RemoteError::Auth(message)) => {
                EngineError::Authentication(message)
            }
            other => EngineError::Enumerate(other),
        }
    }
}

/// One (workspace, folder) unit of a run, as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPair {
    pub workspace: String,
    pub folder: String,
}

impl SyncPair {
    pub fn new(workspace: impl Into<String>, folder: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
            folder: folder.into(),
        }
    }
}

impl fmt::Display for SyncPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.workspace, self.folder)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    pub recursive: bool,
    pub remove_duplicates: bool,
    pub concurrency: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            recursive: false,
            remove_duplicates: false,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub pair: String,
    pub scope: String,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
    pub reports: Vec<ActionReport>,
}

impl PassSummary {
    fn new(pair: &SyncPair, scope: &SyncScope, unchanged: usize, reports: Vec<ActionReport>) -> Self {
        let mut summary = Self {
            pair: pair.to_string(),
            scope: scope.key.clone(),
            unchanged,
            ..Self::default()
        };
        for report in &reports {
            match (&report.outcome, report.action) {
                (Outcome::Success, ActionKind::Create) => summary.created += 1,
                (Outcome::Success, ActionKind::Update) => summary.updated += 1,
                (Outcome::Success, ActionKind::Delete | ActionKind::Dedup) => summary.deleted += 1,
                (Outcome::Unsupported, _) => summary.skipped += 1,
                (Outcome::RetryableFailure(_) | Outcome::PermanentFailure(_), _) => {
                    summary.failed += 1
                }
            }
        }
        summary.reports = reports;
        summary
    }
}

impl fmt::Display for PassSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} created, {} updated, {} deleted, {} unchanged, {} skipped, {} failed",
            self.pair,
            self.created,
            self.updated,
            self.deleted,
            self.unchanged,
            self.skipped,
            self.failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairFailure {
    pub pair: SyncPair,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub passes: Vec<PassSummary>,
    pub failed_pairs: Vec<PairFailure>,
    pub dedup: Option<DedupReport>,
    pub dedup_error: Option<String>,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        !self.failed_pairs.is_empty()
            || self.passes.iter().any(|pass| pass.failed > 0)
            || self.dedup_error.is_some()
            || self.dedup.as_ref().is_some_and(|dedup| dedup.failed() > 0)
    }
}

pub struct SyncEngine {
    source: Arc<dyn FileSource>,
    sink: Arc<dyn KnowledgeSink>,
    ledger: LedgerStore,
    retry: RetryPolicy,
    options: SyncOptions,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn FileSource>,
        sink: Arc<dyn KnowledgeSink>,
        ledger: LedgerStore,
    ) -> Self {
        Self {
            source,
            sink,
            ledger,
            retry: RetryPolicy::default(),
            options: SyncOptions::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    fn applier(&self) -> SinkApplier<'_> {
        SinkApplier::new(
            self.source.as_ref(),
            self.sink.as_ref(),
            &self.ledger,
            &self.retry,
            self.options.concurrency,
        )
    }

    /// Enumerate, diff, apply and record one pair.
    pub async fn run_pair(&self, pair: &SyncPair) -> Result<PassSummary, EngineError> {
        let enumerator = SourceEnumerator::new(self.source.as_ref(), &self.retry);
        let workspace = enumerator.resolve_workspace(&pair.workspace).await?;
        let folder = enumerator.resolve_folder(&workspace.id, &pair.folder).await?;
        let scope = SyncScope::new(&workspace.id, folder.id.as_deref());
        debug!(pair = %pair, scope = %scope.key, folder = %folder.label, "starting pass");

        let records: Vec<_> = enumerator
            .enumerate(&workspace.id, &folder, self.options.recursive)
            .try_collect()
            .await?;
        let entries = self.ledger.load_scope(&scope.key).await?;
        let diff = compute_diff(&records, &entries, now_millis());
        debug!(
            pair = %pair,
            records = records.len(),
            create = diff.to_create.len(),
            update = diff.to_update.len(),
            delete = diff.to_delete.len(),
            unchanged = diff.unchanged.len(),
            "computed diff"
        );

        if diff.is_noop() {
            debug!(pair = %pair, "source unchanged since last pass");
            return Ok(PassSummary::new(pair, &scope, diff.unchanged.len(), Vec::new()));
        }

        let mut adoption = if diff.to_create.is_empty() {
            AdoptionIndex::default()
        } else {
            self.adoption_index().await
        };
        let reports = self
            .applier()
            .apply(&scope, &diff, &records, &entries, &mut adoption)
            .await;
        Ok(PassSummary::new(pair, &scope, diff.unchanged.len(), reports))
    }

    /// Runs every pair in order; only a source authentication failure stops the run.
    pub async fn run(&self, pairs: &[SyncPair]) -> Result<RunReport, EngineError> {
        let mut report = RunReport::default();
        for pair in pairs {
            match self.run_pair(pair).await {
                Ok(summary) => {
                    info!("{summary}");
                    report.passes.push(summary);
                }
                Err(EngineError::Authentication(message)) => {
                    error!(pair = %pair, error = %message, "source rejected credentials, aborting run");
                    return Err(EngineError::Authentication(message));
                }
                Err(err) => {
                    error!(pair = %pair, error = %err, "pass failed");
                    report.failed_pairs.push(PairFailure {
                        pair: pair.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        if self.options.remove_duplicates {
            match self.deduplicate().await {
                Ok(dedup) => {
                    info!(
                        groups = dedup.groups,
                        removed = dedup.removed(),
                        repointed = dedup.repointed,
                        "deduplication finished"
                    );
                    report.dedup = Some(dedup);
                }
                Err(err) => {
                    error!(error = %err, "deduplication failed");
                    report.dedup_error = Some(err.to_string());
                }
            }
        }
        Ok(report)
    }

    pub async fn deduplicate(&self) -> Result<DedupReport, DedupError> {
        self.applier().deduplicate().await
    }

    /// Orphaned sink documents; adoption is best effort, so failures yield an empty index.
    async fn adoption_index(&self) -> AdoptionIndex {
        let documents = match self
            .retry
            .run("list documents", || self.sink.list_documents())
            .await
        {
            Ok(documents) => documents,
            Err(err) => {
                warn!(error = %err, "could not list sink documents, adoption disabled for this pass");
                return AdoptionIndex::default();
            }
        };
        match self.ledger.referenced_documents().await {
            Ok(referenced) => {
                let index = AdoptionIndex::build(documents, &referenced);
                if !index.is_empty() {
                    debug!(candidates = index.len(), "found unreferenced sink documents");
                }
                index
            }
            Err(err) => {
                warn!(error = %err, "could not read ledger references, adoption disabled for this pass");
                AdoptionIndex::default()
            }
        }
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
