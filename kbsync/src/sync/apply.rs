use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use futures_util::{StreamExt, stream};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::clock::now_millis;
use super::diff::DiffResult;
use super::enumerate::SourceFileRecord;
use super::file_types::{FileKind, kind_for_extension};
use super::ledger::{LedgerEntry, LedgerError, LedgerStore, SyncScope};
use super::remote::{
    DocumentContext, DocumentPayload, FileSource, KnowledgeSink, RemoteError, SinkDocument,
};
use super::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ActionKind {
    Create,
    Update,
    Delete,
    Dedup,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ActionKind::Create => "create",
            ActionKind::Update => "update",
            ActionKind::Delete => "delete",
            ActionKind::Dedup => "dedup",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Unsupported,
    /// Retries ran out on a transient error.
    RetryableFailure(String),
    PermanentFailure(String),
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Outcome::RetryableFailure(_) | Outcome::PermanentFailure(_)
        )
    }

    fn from_remote(err: &RemoteError) -> Self {
        if err.is_retryable() {
            Outcome::RetryableFailure(err.to_string())
        } else {
            Outcome::PermanentFailure(err.to_string())
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("ok"),
            Outcome::Unsupported => f.write_str("unsupported file type"),
            Outcome::RetryableFailure(message) => write!(f, "failed after retries: {message}"),
            Outcome::PermanentFailure(message) => write!(f, "failed: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionReport {
    pub source_id: String,
    pub name: String,
    pub action: ActionKind,
    pub outcome: Outcome,
    /// Sink document the action ended on, when it succeeded.
    pub document_id: Option<String>,
}

/// Sink documents no ledger entry references, by document name; candidates for adoption.
#[derive(Debug, Default)]
pub struct AdoptionIndex {
    by_name: HashMap<String, Vec<String>>,
}

impl AdoptionIndex {
    pub fn build(mut documents: Vec<SinkDocument>, referenced: &HashSet<String>) -> Self {
        // Newest first so `take` hands out the most recent orphan.
        documents.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        let mut by_name: HashMap<String, Vec<String>> = HashMap::new();
        for document in documents {
            if referenced.contains(&document.id) {
                continue;
            }
            by_name.entry(document.name).or_default().push(document.id);
        }
        Self { by_name }
    }

    pub fn take(&mut self, name: &str) -> Option<String> {
        let ids = self.by_name.get_mut(name)?;
        if ids.is_empty() {
            return None;
        }
        Some(ids.remove(0))
    }

    pub fn len(&self) -> usize {
        self.by_name.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("listing sink documents failed: {0}")]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupReport {
    /// Names that had more than one document.
    pub groups: usize,
    pub repointed: u64,
    pub reports: Vec<ActionReport>,
}

impl DedupReport {
    pub fn removed(&self) -> usize {
        self.reports
            .iter()
            .filter(|report| report.outcome == Outcome::Success)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.reports
            .iter()
            .filter(|report| report.outcome.is_failure())
            .count()
    }
}

enum Action<'r> {
    Create {
        record: &'r SourceFileRecord,
        adopt: Option<String>,
    },
    Update {
        record: &'r SourceFileRecord,
        entry: &'r LedgerEntry,
    },
    Delete {
        entry: &'r LedgerEntry,
    },
}

pub struct SinkApplier<'a> {
    source: &'a dyn FileSource,
    sink: &'a dyn KnowledgeSink,
    ledger: &'a LedgerStore,
    retry: &'a RetryPolicy,
    concurrency: usize,
}

impl<'a> SinkApplier<'a> {
    pub fn new(
        source: &'a dyn FileSource,
        sink: &'a dyn KnowledgeSink,
        ledger: &'a LedgerStore,
        retry: &'a RetryPolicy,
        concurrency: usize,
    ) -> Self {
        Self {
            source,
            sink,
            ledger,
            retry,
            concurrency: concurrency.max(1),
        }
    }

    /// Executes a fixed diff; reports come back sorted by source id.
    pub async fn apply(
        &self,
        scope: &SyncScope,
        diff: &DiffResult,
        records: &[SourceFileRecord],
        entries: &HashMap<String, LedgerEntry>,
        adoption: &mut AdoptionIndex,
    ) -> Vec<ActionReport> {
        let by_id: HashMap<&str, &SourceFileRecord> = records
            .iter()
            .filter(|record| !record.is_folder)
            .map(|record| (record.id.as_str(), record))
            .collect();

        let mut actions = Vec::new();
        for id in &diff.to_create {
            let Some(record) = by_id.get(id.as_str()).copied() else {
                continue;
            };
            let adopt = if is_supported(record) {
                adoption.take(&document_context(scope, record).title())
            } else {
                None
            };
            actions.push(Action::Create { record, adopt });
        }
        for id in &diff.to_update {
            if let (Some(record), Some(entry)) = (by_id.get(id.as_str()).copied(), entries.get(id)) {
                actions.push(Action::Update { record, entry });
            }
        }
        for id in &diff.to_delete {
            if let Some(entry) = entries.get(id) {
                actions.push(Action::Delete { entry });
            }
        }

        let mut reports: Vec<ActionReport> = stream::iter(actions)
            .map(|action| self.execute(scope, action))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        reports.sort_by(|a, b| a.source_id.cmp(&b.source_id).then(a.action.cmp(&b.action)));
        reports
    }

    async fn execute(&self, scope: &SyncScope, action: Action<'_>) -> ActionReport {
        match action {
            Action::Create { record, adopt } => {
                self.sync_file(scope, record, ActionKind::Create, adopt.as_deref())
                    .await
            }
            Action::Update { record, entry } => {
                self.sync_file(
                    scope,
                    record,
                    ActionKind::Update,
                    Some(entry.sink_document_id.as_str()),
                )
                .await
            }
            Action::Delete { entry } => self.delete(scope, entry).await,
        }
    }

    /// Uploads one file into `existing` (or a new document) and records it.
    async fn sync_file(
        &self,
        scope: &SyncScope,
        record: &SourceFileRecord,
        action: ActionKind,
        existing: Option<&str>,
    ) -> ActionReport {
        let context = document_context(scope, record);
        let mut report = ActionReport {
            source_id: record.id.clone(),
            name: context.title(),
            action,
            outcome: Outcome::Success,
            document_id: None,
        };

        let kind = kind_for_extension(record.extension.as_deref().unwrap_or_default());
        if kind == FileKind::Unsupported {
            debug!(file = %record.path, "skipping unsupported file type");
            report.outcome = Outcome::Unsupported;
            return report;
        }

        let payload = match self.fetch(&scope.workspace_id, record, kind).await {
            Ok(payload) => payload,
            Err(outcome) => {
                warn!(file = %record.path, %action, %outcome, "download failed");
                report.outcome = outcome;
                return report;
            }
        };

        let document_id = match self.upload(existing, record, &context, payload).await {
            Ok(document_id) => document_id,
            Err(err) => {
                warn!(file = %record.path, %action, error = %err, "sink write failed");
                report.outcome = Outcome::from_remote(&err);
                return report;
            }
        };

        let entry = LedgerEntry {
            scope: scope.key.clone(),
            source_id: record.id.clone(),
            sink_document_id: document_id.clone(),
            document_name: report.name.clone(),
            source_path: record.path.clone(),
            last_synced_modified_at: record.modified_at,
            last_synced_at: now_millis(),
        };
        if let Err(err) = self.ledger.record(&entry).await {
            warn!(file = %record.path, error = %err, "ledger write failed after sink write");
            report.outcome = Outcome::PermanentFailure(format!("ledger write failed: {err}"));
            report.document_id = Some(document_id);
            return report;
        }

        info!(file = %record.path, document = %document_id, %action, "synced");
        report.document_id = Some(document_id);
        report
    }

    async fn fetch(
        &self,
        workspace_id: &str,
        record: &SourceFileRecord,
        kind: FileKind,
    ) -> Result<DocumentPayload, Outcome> {
        let bytes = self
            .retry
            .run("download", || self.source.download(workspace_id, &record.id))
            .await
            .map_err(|err| Outcome::from_remote(&err))?;
        match kind {
            FileKind::ConvertToText => String::from_utf8(bytes)
                .map(DocumentPayload::Text)
                .map_err(|_| Outcome::PermanentFailure("content is not valid UTF-8".into())),
            _ => Ok(DocumentPayload::File(bytes)),
        }
    }

    /// Replaces `existing` when given, falling back to a fresh document if the sink lost it.
    async fn upload(
        &self,
        existing: Option<&str>,
        record: &SourceFileRecord,
        context: &DocumentContext,
        payload: DocumentPayload,
    ) -> Result<String, RemoteError> {
        if let Some(document_id) = existing {
            let replaced = self
                .retry
                .run("replace document", || {
                    self.sink
                        .replace_document(document_id, context, payload.clone())
                })
                .await;
            match replaced {
                Ok(()) => return Ok(document_id.to_string()),
                Err(RemoteError::NotFound(_)) => {
                    info!(file = %record.path, document = %document_id, "document vanished from sink, re-creating");
                }
                Err(err) => return Err(err),
            }
        }
        self.retry
            .run("create document", || {
                self.sink.create_document(context, payload.clone())
            })
            .await
    }

    async fn delete(&self, scope: &SyncScope, entry: &LedgerEntry) -> ActionReport {
        let mut report = ActionReport {
            source_id: entry.source_id.clone(),
            name: entry.document_name.clone(),
            action: ActionKind::Delete,
            outcome: Outcome::Success,
            document_id: Some(entry.sink_document_id.clone()),
        };

        let shared = match self
            .ledger
            .other_references(&entry.sink_document_id, &scope.key, &entry.source_id)
            .await
        {
            Ok(refs) => refs > 0,
            Err(err) => {
                report.outcome = Outcome::PermanentFailure(format!("ledger read failed: {err}"));
                return report;
            }
        };
        if shared {
            // Another source file still maps to this document; only drop our entry.
            debug!(file = %entry.source_path, document = %entry.sink_document_id, "document still referenced, keeping it");
        } else {
            let deleted = self
                .retry
                .run("delete document", || {
                    self.sink.delete_document(&entry.sink_document_id)
                })
                .await;
            match deleted {
                Ok(()) | Err(RemoteError::NotFound(_)) => {}
                Err(err) => {
                    warn!(file = %entry.source_path, error = %err, "sink delete failed");
                    report.outcome = Outcome::from_remote(&err);
                    return report;
                }
            }
        }

        if let Err(err) = self.ledger.remove(&scope.key, &entry.source_id).await {
            report.outcome = Outcome::PermanentFailure(format!("ledger write failed: {err}"));
            return report;
        }
        info!(file = %entry.source_path, document = %entry.sink_document_id, "deleted");
        report
    }

    /// Keeps one document per name across the whole knowledge base.
    ///
    /// Names carry the folder context, so a group normally holds one synced
    /// document plus orphans. Documents owned by different ledger entries are
    /// never merged: at most one owned duplicate is folded into the keeper.
    pub async fn deduplicate(&self) -> Result<DedupReport, DedupError> {
        let documents = self
            .retry
            .run("list documents", || self.sink.list_documents())
            .await?;
        let referenced = self.ledger.referenced_documents().await?;

        let mut groups: BTreeMap<String, Vec<SinkDocument>> = BTreeMap::new();
        for document in documents {
            groups.entry(document.name.clone()).or_default().push(document);
        }

        let mut report = DedupReport::default();
        for (name, mut documents) in groups {
            if documents.len() < 2 {
                continue;
            }
            report.groups += 1;
            documents.sort_by(|a, b| {
                b.updated_at
                    .cmp(&a.updated_at)
                    .then_with(|| referenced.contains(&b.id).cmp(&referenced.contains(&a.id)))
                    .then_with(|| a.id.cmp(&b.id))
            });
            let keeper = documents.remove(0);
            debug!(name = %name, keep = %keeper.id, duplicates = documents.len(), "deduplicating");
            let mut keeper_owned = referenced.contains(&keeper.id);

            for duplicate in documents {
                if referenced.contains(&duplicate.id) {
                    if keeper_owned {
                        debug!(name = %name, document = %duplicate.id, "duplicate belongs to another source file, keeping it");
                        continue;
                    }
                    keeper_owned = true;
                }
                let outcome = self.remove_duplicate(&duplicate, &keeper, &mut report).await;
                report.reports.push(ActionReport {
                    source_id: duplicate.id.clone(),
                    name: name.clone(),
                    action: ActionKind::Dedup,
                    outcome,
                    document_id: Some(keeper.id.clone()),
                });
            }
        }
        Ok(report)
    }

    async fn remove_duplicate(
        &self,
        duplicate: &SinkDocument,
        keeper: &SinkDocument,
        report: &mut DedupReport,
    ) -> Outcome {
        let deleted = self
            .retry
            .run("delete duplicate", || {
                self.sink.delete_document(&duplicate.id)
            })
            .await;
        match deleted {
            Ok(()) | Err(RemoteError::NotFound(_)) => {}
            Err(err) => {
                warn!(document = %duplicate.id, error = %err, "failed to delete duplicate");
                return Outcome::from_remote(&err);
            }
        }
        match self.ledger.repoint_document(&duplicate.id, &keeper.id).await {
            Ok(changed) => {
                report.repointed += changed;
                info!(name = %duplicate.name, removed = %duplicate.id, kept = %keeper.id, "removed duplicate");
                Outcome::Success
            }
            Err(err) => Outcome::PermanentFailure(format!("ledger write failed: {err}")),
        }
    }
}

fn document_context(scope: &SyncScope, record: &SourceFileRecord) -> DocumentContext {
    DocumentContext::new(&scope.key, &record.path, &record.name)
}

fn is_supported(record: &SourceFileRecord) -> bool {
    kind_for_extension(record.extension.as_deref().unwrap_or_default()) != FileKind::Unsupported
}

#[cfg(test)]
#[path = "apply_tests.rs"]
mod tests;
