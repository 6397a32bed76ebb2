use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::Context;
use kbsync_core::{DifyClient, WimiClient};
use tracing::info;

use crate::adapters::{DifySink, WimiSource};
use crate::config::SyncConfig;
use crate::sync::apply::Outcome;
use crate::sync::engine::{RunReport, SyncEngine, SyncPair};
use crate::sync::ledger::LedgerStore;
use crate::sync::remote::RemoteError;
use crate::sync::retry::RetryPolicy;

pub struct SyncRunner {
    engine: SyncEngine,
    pairs: Vec<SyncPair>,
}

impl SyncRunner {
    /// Logs into Wimi, finds (or creates) the knowledge base and opens the ledger.
    pub async fn bootstrap(config: SyncConfig) -> anyhow::Result<Self> {
        let retry = RetryPolicy::default().with_max_attempts(config.max_attempts);

        let wimi = WimiClient::with_timeout(
            &config.wimi.api_url,
            &config.wimi.download_url,
            config.wimi.credentials.clone(),
            config.timeout,
        )
        .context("invalid Wimi configuration")?;
        let source = WimiSource::login(wimi, &retry)
            .await
            .context("Wimi login failed")?;
        info!(
            user = %source.session().user_id,
            workspaces = source.session().projects.len(),
            "logged into Wimi"
        );

        let dify = DifyClient::with_timeout(
            &config.dify.api_url,
            config.dify.api_key.clone(),
            config.timeout,
        )
        .context("invalid Dify configuration")?;
        let knowledge_name = config.dify.knowledge_name.as_str();
        let dataset = {
            let dify = &dify;
            retry
                .run("find knowledge base", move || async move {
                    dify.find_or_create_dataset(knowledge_name)
                        .await
                        .map_err(RemoteError::from)
                })
                .await
                .with_context(|| format!("failed to open knowledge base {knowledge_name:?}"))?
        };
        info!(knowledge = %dataset.name, id = %dataset.id, "using knowledge base");

        let ledger = match &config.ledger_path {
            Some(path) => LedgerStore::open(path).await,
            None => LedgerStore::open_default().await,
        }
        .context("failed to open sync ledger")?;

        let engine = SyncEngine::new(
            Arc::new(source),
            Arc::new(DifySink::new(dify, dataset.id)),
            ledger,
        )
        .with_retry(retry)
        .with_options(config.options);

        Ok(Self {
            engine,
            pairs: config.pairs,
        })
    }

    pub async fn run(self) -> anyhow::Result<RunReport> {
        tokio::select! {
            result = self.engine.run(&self.pairs) => Ok(result?),
            _ = tokio::signal::ctrl_c() => {
                anyhow::bail!("sync run interrupted");
            }
        }
    }
}

/// One line per pair; `verbose` adds every action and its outcome.
pub fn render_report(report: &RunReport, verbose: bool) -> String {
    let mut out = String::new();
    for pass in &report.passes {
        let _ = writeln!(out, "{pass}");
        for action in &pass.reports {
            if verbose || action.outcome.is_failure() {
                let _ = writeln!(
                    out,
                    "  {} {} ({}): {}",
                    action.action, action.name, action.source_id, action.outcome
                );
            }
        }
    }
    for failure in &report.failed_pairs {
        let _ = writeln!(out, "{}: failed: {}", failure.pair, failure.error);
    }
    if let Some(dedup) = &report.dedup {
        let _ = writeln!(
            out,
            "duplicates: {} names, {} removed, {} ledger entries repointed, {} failed",
            dedup.groups,
            dedup.removed(),
            dedup.repointed,
            dedup.failed()
        );
        for action in &dedup.reports {
            if verbose || action.outcome != Outcome::Success {
                let _ = writeln!(
                    out,
                    "  {} {} ({}): {}",
                    action.action, action.name, action.source_id, action.outcome
                );
            }
        }
    }
    if let Some(err) = &report.dedup_error {
        let _ = writeln!(out, "duplicates: failed: {err}");
    }
    out
}
