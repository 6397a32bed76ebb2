use std::path::PathBuf;

use clap::Parser;
use kbsync::config::{ConfigOverrides, DEFAULT_FOLDERS, DEFAULT_WORKSPACE, SyncConfig};
use kbsync::runner::{SyncRunner, render_report};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "kbsync",
    version,
    about = "Mirror Wimi workspace folders into a Dify knowledge base"
)]
struct Cli {
    /// Comma-separated folder ids, names or paths ("root" for the workspace root)
    #[arg(long, default_value = DEFAULT_FOLDERS)]
    folders: String,

    /// Workspace for every folder, or a comma-separated list with one per folder
    #[arg(long, default_value = DEFAULT_WORKSPACE)]
    workspace: String,

    /// Walk sub-folders recursively
    #[arg(long)]
    include_subfolders: bool,

    /// Keep only the newest document per name in the knowledge base
    #[arg(long)]
    remove_duplicates: bool,

    /// List every file and its outcome
    #[arg(short, long)]
    verbose: bool,

    /// Dify API URL (falls back to DIFY_API_URL)
    #[arg(long)]
    dify_api_url: Option<String>,

    /// Dify dataset API key (falls back to DIFY_API_KEY)
    #[arg(long)]
    dify_api_key: Option<String>,

    /// Knowledge base name (falls back to KNOWLEDGE_NAME)
    #[arg(long)]
    knowledge_name: Option<String>,

    /// Sync ledger location (falls back to KBSYNC_LEDGER_PATH)
    #[arg(long)]
    ledger: Option<PathBuf>,

    /// Parallel transfers per pass (falls back to KBSYNC_CONCURRENCY)
    #[arg(long)]
    concurrency: Option<usize>,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            folders: self.folders.clone(),
            workspace: self.workspace.clone(),
            include_subfolders: self.include_subfolders,
            remove_duplicates: self.remove_duplicates,
            dify_api_url: self.dify_api_url.clone(),
            dify_api_key: self.dify_api_key.clone(),
            knowledge_name: self.knowledge_name.clone(),
            ledger_path: self.ledger.clone(),
            concurrency: self.concurrency,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = SyncConfig::from_env(cli.overrides())?;
    let runner = SyncRunner::bootstrap(config).await?;
    let report = runner.run().await?;

    print!("{}", render_report(&report, cli.verbose));
    if report.has_failures() {
        anyhow::bail!("sync finished with failures");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_sync_the_general_root() {
        let cli = Cli::try_parse_from(["kbsync"]).unwrap();
        let overrides = cli.overrides();
        assert_eq!(overrides, ConfigOverrides::default());
    }

    #[test]
    fn parses_all_flags() {
        let cli = Cli::try_parse_from([
            "kbsync",
            "--folders",
            "Docs,Contracts",
            "--workspace",
            "General,Legal",
            "--include-subfolders",
            "--remove-duplicates",
            "--verbose",
            "--knowledge-name",
            "Handbook",
            "--ledger",
            "/tmp/ledger.db",
            "--concurrency",
            "8",
        ])
        .unwrap();

        let overrides = cli.overrides();
        assert_eq!(overrides.folders, "Docs,Contracts");
        assert!(overrides.include_subfolders);
        assert!(overrides.remove_duplicates);
        assert!(cli.verbose);
        assert_eq!(overrides.knowledge_name.as_deref(), Some("Handbook"));
        assert_eq!(overrides.ledger_path, Some(PathBuf::from("/tmp/ledger.db")));
        assert_eq!(overrides.concurrency, Some(8));
    }

    #[test]
    fn rejects_unknown_arguments() {
        assert!(Cli::try_parse_from(["kbsync", "--dry-run"]).is_err());
    }
}
