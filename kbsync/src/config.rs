use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use kbsync_core::WimiCredentials;

use crate::sync::engine::{DEFAULT_CONCURRENCY, SyncOptions, SyncPair};
use crate::sync::retry::DEFAULT_MAX_ATTEMPTS;

const DEFAULT_DIFY_API_URL: &str = "https://api.dify.ai/v1";
const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_FOLDERS: &str = "root";
pub const DEFAULT_WORKSPACE: &str = "General";

/// Values given on the command line; they win over the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub folders: String,
    pub workspace: String,
    pub include_subfolders: bool,
    pub remove_duplicates: bool,
    pub dify_api_url: Option<String>,
    pub dify_api_key: Option<String>,
    pub knowledge_name: Option<String>,
    pub ledger_path: Option<PathBuf>,
    pub concurrency: Option<usize>,
}

impl Default for ConfigOverrides {
    fn default() -> Self {
        Self {
            folders: DEFAULT_FOLDERS.to_string(),
            workspace: DEFAULT_WORKSPACE.to_string(),
            include_subfolders: false,
            remove_duplicates: false,
            dify_api_url: None,
            dify_api_key: None,
            knowledge_name: None,
            ledger_path: None,
            concurrency: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WimiSettings {
    pub api_url: String,
    pub download_url: String,
    pub credentials: WimiCredentials,
}

#[derive(Clone)]
pub struct DifySettings {
    pub api_url: String,
    pub api_key: String,
    pub knowledge_name: String,
}

impl fmt::Debug for DifySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DifySettings")
            .field("api_url", &self.api_url)
            .field("knowledge_name", &self.knowledge_name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub wimi: WimiSettings,
    pub dify: DifySettings,
    /// `None` means the per-user default location.
    pub ledger_path: Option<PathBuf>,
    pub pairs: Vec<SyncPair>,
    pub options: SyncOptions,
    pub max_attempts: u32,
    pub timeout: Duration,
}

impl SyncConfig {
    pub fn from_env(overrides: ConfigOverrides) -> anyhow::Result<Self> {
        Self::from_lookup(overrides, |name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(overrides: ConfigOverrides, lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let required = |name: &str| env(name).with_context(|| format!("{name} is not set"));

        let wimi = WimiSettings {
            api_url: required("WIMI_API_URL")?,
            download_url: required("WIMI_DOWNLOAD_URL")?,
            credentials: WimiCredentials {
                account_id: required("WIMI_ACCOUNT_ID")?,
                app_token: required("WIMI_API_KEY")?,
                login: required("WIMI_LOGIN")?,
                password: required("WIMI_PASSWORD")?,
            },
        };

        let dify = DifySettings {
            api_url: overrides
                .dify_api_url
                .or_else(|| env("DIFY_API_URL"))
                .unwrap_or_else(|| DEFAULT_DIFY_API_URL.to_string()),
            api_key: overrides
                .dify_api_key
                .or_else(|| env("DIFY_API_KEY"))
                .context("Dify API key is missing (--dify-api-key or DIFY_API_KEY)")?,
            knowledge_name: overrides
                .knowledge_name
                .or_else(|| env("KNOWLEDGE_NAME"))
                .context("knowledge base name is missing (--knowledge-name or KNOWLEDGE_NAME)")?,
        };

        let ledger_path = overrides
            .ledger_path
            .or_else(|| env("KBSYNC_LEDGER_PATH").map(PathBuf::from));
        let concurrency = overrides
            .concurrency
            .filter(|value| *value > 0)
            .unwrap_or_else(|| {
                read_u64(&env, "KBSYNC_CONCURRENCY", DEFAULT_CONCURRENCY as u64) as usize
            });
        let max_attempts = read_u64(&env, "KBSYNC_MAX_ATTEMPTS", u64::from(DEFAULT_MAX_ATTEMPTS))
            .min(u64::from(u32::MAX)) as u32;
        let timeout = Duration::from_secs(read_u64(
            &env,
            "KBSYNC_TIMEOUT_SECS",
            DEFAULT_TIMEOUT_SECS,
        ));

        Ok(Self {
            wimi,
            dify,
            ledger_path,
            pairs: pair_folders(&overrides.folders, &overrides.workspace)?,
            options: SyncOptions {
                recursive: overrides.include_subfolders,
                remove_duplicates: overrides.remove_duplicates,
                concurrency,
            },
            max_attempts,
            timeout,
        })
    }
}

/// Zips the folder list with the workspace list; a single workspace applies to every folder.
pub fn pair_folders(folders: &str, workspaces: &str) -> anyhow::Result<Vec<SyncPair>> {
    let mut folders = split_list(folders);
    if folders.is_empty() {
        folders.push(DEFAULT_FOLDERS.to_string());
    }
    let mut workspaces = split_list(workspaces);
    if workspaces.is_empty() {
        workspaces.push(DEFAULT_WORKSPACE.to_string());
    }

    if workspaces.len() == 1 {
        let workspace = &workspaces[0];
        return Ok(folders
            .into_iter()
            .map(|folder| SyncPair::new(workspace.clone(), folder))
            .collect());
    }
    if workspaces.len() != folders.len() {
        bail!(
            "got {} workspaces for {} folders; give one workspace or one per folder",
            workspaces.len(),
            folders.len()
        );
    }
    Ok(workspaces
        .into_iter()
        .zip(folders)
        .map(|(workspace, folder)| SyncPair::new(workspace, folder))
        .collect())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn read_u64<F>(env: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    env(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}
