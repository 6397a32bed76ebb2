use std::collections::{HashSet, VecDeque};

use futures_util::Stream;
use futures_util::stream;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use tracing::debug;

use super::clock::unix_millis;
use super::file_types::{extension_of, normalize_name};
use super::remote::{FileSource, FolderListing, RemoteError, SourceFile, SourceFolder, Workspace};
use super::retry::RetryPolicy;

/// One file or folder as seen in the source during this pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFileRecord {
    pub id: String,
    pub name: String,
    /// Folder chain from the enumeration root, `/` separated, ending in `name`.
    pub path: String,
    pub modified_at: Option<i64>,
    pub is_folder: bool,
    pub extension: Option<String>,
}

#[derive(Debug, Error)]
pub enum EnumerateError {
    #[error("workspace not found: {0}")]
    WorkspaceNotFound(String),
    #[error("folder not found: {0}")]
    FolderNotFound(String),
    #[error("folder name {name:?} is ambiguous: {}", .candidates.join(", "))]
    AmbiguousFolder {
        name: String,
        candidates: Vec<String>,
    },
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFolder {
    /// `None` is the workspace root.
    pub id: Option<String>,
    pub label: String,
}

impl ResolvedFolder {
    pub fn root() -> Self {
        Self {
            id: None,
            label: "root".to_string(),
        }
    }
}

pub struct SourceEnumerator<'a> {
    source: &'a dyn FileSource,
    retry: &'a RetryPolicy,
}

impl<'a> SourceEnumerator<'a> {
    pub fn new(source: &'a dyn FileSource, retry: &'a RetryPolicy) -> Self {
        Self { source, retry }
    }

    pub async fn resolve_workspace(&self, token: &str) -> Result<Workspace, EnumerateError> {
        let token = token.trim();
        if is_numeric(token) {
            return Ok(Workspace {
                id: token.to_string(),
                name: token.to_string(),
            });
        }
        let workspaces = self
            .retry
            .run("list workspaces", || self.source.list_workspaces())
            .await?;
        workspaces
            .into_iter()
            .find(|workspace| workspace.name == token)
            .ok_or_else(|| EnumerateError::WorkspaceNotFound(token.to_string()))
    }

    pub async fn resolve_folder(
        &self,
        workspace_id: &str,
        token: &str,
    ) -> Result<ResolvedFolder, EnumerateError> {
        let token = token.trim();
        if token.is_empty() || token.eq_ignore_ascii_case("root") {
            return Ok(ResolvedFolder::root());
        }
        if is_numeric(token) {
            return Ok(ResolvedFolder {
                id: Some(token.to_string()),
                label: token.to_string(),
            });
        }
        if token.contains('/') {
            return self.resolve_folder_path(workspace_id, token).await;
        }
        self.search_folder(workspace_id, token).await
    }

    async fn resolve_folder_path(
        &self,
        workspace_id: &str,
        token: &str,
    ) -> Result<ResolvedFolder, EnumerateError> {
        let mut current: Option<String> = None;
        let mut walked = Vec::new();
        for segment in token.split('/').filter(|segment| !segment.is_empty()) {
            let listing = self.list(workspace_id, current.as_deref()).await?;
            let mut matches = listing
                .folders
                .into_iter()
                .filter(|folder| folder.name == segment);
            let Some(found) = matches.next() else {
                return Err(EnumerateError::FolderNotFound(token.to_string()));
            };
            if matches.next().is_some() {
                return Err(EnumerateError::AmbiguousFolder {
                    name: token.to_string(),
                    candidates: vec![join_path(&walked.join("/"), segment)],
                });
            }
            walked.push(found.name);
            current = Some(found.id);
        }
        match current {
            Some(id) => Ok(ResolvedFolder {
                id: Some(id),
                label: walked.join("/"),
            }),
            None => Ok(ResolvedFolder::root()),
        }
    }

    /// Breadth-first search by name: the shallowest match wins, a tie at that depth is an error.
    async fn search_folder(
        &self,
        workspace_id: &str,
        name: &str,
    ) -> Result<ResolvedFolder, EnumerateError> {
        let mut level: Vec<(Option<String>, String)> = vec![(None, String::new())];
        let mut seen = HashSet::new();
        while !level.is_empty() {
            let mut matches = Vec::new();
            let mut next = Vec::new();
            for (folder_id, path) in &level {
                let listing = self.list(workspace_id, folder_id.as_deref()).await?;
                for folder in listing.folders {
                    if !seen.insert(folder.id.clone()) {
                        continue;
                    }
                    let child_path = join_path(path, &folder.name);
                    if folder.name == name {
                        matches.push((folder.id.clone(), child_path.clone()));
                    }
                    next.push((Some(folder.id), child_path));
                }
            }
            match matches.len() {
                0 => level = next,
                1 => {
                    let (id, path) = matches.remove(0);
                    debug!(folder = name, id = %id, path = %path, "resolved folder by name");
                    return Ok(ResolvedFolder {
                        id: Some(id),
                        label: path,
                    });
                }
                _ => {
                    return Err(EnumerateError::AmbiguousFolder {
                        name: name.to_string(),
                        candidates: matches.into_iter().map(|(_, path)| path).collect(),
                    });
                }
            }
        }
        Err(EnumerateError::FolderNotFound(name.to_string()))
    }

    /// Lazily walks `folder`, depth-first in listing order when `recursive`.
    pub fn enumerate(
        &self,
        workspace_id: &str,
        folder: &ResolvedFolder,
        recursive: bool,
    ) -> impl Stream<Item = Result<SourceFileRecord, EnumerateError>> + use<'a> {
        let source = self.source;
        let retry = self.retry;
        let state = WalkState {
            workspace_id: workspace_id.to_string(),
            recursive,
            pending: vec![PendingFolder {
                id: folder.id.clone(),
                path: String::new(),
                record: None,
            }],
            ready: VecDeque::new(),
            seen_folders: folder.id.iter().cloned().collect(),
            seen_files: HashSet::new(),
        };

        stream::try_unfold(state, move |state| next_record(source, retry, state))
    }

    async fn list(
        &self,
        workspace_id: &str,
        folder_id: Option<&str>,
    ) -> Result<FolderListing, RemoteError> {
        self.retry
            .run("list folder", || self.source.list_folder(workspace_id, folder_id))
            .await
    }
}

struct PendingFolder {
    id: Option<String>,
    path: String,
    /// Emitted right before the folder's contents.
    record: Option<SourceFileRecord>,
}

struct WalkState {
    workspace_id: String,
    recursive: bool,
    pending: Vec<PendingFolder>,
    ready: VecDeque<SourceFileRecord>,
    seen_folders: HashSet<String>,
    seen_files: HashSet<String>,
}

impl WalkState {
    fn absorb(&mut self, path: &str, files: Vec<SourceFile>, folders: Vec<SourceFolder>) {
        for file in files {
            if !self.seen_files.insert(file.id.clone()) {
                debug!(id = %file.id, "skipping file listed twice");
                continue;
            }
            self.ready.push_back(file_record(path, file));
        }

        let mut children = Vec::new();
        for folder in folders {
            if !self.seen_folders.insert(folder.id.clone()) {
                continue;
            }
            let child_path = join_path(path, &folder.name);
            let record = SourceFileRecord {
                id: folder.id.clone(),
                name: folder.name,
                path: child_path.clone(),
                modified_at: None,
                is_folder: true,
                extension: None,
            };
            if self.recursive {
                children.push(PendingFolder {
                    id: Some(folder.id),
                    path: child_path,
                    record: Some(record),
                });
            } else {
                self.ready.push_back(record);
            }
        }
        // Stack: push in reverse so the first listed folder is walked first.
        self.pending.extend(children.into_iter().rev());
    }
}

async fn next_record(
    source: &dyn FileSource,
    retry: &RetryPolicy,
    mut state: WalkState,
) -> Result<Option<(SourceFileRecord, WalkState)>, EnumerateError> {
    loop {
        if let Some(record) = state.ready.pop_front() {
            return Ok(Some((record, state)));
        }
        let Some(next) = state.pending.pop() else {
            return Ok(None);
        };
        if let Some(record) = next.record {
            state.ready.push_back(record);
        }
        let listing = {
            let workspace_id = state.workspace_id.as_str();
            let folder_id = next.id.as_deref();
            retry
                .run("list folder", || source.list_folder(workspace_id, folder_id))
                .await?
        };
        state.absorb(&next.path, listing.files, listing.folders);
    }
}

fn file_record(path: &str, file: SourceFile) -> SourceFileRecord {
    let name = normalize_name(&file.name);
    let extension = file
        .extension
        .as_deref()
        .map(|extension| extension.trim_start_matches('.').to_ascii_lowercase())
        .filter(|extension| !extension.is_empty())
        .or_else(|| extension_of(&name));
    SourceFileRecord {
        id: file.id,
        path: join_path(path, &name),
        modified_at: file.modified.as_deref().and_then(parse_source_timestamp),
        name,
        is_folder: false,
        extension,
    }
}

/// Unix milliseconds of a source timestamp; naive formats are read as UTC.
pub fn parse_source_timestamp(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(at) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(unix_millis(at));
    }
    let with_fraction =
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]");
    let plain = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    PrimitiveDateTime::parse(raw, with_fraction)
        .or_else(|_| PrimitiveDateTime::parse(raw, plain))
        .ok()
        .map(|at| unix_millis(at.assume_utc()))
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

fn is_numeric(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(|byte| byte.is_ascii_digit())
}

#[cfg(test)]
#[path = "enumerate_tests.rs"]
mod tests;
