use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Failure of a single remote call, already classified for the retry policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("{0}")]
    Permanent(String),
}

impl RemoteError {
    pub fn transient(message: impl Into<String>) -> Self {
        RemoteError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub id: String,
    pub name: String,
    pub extension: Option<String>,
    /// Raw modification timestamp as reported by the source.
    pub modified: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFolder {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderListing {
    pub files: Vec<SourceFile>,
    pub folders: Vec<SourceFolder>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentPayload {
    File(Vec<u8>),
    Text(String),
}

/// Where a mirrored file lives in the source; the sink stores it in the document title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentContext {
    /// Ledger scope of the pass, `"{workspace_id}:{folder_id|root}"`.
    pub scope: String,
    /// Folder chain from the pass root down to the file.
    pub folders: Vec<String>,
    pub name: String,
}

impl DocumentContext {
    /// `path` is the `/` separated logical path ending in the file name.
    pub fn new(scope: &str, path: &str, name: &str) -> Self {
        let mut folders: Vec<String> = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect();
        folders.pop();
        Self {
            scope: scope.to_string(),
            folders,
            name: name.to_string(),
        }
    }

    /// Sink document name, e.g. `[100:root > Docs] report.pdf`.
    ///
    /// The file name stays last so the sink still sees the extension, and no
    /// `/` is used since upload file names may not contain one.
    pub fn title(&self) -> String {
        let mut context = self.scope.clone();
        for folder in &self.folders {
            context.push_str(" > ");
            context.push_str(folder);
        }
        format!("[{context}] {}", self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkDocument {
    pub id: String,
    pub name: String,
    /// Unix seconds of the last change on the sink side.
    pub updated_at: i64,
}

/// Read-only view of the file storage the knowledge base mirrors.
#[async_trait]
pub trait FileSource: Send + Sync {
    async fn list_workspaces(&self) -> Result<Vec<Workspace>, RemoteError>;

    /// Lists one folder; `None` is the workspace root.
    async fn list_folder(
        &self,
        workspace_id: &str,
        folder_id: Option<&str>,
    ) -> Result<FolderListing, RemoteError>;

    async fn download(&self, workspace_id: &str, file_id: &str) -> Result<Vec<u8>, RemoteError>;
}

/// Document store of one knowledge base.
#[async_trait]
pub trait KnowledgeSink: Send + Sync {
    /// Returns the id of the new document.
    async fn create_document(
        &self,
        context: &DocumentContext,
        payload: DocumentPayload,
    ) -> Result<String, RemoteError>;

    async fn replace_document(
        &self,
        document_id: &str,
        context: &DocumentContext,
        payload: DocumentPayload,
    ) -> Result<(), RemoteError>;

    async fn delete_document(&self, document_id: &str) -> Result<(), RemoteError>;

    async fn list_documents(&self) -> Result<Vec<SinkDocument>, RemoteError>;
}
