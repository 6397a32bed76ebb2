//! Bindings of the engine's ports to the Wimi and Dify HTTP clients.

use std::time::Duration;

use async_trait::async_trait;
use kbsync_core::{
    ApiErrorClass, DifyClient, DifyError, DocumentInfo, WimiClient, WimiError, WimiSession,
};

use crate::sync::file_types::extension_of;
use crate::sync::remote::{
    DocumentContext, DocumentPayload, FileSource, FolderListing, KnowledgeSink, RemoteError, SinkDocument,
    SourceFile, SourceFolder, Workspace,
};
use crate::sync::retry::RetryPolicy;

fn classify(class: ApiErrorClass, message: String, retry_after: Option<u64>) -> RemoteError {
    match class {
        ApiErrorClass::Auth => RemoteError::Auth(message),
        ApiErrorClass::NotFound => RemoteError::NotFound(message),
        ApiErrorClass::RateLimit | ApiErrorClass::Transient => RemoteError::Transient {
            message,
            retry_after: retry_after.map(Duration::from_secs),
        },
        ApiErrorClass::Permanent => RemoteError::Permanent(message),
    }
}

impl From<WimiError> for RemoteError {
    fn from(err: WimiError) -> Self {
        classify(err.classification(), err.to_string(), None)
    }
}

impl From<DifyError> for RemoteError {
    fn from(err: DifyError) -> Self {
        classify(err.classification(), err.to_string(), err.retry_after_secs())
    }
}

/// Logged-in Wimi account; workspaces are the projects returned at login.
pub struct WimiSource {
    client: WimiClient,
    session: WimiSession,
}

impl WimiSource {
    pub async fn login(client: WimiClient, retry: &RetryPolicy) -> Result<Self, RemoteError> {
        let session = {
            let client = &client;
            retry
                .run("wimi login", move || async move {
                    client.login().await.map_err(RemoteError::from)
                })
                .await?
        };
        Ok(Self { client, session })
    }

    pub fn session(&self) -> &WimiSession {
        &self.session
    }
}

#[async_trait]
impl FileSource for WimiSource {
    async fn list_workspaces(&self) -> Result<Vec<Workspace>, RemoteError> {
        Ok(self
            .session
            .projects
            .iter()
            .map(|project| Workspace {
                id: project.project_id.clone(),
                name: project.name.clone(),
            })
            .collect())
    }

    async fn list_folder(
        &self,
        workspace_id: &str,
        folder_id: Option<&str>,
    ) -> Result<FolderListing, RemoteError> {
        let entries = self
            .client
            .list_entries(&self.session, workspace_id, folder_id)
            .await?;
        Ok(FolderListing {
            files: entries
                .files
                .into_iter()
                .map(|file| SourceFile {
                    extension: file
                        .extension
                        .filter(|extension| !extension.is_empty())
                        .or_else(|| extension_of(&file.name)),
                    id: file.file_id,
                    name: file.name,
                    modified: file.date,
                })
                .collect(),
            folders: entries
                .dirs
                .into_iter()
                .map(|dir| SourceFolder {
                    id: dir.dir_id,
                    name: dir.name,
                })
                .collect(),
        })
    }

    async fn download(&self, workspace_id: &str, file_id: &str) -> Result<Vec<u8>, RemoteError> {
        Ok(self
            .client
            .download(&self.session, workspace_id, file_id)
            .await?)
    }
}

/// One Dify knowledge base (dataset).
pub struct DifySink {
    client: DifyClient,
    dataset_id: String,
}

impl DifySink {
    pub fn new(client: DifyClient, dataset_id: impl Into<String>) -> Self {
        Self {
            client,
            dataset_id: dataset_id.into(),
        }
    }
}

#[async_trait]
impl KnowledgeSink for DifySink {
    async fn create_document(
        &self,
        context: &DocumentContext,
        payload: DocumentPayload,
    ) -> Result<String, RemoteError> {
        let name = context.title();
        let document: DocumentInfo = match payload {
            DocumentPayload::File(bytes) => {
                self.client
                    .create_document_by_file(&self.dataset_id, &name, bytes)
                    .await?
            }
            DocumentPayload::Text(text) => {
                self.client
                    .create_document_by_text(&self.dataset_id, &name, &text)
                    .await?
            }
        };
        Ok(document.id)
    }

    async fn replace_document(
        &self,
        document_id: &str,
        context: &DocumentContext,
        payload: DocumentPayload,
    ) -> Result<(), RemoteError> {
        let name = context.title();
        match payload {
            DocumentPayload::File(bytes) => {
                self.client
                    .update_document_by_file(&self.dataset_id, document_id, &name, bytes)
                    .await?;
            }
            DocumentPayload::Text(text) => {
                self.client
                    .update_document_by_text(&self.dataset_id, document_id, &name, &text)
                    .await?;
            }
        }
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), RemoteError> {
        Ok(self
            .client
            .delete_document(&self.dataset_id, document_id)
            .await?)
    }

    async fn list_documents(&self) -> Result<Vec<SinkDocument>, RemoteError> {
        let documents = self.client.list_documents(&self.dataset_id).await?;
        Ok(documents
            .into_iter()
            .map(|document| SinkDocument {
                updated_at: document.last_changed(),
                id: document.id,
                name: document.name,
            })
            .collect())
    }
}
