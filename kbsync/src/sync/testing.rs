//! In-memory source and sink used by the engine tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::remote::{
    DocumentContext, DocumentPayload, FileSource, FolderListing, KnowledgeSink, RemoteError, SinkDocument,
    SourceFile, SourceFolder, Workspace,
};

pub const WORKSPACE: &str = "100";

type FolderKey = (String, Option<String>);

#[derive(Default)]
struct SourceState {
    workspaces: Vec<Workspace>,
    folders: HashMap<FolderKey, FolderListing>,
    contents: HashMap<String, Vec<u8>>,
    failing_downloads: HashMap<String, RemoteError>,
    failing_listings: usize,
    downloads: usize,
}

pub struct FakeSource {
    state: Mutex<SourceState>,
}

impl FakeSource {
    /// One workspace `100` named `General`.
    pub fn new() -> Self {
        let source = Self {
            state: Mutex::new(SourceState::default()),
        };
        source.add_workspace(WORKSPACE, "General");
        source
    }

    pub fn add_workspace(&self, id: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.workspaces.push(Workspace {
            id: id.into(),
            name: name.into(),
        });
        state
            .folders
            .entry((id.to_string(), None))
            .or_default();
    }

    pub fn put_folder(&self, workspace: &str, parent: Option<&str>, id: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .folders
            .entry(key(workspace, parent))
            .or_default()
            .folders
            .push(SourceFolder {
                id: id.into(),
                name: name.into(),
            });
        state.folders.entry(key(workspace, Some(id))).or_default();
    }

    pub fn put_file(
        &self,
        workspace: &str,
        folder: Option<&str>,
        id: &str,
        name: &str,
        modified: &str,
        content: &str,
    ) {
        let mut state = self.state.lock().unwrap();
        let listing = state.folders.entry(key(workspace, folder)).or_default();
        listing.files.retain(|file| file.id != id);
        listing.files.push(SourceFile {
            id: id.into(),
            name: name.into(),
            extension: None,
            modified: Some(modified.into()),
        });
        state.contents.insert(id.into(), content.as_bytes().to_vec());
    }

    pub fn remove_file(&self, workspace: &str, folder: Option<&str>, id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(listing) = state.folders.get_mut(&key(workspace, folder)) {
            listing.files.retain(|file| file.id != id);
        }
    }

    pub fn fail_download(&self, id: &str, err: RemoteError) {
        let mut state = self.state.lock().unwrap();
        state.failing_downloads.insert(id.into(), err);
    }

    pub fn heal_download(&self, id: &str) {
        self.state.lock().unwrap().failing_downloads.remove(id);
    }

    /// The next `count` listing calls fail with a transient error.
    pub fn fail_listings(&self, count: usize) {
        self.state.lock().unwrap().failing_listings = count;
    }

    pub fn downloads(&self) -> usize {
        self.state.lock().unwrap().downloads
    }
}

fn key(workspace: &str, folder: Option<&str>) -> FolderKey {
    (workspace.to_string(), folder.map(str::to_string))
}

#[async_trait]
impl FileSource for FakeSource {
    async fn list_workspaces(&self) -> Result<Vec<Workspace>, RemoteError> {
        Ok(self.state.lock().unwrap().workspaces.clone())
    }

    async fn list_folder(
        &self,
        workspace_id: &str,
        folder_id: Option<&str>,
    ) -> Result<FolderListing, RemoteError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_listings > 0 {
            state.failing_listings -= 1;
            return Err(RemoteError::transient("listing unavailable"));
        }
        state
            .folders
            .get(&key(workspace_id, folder_id))
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("folder {folder_id:?}")))
    }

    async fn download(&self, _workspace_id: &str, file_id: &str) -> Result<Vec<u8>, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.downloads += 1;
        if let Some(err) = state.failing_downloads.get(file_id) {
            return Err(err.clone());
        }
        state
            .contents
            .get(file_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("file {file_id}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeDocument {
    pub name: String,
    pub payload: DocumentPayload,
    pub updated_at: i64,
}

#[derive(Default)]
struct SinkState {
    documents: BTreeMap<String, FakeDocument>,
    next_id: u64,
    clock: i64,
    failing_replaces: HashSet<String>,
    calls: Vec<String>,
}

pub struct FakeSink {
    state: Mutex<SinkState>,
}

impl FakeSink {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SinkState {
                clock: 1_000,
                ..SinkState::default()
            }),
        }
    }

    pub fn insert_document(&self, id: &str, name: &str, updated_at: i64) {
        self.state.lock().unwrap().documents.insert(
            id.into(),
            FakeDocument {
                name: name.into(),
                payload: DocumentPayload::Text(String::new()),
                updated_at,
            },
        );
    }

    pub fn document(&self, id: &str) -> Option<FakeDocument> {
        self.state.lock().unwrap().documents.get(id).cloned()
    }

    pub fn remove_document(&self, id: &str) {
        self.state.lock().unwrap().documents.remove(id);
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().documents.len()
    }

    pub fn fail_replace(&self, document_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.failing_replaces.insert(document_id.into());
    }

    /// Mutating calls in the order they arrived, e.g. `create:[100:root] notes.md`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }
}

#[async_trait]
impl KnowledgeSink for FakeSink {
    async fn create_document(
        &self,
        context: &DocumentContext,
        payload: DocumentPayload,
    ) -> Result<String, RemoteError> {
        let name = context.title();
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("create:{name}"));
        state.next_id += 1;
        state.clock += 1;
        let id = format!("doc-{}", state.next_id);
        let updated_at = state.clock;
        state.documents.insert(
            id.clone(),
            FakeDocument {
                name,
                payload,
                updated_at,
            },
        );
        Ok(id)
    }

    async fn replace_document(
        &self,
        document_id: &str,
        context: &DocumentContext,
        payload: DocumentPayload,
    ) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("replace:{document_id}"));
        if state.failing_replaces.contains(document_id) {
            return Err(RemoteError::Permanent(format!(
                "replace {document_id} rejected"
            )));
        }
        state.clock += 1;
        let updated_at = state.clock;
        let Some(document) = state.documents.get_mut(document_id) else {
            return Err(RemoteError::NotFound(format!("document {document_id}")));
        };
        document.name = context.title();
        document.payload = payload;
        document.updated_at = updated_at;
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("delete:{document_id}"));
        match state.documents.remove(document_id) {
            Some(_) => Ok(()),
            None => Err(RemoteError::NotFound(format!("document {document_id}"))),
        }
    }

    async fn list_documents(&self) -> Result<Vec<SinkDocument>, RemoteError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .documents
            .iter()
            .map(|(id, document)| SinkDocument {
                id: id.clone(),
                name: document.name.clone(),
                updated_at: document.updated_at,
            })
            .collect())
    }
}
