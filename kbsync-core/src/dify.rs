use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use url::Url;

use crate::status::{ApiErrorClass, classify_api_status, classify_request_error, retry_after_secs};

const DEFAULT_BASE_URL: &str = "https://api.dify.ai/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const PAGE_LIMIT: u32 = 100;

#[derive(Debug, Error)]
pub enum DifyError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<u64>,
    },
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

impl DifyError {
    pub fn classification(&self) -> ApiErrorClass {
        match self {
            DifyError::Request(err) => classify_request_error(err),
            DifyError::Api { status, .. } => classify_api_status(*status),
            DifyError::Url(_) | DifyError::Encode(_) => ApiErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classification().is_retryable()
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            DifyError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct DifyClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl DifyClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, DifyError> {
        Self::with_base_url(DEFAULT_BASE_URL, api_key)
    }

    pub fn with_base_url(base_url: &str, api_key: impl Into<String>) -> Result<Self, DifyError> {
        Self::with_timeout(base_url, api_key, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: &str,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DifyError> {
        // Keep the API prefix (e.g. "/v1") when joining relative endpoints.
        let base_url = format!("{}/", base_url.trim_end_matches('/'));
        Ok(Self {
            http: Client::builder().timeout(timeout).build()?,
            base_url: Url::parse(&base_url)?,
            api_key: api_key.into(),
        })
    }

    pub async fn list_datasets(&self) -> Result<Vec<Dataset>, DifyError> {
        self.list_all("datasets").await
    }

    pub async fn create_dataset(&self, name: &str) -> Result<Dataset, DifyError> {
        let url = self.endpoint("datasets")?;
        let request = self.http.post(url).json(&json!({ "name": name }));
        self.send(request).await
    }

    /// Looks the knowledge base up by exact name, creating it when absent.
    pub async fn find_or_create_dataset(&self, name: &str) -> Result<Dataset, DifyError> {
        if let Some(existing) = self
            .list_datasets()
            .await?
            .into_iter()
            .find(|dataset| dataset.name == name)
        {
            return Ok(existing);
        }
        self.create_dataset(name).await
    }

    pub async fn list_documents(&self, dataset_id: &str) -> Result<Vec<DocumentInfo>, DifyError> {
        self.list_all(&format!("datasets/{dataset_id}/documents"))
            .await
    }

    pub async fn create_document_by_file(
        &self,
        dataset_id: &str,
        name: &str,
        content: Vec<u8>,
    ) -> Result<DocumentInfo, DifyError> {
        let url = self.endpoint(&format!("datasets/{dataset_id}/document/create_by_file"))?;
        let data = json!({
            "indexing_technique": "high_quality",
            "process_rule": process_rule(),
        });
        let request = self.http.post(url).multipart(file_form(&data, name, content)?);
        let envelope: DocumentEnvelope = self.send(request).await?;
        Ok(envelope.document)
    }

    pub async fn create_document_by_text(
        &self,
        dataset_id: &str,
        name: &str,
        text: &str,
    ) -> Result<DocumentInfo, DifyError> {
        let url = self.endpoint(&format!("datasets/{dataset_id}/document/create_by_text"))?;
        let request = self.http.post(url).json(&json!({
            "name": name,
            "text": text,
            "indexing_technique": "high_quality",
            "process_rule": process_rule(),
        }));
        let envelope: DocumentEnvelope = self.send(request).await?;
        Ok(envelope.document)
    }

    pub async fn update_document_by_file(
        &self,
        dataset_id: &str,
        document_id: &str,
        name: &str,
        content: Vec<u8>,
    ) -> Result<DocumentInfo, DifyError> {
        let url = self.endpoint(&format!(
            "datasets/{dataset_id}/documents/{document_id}/update_by_file"
        ))?;
        let data = json!({ "process_rule": process_rule() });
        let request = self.http.post(url).multipart(file_form(&data, name, content)?);
        let envelope: DocumentEnvelope = self.send(request).await?;
        Ok(envelope.document)
    }

    pub async fn update_document_by_text(
        &self,
        dataset_id: &str,
        document_id: &str,
        name: &str,
        text: &str,
    ) -> Result<DocumentInfo, DifyError> {
        let url = self.endpoint(&format!(
            "datasets/{dataset_id}/documents/{document_id}/update_by_text"
        ))?;
        let request = self.http.post(url).json(&json!({
            "name": name,
            "text": text,
            "process_rule": process_rule(),
        }));
        let envelope: DocumentEnvelope = self.send(request).await?;
        Ok(envelope.document)
    }

    pub async fn delete_document(
        &self,
        dataset_id: &str,
        document_id: &str,
    ) -> Result<(), DifyError> {
        let url = self.endpoint(&format!("datasets/{dataset_id}/documents/{document_id}"))?;
        let response = self
            .http
            .delete(url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(Self::api_error(response).await)
    }

    async fn list_all<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, DifyError> {
        let mut items = Vec::new();
        let mut page_number = 1u32;
        loop {
            let mut url = self.endpoint(path)?;
            url.query_pairs_mut()
                .append_pair("page", &page_number.to_string())
                .append_pair("limit", &PAGE_LIMIT.to_string());
            let page: Page<T> = self.send(self.http.get(url)).await?;
            let exhausted = page.data.is_empty();
            items.extend(page.data);
            if !page.has_more || exhausted {
                break;
            }
            page_number = page_number.saturating_add(1);
        }
        Ok(items)
    }

    fn endpoint(&self, path: &str) -> Result<Url, DifyError> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, DifyError> {
        let response = request.bearer_auth(&self.api_key).send().await?;
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: reqwest::Response) -> DifyError {
        let status = response.status();
        let retry_after = retry_after_secs(response.headers());
        let body = response.text().await.unwrap_or_default();
        DifyError::Api {
            status,
            body,
            retry_after,
        }
    }
}

fn process_rule() -> Value {
    json!({
        "mode": "automatic",
        "rules": {
            "pre_processing_rules": [
                { "id": "remove_extra_spaces", "enabled": true },
                { "id": "remove_urls_emails", "enabled": true },
            ],
            "segmentation": { "separator": "\n", "max_tokens": 1000 },
        },
    })
}

fn file_form(data: &Value, name: &str, content: Vec<u8>) -> Result<Form, DifyError> {
    let data = Part::text(serde_json::to_string(data)?).mime_str("application/json")?;
    let file = Part::bytes(content)
        .file_name(name.to_string())
        .mime_str("application/octet-stream")?;
    Ok(Form::new().part("data", data).part("file", file))
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Dataset {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DocumentInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

impl DocumentInfo {
    /// Unix seconds of the last change the API reports for this document.
    pub fn last_changed(&self) -> i64 {
        self.updated_at.or(self.created_at).unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    data: Vec<T>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct DocumentEnvelope {
    document: DocumentInfo,
}
