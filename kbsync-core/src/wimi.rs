use std::fmt;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::status::{ApiErrorClass, classify_api_status, classify_request_error};

const API_VERSION: &str = "1.2";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum WimiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("login rejected: {0}")]
    LoginRejected(String),
    #[error("response to {target} carries no body data")]
    MissingData { target: String },
}

impl WimiError {
    pub fn classification(&self) -> ApiErrorClass {
        match self {
            WimiError::Request(err) => classify_request_error(err),
            WimiError::Api { status, .. } => classify_api_status(*status),
            WimiError::LoginRejected(_) => ApiErrorClass::Auth,
            WimiError::Url(_) | WimiError::MissingData { .. } => ApiErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classification().is_retryable()
    }
}

#[derive(Clone)]
pub struct WimiCredentials {
    pub account_id: String,
    pub app_token: String,
    pub login: String,
    pub password: String,
}

impl fmt::Debug for WimiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WimiCredentials")
            .field("account_id", &self.account_id)
            .field("login", &self.login)
            .finish_non_exhaustive()
    }
}

/// Token and identity returned by `auth.user.login`; required by every other call.
#[derive(Debug, Clone)]
pub struct WimiSession {
    pub token: String,
    pub user_id: String,
    pub projects: Vec<Project>,
}

#[derive(Clone)]
pub struct WimiClient {
    http: Client,
    api_url: Url,
    download_url: Url,
    credentials: WimiCredentials,
}

impl WimiClient {
    pub fn new(
        api_url: &str,
        download_url: &str,
        credentials: WimiCredentials,
    ) -> Result<Self, WimiError> {
        Self::with_timeout(api_url, download_url, credentials, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        api_url: &str,
        download_url: &str,
        credentials: WimiCredentials,
        timeout: Duration,
    ) -> Result<Self, WimiError> {
        Ok(Self {
            http: Client::builder().timeout(timeout).build()?,
            api_url: Url::parse(api_url)?,
            download_url: Url::parse(download_url)?,
            credentials,
        })
    }

    pub async fn login(&self) -> Result<WimiSession, WimiError> {
        let target = "auth.user.login";
        let payload = json!({
            "header": {
                "app_token": self.credentials.app_token,
                "api_version": API_VERSION,
                "msg_key": format!("{target}.{}", Uuid::new_v4()),
                "identification": { "account_id": id_value(&self.credentials.account_id) },
                "target": target,
                "auth": {
                    "login": self.credentials.login,
                    "password": self.credentials.password,
                },
            },
            "body": {
                "data": {
                    "token": null,
                    "list_projects": true,
                    "projects_auth": true,
                },
            },
        });

        let envelope: Envelope<LoginData> = self.post_envelope(&self.api_url, &payload).await?;
        let token = envelope
            .header
            .and_then(|header| header.token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| WimiError::LoginRejected("no session token in response".into()))?;
        let data = envelope
            .body
            .and_then(|body| body.data)
            .ok_or_else(|| WimiError::MissingData {
                target: target.to_string(),
            })?;

        Ok(WimiSession {
            token,
            user_id: data.user.user_id,
            projects: data.projects,
        })
    }

    /// Lists the files and sub-folders of one folder (`None` = project root).
    pub async fn list_entries(
        &self,
        session: &WimiSession,
        project_id: &str,
        dir_id: Option<&str>,
    ) -> Result<EntryList, WimiError> {
        let target = "document.entry.list";
        let mut identification = self.identification(session, project_id);
        if let Some(dir_id) = dir_id {
            identification["dir_id"] = id_value(dir_id);
        }
        let payload = json!({
            "header": self.header(session, target, identification),
            "body": { "data": { "no_comment_count": true } },
        });

        let envelope: Envelope<EntryList> = self.post_envelope(&self.api_url, &payload).await?;
        envelope
            .body
            .and_then(|body| body.data)
            .ok_or_else(|| WimiError::MissingData {
                target: target.to_string(),
            })
    }

    pub async fn download(
        &self,
        session: &WimiSession,
        project_id: &str,
        file_id: &str,
    ) -> Result<Vec<u8>, WimiError> {
        let mut identification = self.identification(session, project_id);
        identification["file_id"] = id_value(file_id);
        let payload = json!({
            "header": self.header(session, "document.file.Download", identification),
            "body": {},
        });

        let response = self
            .http
            .post(self.download_url.clone())
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(WimiError::Api { status, body });
        }
        Ok(response.bytes().await?.to_vec())
    }

    fn identification(&self, session: &WimiSession, project_id: &str) -> Value {
        json!({
            "account_id": id_value(&self.credentials.account_id),
            "user_id": id_value(&session.user_id),
            "project_id": id_value(project_id),
        })
    }

    fn header(&self, session: &WimiSession, target: &str, identification: Value) -> Value {
        json!({
            "target": target,
            "api_version": API_VERSION,
            "app_token": self.credentials.app_token,
            "msg_key": Uuid::new_v4().to_string(),
            "token": session.token,
            "identification": identification,
        })
    }

    async fn post_envelope<T: DeserializeOwned>(
        &self,
        url: &Url,
        payload: &Value,
    ) -> Result<Envelope<T>, WimiError> {
        let response = self.http.post(url.clone()).json(payload).send().await?;
        if response.status().is_success() {
            Ok(response.json::<Envelope<T>>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(WimiError::Api { status, body })
        }
    }
}

/// Wimi identifiers are numeric; send them as numbers whenever they parse as one.
fn id_value(id: &str) -> Value {
    id.parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(id))
}

fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(value) => Ok(value),
        Value::Number(value) => Ok(value.to_string()),
        other => Err(de::Error::custom(format!(
            "expected a string or numeric id, got {other}"
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    header: Option<ResponseHeader>,
    body: Option<ResponseBody<T>>,
}

#[derive(Debug, Deserialize)]
struct ResponseHeader {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseBody<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    user: LoginUser,
    #[serde(default)]
    projects: Vec<Project>,
}

#[derive(Debug, Deserialize)]
struct LoginUser {
    #[serde(deserialize_with = "id_string")]
    user_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Project {
    #[serde(deserialize_with = "id_string")]
    pub project_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct FileEntry {
    #[serde(deserialize_with = "id_string")]
    pub file_id: String,
    pub name: String,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DirEntry {
    #[serde(deserialize_with = "id_string")]
    pub dir_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct EntryList {
    #[serde(default)]
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub dirs: Vec<DirEntry>,
}
