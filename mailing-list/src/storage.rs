//! File storage backends for mailed attachments.
//!
//! Paths are absolute within the storage namespace, e.g. `/Mailed Attachments/abc12 - u1/report.pdf`.
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP client error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{operation} returned unexpected status {status}")]
    UnexpectedStatus {
        operation: &'static str,
        status: StatusCode,
    },

    #[error("invalid storage path: {0}")]
    InvalidPath(String),

    #[error("path already exists: {0}")]
    Conflict(String),

    #[error("no free folder name for {0}")]
    NoFreeName(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Folder,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub path: String,
    pub kind: EntryKind,
}

#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Returns `None` when nothing exists at `path`.
    async fn metadata(&self, path: &str) -> Result<Option<Metadata>, StorageError>;

    /// Fails with `StorageError::Conflict` when `path` is taken.
    async fn create_folder(&self, path: &str) -> Result<Metadata, StorageError>;

    /// Stores `contents` at `path`. An existing file is never overwritten; the
    /// backend picks a free name instead and returns it in the metadata.
    async fn upload(&self, path: &str, contents: Vec<u8>) -> Result<Metadata, StorageError>;
}

/// Inserts ` (n)` before the extension: `report.pdf` becomes `report (1).pdf`.
pub(crate) fn with_suffix(name: &str, n: u32) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{} ({n}){}", &name[..dot], &name[dot..]),
        _ => format!("{name} ({n})"),
    }
}

pub struct FilesystemStorage {
    base_dir: PathBuf,
}

impl FilesystemStorage {
    pub fn new(base_dir: &str) -> Self {
        FilesystemStorage {
            base_dir: PathBuf::from(base_dir),
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || relative.as_os_str().is_empty() {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.base_dir.join(relative))
    }
}

#[async_trait]
impl FileStorage for FilesystemStorage {
    async fn metadata(&self, path: &str) -> Result<Option<Metadata>, StorageError> {
        let local = self.resolve(path)?;
        match tokio::fs::metadata(&local).await {
            Ok(meta) => Ok(Some(Metadata {
                path: path.to_string(),
                kind: if meta.is_dir() {
                    EntryKind::Folder
                } else {
                    EntryKind::File
                },
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_folder(&self, path: &str) -> Result<Metadata, StorageError> {
        let local = self.resolve(path)?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::create_dir(&local).await {
            Ok(()) => Ok(Metadata {
                path: path.to_string(),
                kind: EntryKind::Folder,
            }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(StorageError::Conflict(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn upload(&self, path: &str, contents: Vec<u8>) -> Result<Metadata, StorageError> {
        let (folder, name) = path
            .rsplit_once('/')
            .ok_or_else(|| StorageError::InvalidPath(path.to_string()))?;
        let local_folder = self.resolve(folder)?;
        tokio::fs::create_dir_all(&local_folder).await?;

        let mut candidate = name.to_string();
        let mut n = 0;
        loop {
            let result = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(local_folder.join(&candidate))
                .await;
            match result {
                Ok(mut file) => {
                    file.write_all(&contents).await?;
                    file.flush().await?;
                    return Ok(Metadata {
                        path: format!("{folder}/{candidate}"),
                        kind: EntryKind::File,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    n += 1;
                    candidate = with_suffix(name, n);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[derive(Deserialize)]
struct RemoteMetadata {
    #[serde(rename = ".tag")]
    tag: Option<EntryKind>,
    path_display: String,
}

#[derive(Deserialize)]
struct CreateFolderResponse {
    metadata: RemoteMetadata,
}

/// Storage service speaking the Dropbox v2 files API.
pub struct HttpFileStorage {
    client: reqwest::Client,
    api_url: Url,
    content_url: Url,
    access_token: String,
}

impl HttpFileStorage {
    pub fn new(
        api_url: Url,
        content_url: Url,
        access_token: String,
        timeout: Duration,
    ) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(HttpFileStorage {
            client,
            api_url,
            content_url,
            access_token,
        })
    }

    fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, StorageError> {
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| StorageError::InvalidPath(base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// The API argument header only accepts ASCII, so everything else is escaped
/// as JSON `\uXXXX` sequences.
fn ascii_json(value: &serde_json::Value) -> String {
    let mut escaped = String::new();
    for c in value.to_string().chars() {
        if c.is_ascii() {
            escaped.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                escaped.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    escaped
}

#[async_trait]
impl FileStorage for HttpFileStorage {
    async fn metadata(&self, path: &str) -> Result<Option<Metadata>, StorageError> {
        let url = Self::endpoint(&self.api_url, &["files", "get_metadata"])?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({ "path": path }))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let meta = response.json::<RemoteMetadata>().await?;
                Ok(Some(Metadata {
                    path: meta.path_display,
                    kind: meta.tag.unwrap_or(EntryKind::File),
                }))
            }
            // Lookup errors such as path/not_found are reported as conflicts
            StatusCode::CONFLICT => Ok(None),
            status => Err(StorageError::UnexpectedStatus {
                operation: "get_metadata",
                status,
            }),
        }
    }

    async fn create_folder(&self, path: &str) -> Result<Metadata, StorageError> {
        let url = Self::endpoint(&self.api_url, &["files", "create_folder_v2"])?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({ "path": path, "autorename": false }))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let created = response.json::<CreateFolderResponse>().await?;
                Ok(Metadata {
                    path: created.metadata.path_display,
                    kind: EntryKind::Folder,
                })
            }
            StatusCode::CONFLICT => Err(StorageError::Conflict(path.to_string())),
            status => Err(StorageError::UnexpectedStatus {
                operation: "create_folder",
                status,
            }),
        }
    }

    async fn upload(&self, path: &str, contents: Vec<u8>) -> Result<Metadata, StorageError> {
        let url = Self::endpoint(&self.content_url, &["files", "upload"])?;
        let arg = ascii_json(&serde_json::json!({
            "path": path,
            "mode": "add",
            "autorename": true,
            "mute": true,
        }));
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .header("Dropbox-API-Arg", arg)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(contents)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let meta = response.json::<RemoteMetadata>().await?;
                Ok(Metadata {
                    path: meta.path_display,
                    kind: EntryKind::File,
                })
            }
            status => Err(StorageError::UnexpectedStatus {
                operation: "upload",
                status,
            }),
        }
    }
}
