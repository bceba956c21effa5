//! Object storage backends for lab reports
//!
//! Keys are `/`-separated relative paths. A `put` to an existing key
//! overwrites it, which is what makes report publishing idempotent.

use crate::error::ArchiveError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `body` under `key`, returning the object's location
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<String, ArchiveError>;

    /// Keys starting with `prefix`, in no particular order
    async fn list(&self, prefix: &str) -> Result<Vec<String>, ArchiveError>;
}

fn check_key(key: &str) -> Result<(), ArchiveError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(ArchiveError::Storage(format!("invalid object key: {:?}", key)));
    }
    Ok(())
}

/// Stores objects as files under a root directory
#[derive(Clone, Debug)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        key.split('/').fold(self.root.clone(), |path, part| path.join(part))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>, _content_type: &str) -> Result<String, ArchiveError> {
        check_key(key)?;
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write then rename so readers never see a half-written report
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &body).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(key = %key, bytes = body.len(), "Stored object on disk");
        Ok(format!("file://{}", path.display()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ArchiveError> {
        let mut keys = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];

        while let Some((dir, rel)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = if rel.is_empty() {
                    name
                } else {
                    format!("{}/{}", rel, name)
                };

                if entry.file_type().await?.is_dir() {
                    pending.push((entry.path(), key));
                } else if key.starts_with(prefix) && !key.contains(".tmp-") {
                    keys.push(key);
                }
            }
        }

        Ok(keys)
    }
}

/// Stores objects over HTTP: `PUT {base}/{key}` and `GET {base}?prefix=`
///
/// The listing endpoint must answer with a JSON array of keys.
#[derive(Clone, Debug)]
pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, ArchiveError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<String, ArchiveError> {
        check_key(key)?;
        let url = format!("{}/{}", self.base_url, key);

        let response = self
            .authorize(self.client.put(&url))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ArchiveError::Storage(format!(
                "PUT {} returned {}",
                url,
                response.status()
            )));
        }

        debug!(url = %url, "Uploaded object");
        Ok(url)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ArchiveError> {
        let response = self
            .authorize(self.client.get(&self.base_url))
            .query(&[("prefix", prefix)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ArchiveError::Storage(format!(
                "listing {} returned {}",
                prefix,
                response.status()
            )));
        }

        Ok(response.json::<Vec<String>>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_key() {
        assert!(check_key("reports/alice/s1/report-v1.json").is_ok());
        assert!(check_key("").is_err());
        assert!(check_key("/etc/passwd").is_err());
        assert!(check_key("reports/../secret").is_err());
        assert!(check_key("reports//x").is_err());
    }

    #[tokio::test]
    async fn test_fs_store_put_overwrites_and_lists() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        let location = store
            .put("reports/alice/s1/report-v1.json", b"{}".to_vec(), "application/json")
            .await
            .unwrap();
        assert!(location.starts_with("file://"));

        store
            .put("reports/alice/s1/report-v1.json", b"{\"v\":2}".to_vec(), "application/json")
            .await
            .unwrap();
        store
            .put("reports/bob/s2/report-v1.json", b"{}".to_vec(), "application/json")
            .await
            .unwrap();

        let on_disk = std::fs::read_to_string(dir.path().join("reports/alice/s1/report-v1.json")).unwrap();
        assert_eq!(on_disk, "{\"v\":2}");

        let mut keys = store.list("reports/alice/").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["reports/alice/s1/report-v1.json"]);
        assert_eq!(store.list("reports/").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fs_store_list_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().join("nothing-here"));
        assert!(store.list("reports/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fs_store_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let err = store
            .put("../escape.json", Vec::new(), "application/json")
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Storage(_)));
    }
}
