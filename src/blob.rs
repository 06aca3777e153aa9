use crate::config::BlobSettings;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("request failed: {0}")]
    Request(String),
}

/// Read-only view of the object storage holding source photos.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// `Ok(None)` when the object does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError>;

    fn url(&self, key: &str) -> String;
}

/// Supabase Storage bucket accessed with the service role key.
#[derive(Debug, Clone)]
pub struct SupabaseStorage {
    base_url: String,
    service_key: String,
    bucket: String,
    http: Client,
}

impl SupabaseStorage {
    pub fn new(settings: &BlobSettings, http: Client) -> Self {
        Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            service_key: settings.service_key.clone(),
            bucket: settings.bucket.clone(),
            http,
        }
    }

    fn object_path(&self, key: &str) -> String {
        let encoded = key
            .trim_start_matches('/')
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        format!("{}/{}", self.bucket, encoded)
    }
}

#[async_trait]
impl BlobStore for SupabaseStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError> {
        let url = format!(
            "{}/storage/v1/object/{}",
            self.base_url,
            self.object_path(key)
        );
        let response = self
            .http
            .get(url)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .send()
            .await
            .map_err(|err| BlobError::Request(err.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND || response.status() == StatusCode::BAD_REQUEST
        {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(BlobError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| BlobError::Request(err.to_string()))?;
        Ok(Some(bytes.to_vec()))
    }

    fn url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}",
            self.base_url,
            self.object_path(key)
        )
    }
}

/// In-memory store, used when no storage is configured and by tests.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, key: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.objects.write().await.insert(key.into(), bytes.into());
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    fn url(&self, key: &str) -> String {
        format!("memory://{key}")
    }
}
