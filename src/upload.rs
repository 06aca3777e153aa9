use crate::blob::{BlobError, BlobStore};
use crate::config::MAX_UPLOAD_IMAGES;
use crate::cookies::CookieJar;
use crate::http::{self, ACCEPT_JSON};
use crate::models::UploadedImage;
use crate::platform::{ImageMode, PlatformAdapter};
use base64::{Engine, engine::general_purpose::STANDARD};
use reqwest::{
    Client,
    header::{ACCEPT, ORIGIN, REFERER},
};
use serde_json::{Value, json};
use std::sync::Arc;
use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("no images uploaded ({attempted} attempted)")]
    NoImagesUploaded { attempted: usize },
}

/// Why a single image was skipped. Never fails the batch on its own.
#[derive(Debug, Error)]
enum ImageFailure {
    #[error("object missing or empty in blob store")]
    Missing,
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error("upload request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("uploader answered HTTP {0}")]
    Status(u16),
    #[error("uploader reply has no `file` field")]
    NoFileId,
}

/// Moves source photos from the blob store onto a platform.
#[derive(Clone)]
pub struct ImageUploader {
    http: Client,
    blobs: Arc<dyn BlobStore>,
    concurrency: usize,
}

impl ImageUploader {
    pub fn new(http: Client, blobs: Arc<dyn BlobStore>, concurrency: usize) -> Self {
        Self {
            http,
            blobs,
            concurrency: concurrency.max(1),
        }
    }

    /// Upload at most [`MAX_UPLOAD_IMAGES`] references. Failed images are logged
    /// and skipped; the survivors keep their input order.
    pub async fn upload(
        &self,
        adapter: &Arc<dyn PlatformAdapter>,
        references: &[String],
        jar: &CookieJar,
        token: &str,
    ) -> Result<Vec<UploadedImage>, UploadError> {
        let batch: Vec<String> = references.iter().take(MAX_UPLOAD_IMAGES).cloned().collect();
        let attempted = batch.len();
        let platform = adapter.id();
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for (index, reference) in batch.into_iter().enumerate() {
            let uploader = self.clone();
            let adapter = Arc::clone(adapter);
            let jar = jar.clone();
            let token = token.to_string();
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let result = uploader
                    .upload_one(adapter.as_ref(), &reference, &jar, &token)
                    .await;
                (index, reference, result)
            });
        }

        let mut uploaded = Vec::with_capacity(attempted);
        while let Some(joined) = tasks.join_next().await {
            let (index, reference, result) = match joined {
                Ok(done) => done,
                Err(err) => {
                    warn!(target = "publisher.upload", %platform, error = %err, "upload task aborted");
                    continue;
                }
            };
            match result {
                Ok(url) => uploaded.push(UploadedImage {
                    source_reference: reference,
                    platform_url_or_id: url,
                    upload_order: index,
                }),
                Err(failure) => warn!(
                    target = "publisher.upload",
                    %platform,
                    reference = %reference,
                    error = %failure,
                    "image skipped"
                ),
            }
        }
        uploaded.sort_by_key(|image| image.upload_order);

        info!(
            target = "publisher.upload",
            %platform,
            attempted,
            uploaded = uploaded.len(),
            "image batch finished"
        );
        if uploaded.is_empty() {
            return Err(UploadError::NoImagesUploaded { attempted });
        }
        Ok(uploaded)
    }

    async fn upload_one(
        &self,
        adapter: &dyn PlatformAdapter,
        reference: &str,
        jar: &CookieJar,
        token: &str,
    ) -> Result<String, ImageFailure> {
        let bytes = self
            .blobs
            .get(reference)
            .await?
            .filter(|bytes| !bytes.is_empty())
            .ok_or(ImageFailure::Missing)?;
        let data_url = data_url(&bytes);

        let endpoint = match adapter.image_mode() {
            ImageMode::Inline => return Ok(data_url),
            ImageMode::Upload { endpoint } => adapter.absolute_url(&endpoint),
        };

        let response = http::with_cookies(self.http.post(endpoint), jar)
            .header(ACCEPT, ACCEPT_JSON)
            .header(ORIGIN, adapter.base_url())
            .header(REFERER, adapter.absolute_url(adapter.new_listing_path()))
            .header("X-CSRF-TOKEN", token)
            .header("X-XSRF-TOKEN", token)
            .header("X-Requested-With", "XMLHttpRequest")
            .json(&json!({ "image": data_url, "name": "" }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ImageFailure::Status(response.status().as_u16()));
        }
        let reply: Value = response.json().await?;
        let file = reply
            .get("file")
            .and_then(Value::as_str)
            .filter(|file| !file.is_empty())
            .ok_or(ImageFailure::NoFileId)?;
        Ok(adapter.uploaded_image_url(file))
    }
}

pub fn data_url(bytes: &[u8]) -> String {
    format!("data:{};base64,{}", sniff_mime(bytes), STANDARD.encode(bytes))
}

fn sniff_mime(bytes: &[u8]) -> &'static str {
    match bytes {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        _ => "image/jpeg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::config::{HttpSettings, NetgunSettings, OtobronSettings};
    use crate::platform::{NetgunAdapter, OtobronAdapter};
    use httpmock::prelude::*;

    fn photo(n: usize) -> Vec<u8> {
        let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0];
        bytes.extend(format!("photo-number-{n}").into_bytes());
        bytes
    }

    fn netgun(base_url: String) -> Arc<dyn PlatformAdapter> {
        Arc::new(NetgunAdapter::new(NetgunSettings {
            base_url,
            image_base_url: "https://netgun.pl".into(),
            ..NetgunSettings::default()
        }))
    }

    fn uploader(blobs: MemoryBlobStore, concurrency: usize) -> ImageUploader {
        ImageUploader::new(
            http::build_client(&HttpSettings::default()).unwrap(),
            Arc::new(blobs),
            concurrency,
        )
    }

    #[tokio::test]
    async fn failed_items_are_skipped_and_order_is_kept() {
        let server = MockServer::start_async().await;
        let blobs = MemoryBlobStore::new();
        let references: Vec<String> = (1..=6).map(|n| format!("weapons/7/{n}.jpg")).collect();
        for n in [1, 3, 4, 5, 6] {
            blobs.insert(format!("weapons/7/{n}.jpg"), photo(n)).await;
        }
        for n in [1, 3, 4, 6] {
            let encoded = STANDARD.encode(photo(n));
            server
                .mock_async(|when, then| {
                    when.method(POST)
                        .path("/api/image-uploader")
                        .header("X-CSRF-TOKEN", "tok")
                        .header("X-XSRF-TOKEN", "tok")
                        .header("X-Requested-With", "XMLHttpRequest")
                        .header("Cookie", "netgun_session=abc")
                        .body_contains(encoded.as_str());
                    then.status(200)
                        .json_body(json!({ "success": true, "file": format!("f{n}.jpg") }));
                })
                .await;
        }
        let encoded = STANDARD.encode(photo(5));
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/image-uploader")
                    .body_contains(encoded.as_str());
                then.status(200).json_body(json!({ "success": false }));
            })
            .await;

        let mut jar = CookieJar::for_base_url(&server.base_url());
        jar.set("netgun_session", "abc");
        let images = uploader(blobs, 3)
            .upload(&netgun(server.base_url()), &references, &jar, "tok")
            .await
            .unwrap();

        let urls: Vec<&str> = images.iter().map(|i| i.platform_url_or_id.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://netgun.pl/uploader/f1.jpg",
                "https://netgun.pl/uploader/f3.jpg",
                "https://netgun.pl/uploader/f4.jpg",
                "https://netgun.pl/uploader/f6.jpg",
            ]
        );
        assert_eq!(images.len(), references.len() - 2);
        assert_eq!(images[1].source_reference, "weapons/7/3.jpg");
    }

    #[tokio::test]
    async fn all_failures_surface_as_upload_error() {
        let server = MockServer::start_async().await;
        let blobs = MemoryBlobStore::new();
        blobs.insert("a.jpg", photo(1)).await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/image-uploader");
                then.status(500).body("Server Error");
            })
            .await;

        let jar = CookieJar::for_base_url(&server.base_url());
        let err = uploader(blobs, 1)
            .upload(
                &netgun(server.base_url()),
                &["a.jpg".to_string(), "missing.jpg".to_string()],
                &jar,
                "tok",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::NoImagesUploaded { attempted: 2 }));
    }

    #[tokio::test]
    async fn inline_mode_caps_the_batch_without_network() {
        let blobs = MemoryBlobStore::new();
        let references: Vec<String> = (0..12).map(|n| format!("{n}.png")).collect();
        for reference in &references {
            blobs.insert(reference.clone(), b"\x89PNG\r\n\x1a\n....".to_vec()).await;
        }
        let adapter: Arc<dyn PlatformAdapter> = Arc::new(OtobronAdapter::new(OtobronSettings {
            base_url: "http://127.0.0.1:9".into(),
            ..OtobronSettings::default()
        }));
        let jar = CookieJar::new("127.0.0.1");

        let images = uploader(blobs, 4)
            .upload(&adapter, &references, &jar, "nonce")
            .await
            .unwrap();
        assert_eq!(images.len(), MAX_UPLOAD_IMAGES);
        assert!(images.iter().all(|i| i.platform_url_or_id.starts_with("data:image/png;base64,")));
        let order: Vec<usize> = images.iter().map(|i| i.upload_order).collect();
        assert_eq!(order, (0..MAX_UPLOAD_IMAGES).collect::<Vec<_>>());
    }

    #[test]
    fn mime_is_sniffed_from_magic_bytes() {
        assert_eq!(sniff_mime(&photo(1)), "image/jpeg");
        assert_eq!(sniff_mime(b"GIF89a..."), "image/gif");
        assert_eq!(sniff_mime(b"RIFF\x00\x00\x00\x00WEBPVP8 "), "image/webp");
        assert_eq!(sniff_mime(b"unknown"), "image/jpeg");
        assert_eq!(data_url(b"GIF8"), "data:image/gif;base64,R0lGOA==");
    }
}
