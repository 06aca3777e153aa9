//! Write-once capture of raw upstream responses.
//!
//! Every file starts with two HTML comment lines (status code, percent-encoded
//! subject id) followed by the body exactly as received, so the capture opens
//! in a browser and [`AuditLog::load`] can recover the original bytes.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::{
    io::ErrorKind,
    path::PathBuf,
};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};
use tracing::info;
use uuid::Uuid;

pub const RETRIEVAL_PREFIX: &str = "responses";

static FILE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_\-][A-Za-z0-9_.\-]*\.html$").expect("static pattern"));
static TIMESTAMP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_(\d{4}-\d{2}-\d{2}_\d{2}-\d{2}-\d{2})_[0-9a-f]{8}\.html$").expect("static pattern"));

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("cannot prepare audit directory {path}: {source}")]
    Directory {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot write audit record {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("audit record not found")]
    NotFound,
    #[error("invalid audit record name")]
    InvalidName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    Response,
    PromotionPage,
    Confirmation,
}

impl CaptureKind {
    fn as_str(&self) -> &'static str {
        match self {
            CaptureKind::Response => "response",
            CaptureKind::PromotionPage => "promotion_page",
            CaptureKind::Confirmation => "confirmation",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: Option<DateTime<Utc>>,
    pub subject_id: String,
    pub status_code: u16,
    pub raw_body: String,
    pub retrieval_path: String,
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    dir: PathBuf,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Persist `body` and return its retrieval path (`responses/<file>`).
    pub async fn capture(
        &self,
        platform: &str,
        kind: CaptureKind,
        subject_id: &str,
        status_code: u16,
        body: impl AsRef<[u8]>,
    ) -> Result<String, AuditError> {
        let body = body.as_ref();
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| AuditError::Directory {
                path: self.dir.display().to_string(),
                source,
            })?;

        let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let suffix = &Uuid::new_v4().simple().to_string()[..8];
        let file_name = format!(
            "{}_{}_{}_{}_{}.html",
            sanitize(platform),
            kind.as_str(),
            sanitize(subject_id),
            timestamp,
            suffix
        );
        let path = self.dir.join(&file_name);

        let mut contents = Vec::with_capacity(body.len() + 64);
        contents.extend_from_slice(format!("<!-- Status Code: {status_code} -->\n").as_bytes());
        contents.extend_from_slice(
            format!("<!-- Subject ID: {} -->\n", urlencoding::encode(subject_id)).as_bytes(),
        );
        contents.extend_from_slice(body);

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|source| AuditError::Write {
                path: path.display().to_string(),
                source,
            })?;
        file.write_all(&contents)
            .await
            .map_err(|source| AuditError::Write {
                path: path.display().to_string(),
                source,
            })?;
        file.flush().await.map_err(|source| AuditError::Write {
            path: path.display().to_string(),
            source,
        })?;

        info!(
            target = "publisher.audit",
            platform,
            subject_id,
            status_code,
            file = %file_name,
            "response captured"
        );
        Ok(format!("{RETRIEVAL_PREFIX}/{file_name}"))
    }

    /// Raw file contents for the HTTP endpoint, header comments included.
    pub async fn read_file(&self, file_name: &str) -> Result<Vec<u8>, AuditError> {
        if !is_allowed_name(file_name) {
            return Err(AuditError::InvalidName);
        }
        let path = self.dir.join(file_name);
        fs::read(&path).await.map_err(|source| match source.kind() {
            ErrorKind::NotFound => AuditError::NotFound,
            _ => AuditError::Write {
                path: path.display().to_string(),
                source,
            },
        })
    }

    /// Load a record by retrieval path or bare file name.
    pub async fn load(&self, reference: &str) -> Result<AuditRecord, AuditError> {
        let file_name = reference
            .strip_prefix(RETRIEVAL_PREFIX)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(reference);
        let bytes = self.read_file(file_name).await?;

        let mut rest: &[u8] = &bytes;
        let mut status_code = 0;
        let mut subject_id = String::new();
        if let Some((line, tail)) = split_line(rest)
            && let Some(value) = header_value(line, "Status Code")
        {
            status_code = value.parse().unwrap_or_default();
            rest = tail;
        }
        if let Some((line, tail)) = split_line(rest)
            && let Some(value) = header_value(line, "Subject ID")
        {
            subject_id = urlencoding::decode(value)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| value.to_string());
            rest = tail;
        }

        Ok(AuditRecord {
            timestamp: timestamp_from_name(file_name),
            subject_id,
            status_code,
            raw_body: String::from_utf8_lossy(rest).into_owned(),
            retrieval_path: format!("{RETRIEVAL_PREFIX}/{file_name}"),
        })
    }
}

/// File names the retrieval endpoint will serve: a flat `.html` name, no traversal.
pub fn is_allowed_name(file_name: &str) -> bool {
    FILE_NAME.is_match(file_name) && !file_name.contains("..")
}

fn split_line(bytes: &[u8]) -> Option<(&str, &[u8])> {
    let end = bytes.iter().position(|b| *b == b'\n')?;
    let line = std::str::from_utf8(&bytes[..end]).ok()?;
    Some((line, &bytes[end + 1..]))
}

fn header_value<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    line.trim()
        .strip_prefix("<!--")?
        .strip_suffix("-->")?
        .trim()
        .strip_prefix(label)?
        .strip_prefix(':')
        .map(str::trim)
}

fn timestamp_from_name(file_name: &str) -> Option<DateTime<Utc>> {
    let raw = TIMESTAMP.captures(file_name)?.get(1)?.as_str();
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d_%H-%M-%S").ok()?;
    Local
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

fn sanitize(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .take(48)
        .collect();
    if cleaned.is_empty() {
        "unknown".into()
    } else {
        cleaned
    }
}
