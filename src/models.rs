use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PlatformId {
    Netgun,
    Otobron,
}

impl PlatformId {
    pub const ALL: [PlatformId; 2] = [PlatformId::Netgun, PlatformId::Otobron];

    pub fn slug(&self) -> &'static str {
        match self {
            PlatformId::Netgun => "netgun",
            PlatformId::Otobron => "otobron",
        }
    }

    pub fn from_slug(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "netgun" | "netgun.pl" => Some(PlatformId::Netgun),
            "otobron" | "otobron.pl" => Some(PlatformId::Otobron),
            _ => None,
        }
    }

    pub fn cookies_key(&self) -> String {
        format!("{}_session_cookies", self.slug())
    }

    pub fn token_key(&self) -> String {
        format!("{}_xsrf_token", self.slug())
    }
}

impl std::fmt::Display for PlatformId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.slug())
    }
}

/// A single listing to publish. Built per call and never mutated during an attempt.
#[derive(Debug, Clone, Deserialize)]
pub struct ListingRequest {
    pub platform: PlatformId,
    pub subject_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub price: i64,
    #[serde(default)]
    pub image_references: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Request body of the listing endpoints; the platform comes from the path.
#[derive(Debug, Clone, Deserialize)]
pub struct ListingPayload {
    pub subject_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub price: i64,
    #[serde(default)]
    pub image_references: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl ListingPayload {
    pub fn into_request(self, platform: PlatformId) -> ListingRequest {
        ListingRequest {
            platform,
            subject_id: self.subject_id,
            title: self.title,
            description: self.description,
            price: self.price,
            image_references: self.image_references,
            attributes: self.attributes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadedImage {
    pub source_reference: String,
    pub platform_url_or_id: String,
    pub upload_order: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    Published {
        listing_url: Option<String>,
        audit_ref: String,
    },
    Rejected {
        reason: String,
        audit_ref: Option<String>,
    },
    SessionExpired,
    TransportError {
        detail: String,
    },
}

impl SubmissionOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, SubmissionOutcome::Published { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            SubmissionOutcome::Published { .. } => "published",
            SubmissionOutcome::Rejected { .. } => "rejected",
            SubmissionOutcome::SessionExpired => "session_expired",
            SubmissionOutcome::TransportError { .. } => "transport_error",
        }
    }
}

/// Caller-facing result of a submission attempt.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ListingResponse {
    pub success: bool,
    pub platform: PlatformId,
    pub subject_id: String,
    pub outcome: SubmissionOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listing_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoginResponse {
    pub success: bool,
    pub platform: PlatformId,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookie_count: Option<usize>,
    /// Failure class (`auth`, `transport`) when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_slugs_round_trip() {
        for platform in PlatformId::ALL {
            assert_eq!(PlatformId::from_slug(platform.slug()), Some(platform));
        }
        assert_eq!(PlatformId::from_slug(" Netgun.pl "), Some(PlatformId::Netgun));
        assert_eq!(PlatformId::from_slug("allegro"), None);
    }

    #[test]
    fn cache_keys_follow_platform_slug() {
        assert_eq!(PlatformId::Netgun.cookies_key(), "netgun_session_cookies");
        assert_eq!(PlatformId::Otobron.token_key(), "otobron_xsrf_token");
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let outcome = SubmissionOutcome::Rejected {
            reason: "no publish confirmation".into(),
            audit_ref: Some("responses/x.html".into()),
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["status"], "rejected");
        assert_eq!(value["audit_ref"], "responses/x.html");
    }
}
