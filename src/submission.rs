//! Listing submission state machine.
//!
//! `TokenRefresh → Submitting → (AwaitingPromotionConfirm | Done)`, ending in
//! one [`SubmissionOutcome`]. Every upstream answer to the listing form is
//! captured before it is interpreted. Nothing here writes to the session cache.

use crate::audit::{AuditError, AuditLog, CaptureKind};
use crate::blob::BlobStore;
use crate::config::Settings;
use crate::cookies::CookieJar;
use crate::http::{self, PageResponse};
use crate::models::{
    ListingRequest, ListingResponse, LoginResponse, PlatformId, StageReport, SubmissionOutcome,
    UploadedImage,
};
use crate::platform::{Adapters, EncodedBody, PlatformAdapter, Promotion};
use crate::session::{LoginError, SessionManager};
use crate::store::{SessionStore, StoreError};
use crate::upload::{ImageUploader, UploadError};
use reqwest::{
    Client, StatusCode,
    header::{CACHE_CONTROL, ORIGIN, REFERER},
    multipart::Form,
};
use serde_json::{Value, json};
use std::{future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{info, warn};

const NO_IMAGES: &str = "no images uploaded";
const NO_CONFIRMATION: &str = "no publish confirmation";

/// Caller-visible failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Auth,
    SessionExpired,
    Upload,
    SubmissionRejected,
    Transport,
    AuditWrite,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::SessionExpired => "session_expired",
            ErrorKind::Upload => "upload",
            ErrorKind::SubmissionRejected => "submission_rejected",
            ErrorKind::Transport => "transport",
            ErrorKind::AuditWrite => "audit_write",
        }
    }
}

impl From<&LoginError> for ErrorKind {
    fn from(err: &LoginError) -> Self {
        match err {
            LoginError::Transport(_) | LoginError::Store(_) => ErrorKind::Transport,
            _ => ErrorKind::Auth,
        }
    }
}

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("session expired")]
    SessionExpired,
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("audit write failed: {0}")]
    Audit(#[from] AuditError),
    #[error("promotion confirmation failed: {0}")]
    Confirmation(String),
}

impl SubmissionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SubmissionError::SessionExpired => ErrorKind::SessionExpired,
            SubmissionError::Upload(_) => ErrorKind::Upload,
            SubmissionError::Transport(_) | SubmissionError::Confirmation(_) => {
                ErrorKind::Transport
            }
            SubmissionError::Audit(_) => ErrorKind::AuditWrite,
        }
    }

    fn into_outcome(self) -> SubmissionOutcome {
        match self {
            SubmissionError::SessionExpired => SubmissionOutcome::SessionExpired,
            SubmissionError::Upload(_) => SubmissionOutcome::Rejected {
                reason: NO_IMAGES.into(),
                audit_ref: None,
            },
            other => SubmissionOutcome::TransportError {
                detail: other.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for SubmissionError {
    fn from(err: reqwest::Error) -> Self {
        SubmissionError::Transport(err.to_string())
    }
}

impl From<StoreError> for SubmissionError {
    fn from(err: StoreError) -> Self {
        SubmissionError::Transport(err.to_string())
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

struct Submitted {
    page: PageResponse,
    audit_ref: String,
}

/// How the platform answered the listing form.
#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Promotion(Promotion),
    Expired,
    Published(Option<String>),
    Rejected,
}

#[derive(Clone)]
pub struct Publisher {
    http: Client,
    adapters: Adapters,
    sessions: SessionManager,
    uploader: ImageUploader,
    audit: AuditLog,
    public_base_url: Option<String>,
}

impl Publisher {
    pub fn new(
        settings: &Settings,
        http: Client,
        store: Arc<dyn SessionStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            adapters: Adapters::from_settings(settings),
            sessions: SessionManager::new(http.clone(), store, settings.session_ttl),
            uploader: ImageUploader::new(http.clone(), blobs, settings.upload_concurrency),
            audit: AuditLog::new(settings.audit_dir.clone()),
            public_base_url: settings.public_base_url.clone(),
            http,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub async fn login(&self, platform: PlatformId) -> LoginResponse {
        let Some(adapter) = self.adapters.get(platform) else {
            return LoginResponse {
                success: false,
                platform,
                message: format!("{platform} is not supported"),
                cookie_count: None,
                error: Some(ErrorKind::Auth.as_str().into()),
            };
        };
        match self.sessions.login(adapter.as_ref()).await {
            Ok(summary) => LoginResponse {
                success: true,
                platform,
                message: format!("logged in to {platform}"),
                cookie_count: Some(summary.cookie_count),
                error: None,
            },
            Err(err) => {
                let kind = ErrorKind::from(&err);
                crate::metrics::failure("login", kind.as_str());
                LoginResponse {
                    success: false,
                    platform,
                    message: err.to_string(),
                    cookie_count: None,
                    error: Some(kind.as_str().into()),
                }
            }
        }
    }

    /// Publish one listing. Never fails: every fault becomes an outcome.
    pub async fn submit(&self, request: ListingRequest) -> ListingResponse {
        let started = Instant::now();
        let mut stages = Vec::new();
        let outcome = match self.run(&request, &mut stages).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(
                    target = "publisher.submission",
                    platform = %request.platform,
                    subject_id = %request.subject_id,
                    kind = err.kind().as_str(),
                    error = %err,
                    "submission stopped"
                );
                crate::metrics::failure("submission", err.kind().as_str());
                err.into_outcome()
            }
        };
        crate::metrics::outcome(request.platform.slug(), outcome.label());
        info!(
            target = "publisher.submission",
            platform = %request.platform,
            subject_id = %request.subject_id,
            outcome = outcome.label(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "submission finished"
        );
        self.respond(request, outcome, stages)
    }

    async fn run(
        &self,
        request: &ListingRequest,
        stages: &mut Vec<StageReport>,
    ) -> Result<SubmissionOutcome, SubmissionError> {
        let adapter = self
            .adapters
            .get(request.platform)
            .ok_or_else(|| SubmissionError::Transport(format!("{} is not supported", request.platform)))?;
        let session = self
            .sessions
            .current_session(adapter.as_ref())
            .await?
            .ok_or(SubmissionError::SessionExpired)?;
        let mut jar = session.cookie_jar;

        let token = self
            .capture_stage(
                "token_refresh",
                stages,
                refresh_token(&self.http, adapter.as_ref(), &mut jar),
            )
            .await?;

        let images = self
            .capture_stage(
                "upload_images",
                stages,
                self.upload_images(&adapter, request, &jar, &token),
            )
            .await?;

        let Submitted { page, audit_ref } = self
            .capture_stage(
                "submit_listing",
                stages,
                self.post_listing(adapter.as_ref(), request, &images, &mut jar, &token),
            )
            .await?;

        Ok(match classify(adapter.as_ref(), &page) {
            Verdict::Promotion(promotion) => {
                let confirmed = self
                    .capture_stage(
                        "confirm_promotion",
                        stages,
                        self.confirm_promotion(adapter.as_ref(), request, &promotion, &mut jar),
                    )
                    .await;
                if let Err(err) = confirmed {
                    // Best effort: the listing exists once the promotion redirect is issued.
                    warn!(
                        target = "publisher.submission",
                        platform = %request.platform,
                        subject_id = %request.subject_id,
                        number = %promotion.number,
                        error = %err,
                        "promotion confirmation failed"
                    );
                }
                SubmissionOutcome::Published {
                    listing_url: Some(adapter.listing_url_for(&promotion)),
                    audit_ref,
                }
            }
            Verdict::Expired => SubmissionOutcome::SessionExpired,
            Verdict::Published(listing_url) => SubmissionOutcome::Published {
                listing_url,
                audit_ref,
            },
            Verdict::Rejected => {
                crate::metrics::failure("submission", ErrorKind::SubmissionRejected.as_str());
                SubmissionOutcome::Rejected {
                    reason: NO_CONFIRMATION.into(),
                    audit_ref: Some(audit_ref),
                }
            }
        })
    }

    async fn upload_images(
        &self,
        adapter: &Arc<dyn PlatformAdapter>,
        request: &ListingRequest,
        jar: &CookieJar,
        token: &str,
    ) -> Result<StageOutcome<Vec<UploadedImage>>, SubmissionError> {
        let images = self
            .uploader
            .upload(adapter, &request.image_references, jar, token)
            .await?;
        let urls: Vec<&str> = images
            .iter()
            .map(|image| image.platform_url_or_id.as_str())
            .filter(|url| !url.starts_with("data:"))
            .collect();
        let output = json!({
            "requested": request.image_references.len(),
            "uploaded": images.len(),
            "references": images.iter().map(|i| i.source_reference.as_str()).collect::<Vec<_>>(),
            "urls": urls,
        });
        Ok(StageOutcome::new(images, output))
    }

    async fn post_listing(
        &self,
        adapter: &dyn PlatformAdapter,
        request: &ListingRequest,
        images: &[UploadedImage],
        jar: &mut CookieJar,
        token: &str,
    ) -> Result<StageOutcome<Submitted>, SubmissionError> {
        let url = adapter.absolute_url(adapter.submit_path());
        let builder = http::with_cookies(self.http.post(&url), jar)
            .header(ORIGIN, adapter.base_url())
            .header(REFERER, adapter.absolute_url(adapter.new_listing_path()))
            .header(CACHE_CONTROL, "max-age=0");
        let body = adapter.build_form_payload(request, images, token);
        let field_count = body.fields().len();
        let builder = match body {
            EncodedBody::Form(fields) => builder.form(&fields),
            EncodedBody::Multipart(fields) => {
                let form = fields
                    .into_iter()
                    .fold(Form::new().percent_encode_noop(), |form, (name, value)| {
                        form.text(name, value)
                    });
                builder.multipart(form)
            }
        };

        let response = builder.send().await?;
        let page = http::read_page(response, jar).await?;
        let audit_ref = self
            .audit
            .capture(
                adapter.id().slug(),
                CaptureKind::Response,
                &request.subject_id,
                page.status.as_u16(),
                &page.raw,
            )
            .await?;

        let output = json!({
            "status": page.status.as_u16(),
            "location": page.location,
            "fields": field_count,
            "audit_ref": audit_ref,
        });
        Ok(StageOutcome::new(Submitted { page, audit_ref }, output))
    }

    async fn confirm_promotion(
        &self,
        adapter: &dyn PlatformAdapter,
        request: &ListingRequest,
        promotion: &Promotion,
        jar: &mut CookieJar,
    ) -> Result<StageOutcome<()>, SubmissionError> {
        let confirm_path = adapter.promotion_confirm_path().ok_or_else(|| {
            SubmissionError::Confirmation("platform has no confirmation endpoint".into())
        })?;
        let platform = adapter.id().slug();

        let response = http::with_cookies(self.http.get(&promotion.location), jar)
            .header(REFERER, adapter.absolute_url(adapter.new_listing_path()))
            .send()
            .await?;
        let page = http::read_page(response, jar).await?;
        self.audit
            .capture(
                platform,
                CaptureKind::PromotionPage,
                &request.subject_id,
                page.status.as_u16(),
                &page.raw,
            )
            .await?;
        let token = adapter
            .listing_token()
            .extract(&page.body, None)
            .ok_or_else(|| SubmissionError::Confirmation("no token on promotion page".into()))?;

        let response = http::with_cookies(self.http.post(adapter.absolute_url(confirm_path)), jar)
            .header(ORIGIN, adapter.base_url())
            .header(REFERER, &promotion.location)
            .header(CACHE_CONTROL, "max-age=0")
            .form(&adapter.promotion_form(promotion, &token))
            .send()
            .await?;
        let confirmation = http::read_page(response, jar).await?;
        let audit_ref = self
            .audit
            .capture(
                platform,
                CaptureKind::Confirmation,
                &request.subject_id,
                confirmation.status.as_u16(),
                &confirmation.raw,
            )
            .await?;
        if confirmation.status.is_client_error() || confirmation.status.is_server_error() {
            return Err(SubmissionError::Confirmation(format!(
                "HTTP {} ({audit_ref})",
                confirmation.status.as_u16()
            )));
        }

        Ok(StageOutcome::new(
            (),
            json!({
                "number": promotion.number,
                "status": confirmation.status.as_u16(),
                "audit_ref": audit_ref,
            }),
        ))
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, SubmissionError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, SubmissionError>>,
    {
        let started = Instant::now();
        let result = fut.await;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        match result {
            Ok(outcome) => {
                stages.push(StageReport::new(name, elapsed_ms, outcome.output));
                Ok(outcome.value)
            }
            Err(err) => {
                stages.push(StageReport::new(
                    name,
                    elapsed_ms,
                    json!({ "error": err.to_string(), "kind": err.kind().as_str() }),
                ));
                Err(err)
            }
        }
    }

    fn respond(
        &self,
        request: ListingRequest,
        outcome: SubmissionOutcome,
        stages: Vec<StageReport>,
    ) -> ListingResponse {
        let (listing_url, audit_ref, message) = match &outcome {
            SubmissionOutcome::Published {
                listing_url,
                audit_ref,
            } => (listing_url.clone(), Some(audit_ref.clone()), None),
            SubmissionOutcome::Rejected { reason, audit_ref } => {
                (None, audit_ref.clone(), Some(reason.clone()))
            }
            SubmissionOutcome::SessionExpired => (
                None,
                None,
                Some("session expired; log in again".to_string()),
            ),
            SubmissionOutcome::TransportError { detail } => (None, None, Some(detail.clone())),
        };
        let audit_url = audit_ref.as_deref().map(|reference| self.audit_url(reference));
        ListingResponse {
            success: outcome.is_published(),
            platform: request.platform,
            subject_id: request.subject_id,
            outcome,
            listing_url,
            audit_ref,
            audit_url,
            message,
            stages,
        }
    }

    fn audit_url(&self, reference: &str) -> String {
        match &self.public_base_url {
            Some(base) => format!("{base}/{reference}"),
            None => format!("/{reference}"),
        }
    }
}

async fn refresh_token(
    http: &Client,
    adapter: &dyn PlatformAdapter,
    jar: &mut CookieJar,
) -> Result<StageOutcome<String>, SubmissionError> {
    let url = adapter.absolute_url(adapter.new_listing_path());
    let response = http::with_cookies(http.get(&url), jar)
        .header(REFERER, format!("{}/", adapter.base_url()))
        .send()
        .await?;
    let page = http::read_page(response, jar).await?;
    if page.is_redirect() {
        warn!(
            target = "publisher.submission",
            platform = %adapter.id(),
            location = page.location.as_deref().unwrap_or_default(),
            "new listing page redirected"
        );
        return Err(SubmissionError::SessionExpired);
    }
    let token = adapter
        .listing_token()
        .extract(&page.body, Some(jar))
        .ok_or(SubmissionError::SessionExpired)?;
    let output = json!({
        "status": page.status.as_u16(),
        "token": crate::session::preview(&token),
    });
    Ok(StageOutcome::new(token, output))
}

/// Interpret the listing form response, strongest signal first.
fn classify(adapter: &dyn PlatformAdapter, page: &PageResponse) -> Verdict {
    if page.is_redirect()
        && let Some(location) = page.location.as_deref()
    {
        if let Some(promotion) = adapter.parse_promotion(location) {
            return Verdict::Promotion(promotion);
        }
        if adapter.is_login_redirect(location) {
            return Verdict::Expired;
        }
        let target = adapter.absolute_url(location);
        if adapter.is_listing_url(&target) {
            return Verdict::Published(Some(target));
        }
    }
    // Laravel answers a stale CSRF token with 419 "Page Expired".
    if page.status.as_u16() == 419 || page.status == StatusCode::UNAUTHORIZED {
        return Verdict::Expired;
    }
    let listing_url = adapter.find_listing_url(&page.body);
    if listing_url.is_some()
        || adapter
            .success_markers()
            .iter()
            .any(|marker| page.body.contains(marker))
    {
        return Verdict::Published(listing_url);
    }
    Verdict::Rejected
}
