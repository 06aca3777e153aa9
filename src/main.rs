mod audit;
mod blob;
mod config;
mod cookies;
mod http;
mod jobs;
mod metrics;
mod models;
mod platform;
mod security;
mod session;
mod store;
mod submission;
mod token;
mod upload;

use audit::AuditError;
use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use blob::{BlobStore, MemoryBlobStore, SupabaseStorage};
use config::Settings;
use eyre::WrapErr;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, ListingPayload, ListingResponse, LoginResponse, PlatformId, SubmissionOutcome};
use security::{AuthContext, AuthState, require_api_auth};
use serde::Serialize;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use store::{MemorySessionStore, RedisSessionStore, SessionStore};
use submission::Publisher;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "publisher.api", "server crashed: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let settings = Settings::from_env();
    let client = http::build_client(&settings.http).wrap_err("building upstream client")?;

    let store: Arc<dyn SessionStore> = match &settings.redis_url {
        Some(url) => Arc::new(RedisSessionStore::open(url).wrap_err("opening redis")?),
        None => {
            warn!(
                target = "publisher.api",
                "REDIS_URL not set; sessions are kept in memory and lost on restart"
            );
            Arc::new(MemorySessionStore::new())
        }
    };
    let blobs: Arc<dyn BlobStore> = match &settings.blob {
        Some(blob) => Arc::new(SupabaseStorage::new(
            blob,
            http::build_service_client(&settings.http),
        )),
        None => {
            warn!(
                target = "publisher.api",
                "SUPABASE_URL not set; image references resolve against an empty store"
            );
            Arc::new(MemoryBlobStore::new())
        }
    };

    let publisher = Publisher::new(&settings, client, store, blobs);
    let (queue, _worker) = jobs::JobQueue::spawn(
        publisher.clone(),
        settings.queue_capacity,
        settings.job_retention,
    );
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("installing prometheus recorder")?;
    let state = AppState {
        publisher,
        queue,
        prometheus_handle,
        metrics_key: std::env::var("METRICS_KEY").ok().filter(|k| !k.is_empty()),
    };

    let app = build_router(state, AuthState::from_env(), settings.request_max_bytes);

    let addr: SocketAddr = ([0, 0, 0, 0], settings.port).into();
    info!(target = "publisher.api", audit_dir = %settings.audit_dir.display(), "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    publisher: Publisher,
    queue: jobs::JobQueue,
    prometheus_handle: PrometheusHandle,
    metrics_key: Option<String>,
}

fn build_router(state: AppState, auth_state: AuthState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .nest(
            "/platforms/{platform}",
            Router::new()
                .route("/login", post(login))
                .route("/session", get(session_status))
                .route("/listings", post(create_listing)),
        )
        .nest(
            "/jobs",
            Router::new()
                .route("/platforms/{platform}/listings", post(enqueue_listing_job))
                .route("/{id}", get(get_job_status)),
        )
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/responses/{filename}", get(audit_file))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "listing-publisher",
    }))
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.metrics_key {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

/// Serve a captured upstream response as HTML.
///
/// - Method: `GET`
/// - Path: `/responses/{filename}`
/// - Auth: none; only flat `.html` names inside the audit directory are served
async fn audit_file(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    crate::metrics::inc_requests("/responses");
    match state.publisher.audit().read_file(&filename).await {
        Ok(bytes) => Ok(([(CONTENT_TYPE, "text/html; charset=utf-8")], bytes).into_response()),
        Err(AuditError::NotFound | AuditError::InvalidName) => Err(AppError::NotFound("audit_record")),
        Err(err) => Err(AppError::Internal(err.to_string())),
    }
}

/// Run the login handshake and cache the resulting session.
///
/// - Method: `POST`
/// - Path: `/platforms/{platform}/login`
/// - Auth: `Authorization: Bearer <key>` or `X-Publisher-Key: <key>`
async fn login(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(platform): Path<String>,
) -> Result<(StatusCode, Json<LoginResponse>), AppError> {
    crate::metrics::inc_requests("/platforms/login");
    let platform = parse_platform(&platform)?;
    info!(
        target = "publisher.api",
        operator = %context.operator,
        api_key = %context.api_key_id,
        %platform,
        "login requested"
    );
    let response = state.publisher.login(platform).await;
    let status = match response.error.as_deref() {
        None => StatusCode::OK,
        Some("transport") => StatusCode::BAD_GATEWAY,
        Some(_) => StatusCode::UNAUTHORIZED,
    };
    Ok((status, Json(response)))
}

#[derive(Debug, Serialize)]
struct SessionStatus {
    platform: PlatformId,
    logged_in: bool,
}

async fn session_status(
    State(state): State<AppState>,
    Path(platform): Path<String>,
) -> Result<Json<SessionStatus>, AppError> {
    let platform = parse_platform(&platform)?;
    let logged_in = state.publisher.sessions().is_logged_in(platform).await;
    Ok(Json(SessionStatus {
        platform,
        logged_in,
    }))
}

/// Publish one listing with the cached session.
///
/// - Method: `POST`
/// - Path: `/platforms/{platform}/listings`
/// - Body: `ListingPayload`
/// - Response: `ListingResponse`; 200 published, 422 rejected, 401 session
///   expired, 502 transport failure
async fn create_listing(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(platform): Path<String>,
    Json(payload): Json<ListingPayload>,
) -> Result<(StatusCode, Json<ListingResponse>), AppError> {
    crate::metrics::inc_requests("/platforms/listings");
    let platform = parse_platform(&platform)?;
    info!(
        target = "publisher.api",
        operator = %context.operator,
        api_key = %context.api_key_id,
        %platform,
        subject_id = %payload.subject_id,
        "listing submission invoked"
    );
    let response = state.publisher.submit(payload.into_request(platform)).await;
    Ok((outcome_status(&response.outcome), Json(response)))
}

fn outcome_status(outcome: &SubmissionOutcome) -> StatusCode {
    match outcome {
        SubmissionOutcome::Published { .. } => StatusCode::OK,
        SubmissionOutcome::Rejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        SubmissionOutcome::SessionExpired => StatusCode::UNAUTHORIZED,
        SubmissionOutcome::TransportError { .. } => StatusCode::BAD_GATEWAY,
    }
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_listing_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(platform): Path<String>,
    Json(payload): Json<ListingPayload>,
) -> Result<(StatusCode, Json<EnqueueResponse>), AppError> {
    crate::metrics::inc_requests("/jobs/platforms/listings");
    let platform = parse_platform(&platform)?;
    let id = state
        .queue
        .enqueue_listing(payload.into_request(platform), context)
        .await
        .map_err(AppError::Queue)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            job_id: id.to_string(),
        }),
    ))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::BadRequest("invalid_job_id"));
    };
    state
        .queue
        .get(uuid)
        .await
        .map(Json)
        .ok_or(AppError::NotFound("job"))
}

fn parse_platform(raw: &str) -> Result<PlatformId, AppError> {
    PlatformId::from_slug(raw).ok_or_else(|| AppError::UnknownPlatform(raw.to_string()))
}

#[derive(Debug)]
enum AppError {
    UnknownPlatform(String),
    BadRequest(&'static str),
    NotFound(&'static str),
    Queue(ApiError),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, payload) = match self {
            AppError::UnknownPlatform(raw) => (
                StatusCode::NOT_FOUND,
                ApiError {
                    error: "unknown_platform".into(),
                    detail: Some(raw),
                },
            ),
            AppError::BadRequest(code) => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    error: code.into(),
                    detail: None,
                },
            ),
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                ApiError {
                    error: "not_found".into(),
                    detail: Some(what.into()),
                },
            ),
            AppError::Queue(err) => (StatusCode::SERVICE_UNAVAILABLE, err),
            AppError::Internal(detail) => {
                error!(target = "publisher.api", %detail, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError {
                        error: "internal".into(),
                        detail: None,
                    },
                )
            }
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::CaptureKind;
    use crate::config::HttpSettings;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    const KEY: &str = "test-key";

    struct Harness {
        app: Router,
        publisher: Publisher,
        store: Arc<MemorySessionStore>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            audit_dir: dir.path().to_path_buf(),
            ..Settings::default()
        };
        let store = Arc::new(MemorySessionStore::new());
        let publisher = Publisher::new(
            &settings,
            http::build_client(&HttpSettings::default()).unwrap(),
            store.clone(),
            Arc::new(MemoryBlobStore::new()),
        );
        let (queue, _worker) =
            jobs::JobQueue::spawn(publisher.clone(), 4, settings.job_retention);
        let state = AppState {
            publisher: publisher.clone(),
            queue,
            prometheus_handle: PrometheusBuilder::new().build_recorder().handle(),
            metrics_key: Some("m-key".into()),
        };
        let app = build_router(
            state,
            AuthState::from_list(&format!("ops:{KEY}")),
            settings.request_max_bytes,
        );
        Harness {
            app,
            publisher,
            store,
            _dir: dir,
        }
    }

    fn listing_body() -> Body {
        Body::from(
            json!({
                "subject_id": "42",
                "title": "CZ Shadow 2",
                "price": 5400,
                "image_references": ["weapons/42/a.jpg"]
            })
            .to_string(),
        )
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    async fn call_json(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let (status, bytes) = call(app, request).await;
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_is_public() {
        let h = harness();
        let (status, body) = call_json(
            &h.app,
            Request::get("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn metrics_require_their_own_key() {
        let h = harness();
        let (status, _) = call(&h.app, Request::get("/metrics").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let request = Request::get("/metrics")
            .header("X-Metrics-Key", "m-key")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&h.app, request).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn operator_endpoints_reject_missing_key() {
        let h = harness();
        let request = Request::post("/platforms/netgun/listings")
            .header("content-type", "application/json")
            .body(listing_body())
            .unwrap();
        let (status, body) = call_json(&h.app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "missing_api_key");
    }

    #[tokio::test]
    async fn listing_without_session_maps_to_401_outcome() {
        let h = harness();
        let request = Request::post("/platforms/netgun/listings")
            .header("content-type", "application/json")
            .header(security::API_KEY_HEADER, KEY)
            .body(listing_body())
            .unwrap();
        let (status, body) = call_json(&h.app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["outcome"]["status"], "session_expired");
        assert_eq!(body["success"], false);
        assert_eq!(body["subject_id"], "42");
    }

    #[tokio::test]
    async fn unknown_platform_is_not_found() {
        let h = harness();
        let request = Request::get("/platforms/allegro/session")
            .header("Authorization", format!("Bearer {KEY}"))
            .body(Body::empty())
            .unwrap();
        let (status, body) = call_json(&h.app, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "unknown_platform");
    }

    #[tokio::test]
    async fn session_endpoint_reports_cached_login() {
        let h = harness();
        let request = || {
            Request::get("/platforms/otobron/session")
                .header(security::API_KEY_HEADER, KEY)
                .body(Body::empty())
                .unwrap()
        };
        let (_, body) = call_json(&h.app, request()).await;
        assert_eq!(body["logged_in"], false);

        let ttl = std::time::Duration::from_secs(60);
        let (cookies_key, token_key) = (
            PlatformId::Otobron.cookies_key(),
            PlatformId::Otobron.token_key(),
        );
        h.store
            .put_all(
                &[
                    (cookies_key.as_str(), "wp_logged_in=1"),
                    (token_key.as_str(), "nonce"),
                ],
                ttl,
            )
            .await
            .unwrap();
        let (status, body) = call_json(&h.app, request()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["platform"], "otobron");
        assert_eq!(body["logged_in"], true);
    }

    #[tokio::test]
    async fn login_without_credentials_is_unauthorized() {
        let h = harness();
        let request = Request::post("/platforms/netgun/login")
            .header(security::API_KEY_HEADER, KEY)
            .body(Body::empty())
            .unwrap();
        let (status, body) = call_json(&h.app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "auth");
    }

    #[tokio::test]
    async fn audit_files_are_served_by_name_only() {
        let h = harness();
        let reference = h
            .publisher
            .audit()
            .capture("netgun", CaptureKind::Response, "42", 200, "<p>dodano</p>")
            .await
            .unwrap();

        let (status, bytes) = call(
            &h.app,
            Request::get(format!("/{reference}")).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("<!-- Status Code: 200 -->\n<!-- Subject ID: 42 -->\n"));
        assert!(text.ends_with("<p>dodano</p>"));

        for uri in ["/responses/missing.html", "/responses/..%2Fsecret.html", "/responses/notes.txt"] {
            let (status, _) = call(&h.app, Request::get(uri).body(Body::empty()).unwrap()).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn jobs_are_accepted_and_polled() {
        let h = harness();
        let request = Request::post("/jobs/platforms/netgun/listings")
            .header("content-type", "application/json")
            .header(security::API_KEY_HEADER, KEY)
            .body(listing_body())
            .unwrap();
        let (status, body) = call_json(&h.app, request).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let job_id = body["job_id"].as_str().unwrap().to_string();

        let poll = Request::get(format!("/jobs/{job_id}"))
            .header(security::API_KEY_HEADER, KEY)
            .body(Body::empty())
            .unwrap();
        let (status, body) = call_json(&h.app, poll).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], job_id.as_str());

        let bad = Request::get("/jobs/not-a-uuid")
            .header(security::API_KEY_HEADER, KEY)
            .body(Body::empty())
            .unwrap();
        let (status, body) = call_json(&h.app, bad).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_job_id");
    }

    #[test]
    fn outcomes_map_to_status_codes() {
        assert_eq!(
            outcome_status(&SubmissionOutcome::Rejected {
                reason: "no publish confirmation".into(),
                audit_ref: None,
            }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            outcome_status(&SubmissionOutcome::TransportError { detail: "x".into() }),
            StatusCode::BAD_GATEWAY
        );
    }
}
