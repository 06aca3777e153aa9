//! Login handshake and cached session access.
//!
//! A login walks `Anonymous → HomepageVisited → LoginPageFetched →
//! CredentialsSubmitted → Authenticated`, accumulating cookies in a fresh jar,
//! and finally writes the serialized jar plus the CSRF token to the session
//! store. Logins are serialized per platform; reads of the cache never lock.

use crate::cookies::CookieJar;
use crate::http::{self, PageResponse};
use crate::models::PlatformId;
use crate::platform::PlatformAdapter;
use crate::store::{SessionStore, StoreError};
use chrono::{DateTime, Utc};
use reqwest::{
    Client,
    header::{CACHE_CONTROL, ORIGIN, REFERER},
};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    Anonymous,
    HomepageVisited,
    LoginPageFetched,
    CredentialsSubmitted,
    Authenticated,
    LoginFailed,
}

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("no credentials configured for {0}")]
    MissingCredentials(PlatformId),
    #[error("no token found on the login page")]
    TokenNotFound,
    #[error("login rejected (status: {status})")]
    Rejected { status: u16 },
    #[error("login produced no session cookies or token")]
    EmptySession,
    #[error("transport failure during login: {0}")]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Authenticated browser state for one platform.
#[derive(Debug, Clone)]
pub struct PlatformSession {
    pub platform: PlatformId,
    pub cookie_jar: CookieJar,
    pub csrf_token: String,
    /// Known only for sessions produced by a login in this process.
    pub captured_at: Option<DateTime<Utc>>,
}

impl PlatformSession {
    pub fn is_usable(&self) -> bool {
        !self.cookie_jar.is_empty() && !self.csrf_token.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub platform: PlatformId,
    pub cookie_count: usize,
    pub token_preview: String,
    pub captured_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SessionManager {
    http: Client,
    store: Arc<dyn SessionStore>,
    ttl: Duration,
    locks: Arc<Mutex<HashMap<PlatformId, Arc<Mutex<()>>>>>,
}

impl SessionManager {
    pub fn new(http: Client, store: Arc<dyn SessionStore>, ttl: Duration) -> Self {
        Self {
            http,
            store,
            ttl,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run the full handshake and replace the cached session on success.
    pub async fn login(&self, adapter: &dyn PlatformAdapter) -> Result<SessionSummary, LoginError> {
        let platform = adapter.id();
        if !adapter.credentials().is_complete() {
            return Err(LoginError::MissingCredentials(platform));
        }

        let lock = self.lock_for(platform).await;
        let _guard = lock.lock().await;

        let mut state = LoginState::Anonymous;
        match self.handshake(adapter, &mut state).await {
            Ok(summary) => {
                info!(
                    target = "publisher.session",
                    %platform,
                    cookie_count = summary.cookie_count,
                    token = %summary.token_preview,
                    "logged in"
                );
                Ok(summary)
            }
            Err(err) => {
                warn!(
                    target = "publisher.session",
                    %platform,
                    last_state = ?state,
                    error = %err,
                    "login failed"
                );
                advance(platform, &mut state, LoginState::LoginFailed);
                Err(err)
            }
        }
    }

    async fn handshake(
        &self,
        adapter: &dyn PlatformAdapter,
        state: &mut LoginState,
    ) -> Result<SessionSummary, LoginError> {
        let platform = adapter.id();
        let base = adapter.base_url();
        let home = format!("{base}/");
        let login_url = adapter.absolute_url(adapter.login_path());
        let mut jar = CookieJar::for_base_url(base);

        let response = self
            .http
            .get(&home)
            .header(REFERER, &home)
            .send()
            .await?;
        http::read_page(response, &mut jar).await?;
        advance(platform, state, LoginState::HomepageVisited);

        let response = http::with_cookies(self.http.get(&login_url), &jar)
            .header(REFERER, &home)
            .header(CACHE_CONTROL, "max-age=0")
            .send()
            .await?;
        let page = http::read_page(response, &mut jar).await?;
        let extractor = adapter.login_token();
        let token = extractor
            .extract(&page.body, Some(&jar))
            .ok_or(LoginError::TokenNotFound)?;
        advance(platform, state, LoginState::LoginPageFetched);

        let response = http::with_cookies(self.http.post(&login_url), &jar)
            .header(ORIGIN, base)
            .header(REFERER, &login_url)
            .header(CACHE_CONTROL, "max-age=0")
            .form(&adapter.login_form(&token))
            .send()
            .await?;
        let PageResponse { status, .. } = http::read_page(response, &mut jar).await?;
        advance(platform, state, LoginState::CredentialsSubmitted);
        if !status.is_redirection() {
            return Err(LoginError::Rejected {
                status: status.as_u16(),
            });
        }

        let token = extractor.from_cookie(&jar).unwrap_or(token);
        let cookies = jar.serialize();
        if cookies.is_empty() || token.is_empty() {
            return Err(LoginError::EmptySession);
        }
        self.store
            .put_all(
                &[
                    (platform.cookies_key().as_str(), cookies.as_str()),
                    (platform.token_key().as_str(), token.as_str()),
                ],
                self.ttl,
            )
            .await?;
        advance(platform, state, LoginState::Authenticated);

        Ok(SessionSummary {
            platform,
            cookie_count: jar.len(),
            token_preview: preview(&token),
            captured_at: Utc::now(),
        })
    }

    /// True only when both the cookie string and the token are cached and non-empty.
    pub async fn is_logged_in(&self, platform: PlatformId) -> bool {
        match self.cached(platform).await {
            Ok(cached) => cached.is_some(),
            Err(err) => {
                warn!(target = "publisher.session", %platform, error = %err, "session cache read failed");
                false
            }
        }
    }

    pub async fn current_session(
        &self,
        adapter: &dyn PlatformAdapter,
    ) -> Result<Option<PlatformSession>, StoreError> {
        let platform = adapter.id();
        Ok(self
            .cached(platform)
            .await?
            .map(|(cookies, token)| PlatformSession {
                platform,
                cookie_jar: CookieJar::from_serialized(&cookies, adapter.base_url()),
                csrf_token: token,
                captured_at: None,
            })
            .filter(PlatformSession::is_usable))
    }

    async fn cached(&self, platform: PlatformId) -> Result<Option<(String, String)>, StoreError> {
        let cookies = self.store.get(&platform.cookies_key()).await?;
        let token = self.store.get(&platform.token_key()).await?;
        Ok(match (cookies, token) {
            (Some(cookies), Some(token)) if !cookies.is_empty() && !token.is_empty() => {
                Some((cookies, token))
            }
            _ => None,
        })
    }

    async fn lock_for(&self, platform: PlatformId) -> Arc<Mutex<()>> {
        self.locks.lock().await.entry(platform).or_default().clone()
    }
}

fn advance(platform: PlatformId, state: &mut LoginState, next: LoginState) {
    debug!(target = "publisher.session", %platform, from = ?state, to = ?next, "login state");
    *state = next;
}

pub(crate) fn preview(token: &str) -> String {
    token.chars().take(6).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credentials, HttpSettings, NetgunSettings};
    use crate::platform::NetgunAdapter;
    use crate::store::MemorySessionStore;
    use httpmock::prelude::*;

    fn adapter(base_url: String, with_credentials: bool) -> NetgunAdapter {
        let credentials = if with_credentials {
            Credentials {
                username: "klub@example.pl".into(),
                password: "tajne".into(),
            }
        } else {
            Credentials::default()
        };
        NetgunAdapter::new(NetgunSettings {
            base_url: base_url.clone(),
            image_base_url: base_url,
            credentials,
            ..NetgunSettings::default()
        })
    }

    fn manager(store: MemorySessionStore) -> SessionManager {
        SessionManager::new(
            http::build_client(&HttpSettings::default()).unwrap(),
            Arc::new(store),
            Duration::from_secs(60),
        )
    }

    async fn mock_platform<'a>(
        server: &'a MockServer,
        session: &str,
        xsrf: &str,
    ) -> Vec<httpmock::Mock<'a>> {
        let home = server
            .mock_async(|when, then| {
                when.method(GET).path("/");
                then.status(200)
                    .header("Set-Cookie", "netgun_session=anon; path=/")
                    .body("<html>home</html>");
            })
            .await;
        let xsrf_cookie = format!("XSRF-TOKEN={xsrf}; path=/");
        let page = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/login")
                    .header("Cookie", "netgun_session=anon");
                then.status(200)
                    .header("Set-Cookie", xsrf_cookie.as_str())
                    .body(r#"<form><input type="hidden" name="_token" value="pre-login"></form>"#);
            })
            .await;
        let session_cookie = format!("netgun_session={session}; path=/; httponly");
        let presented = format!("netgun_session=anon; XSRF-TOKEN={xsrf}");
        let submit = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/login")
                    .header("Cookie", presented.as_str())
                    .body_contains("_token=pre-login")
                    .body_contains("email=klub%40example.pl")
                    .body_contains("remember=on");
                then.status(302)
                    .header("Location", "/")
                    .header("Set-Cookie", session_cookie.as_str());
            })
            .await;
        vec![home, page, submit]
    }

    #[tokio::test]
    async fn login_caches_cookies_and_refreshed_token() {
        let server = MockServer::start_async().await;
        let mocks = mock_platform(&server, "s1", "fresh%3D").await;
        let store = MemorySessionStore::new();
        let sessions = manager(store.clone());

        let summary = sessions.login(&adapter(server.base_url(), true)).await.unwrap();
        for mock in &mocks {
            mock.assert_async().await;
        }
        assert_eq!(summary.cookie_count, 2);
        assert_eq!(
            store.get("netgun_session_cookies").await.unwrap().as_deref(),
            Some("netgun_session=s1; XSRF-TOKEN=fresh%3D")
        );
        assert_eq!(
            store.get("netgun_xsrf_token").await.unwrap().as_deref(),
            Some("fresh=")
        );
        assert!(sessions.is_logged_in(PlatformId::Netgun).await);
    }

    #[tokio::test]
    async fn second_login_replaces_the_whole_session() {
        let server = MockServer::start_async().await;
        let store = MemorySessionStore::new();
        let sessions = manager(store.clone());
        let netgun = adapter(server.base_url(), true);

        let first = mock_platform(&server, "one", "tok-one").await;
        sessions.login(&netgun).await.unwrap();
        for mock in first {
            mock.delete_async().await;
        }
        mock_platform(&server, "two", "tok-two").await;
        sessions.login(&netgun).await.unwrap();

        let session = sessions.current_session(&netgun).await.unwrap().unwrap();
        assert_eq!(session.cookie_jar.get("netgun_session"), Some("two"));
        assert_eq!(session.csrf_token, "tok-two");
        assert_eq!(session.captured_at, None);
    }

    #[tokio::test]
    async fn non_redirect_login_response_is_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/");
                then.status(200);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/login");
                then.status(200).body(r#"<input name="_token" value="t">"#);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/login");
                then.status(422).body("Nieprawidłowe dane logowania");
            })
            .await;

        let store = MemorySessionStore::new();
        let err = manager(store.clone())
            .login(&adapter(server.base_url(), true))
            .await
            .unwrap_err();
        assert!(matches!(err, LoginError::Rejected { status: 422 }));
        assert!(store.get("netgun_session_cookies").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_login_token_fails_before_posting_credentials() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET);
                then.status(200).body("<html>maintenance</html>");
            })
            .await;
        let post = server
            .mock_async(|when, then| {
                when.method(POST).path("/login");
                then.status(302);
            })
            .await;

        let err = manager(MemorySessionStore::new())
            .login(&adapter(server.base_url(), true))
            .await
            .unwrap_err();
        assert!(matches!(err, LoginError::TokenNotFound));
        assert_eq!(post.hits_async().await, 0);
    }

    #[tokio::test]
    async fn redirect_without_cookies_does_not_cache_a_half_session() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/login");
                then.status(200).body(r#"<input name="_token" value="t">"#);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/");
                then.status(200);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/login");
                then.status(302).header("Location", "/");
            })
            .await;

        let store = MemorySessionStore::new();
        let err = manager(store.clone())
            .login(&adapter(server.base_url(), true))
            .await
            .unwrap_err();
        assert!(matches!(err, LoginError::EmptySession));
        assert!(store.get("netgun_xsrf_token").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_credentials_short_circuit() {
        let err = manager(MemorySessionStore::new())
            .login(&adapter("http://127.0.0.1:9".into(), false))
            .await
            .unwrap_err();
        assert!(matches!(err, LoginError::MissingCredentials(PlatformId::Netgun)));
    }

    #[tokio::test]
    async fn logged_in_requires_both_cached_fields() {
        let ttl = Duration::from_secs(60);
        for (cookies, token, expected) in [
            (None, None, false),
            (Some("a=1"), None, false),
            (None, Some("tok"), false),
            (Some("a=1"), Some("tok"), true),
        ] {
            let store = MemorySessionStore::new();
            if let Some(cookies) = cookies {
                store.put("otobron_session_cookies", cookies, ttl).await.unwrap();
            }
            if let Some(token) = token {
                store.put("otobron_xsrf_token", token, ttl).await.unwrap();
            }
            let sessions = manager(store);
            assert_eq!(
                sessions.is_logged_in(PlatformId::Otobron).await,
                expected,
                "cookies={cookies:?} token={token:?}"
            );
        }
    }

    #[tokio::test]
    async fn empty_cached_values_count_as_logged_out() {
        let store = MemorySessionStore::new();
        let ttl = Duration::from_secs(60);
        store.put("netgun_session_cookies", "", ttl).await.unwrap();
        store.put("netgun_xsrf_token", "tok", ttl).await.unwrap();
        let sessions = manager(store);
        assert!(!sessions.is_logged_in(PlatformId::Netgun).await);
        assert!(
            sessions
                .current_session(&adapter("https://www.netgun.pl".into(), true))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn concurrent_logins_leave_one_complete_session() {
        let server = MockServer::start_async().await;
        mock_platform(&server, "same", "tok").await;
        let store = MemorySessionStore::new();
        let sessions = manager(store.clone());
        let netgun = adapter(server.base_url(), true);

        let (a, b) = tokio::join!(sessions.login(&netgun), sessions.login(&netgun));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(
            store.get("netgun_session_cookies").await.unwrap().as_deref(),
            Some("netgun_session=same; XSRF-TOKEN=tok")
        );
        assert_eq!(store.get("netgun_xsrf_token").await.unwrap().as_deref(), Some("tok"));
    }
}
