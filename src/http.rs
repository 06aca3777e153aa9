use crate::config::HttpSettings;
use crate::cookies::CookieJar;
use reqwest::{
    Client, RequestBuilder, Response, StatusCode,
    header::{ACCEPT, ACCEPT_LANGUAGE, COOKIE, HeaderMap, HeaderValue, LOCATION},
    redirect::Policy,
};

pub const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/144.0.0.0 Safari/537.36";
pub const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8";
pub const ACCEPT_JSON: &str = "application/json, text/plain, */*";

/// Client used for every upstream platform call.
///
/// Redirects are never followed: login success and listing creation are both
/// signalled by a 3xx whose `Location` has to be inspected directly. Cookies are
/// managed explicitly through [`crate::cookies::CookieJar`].
pub fn build_client(settings: &HttpSettings) -> reqwest::Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_HTML));
    headers.insert(
        ACCEPT_LANGUAGE,
        HeaderValue::from_static("pl,en-US;q=0.9,en;q=0.8"),
    );
    Client::builder()
        .timeout(settings.timeout)
        .connect_timeout(settings.connect_timeout)
        .user_agent(USER_AGENT)
        .default_headers(headers)
        .redirect(Policy::none())
        .build()
}

/// Plain client for collaborators that are not emulated browser sessions.
pub fn build_service_client(settings: &HttpSettings) -> Client {
    Client::builder()
        .timeout(settings.timeout)
        .connect_timeout(settings.connect_timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Status, redirect target and body of an upstream page, read after its cookies
/// were absorbed into the session jar.
#[derive(Debug, Clone)]
pub struct PageResponse {
    pub status: StatusCode,
    pub location: Option<String>,
    /// Body exactly as received; this is what gets captured.
    pub raw: Vec<u8>,
    /// Lossy UTF-8 view of `raw` for token and marker matching.
    pub body: String,
}

impl PageResponse {
    pub fn is_redirect(&self) -> bool {
        self.status.is_redirection()
    }
}

/// Attach the jar as a `Cookie` header; an empty jar sends none.
pub fn with_cookies(builder: RequestBuilder, jar: &CookieJar) -> RequestBuilder {
    match jar.header_value() {
        Some(value) => builder.header(COOKIE, value),
        None => builder,
    }
}

pub async fn read_page(response: Response, jar: &mut CookieJar) -> reqwest::Result<PageResponse> {
    jar.absorb(response.headers());
    let status = response.status();
    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let raw = response.bytes().await?.to_vec();
    let body = String::from_utf8_lossy(&raw).into_owned();
    Ok(PageResponse {
        status,
        location,
        raw,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn redirects_are_returned_not_followed() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/start").header("Cookie", "a=1");
                then.status(302)
                    .header("Location", "/elsewhere")
                    .header("Set-Cookie", "b=2; path=/")
                    .body("moved");
            })
            .await;
        let followed = server
            .mock_async(|when, then| {
                when.method(GET).path("/elsewhere");
                then.status(200);
            })
            .await;

        let client = build_client(&HttpSettings::default()).unwrap();
        let mut jar = CookieJar::for_base_url(&server.base_url());
        jar.set("a", "1");
        let response = with_cookies(client.get(server.url("/start")), &jar)
            .send()
            .await
            .unwrap();
        let page = read_page(response, &mut jar).await.unwrap();

        assert!(page.is_redirect());
        assert_eq!(page.location.as_deref(), Some("/elsewhere"));
        assert_eq!(page.body, "moved");
        assert_eq!(jar.serialize(), "a=1; b=2");
        assert_eq!(followed.hits_async().await, 0);
    }

    #[tokio::test]
    async fn raw_body_keeps_bytes_that_are_not_utf8() {
        let server = MockServer::start_async().await;
        let latin2: &[u8] = b"<p>Og\xb3oszenie dodane</p>";
        server
            .mock_async(|when, then| {
                when.method(GET).path("/legacy");
                then.status(200)
                    .header("Content-Type", "text/html; charset=iso-8859-2")
                    .body(latin2);
            })
            .await;

        let client = build_client(&HttpSettings::default()).unwrap();
        let mut jar = CookieJar::for_base_url(&server.base_url());
        let response = client.get(server.url("/legacy")).send().await.unwrap();
        let page = read_page(response, &mut jar).await.unwrap();

        assert_eq!(page.raw, latin2);
        assert!(page.body.contains("oszenie dodane"));
    }
}
