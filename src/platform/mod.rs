//! Upstream marketplace adapters.
//!
//! Each adapter owns the protocol knowledge of one site: page paths, form
//! field names, token locations, redirect targets and success markers. The
//! session manager, upload pipeline and submission state machine are generic
//! over [`PlatformAdapter`].

mod netgun;
mod otobron;

pub use netgun::NetgunAdapter;
pub use otobron::OtobronAdapter;

use crate::config::{Credentials, Settings};
use crate::models::{ListingRequest, PlatformId, UploadedImage};
use crate::token::TokenExtractor;
use reqwest::Url;
use std::{collections::HashMap, sync::Arc};

/// How listing photos reach the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageMode {
    /// POST each photo as JSON to `endpoint`; the reply names the stored file.
    Upload { endpoint: String },
    /// Photos travel inside the listing form as base64 data URLs.
    Inline,
}

/// Encoded listing form, ready to be attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedBody {
    /// `application/x-www-form-urlencoded`; repeated keys are kept in order.
    Form(Vec<(String, String)>),
    /// `multipart/form-data` made only of text parts.
    Multipart(Vec<(String, String)>),
}

impl EncodedBody {
    pub fn fields(&self) -> &[(String, String)] {
        match self {
            EncodedBody::Form(fields) | EncodedBody::Multipart(fields) => fields,
        }
    }

    #[cfg(test)]
    pub fn values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields()
            .iter()
            .filter(move |(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    #[cfg(test)]
    pub fn value<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.values(name).next()
    }
}

/// Identifier pair embedded in a "promote your listing" redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promotion {
    pub number: String,
    pub token: String,
    pub location: String,
}

pub trait PlatformAdapter: Send + Sync {
    fn id(&self) -> PlatformId;

    fn base_url(&self) -> &str;

    fn credentials(&self) -> &Credentials;

    fn login_path(&self) -> &str;

    /// Page whose form carries a fresh token for the next listing.
    fn new_listing_path(&self) -> &str;

    fn submit_path(&self) -> &str;

    fn login_token(&self) -> TokenExtractor;

    fn listing_token(&self) -> TokenExtractor;

    fn login_form(&self, token: &str) -> Vec<(String, String)>;

    fn image_mode(&self) -> ImageMode;

    /// Final image URL for a file id returned by the uploader.
    fn uploaded_image_url(&self, file_id: &str) -> String;

    fn build_form_payload(
        &self,
        request: &ListingRequest,
        images: &[UploadedImage],
        token: &str,
    ) -> EncodedBody;

    fn parse_promotion(&self, _location: &str) -> Option<Promotion> {
        None
    }

    fn promotion_confirm_path(&self) -> Option<&str> {
        None
    }

    fn promotion_form(&self, _promotion: &Promotion, _token: &str) -> Vec<(String, String)> {
        Vec::new()
    }

    fn listing_url_for(&self, promotion: &Promotion) -> String;

    fn success_markers(&self) -> &[&'static str];

    /// Listing link found in a response body.
    fn find_listing_url(&self, html: &str) -> Option<String>;

    /// Whether an absolute redirect target is a published listing page.
    fn is_listing_url(&self, url: &str) -> bool;

    /// Whether a redirect sends the browser back to the login form.
    fn is_login_redirect(&self, location: &str) -> bool {
        path_of(self.base_url(), location)
            .is_some_and(|path| path.trim_end_matches('/') == self.login_path().trim_end_matches('/'))
    }

    fn absolute_url(&self, path_or_url: &str) -> String {
        absolute_url(self.base_url(), path_or_url)
    }
}

pub fn adapter_for(platform: PlatformId, settings: &Settings) -> Arc<dyn PlatformAdapter> {
    match platform {
        PlatformId::Netgun => Arc::new(NetgunAdapter::new(settings.netgun.clone())),
        PlatformId::Otobron => Arc::new(OtobronAdapter::new(settings.otobron.clone())),
    }
}

/// One adapter per supported platform.
#[derive(Clone)]
pub struct Adapters {
    inner: Arc<HashMap<PlatformId, Arc<dyn PlatformAdapter>>>,
}

impl Adapters {
    pub fn from_settings(settings: &Settings) -> Self {
        let inner = PlatformId::ALL
            .into_iter()
            .map(|platform| (platform, adapter_for(platform, settings)))
            .collect();
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn get(&self, platform: PlatformId) -> Option<Arc<dyn PlatformAdapter>> {
        self.inner.get(&platform).cloned()
    }
}

pub(crate) fn absolute_url(base_url: &str, path_or_url: &str) -> String {
    if path_or_url.starts_with("http://") || path_or_url.starts_with("https://") {
        return path_or_url.to_string();
    }
    match Url::parse(base_url).and_then(|base| base.join(path_or_url)) {
        Ok(url) => url.to_string(),
        Err(_) => format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            path_or_url.trim_start_matches('/')
        ),
    }
}

fn path_of(base_url: &str, location: &str) -> Option<String> {
    Url::parse(&absolute_url(base_url, location))
        .ok()
        .map(|url| url.path().to_string())
}

/// Path of `location` when it points at the same host as `base_url`.
fn path_on_base(base_url: &str, location: &str) -> Option<String> {
    let base = Url::parse(base_url).ok()?;
    let target = Url::parse(&absolute_url(base_url, location)).ok()?;
    (target.host_str() == base.host_str()).then(|| target.path().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_locations_resolve_against_base() {
        assert_eq!(
            absolute_url("https://www.netgun.pl", "/promowanie-ogloszenia/1/ab"),
            "https://www.netgun.pl/promowanie-ogloszenia/1/ab"
        );
        assert_eq!(
            absolute_url("http://127.0.0.1:5000", "https://other.example/x"),
            "https://other.example/x"
        );
    }

    #[test]
    fn registry_holds_every_platform() {
        let adapters = Adapters::from_settings(&Settings::default());
        for platform in PlatformId::ALL {
            assert_eq!(adapters.get(platform).unwrap().id(), platform);
        }
    }

    #[test]
    fn login_redirect_detection_ignores_query_and_host() {
        let adapter = adapter_for(PlatformId::Netgun, &Settings::default());
        assert!(adapter.is_login_redirect("/login"));
        assert!(adapter.is_login_redirect("https://www.netgun.pl/login?next=/nowe-ogloszenie"));
        assert!(!adapter.is_login_redirect("/nowe-ogloszenie"));
    }

    #[test]
    fn encoded_body_exposes_repeated_fields() {
        let body = EncodedBody::Form(vec![
            ("images[]".into(), "a".into()),
            ("name".into(), "Glock".into()),
            ("images[]".into(), "b".into()),
        ]);
        assert_eq!(body.values("images[]").collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(body.value("name"), Some("Glock"));
        assert_eq!(body.value("missing"), None);
    }
}
