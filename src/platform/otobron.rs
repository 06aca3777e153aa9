use super::{EncodedBody, ImageMode, PlatformAdapter, Promotion, path_of, path_on_base};
use crate::config::{Credentials, OtobronSettings};
use crate::models::{ListingRequest, PlatformId, UploadedImage};
use crate::token::TokenExtractor;
use regex::Regex;

const LOGIN_NONCE_FIELD: &str = "woocommerce-login-nonce";
const LISTING_NONCE_FIELD: &str = "_wpnonce";

const SUCCESS_MARKERS: &[&str] = &[
    "Ogłoszenie zostało dodane",
    "Dziękujemy za dodanie ogłoszenia",
    "Twoje ogłoszenie oczekuje na zatwierdzenie",
];

/// otobron.pl: WordPress/WooCommerce site. Nonces replace CSRF cookies and the
/// listing form expects photos inlined as base64 text parts of a multipart body.
pub struct OtobronAdapter {
    settings: OtobronSettings,
    listing_anchor: Regex,
}

impl OtobronAdapter {
    pub fn new(settings: OtobronSettings) -> Self {
        let base = regex::escape(settings.base_url.trim_end_matches('/'));
        let listing_anchor = Regex::new(&format!(r#"<a[^>]*href="({base}/listing/[^"]+)""#))
            .expect("escaped base url pattern");
        Self {
            settings,
            listing_anchor,
        }
    }

    fn base(&self) -> &str {
        self.settings.base_url.trim_end_matches('/')
    }
}

impl PlatformAdapter for OtobronAdapter {
    fn id(&self) -> PlatformId {
        PlatformId::Otobron
    }

    fn base_url(&self) -> &str {
        self.base()
    }

    fn credentials(&self) -> &Credentials {
        &self.settings.credentials
    }

    fn login_path(&self) -> &str {
        "/my-account/"
    }

    fn new_listing_path(&self) -> &str {
        "/add-listing/"
    }

    fn submit_path(&self) -> &str {
        "/add-listing/"
    }

    fn login_token(&self) -> TokenExtractor {
        TokenExtractor::new(LOGIN_NONCE_FIELD, None)
    }

    fn listing_token(&self) -> TokenExtractor {
        TokenExtractor::new(LISTING_NONCE_FIELD, None)
    }

    fn login_form(&self, token: &str) -> Vec<(String, String)> {
        vec![
            ("username".into(), self.settings.credentials.username.clone()),
            ("password".into(), self.settings.credentials.password.clone()),
            ("rememberme".into(), "forever".into()),
            (LOGIN_NONCE_FIELD.into(), token.into()),
            ("_wp_http_referer".into(), self.login_path().into()),
            ("login".into(), "Zaloguj się".into()),
        ]
    }

    fn image_mode(&self) -> ImageMode {
        ImageMode::Inline
    }

    fn uploaded_image_url(&self, file_id: &str) -> String {
        file_id.to_string()
    }

    fn build_form_payload(
        &self,
        request: &ListingRequest,
        images: &[UploadedImage],
        token: &str,
    ) -> EncodedBody {
        let s = &self.settings;
        let condition = request
            .attributes
            .get("condition")
            .cloned()
            .unwrap_or_else(|| s.condition.clone());
        let mut fields: Vec<(String, String)> = vec![
            (LISTING_NONCE_FIELD.into(), token.into()),
            ("_wp_http_referer".into(), self.new_listing_path().into()),
            ("listing_type".into(), s.listing_type.clone()),
            ("listing_title".into(), request.title.clone()),
            ("listing_description".into(), request.description.clone()),
            ("listing_category".into(), s.category_id.to_string()),
            ("listing_price".into(), request.price.to_string()),
            ("listing_condition".into(), condition),
        ];
        for option in &s.additional_options {
            fields.push(("listing_options[]".into(), option.clone()));
        }
        fields.extend([
            ("listing_email".into(), s.email.clone()),
            ("listing_phone".into(), s.phone.clone()),
            ("listing_address".into(), s.address.clone()),
            ("listing_lat".into(), s.lat.clone()),
            ("listing_lng".into(), s.lng.clone()),
        ]);
        for image in images {
            fields.push(("listing_gallery[]".into(), image.platform_url_or_id.clone()));
        }
        fields.push(("submit_listing".into(), "1".into()));
        EncodedBody::Multipart(fields)
    }

    fn listing_url_for(&self, promotion: &Promotion) -> String {
        format!("{}/listing/{}/", self.base(), promotion.number)
    }

    fn success_markers(&self) -> &[&'static str] {
        SUCCESS_MARKERS
    }

    fn find_listing_url(&self, html: &str) -> Option<String> {
        self.listing_anchor
            .captures(html)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }

    fn is_listing_url(&self, url: &str) -> bool {
        path_on_base(self.base(), url).is_some_and(|path| {
            path.starts_with("/listing/") && path.trim_end_matches('/').len() > "/listing".len()
        })
    }

    fn is_login_redirect(&self, location: &str) -> bool {
        path_of(self.base(), location).is_some_and(|path| {
            path.contains("wp-login.php")
                || path.trim_end_matches('/') == self.login_path().trim_end_matches('/')
        })
    }
}
