use super::{EncodedBody, ImageMode, PlatformAdapter, Promotion, path_on_base};
use crate::config::{Credentials, NetgunSettings};
use crate::models::{ListingRequest, PlatformId, UploadedImage};
use crate::token::TokenExtractor;
use once_cell::sync::Lazy;
use regex::Regex;

const TOKEN_FIELD: &str = "_token";
const TOKEN_COOKIE: &str = "XSRF-TOKEN";
const PAYMENT_GATEWAY: &str = "przelewy24";
const DEFAULT_CATEGORY: &str = "pistolety";

// Substring match, first hit wins; order matters ("pistolet maszynowy" hits "pistolet").
const CATEGORY_MAPPING: &[(&str, &str)] = &[
    ("pistolet", "pistolety"),
    ("pistolety", "pistolety"),
    ("rewolwer", "rewolwery"),
    ("rewolwery", "rewolwery"),
    ("karabin", "karabinki-automatyczne-szturmowe"),
    ("karabinek", "karabinki-automatyczne-szturmowe"),
    ("strzelba", "strzelby"),
    ("strzelby", "strzelby"),
    ("shotgun", "strzelby"),
    ("snajperka", "karabiny-sniper"),
    ("pm", "pistolety-maszynowe"),
    ("pistolet maszynowy", "pistolety-maszynowe"),
];

const SUCCESS_MARKERS: &[&str] = &[
    "promowanie-ogloszenia",
    "Ogłoszenie zostało dodane",
    "Twoje ogłoszenie zostało opublikowane",
];

static PROMOTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/promowanie-ogloszenia/(\d+)/([A-Za-z0-9]+)").expect("static pattern")
});
static LISTING_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/ogloszenie/[^/?#]+").expect("static pattern"));

/// netgun.pl: Laravel site with `_token` forms, a JSON image uploader and an
/// interposed promotion page after a listing is created.
pub struct NetgunAdapter {
    settings: NetgunSettings,
    listing_anchor: Regex,
}

impl NetgunAdapter {
    pub fn new(settings: NetgunSettings) -> Self {
        let base = regex::escape(settings.base_url.trim_end_matches('/'));
        let listing_anchor = Regex::new(&format!(
            r#"<a[^>]*href="({base}/ogloszenie/[^"]+)""#
        ))
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

pub fn map_category(raw: &str) -> &'static str {
    let lowered = raw.to_lowercase();
    CATEGORY_MAPPING
        .iter()
        .find(|(needle, _)| lowered.contains(needle))
        .map(|(_, category)| *category)
        .unwrap_or(DEFAULT_CATEGORY)
}

impl PlatformAdapter for NetgunAdapter {
    fn id(&self) -> PlatformId {
        PlatformId::Netgun
    }

    fn base_url(&self) -> &str {
        self.base()
    }

    fn credentials(&self) -> &Credentials {
        &self.settings.credentials
    }

    fn login_path(&self) -> &str {
        "/login"
    }

    fn new_listing_path(&self) -> &str {
        "/nowe-ogloszenie"
    }

    fn submit_path(&self) -> &str {
        "/nowe-ogloszenie"
    }

    fn login_token(&self) -> TokenExtractor {
        TokenExtractor::new(TOKEN_FIELD, Some(TOKEN_COOKIE))
    }

    fn listing_token(&self) -> TokenExtractor {
        TokenExtractor::new(TOKEN_FIELD, Some(TOKEN_COOKIE))
    }

    fn login_form(&self, token: &str) -> Vec<(String, String)> {
        vec![
            ("_token".into(), token.into()),
            ("email".into(), self.settings.credentials.username.clone()),
            ("password".into(), self.settings.credentials.password.clone()),
            ("remember".into(), "on".into()),
        ]
    }

    fn image_mode(&self) -> ImageMode {
        ImageMode::Upload {
            endpoint: "/api/image-uploader".into(),
        }
    }

    fn uploaded_image_url(&self, file_id: &str) -> String {
        format!(
            "{}/uploader/{}",
            self.settings.image_base_url.trim_end_matches('/'),
            file_id
        )
    }

    fn build_form_payload(
        &self,
        request: &ListingRequest,
        images: &[UploadedImage],
        token: &str,
    ) -> EncodedBody {
        let s = &self.settings;
        let category = request
            .attributes
            .get("category")
            .map(|raw| map_category(raw))
            .unwrap_or(DEFAULT_CATEGORY);
        let description = format!("{}{}", s.description_prefix, request.description);

        let mut fields: Vec<(String, String)> = vec![
            ("_token".into(), token.into()),
            ("name".into(), request.title.clone()),
            ("transaction_type".into(), attr_or(request, "transaction_type", "sell")),
            ("item_state".into(), attr_or(request, "item_state", "USED")),
            ("category".into(), category.into()),
            ("nickname".into(), s.nickname.clone()),
            ("city".into(), s.city.clone()),
            ("province".into(), s.province.clone()),
            ("description".into(), description),
            ("price".into(), request.price.to_string()),
            ("phone".into(), s.phone.clone()),
            ("email".into(), s.email.clone()),
            ("url".into(), s.shop_url.clone()),
            ("terms".into(), "on".into()),
        ];
        for image in images {
            fields.push(("images[]".into(), image.platform_url_or_id.clone()));
            fields.push(("titles[]".into(), String::new()));
        }
        EncodedBody::Form(fields)
    }

    fn parse_promotion(&self, location: &str) -> Option<Promotion> {
        let caps = PROMOTION.captures(location)?;
        Some(Promotion {
            number: caps.get(1)?.as_str().to_string(),
            token: caps.get(2)?.as_str().to_string(),
            location: self.absolute_url(location),
        })
    }

    fn promotion_confirm_path(&self) -> Option<&str> {
        Some("/promowanie-ogloszenia")
    }

    fn promotion_form(&self, promotion: &Promotion, token: &str) -> Vec<(String, String)> {
        vec![
            ("_token".into(), token.into()),
            ("announcement_number".into(), promotion.number.clone()),
            ("announcement_token".into(), promotion.token.clone()),
            ("payment_gateway".into(), PAYMENT_GATEWAY.into()),
        ]
    }

    fn listing_url_for(&self, promotion: &Promotion) -> String {
        format!("{}/ogloszenie/{}", self.base(), promotion.number)
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
        path_on_base(self.base(), url).is_some_and(|path| LISTING_PATH.is_match(&path))
    }
}

fn attr_or(request: &ListingRequest, key: &str, default: &str) -> String {
    request
        .attributes
        .get(key)
        .filter(|v| !v.trim().is_empty())
        .cloned()
        .unwrap_or_else(|| default.to_string())
}
