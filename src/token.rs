//! CSRF/session token discovery.
//!
//! Platforms embed the token as a hidden form input; markup revisions reorder
//! attributes, so matching is an ordered list of patterns tried first to last,
//! followed by a single cookie fallback. New markup variants are handled by
//! pushing another matcher, without touching the callers.

use crate::cookies::CookieJar;
use regex::Regex;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct TokenMatcher {
    label: &'static str,
    pattern: Regex,
}

impl TokenMatcher {
    /// `pattern` must capture the token value in group 1.
    pub fn new(label: &'static str, pattern: Regex) -> Self {
        Self { label, pattern }
    }

    fn find(&self, html: &str) -> Option<String> {
        self.pattern
            .captures(html)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    Html(&'static str),
    Cookie,
}

#[derive(Debug, Clone)]
pub struct TokenExtractor {
    field_name: String,
    cookie_name: Option<String>,
    matchers: Vec<TokenMatcher>,
}

impl TokenExtractor {
    pub fn new(field_name: &str, cookie_name: Option<&str>) -> Self {
        let field = regex::escape(field_name);
        let name_first = Regex::new(&format!(
            r#"(?is)<input\b[^>]*\bname\s*=\s*["']{field}["'][^>]*\bvalue\s*=\s*["']([^"']*)["']"#
        ))
        .expect("static token pattern");
        let value_first = Regex::new(&format!(
            r#"(?is)<input\b[^>]*\bvalue\s*=\s*["']([^"']*)["'][^>]*\bname\s*=\s*["']{field}["']"#
        ))
        .expect("static token pattern");
        Self {
            field_name: field_name.to_string(),
            cookie_name: cookie_name.map(str::to_string),
            matchers: vec![
                TokenMatcher::new("input_name_first", name_first),
                TokenMatcher::new("input_value_first", value_first),
            ],
        }
    }

    pub fn with_matcher(mut self, matcher: TokenMatcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    /// Token from the document, else from the cookie jar. `None` means "cannot proceed".
    pub fn extract(&self, html: &str, jar: Option<&CookieJar>) -> Option<String> {
        self.extract_with_source(html, jar).map(|(token, _)| token)
    }

    pub fn extract_with_source(
        &self,
        html: &str,
        jar: Option<&CookieJar>,
    ) -> Option<(String, TokenSource)> {
        for matcher in &self.matchers {
            if let Some(token) = matcher.find(html) {
                debug!(
                    target = "publisher.token",
                    field = %self.field_name,
                    matcher = matcher.label,
                    "token found in html"
                );
                return Some((token, TokenSource::Html(matcher.label)));
            }
        }
        self.from_cookie(jar?).map(|token| (token, TokenSource::Cookie))
    }

    /// URL-decoded value of the token cookie, if the platform has one.
    pub fn from_cookie(&self, jar: &CookieJar) -> Option<String> {
        let name = self.cookie_name.as_deref()?;
        let raw = jar.get(name)?;
        let decoded = urlencoding::decode(raw)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| raw.to_string());
        Some(decoded).filter(|v| !v.is_empty())
    }
}
