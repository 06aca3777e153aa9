use reqwest::{
    Url,
    header::{HeaderMap, SET_COOKIE},
};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
}

/// Ordered cookie jar for one emulated browser session.
///
/// Order is first-insertion order; re-setting a cookie keeps its slot and
/// replaces the value, mirroring how browsers serialise the `Cookie` header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CookieJar {
    domain: String,
    cookies: Vec<Cookie>,
}

impl CookieJar {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            cookies: Vec::new(),
        }
    }

    /// Empty jar scoped to the host of `base_url`.
    pub fn for_base_url(base_url: &str) -> Self {
        let domain = Url::parse(base_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_default();
        Self::new(domain)
    }

    /// Rebuild a jar from the flat `name=value; name=value` form kept in the session cache.
    pub fn from_serialized(serialized: &str, base_url: &str) -> Self {
        let mut jar = Self::for_base_url(base_url);
        for pair in serialized.split(';') {
            if let Some((name, value)) = pair.split_once('=') {
                let name = name.trim();
                if !name.is_empty() {
                    jar.set(name, value.trim());
                }
            }
        }
        jar
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.set_scoped(name, value, None, None);
    }

    fn set_scoped(&mut self, name: &str, value: &str, domain: Option<&str>, path: Option<&str>) {
        let domain = domain
            .map(|d| d.trim_start_matches('.').to_string())
            .unwrap_or_else(|| self.domain.clone());
        let path = path.unwrap_or("/").to_string();
        if let Some(existing) = self.cookies.iter_mut().find(|c| c.name == name) {
            existing.value = value.to_string();
            existing.domain = domain;
            existing.path = path;
            return;
        }
        self.cookies.push(Cookie {
            name: name.to_string(),
            value: value.to_string(),
            domain,
            path,
        });
    }

    pub fn remove(&mut self, name: &str) {
        self.cookies.retain(|c| c.name != name);
    }

    /// Apply every `Set-Cookie` header of a response. Returns how many cookies changed.
    pub fn absorb(&mut self, headers: &HeaderMap) -> usize {
        let mut changed = 0;
        for raw in headers.get_all(SET_COOKIE) {
            let Ok(raw) = raw.to_str() else { continue };
            if self.apply_set_cookie(raw) {
                changed += 1;
            }
        }
        changed
    }

    fn apply_set_cookie(&mut self, raw: &str) -> bool {
        let mut parts = raw.split(';');
        let Some((name, value)) = parts.next().and_then(|first| first.split_once('=')) else {
            return false;
        };
        let name = name.trim();
        if name.is_empty() {
            return false;
        }
        let value = value.trim().trim_matches('"');

        let mut domain = None;
        let mut path = None;
        let mut expired = value.is_empty() || value == "deleted";
        for attr in parts {
            let (key, val) = attr.split_once('=').unwrap_or((attr, ""));
            match key.trim().to_ascii_lowercase().as_str() {
                "domain" => domain = Some(val.trim()),
                "path" => path = Some(val.trim()),
                "max-age" => {
                    if val.trim().parse::<i64>().is_ok_and(|age| age <= 0) {
                        expired = true;
                    }
                }
                _ => {}
            }
        }

        if expired {
            let existed = self.get(name).is_some();
            self.remove(name);
            return existed;
        }
        self.set_scoped(name, value, domain, path);
        true
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cookie> {
        self.cookies.iter()
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Flat `name=value; name=value` form, used both for the `Cookie` header and the cache.
    pub fn serialize(&self) -> String {
        self.cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn header_value(&self) -> Option<String> {
        if self.is_empty() {
            None
        } else {
            Some(self.serialize())
        }
    }
}
