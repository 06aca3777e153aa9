use std::{env, path::PathBuf, time::Duration};

pub const DEFAULT_SESSION_TTL_DAYS: u64 = 30;
pub const MAX_UPLOAD_IMAGES: usize = 10;

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub request_max_bytes: usize,
    pub queue_capacity: usize,
    pub job_retention: Duration,
    pub http: HttpSettings,
    pub redis_url: Option<String>,
    pub session_ttl: Duration,
    pub blob: Option<BlobSettings>,
    pub audit_dir: PathBuf,
    pub public_base_url: Option<String>,
    pub upload_concurrency: usize,
    pub netgun: NetgunSettings,
    pub otobron: OtobronSettings,
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlobSettings {
    pub base_url: String,
    pub service_key: String,
    pub bucket: String,
}

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn is_complete(&self) -> bool {
        !self.username.trim().is_empty() && !self.password.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct NetgunSettings {
    pub base_url: String,
    /// Host the uploader serves images from; differs from `base_url` (no `www`).
    pub image_base_url: String,
    pub credentials: Credentials,
    pub email: String,
    pub phone: String,
    pub nickname: String,
    pub city: String,
    pub province: String,
    pub shop_url: String,
    pub description_prefix: String,
}

impl Default for NetgunSettings {
    fn default() -> Self {
        Self {
            base_url: "https://www.netgun.pl".into(),
            image_base_url: "https://netgun.pl".into(),
            credentials: Credentials::default(),
            email: "sagittarius.fundacja@gmail.com".into(),
            phone: "606101419".into(),
            nickname: "Klub Strzelecki Sagittarius".into(),
            city: "Piątnica".into(),
            province: "podlaskie".into(),
            shop_url: "militariaforty.pl".into(),
            description_prefix: "Odwiedź również nasz sklep: https://militariaforty.pl\n\n".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OtobronSettings {
    pub base_url: String,
    pub credentials: Credentials,
    pub email: String,
    pub phone: String,
    pub address: String,
    pub lat: String,
    pub lng: String,
    pub listing_type: String,
    pub category_id: u32,
    pub condition: String,
    pub additional_options: Vec<String>,
}

impl Default for OtobronSettings {
    fn default() -> Self {
        Self {
            base_url: "https://otobron.pl".into(),
            credentials: Credentials::default(),
            email: "sagittarius.fundacja@gmail.com".into(),
            phone: "606 101 419".into(),
            address: "Stawiskowska 57a, 18-421 Piątnica Poduchowna, Polska".into(),
            lat: "53.20247679666036".into(),
            lng: "22.098898574212722".into(),
            listing_type: "bron".into(),
            category_id: 175,
            condition: "Używana".into(),
            additional_options: vec!["Cena do negocjacji".into()],
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 8000,
            request_max_bytes: 256 * 1024,
            queue_capacity: 64,
            job_retention: Duration::from_secs(60 * 60),
            http: HttpSettings::default(),
            redis_url: None,
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_DAYS * 24 * 60 * 60),
            blob: None,
            audit_dir: PathBuf::from("storage/responses"),
            public_base_url: None,
            upload_concurrency: 1,
            netgun: NetgunSettings::default(),
            otobron: OtobronSettings::default(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        let ttl_days = parse_env("SESSION_TTL_DAYS")
            .filter(|v: &u64| *v > 0)
            .unwrap_or(DEFAULT_SESSION_TTL_DAYS);
        Self {
            port: parse_env("PORT").unwrap_or(defaults.port),
            request_max_bytes: parse_env("REQUEST_MAX_BYTES")
                .filter(|v: &usize| *v > 0)
                .unwrap_or(defaults.request_max_bytes),
            queue_capacity: parse_env("QUEUE_CAPACITY")
                .filter(|v: &usize| *v > 0)
                .unwrap_or(defaults.queue_capacity),
            job_retention: parse_env("JOB_RETENTION_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.job_retention),
            http: HttpSettings {
                timeout: Duration::from_secs(parse_env("HTTP_TIMEOUT_SECS").unwrap_or(30)),
                connect_timeout: Duration::from_secs(
                    parse_env("HTTP_CONNECT_TIMEOUT_SECS").unwrap_or(10),
                ),
            },
            redis_url: non_empty_env("REDIS_URL"),
            session_ttl: Duration::from_secs(ttl_days * 24 * 60 * 60),
            blob: BlobSettings::from_env(),
            audit_dir: non_empty_env("AUDIT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.audit_dir),
            public_base_url: non_empty_env("PUBLIC_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string()),
            upload_concurrency: parse_env("UPLOAD_CONCURRENCY")
                .filter(|v: &usize| *v > 0)
                .unwrap_or(defaults.upload_concurrency),
            netgun: NetgunSettings::from_env(),
            otobron: OtobronSettings::from_env(),
        }
    }
}

impl BlobSettings {
    fn from_env() -> Option<Self> {
        let base_url = non_empty_env("SUPABASE_URL")?;
        let service_key = non_empty_env("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|| non_empty_env("SUPABASE_SERVICE_KEY"))
            .or_else(|| non_empty_env("SUPABASE_KEY"))?;
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            bucket: non_empty_env("SUPABASE_STORAGE_BUCKET").unwrap_or_else(|| "photos".into()),
        })
    }
}

impl NetgunSettings {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            base_url: env_or("NETGUN_BASE_URL", d.base_url),
            image_base_url: env_or("NETGUN_IMAGE_BASE_URL", d.image_base_url),
            credentials: Credentials {
                username: env_or("NETGUN_USERNAME", String::new()),
                password: env_or("NETGUN_PASSWORD", String::new()),
            },
            email: env_or("NETGUN_EMAIL", d.email),
            phone: env_or("NETGUN_PHONE", d.phone),
            nickname: env_or("NETGUN_NICKNAME", d.nickname),
            city: env_or("NETGUN_CITY", d.city),
            province: env_or("NETGUN_PROVINCE", d.province),
            shop_url: env_or("NETGUN_SHOP_URL", d.shop_url),
            description_prefix: env_or("NETGUN_DESCRIPTION_PREFIX", d.description_prefix),
        }
    }
}

impl OtobronSettings {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            base_url: env_or("OTOBRON_BASE_URL", d.base_url),
            credentials: Credentials {
                username: env_or("OTOBRON_USERNAME", String::new()),
                password: env_or("OTOBRON_PASSWORD", String::new()),
            },
            email: env_or("OTOBRON_EMAIL", d.email),
            phone: env_or("OTOBRON_PHONE", d.phone),
            address: env_or("OTOBRON_ADDRESS", d.address),
            lat: env_or("OTOBRON_LAT", d.lat),
            lng: env_or("OTOBRON_LNG", d.lng),
            ..d
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_or(key: &str, default: String) -> String {
    non_empty_env(key).unwrap_or(default)
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}
