/*
 * Responsibility
 * - Read environment configuration (store URL, token secret, gateway routes, sync tuning)
 * - Validate values; a missing or bad value aborts startup
 */
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::services::auth::codec::MIN_SECRET_LEN;
use crate::services::proxy::RouteTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Development,
    Production,
}

impl AppEnv {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            _ => Self::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "missing configuration: {}", key),
            ConfigError::Invalid(key) => write!(f, "invalid configuration: {}", key),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Where shared session and rule state lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// `redis://` / `rediss://` URL of the shared Valkey/Redis.
    Valkey(String),
    /// Process-local store; only meaningful for a single gateway instance.
    Memory,
}

#[derive(Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub app_env: AppEnv,
    pub store: StoreBackend,

    // Tokens
    pub jwt_secret: String,
    pub access_token_ttl_seconds: u64,
    pub refresh_token_ttl_seconds: u64,
    pub token_leeway_seconds: u64,

    // Admission
    pub internal_secret: String,
    pub admin_role: String,
    pub whitelist: Vec<String>,
    pub routes: RouteTable,
    pub store_timeout: Duration,

    // HTTP edge
    pub upstream_timeout: Duration,
    pub request_body_limit_bytes: usize,
    pub cors_allowed_origins: Vec<String>,

    // Permission sync
    pub perm_sync_channel: String,
    pub perm_reload_debounce: Duration,
    pub perm_reload_timeout: Duration,
    pub perm_resync_interval: Duration,
    pub match_cache_capacity: usize,
    pub match_cache_ttl: Duration,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Secrets and the store URL (may carry a password) stay out of logs.
        f.debug_struct("Config")
            .field("addr", &self.addr)
            .field("app_env", &self.app_env)
            .field("access_token_ttl_seconds", &self.access_token_ttl_seconds)
            .field("refresh_token_ttl_seconds", &self.refresh_token_ttl_seconds)
            .field("admin_role", &self.admin_role)
            .field("whitelist", &self.whitelist)
            .field("routes", &self.routes.len())
            .field("perm_sync_channel", &self.perm_sync_channel)
            .finish_non_exhaustive()
    }
}

const DEFAULT_WHITELIST: &str = "/login,/refresh,/health";

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (the process environment in production, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let port: u16 = env.parsed("PORT", 8080)?;
        let addr: SocketAddr = SocketAddr::from_str(&format!("0.0.0.0:{}", port))
            .map_err(|_| ConfigError::Invalid("PORT"))?;

        let app_env = AppEnv::parse(&env.or("APP_ENV", "development"));

        let store_url = env.required("VALKEY_URL")?;
        let store = if store_url.starts_with("memory://") {
            StoreBackend::Memory
        } else if store_url.starts_with("redis://") || store_url.starts_with("rediss://") {
            StoreBackend::Valkey(store_url)
        } else {
            return Err(ConfigError::Invalid("VALKEY_URL"));
        };

        let jwt_secret = env.required("JWT_SECRET")?;
        if jwt_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::Invalid("JWT_SECRET"));
        }

        let access_token_ttl_seconds = env.parsed("ACCESS_TOKEN_TTL_SECONDS", 7200)?; // 2 hours
        let refresh_token_ttl_seconds = env.parsed("REFRESH_TOKEN_TTL_SECONDS", 604_800)?; // 7 days
        if access_token_ttl_seconds == 0 {
            return Err(ConfigError::Invalid("ACCESS_TOKEN_TTL_SECONDS"));
        }
        if refresh_token_ttl_seconds == 0 {
            return Err(ConfigError::Invalid("REFRESH_TOKEN_TTL_SECONDS"));
        }
        let token_leeway_seconds = env.parsed("TOKEN_LEEWAY_SECONDS", 0)?;

        let internal_secret = env.required("INTERNAL_SECRET")?;
        if axum::http::HeaderValue::from_str(&internal_secret).is_err() {
            return Err(ConfigError::Invalid("INTERNAL_SECRET"));
        }
        let admin_role = env.or("ADMIN_ROLE", "ADMIN");
        let whitelist = split_list(&env.or("GATEWAY_WHITELIST", DEFAULT_WHITELIST));
        let routes = RouteTable::parse(&env.or("GATEWAY_ROUTES", ""))
            .map_err(|_| ConfigError::Invalid("GATEWAY_ROUTES"))?;

        let store_timeout = Duration::from_millis(env.parsed("STORE_TIMEOUT_MS", 500)?);
        let upstream_timeout = Duration::from_secs(env.parsed("UPSTREAM_TIMEOUT_SECS", 30)?);
        let request_body_limit_bytes = env.parsed("REQUEST_BODY_LIMIT_BYTES", 10 * 1024 * 1024)?;
        let cors_allowed_origins = split_list(&env.or("CORS_ALLOWED_ORIGINS", ""));

        let perm_sync_channel = env.or("PERM_SYNC_CHANNEL", "perm:sync");
        let perm_reload_debounce = Duration::from_millis(env.parsed("PERM_RELOAD_DEBOUNCE_MS", 500)?);
        let perm_reload_timeout = Duration::from_millis(env.parsed("PERM_RELOAD_TIMEOUT_MS", 5000)?);
        let perm_resync_interval = Duration::from_secs(env.parsed("PERM_RESYNC_INTERVAL_SECS", 300)?);
        let match_cache_capacity = env.parsed("MATCH_CACHE_CAPACITY", 2000)?;
        let match_cache_ttl = Duration::from_secs(env.parsed("MATCH_CACHE_TTL_SECS", 7200)?);

        Ok(Self {
            addr,
            app_env,
            store,
            jwt_secret,
            access_token_ttl_seconds,
            refresh_token_ttl_seconds,
            token_leeway_seconds,
            internal_secret,
            admin_role,
            whitelist,
            routes,
            store_timeout,
            upstream_timeout,
            request_body_limit_bytes,
            cors_allowed_origins,
            perm_sync_channel,
            perm_reload_debounce,
            perm_reload_timeout,
            perm_resync_interval,
            match_cache_capacity,
            match_cache_ttl,
        })
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    /// Absent means `default`; present but unparsable is an error rather than a silent default.
    fn parsed<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid(key)),
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
