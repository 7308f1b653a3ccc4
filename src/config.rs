use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::dedupe::MatchStrategy;
use crate::store::SignatureAlgorithm;

/// Canonical rasters wider than this are no better for hashing, only slower.
const MAX_CANONICAL_WIDTH: u32 = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbCfg {
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub name: Option<String>,
    pub max_connections: u32,
}

impl DbCfg {
    /// No URL and no host means there is no database to talk to.
    pub fn is_configured(&self) -> bool {
        self.url.is_some() || self.host.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreCfg {
    pub cloud_name: Option<String>,
    pub api_key: String,
    pub api_secret: String,
    pub folder: String,
    pub api_base: String,
    pub upload_timeout: Duration,
    pub signature_algorithm: SignatureAlgorithm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCfg {
    pub host: String,
    pub port: u16,
    pub max_upload_bytes: usize,
}

impl ServerCfg {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupeCfg {
    pub canonical_width: u32,
    pub strategy: MatchStrategy,
    pub digest_fast_path: bool,
}

impl Default for DedupeCfg {
    fn default() -> Self {
        Self {
            canonical_width: crate::normalize::CANONICAL_WIDTH,
            strategy: MatchStrategy::Exact,
            digest_fast_path: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppCfg {
    pub db: DbCfg,
    pub store: StoreCfg,
    pub server: ServerCfg,
    pub dedupe: DedupeCfg,
}

impl AppCfg {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup so tests don't have to touch the process env.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        let db = DbCfg {
            url: get("DATABASE_URL"),
            host: get("DB_HOST"),
            port: parse_or(&get, "DB_PORT", 5432)?,
            user: get("DB_USER"),
            password: get("DB_PASSWORD"),
            name: get("DB_NAME"),
            max_connections: parse_or(&get, "DB_MAX_CONNECTIONS", 5)?,
        };

        let store = StoreCfg {
            cloud_name: get("CLOUDINARY_CLOUD_NAME"),
            api_key: get("CLOUDINARY_API_KEY").unwrap_or_default(),
            api_secret: get("CLOUDINARY_API_SECRET").unwrap_or_default(),
            folder: get("CLOUDINARY_UPLOAD_FOLDER").unwrap_or_default(),
            api_base: get("CLOUDINARY_API_BASE").unwrap_or_else(|| "https://api.cloudinary.com".into()),
            upload_timeout: Duration::from_secs(parse_or(&get, "UPLOAD_TIMEOUT_SECS", 30)?),
            signature_algorithm: match get("CLOUDINARY_SIGNATURE_ALGORITHM") {
                Some(v) => v
                    .trim()
                    .parse()
                    .map_err(|e: String| anyhow::anyhow!("invalid value for CLOUDINARY_SIGNATURE_ALGORITHM: {e}"))?,
                None => SignatureAlgorithm::default(),
            },
        };
        if store.cloud_name.is_some() && (store.api_key.is_empty() || store.api_secret.is_empty()) {
            bail!("CLOUDINARY_API_KEY and CLOUDINARY_API_SECRET are required when CLOUDINARY_CLOUD_NAME is set");
        }

        let server = ServerCfg {
            host: get("BIND_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "PORT", 8081)?,
            max_upload_bytes: parse_or(&get, "MAX_UPLOAD_BYTES", 10 * 1024 * 1024)?,
        };

        let threshold: u32 = parse_or(&get, "DEDUPE_HAMMING_THRESHOLD", 6)?;
        let strategy = match get("DEDUPE_STRATEGY").map(|s| s.to_ascii_lowercase()).as_deref() {
            None | Some("exact") => MatchStrategy::Exact,
            Some("hamming") => MatchStrategy::Hamming { threshold },
            Some(other) => bail!("DEDUPE_STRATEGY must be `exact` or `hamming`, got `{other}`"),
        };

        let canonical_width: u32 = parse_or(&get, "CANONICAL_WIDTH", crate::normalize::CANONICAL_WIDTH)?;
        if canonical_width == 0 || canonical_width > MAX_CANONICAL_WIDTH {
            bail!("CANONICAL_WIDTH must be between 1 and {MAX_CANONICAL_WIDTH}");
        }

        let dedupe = DedupeCfg {
            canonical_width,
            strategy,
            digest_fast_path: get("DEDUPE_DIGEST_FAST_PATH")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
        };

        Ok(Self { db, store, server, dedupe })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(v) => v.trim().parse().with_context(|| format!("invalid value for {key}: {v}")),
        None => Ok(default),
    }
}
