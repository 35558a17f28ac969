use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, bail};

use vision_gateway::GatewayConfig;

/// Placeholder JWT secrets that must never reach production.
const PLACEHOLDER_SECRETS: &[&str] = &["change-me-to-a-random-string", "dev-secret-change-me"];

/// Server settings resolved from `VISION_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    /// Soft-deleted messages can be restored for this long, then get purged.
    pub restore_window: chrono::Duration,
    pub purge_interval: Duration,
    pub gateway: GatewayConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let jwt_secret = lookup("VISION_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("VISION_JWT_SECRET is unset or still a placeholder; it must match the auth service's secret");
        }

        let defaults = GatewayConfig::default();
        let gateway = GatewayConfig {
            auth_timeout: parse(&lookup, "VISION_AUTH_TIMEOUT_SECS")?
                .map_or(defaults.auth_timeout, Duration::from_secs),
            presence_grace: parse(&lookup, "VISION_PRESENCE_GRACE_MS")?
                .map_or(defaults.presence_grace, Duration::from_millis),
            idle_timeout: parse(&lookup, "VISION_IDLE_TIMEOUT_SECS")?
                .map_or(defaults.idle_timeout, Duration::from_secs),
            typing_ttl: parse(&lookup, "VISION_TYPING_TTL_MS")?
                .map_or(defaults.typing_ttl, Duration::from_millis),
            persist_timeout: parse(&lookup, "VISION_PERSIST_TIMEOUT_MS")?
                .map_or(defaults.persist_timeout, Duration::from_millis),
            max_content_len: parse(&lookup, "VISION_MAX_MESSAGE_LEN")?
                .unwrap_or(defaults.max_content_len),
            ..defaults
        };
        if gateway.max_content_len == 0 {
            bail!("VISION_MAX_MESSAGE_LEN must be positive");
        }

        let restore_hours: i64 = parse(&lookup, "VISION_RESTORE_WINDOW_HOURS")?.unwrap_or(24);
        if restore_hours < 0 {
            bail!("VISION_RESTORE_WINDOW_HOURS must not be negative");
        }

        Ok(Self {
            host: lookup("VISION_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse(&lookup, "VISION_PORT")?.unwrap_or(3000),
            db_path: lookup("VISION_DB_PATH")
                .unwrap_or_else(|| "vision.db".into())
                .into(),
            jwt_secret,
            restore_window: chrono::Duration::hours(restore_hours),
            purge_interval: Duration::from_secs(3600),
            gateway,
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| raw.trim().parse::<T>().with_context(|| format!("invalid {}: {:?}", key, raw)))
        .transpose()
}
