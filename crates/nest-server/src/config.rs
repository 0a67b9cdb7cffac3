use std::time::Duration;

use anyhow::{Context, Result, bail};

use nest_api::{CallTokenConfig, InsightConfig};

const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

const DEFAULT_INSIGHT_MODEL: &str = "gpt-4o-mini";

#[derive(Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: String,
    pub jwt_secret: String,
    pub call_tokens: CallTokenConfig,
    pub insight: Option<InsightConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key lookup; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let jwt_secret = var("NEST_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("NEST_JWT_SECRET is unset or still a placeholder; it must match the auth service's signing secret");
        }

        let port: u16 = var("NEST_PORT")
            .unwrap_or_else(|| "3000".into())
            .parse()
            .context("NEST_PORT must be a port number")?;
        let ttl_secs: u64 = var("NEST_CALL_TOKEN_TTL_SECS")
            .unwrap_or_else(|| "3600".into())
            .parse()
            .context("NEST_CALL_TOKEN_TTL_SECS must be a number of seconds")?;

        let insight = var("NEST_INSIGHT_URL").map(|url| InsightConfig {
            url,
            api_key: var("NEST_INSIGHT_API_KEY"),
            model: var("NEST_INSIGHT_MODEL").unwrap_or_else(|| DEFAULT_INSIGHT_MODEL.into()),
        });

        Ok(Self {
            host: var("NEST_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            db_path: var("NEST_DB_PATH").unwrap_or_else(|| "nest.db".into()),
            call_tokens: CallTokenConfig {
                secret: var("NEST_CALL_TOKEN_SECRET").unwrap_or_else(|| jwt_secret.clone()),
                ttl: Duration::from_secs(ttl_secs),
            },
            jwt_secret,
            insight,
        })
    }
}
