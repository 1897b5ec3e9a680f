use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use std::time::Duration;

const ENV_API_URL: &str = "CLASSROOMD_API_URL";
const ENV_TOKEN: &str = "CLASSROOMD_TOKEN";
const ENV_TIMEOUT_SECONDS: &str = "CLASSROOMD_TIMEOUT_SECONDS";

const DEFAULT_API_URL: &str = "http://127.0.0.1:8000/api/";
const DEFAULT_TIMEOUT_SECONDS: f64 = 15.0;
const MIN_TIMEOUT_SECONDS: f64 = 1.0;
const MAX_TIMEOUT_SECONDS: f64 = 3600.0;

#[derive(Debug, Clone)]
pub struct Settings {
    pub api_url: String,
    pub token: Option<String>,
    pub timeout_seconds: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            token: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
        }
    }
}

/// `session.connect` params; anything omitted falls back to the process settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionParams {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();
        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.trim().is_empty()) {
            settings.api_url = url.trim().to_string();
        }
        if let Some(token) = lookup(ENV_TOKEN).filter(|v| !v.trim().is_empty()) {
            settings.token = Some(token);
        }
        if let Some(raw) = lookup(ENV_TIMEOUT_SECONDS) {
            let secs = raw
                .trim()
                .parse::<f64>()
                .with_context(|| format!("{ENV_TIMEOUT_SECONDS} must be a number, got {raw:?}"))?;
            settings.timeout_seconds = checked_timeout(secs).context(ENV_TIMEOUT_SECONDS)?;
        }
        Ok(settings)
    }

    /// Session params laid over these settings; an out-of-range timeout is an error.
    pub fn overlay(&self, params: SessionParams) -> Result<Settings> {
        let timeout_seconds = match params.timeout_seconds {
            Some(secs) => checked_timeout(secs).context("timeoutSeconds")?,
            None => self.timeout_seconds,
        };
        Ok(Settings {
            api_url: params
                .base_url
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| self.api_url.clone()),
            token: params.token.or_else(|| self.token.clone()),
            timeout_seconds,
        })
    }

    pub fn timeout(&self) -> Duration {
        let secs = self.timeout_seconds.clamp(MIN_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS);
        Duration::try_from_secs_f64(secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(DEFAULT_TIMEOUT_SECONDS))
    }
}

fn checked_timeout(secs: f64) -> Result<f64> {
    ensure!(
        secs.is_finite() && secs > 0.0 && secs <= MAX_TIMEOUT_SECONDS,
        "timeout must be between 0 and {MAX_TIMEOUT_SECONDS} seconds, got {secs}"
    );
    Ok(secs)
}
