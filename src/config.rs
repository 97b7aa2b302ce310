//! Ambient configuration, read once at startup.
//!
//! The source reads chaos/redaction/dry-run/etc. toggles from the process
//! environment; we read them exactly once here and pass the resulting
//! struct explicitly through the call graph rather than calling
//! `std::env::var` from inside component logic.

use crate::error::RoutePilotError;

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v == "1").unwrap_or(false)
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[derive(Debug, Clone)]
pub struct HttpFetchConfig {
    pub allowlist: Vec<String>,
    pub url_template: Option<String>,
    pub max: usize,
}

#[derive(Debug, Clone)]
pub struct ChaosConfig {
    pub primary_stall: bool,
    pub http_5xx: bool,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub gateway_base_url: String,
    pub gateway_api_key: String,
    pub jwt_secret: String,
    pub mirror_json: bool,
    pub snapshot_input: bool,
    pub redact: bool,
    pub redact_fields: Vec<String>,
    pub usage_probe: bool,
    pub early_stop: bool,
    pub dry_run: bool,
    pub http_fetch: HttpFetchConfig,
    pub chaos: ChaosConfig,
}

impl RuntimeConfig {
    /// Read every ambient env var exactly once. `AI_GATEWAY_BASE_URL` and
    /// `AI_GATEWAY_API_KEY` are required; everything else has a default.
    pub fn from_env() -> Result<Self, RoutePilotError> {
        let gateway_base_url = std::env::var("AI_GATEWAY_BASE_URL")
            .map_err(|_| RoutePilotError::Config("AI_GATEWAY_BASE_URL is not set".into()))?;
        let gateway_api_key = std::env::var("AI_GATEWAY_API_KEY")
            .map_err(|_| RoutePilotError::Config("AI_GATEWAY_API_KEY is not set".into()))?;

        let redact_fields = env_opt("ROUTEPILOT_REDACT_FIELDS")
            .map(|s| s.split(',').map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect())
            .unwrap_or_default();

        let allowlist = env_opt("HTTP_FETCH_ALLOWLIST")
            .map(|s| s.split(',').map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect())
            .unwrap_or_default();

        let max = env_opt("HTTP_FETCH_MAX")
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(3);

        Ok(Self {
            gateway_base_url,
            gateway_api_key,
            jwt_secret: env_opt("JWT_SECRET").unwrap_or_else(|| "dev-secret".to_string()),
            mirror_json: env_flag("ROUTEPILOT_MIRROR_JSON"),
            snapshot_input: env_flag("ROUTEPILOT_SNAPSHOT_INPUT"),
            redact: env_flag("ROUTEPILOT_REDACT"),
            redact_fields,
            usage_probe: env_flag("ROUTEPILOT_USAGE_PROBE"),
            early_stop: env_flag("ROUTEPILOT_EARLY_STOP"),
            dry_run: env_flag("ROUTEPILOT_DRY_RUN"),
            http_fetch: HttpFetchConfig {
                allowlist,
                url_template: env_opt("HTTP_FETCH_URL_TEMPLATE"),
                max,
            },
            chaos: ChaosConfig {
                primary_stall: env_flag("CHAOS_PRIMARY_STALL"),
                http_5xx: env_flag("CHAOS_HTTP_5XX"),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment mutation must be serialized across tests in this process.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn missing_required_var_is_config_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("AI_GATEWAY_BASE_URL");
        std::env::remove_var("AI_GATEWAY_API_KEY");
        let err = RuntimeConfig::from_env().unwrap_err();
        assert!(matches!(err, RoutePilotError::Config(_)));
    }

    #[test]
    fn defaults_fill_optional_fields() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("AI_GATEWAY_BASE_URL", "https://gw.example.com");
        std::env::set_var("AI_GATEWAY_API_KEY", "k");
        std::env::remove_var("JWT_SECRET");
        std::env::remove_var("HTTP_FETCH_MAX");
        let cfg = RuntimeConfig::from_env().unwrap();
        assert_eq!(cfg.jwt_secret, "dev-secret");
        assert_eq!(cfg.http_fetch.max, 3);
        std::env::remove_var("AI_GATEWAY_BASE_URL");
        std::env::remove_var("AI_GATEWAY_API_KEY");
    }
}
