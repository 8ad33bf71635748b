use anyhow::{Context, Result};

/// Runtime configuration, resolved once at startup from `FLYCAST_*`
/// environment variables. Only the database URL is mandatory; everything else
/// has defaults suitable for a single-controller deployment.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub database_url: String,
    pub weather_api_base_url: String,
    pub scorer_api_base_url: String,
    pub data_poll_interval_seconds: u64,
    pub evaluation_interval_seconds: u64,
    pub retention_sweep_interval_seconds: u64,
    pub forecast_horizon_days: i64,
    pub similar_days_k: usize,
    pub vapid_private_key: Option<String>,
    pub vapid_contact: String,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = env_optional_string("FLYCAST_DATABASE_URL")
            .context("FLYCAST_DATABASE_URL must be set")?;
        if database_url.trim().is_empty() {
            anyhow::bail!("FLYCAST_DATABASE_URL resolved to an empty value");
        }

        let weather_api_base_url = env_string(
            "FLYCAST_WEATHER_API_BASE_URL",
            "https://api.open-meteo.com/v1",
        );
        let scorer_api_base_url =
            env_string("FLYCAST_SCORER_API_BASE_URL", "http://127.0.0.1:8501");
        let data_poll_interval_seconds =
            env_u64("FLYCAST_DATA_POLL_INTERVAL_SECONDS", 3600).clamp(60, 24 * 3600);
        let evaluation_interval_seconds =
            env_u64("FLYCAST_EVALUATION_INTERVAL_SECONDS", 1800).clamp(60, 24 * 3600);
        let retention_sweep_interval_seconds =
            env_u64("FLYCAST_RETENTION_SWEEP_INTERVAL_SECONDS", 86_400).clamp(3600, 7 * 86_400);
        let forecast_horizon_days = env_u64("FLYCAST_FORECAST_HORIZON_DAYS", 7).clamp(1, 14) as i64;
        let similar_days_k = env_u64("FLYCAST_SIMILAR_DAYS_K", 10).clamp(1, 50) as usize;
        let vapid_private_key = env_optional_string("FLYCAST_VAPID_PRIVATE_KEY");
        let vapid_contact = env_string("FLYCAST_VAPID_CONTACT", "mailto:ops@flycast.local");

        Ok(Self {
            database_url,
            weather_api_base_url,
            scorer_api_base_url,
            data_poll_interval_seconds,
            evaluation_interval_seconds,
            retention_sweep_interval_seconds,
            forecast_horizon_days,
            similar_days_k,
            vapid_private_key,
            vapid_contact,
        })
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            database_url: "postgres://localhost/flycast_test".to_string(),
            weather_api_base_url: "http://127.0.0.1:9/weather".to_string(),
            scorer_api_base_url: "http://127.0.0.1:9/scorer".to_string(),
            data_poll_interval_seconds: 3600,
            evaluation_interval_seconds: 1800,
            retention_sweep_interval_seconds: 86_400,
            forecast_horizon_days: 7,
            similar_days_k: 10,
            vapid_private_key: None,
            vapid_contact: "mailto:ops@flycast.local".to_string(),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_u64_falls_back_on_garbage() {
        std::env::set_var("FLYCAST_TEST_ENV_U64", "not-a-number");
        assert_eq!(env_u64("FLYCAST_TEST_ENV_U64", 42), 42);
        std::env::set_var("FLYCAST_TEST_ENV_U64", " 17 ");
        assert_eq!(env_u64("FLYCAST_TEST_ENV_U64", 42), 17);
        std::env::remove_var("FLYCAST_TEST_ENV_U64");
    }

    #[test]
    fn env_optional_string_treats_blank_as_missing() {
        std::env::set_var("FLYCAST_TEST_ENV_STR", "   ");
        assert_eq!(env_optional_string("FLYCAST_TEST_ENV_STR"), None);
        std::env::set_var("FLYCAST_TEST_ENV_STR", " value ");
        assert_eq!(
            env_optional_string("FLYCAST_TEST_ENV_STR").as_deref(),
            Some("value")
        );
        std::env::remove_var("FLYCAST_TEST_ENV_STR");
    }
}
