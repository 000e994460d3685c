use super::error::AppError;
use std::time::Duration;

/// Reconnect backoff policy: delay after attempt k is `base * multiplier^(k-1)`,
/// capped at `max_attempts` total attempts per epoch.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    pub base: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            multiplier: 1.5,
            max_attempts: 10,
        }
    }
}

impl BackoffConfig {
    /// Delay before reconnect attempt `k` (1-indexed): `base * multiplier^(k-1)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(self.base.as_secs_f64() * factor)
    }
}

/// Thresholds the Connection health timer checks every 60s.
#[derive(Clone, Debug)]
pub struct HealthConfig {
    pub max_frame_silence: Duration,
    pub max_pong_silence: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_frame_silence: Duration::from_secs(5 * 60),
            max_pong_silence: Duration::from_secs(2 * 60),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,
    pub database_url: String,

    /// Vendor streaming endpoint (wss://...).
    pub upstream_url: String,
    pub api_key: String,
    pub client_code: String,
    /// Passed through to the external session issuer; this core never
    /// derives a TOTP itself.
    pub totp_seed: Option<String>,

    pub kv_host: String,
    pub kv_port: u16,
    pub kv_db: i64,
    pub kv_password: Option<String>,

    pub backoff: BackoffConfig,
    pub health: HealthConfig,
    pub ping_interval: Duration,
    pub data_request_interval: Duration,
    pub buffer_scavenge_interval: Duration,
    pub resubscribe_on_307_delay: Duration,
    pub connect_timeout: Duration,
    pub auth_timeout: Duration,
    /// Window within which 3 consecutive authentication rejections make the
    /// Connection surface an unrecoverable error instead of retrying (§7, kind 2).
    pub auth_rejection_window: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let server_addr = std::env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".into());
        let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".into());
            let port = std::env::var("PGPORT").unwrap_or_else(|_| "5432".into());
            let db = std::env::var("PGDATABASE").unwrap_or_else(|_| "marketfeed".into());
            let user = std::env::var("PGUSER").unwrap_or_else(|_| "marketfeed".into());
            let pass = std::env::var("PGPASSWORD").unwrap_or_else(|_| "".into());
            let sslmode = std::env::var("PGSSLMODE").ok();

            let mut parts = vec![
                format!("host={host}"),
                format!("port={port}"),
                format!("dbname={db}"),
                format!("user={user}"),
            ];
            if !pass.is_empty() {
                parts.push(format!("password={pass}"));
            }
            if let Some(sslmode) = sslmode {
                parts.push(format!("sslmode={sslmode}"));
            }
            parts.join(" ")
        });

        let upstream_url = std::env::var("FEED_UPSTREAM_URL")
            .unwrap_or_else(|_| "wss://smartapisocket.vendor.example/smart-stream".into());
        let api_key = std::env::var("FEED_API_KEY").map_err(|_| AppError::MissingEnv("FEED_API_KEY"))?;
        let client_code =
            std::env::var("FEED_CLIENT_CODE").map_err(|_| AppError::MissingEnv("FEED_CLIENT_CODE"))?;
        let totp_seed = std::env::var("FEED_TOTP_SEED").ok().filter(|s| !s.is_empty());

        let kv_host = std::env::var("KV_HOST").unwrap_or_else(|_| "127.0.0.1".into());
        let kv_port = std::env::var("KV_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(6379);
        let kv_db = std::env::var("KV_DB")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let kv_password = std::env::var("KV_PASSWORD").ok().filter(|s| !s.is_empty());

        let backoff = BackoffConfig {
            base: Duration::from_secs(env_u64("FEED_RECONNECT_BASE_SECS").unwrap_or(5)),
            multiplier: env_f64("FEED_RECONNECT_MULTIPLIER").unwrap_or(1.5),
            max_attempts: env_u64("FEED_RECONNECT_MAX_ATTEMPTS").unwrap_or(10) as u32,
        };
        let health = HealthConfig {
            max_frame_silence: Duration::from_secs(env_u64("FEED_HEALTH_MAX_FRAME_SILENCE_SECS").unwrap_or(300)),
            max_pong_silence: Duration::from_secs(env_u64("FEED_HEALTH_MAX_PONG_SILENCE_SECS").unwrap_or(120)),
        };

        Ok(Self {
            server_addr,
            database_url,
            upstream_url,
            api_key,
            client_code,
            totp_seed,
            kv_host,
            kv_port,
            kv_db,
            kv_password,
            backoff,
            health,
            ping_interval: Duration::from_secs(30),
            data_request_interval: Duration::from_secs(60),
            buffer_scavenge_interval: Duration::from_secs(10),
            resubscribe_on_307_delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(5),
            auth_rejection_window: Duration::from_secs(
                env_u64("FEED_AUTH_REJECTION_WINDOW_SECS").unwrap_or(120),
            ),
        })
    }

    pub fn kv_url(&self) -> String {
        let auth = self
            .kv_password
            .as_deref()
            .map(|p| format!(":{p}@"))
            .unwrap_or_default();
        format!("redis://{auth}{}:{}/{}", self.kv_host, self.kv_port, self.kv_db)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backoff_matches_spec_policy() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.base, Duration::from_secs(5));
        assert_eq!(backoff.multiplier, 1.5);
        assert_eq!(backoff.max_attempts, 10);
    }

    #[test]
    fn delay_for_attempt_follows_5s_times_1_5_pow_k_minus_1() {
        let backoff = BackoffConfig::default();

        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs_f64(5.0));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs_f64(7.5));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs_f64(11.25));
        assert_eq!(
            backoff.delay_for_attempt(10),
            Duration::from_secs_f64(5.0 * 1.5f64.powi(9))
        );
    }

    #[test]
    fn delay_for_attempt_treats_zero_same_as_first_attempt() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.delay_for_attempt(0), backoff.delay_for_attempt(1));
    }

    #[test]
    fn default_health_thresholds_match_spec() {
        let health = HealthConfig::default();
        assert_eq!(health.max_frame_silence, Duration::from_secs(300));
        assert_eq!(health.max_pong_silence, Duration::from_secs(120));
    }

    #[test]
    fn kv_url_omits_auth_segment_without_password() {
        let config = AppConfig {
            server_addr: "127.0.0.1:8080".into(),
            database_url: String::new(),
            upstream_url: String::new(),
            api_key: String::new(),
            client_code: String::new(),
            totp_seed: None,
            kv_host: "127.0.0.1".into(),
            kv_port: 6379,
            kv_db: 0,
            kv_password: None,
            backoff: BackoffConfig::default(),
            health: HealthConfig::default(),
            ping_interval: Duration::from_secs(30),
            data_request_interval: Duration::from_secs(60),
            buffer_scavenge_interval: Duration::from_secs(10),
            resubscribe_on_307_delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(5),
            auth_rejection_window: Duration::from_secs(120),
        };
        assert_eq!(config.kv_url(), "redis://127.0.0.1:6379/0");
    }

    #[test]
    fn kv_url_includes_auth_segment_with_password() {
        let mut config_base = AppConfig {
            server_addr: "127.0.0.1:8080".into(),
            database_url: String::new(),
            upstream_url: String::new(),
            api_key: String::new(),
            client_code: String::new(),
            totp_seed: None,
            kv_host: "kv.internal".into(),
            kv_port: 6380,
            kv_db: 2,
            kv_password: Some("s3cret".into()),
            backoff: BackoffConfig::default(),
            health: HealthConfig::default(),
            ping_interval: Duration::from_secs(30),
            data_request_interval: Duration::from_secs(60),
            buffer_scavenge_interval: Duration::from_secs(10),
            resubscribe_on_307_delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(5),
            auth_rejection_window: Duration::from_secs(120),
        };
        assert_eq!(config_base.kv_url(), "redis://:s3cret@kv.internal:6380/2");
        config_base.kv_password = None;
        assert_eq!(config_base.kv_url(), "redis://kv.internal:6380/2");
    }
}
