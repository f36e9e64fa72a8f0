//! 환경 변수 기반 설정 관리

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// 릴레이 서버 + 세션 엔진 설정
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub host: String,
    pub cors_origins: Vec<String>,
    pub room: RoomConfig,
    pub engine: EngineConfig,
    pub log_level: String,
}

/// 방 설정
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub max_size: usize,
    pub timeout_ms: u64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_size: 256,
            timeout_ms: 3_600_000,
        }
    }
}

/// 세션 엔진 설정 (하트비트, 재연결, 입장 확인)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub reconnect_max_attempts: u32,
    pub reconnect_backoff_base: Duration,
    pub reconnect_backoff_cap: Duration,
    /// room-joined 확인을 기다리는 최대 시간
    pub join_confirm_timeout: Duration,
    /// 중복 시그널 지문 캐시 크기
    pub dedup_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            reconnect_max_attempts: 5,
            reconnect_backoff_base: Duration::from_secs(2),
            reconnect_backoff_cap: Duration::from_secs(30),
            join_confirm_timeout: Duration::from_secs(3),
            dedup_capacity: 64,
        }
    }
}

impl EngineConfig {
    /// 환경 변수에서 엔진 설정 로드
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            heartbeat_interval: env_millis("HEARTBEAT_INTERVAL_MS", defaults.heartbeat_interval),
            heartbeat_timeout: env_millis("HEARTBEAT_TIMEOUT_MS", defaults.heartbeat_timeout),
            reconnect_max_attempts: env_parse(
                "RECONNECT_MAX_ATTEMPTS",
                defaults.reconnect_max_attempts,
            ),
            reconnect_backoff_base: env_millis(
                "RECONNECT_BACKOFF_BASE_MS",
                defaults.reconnect_backoff_base,
            ),
            reconnect_backoff_cap: env_millis(
                "RECONNECT_BACKOFF_CAP_MS",
                defaults.reconnect_backoff_cap,
            ),
            join_confirm_timeout: env_millis(
                "JOIN_CONFIRM_TIMEOUT_MS",
                defaults.join_confirm_timeout,
            ),
            dedup_capacity: env_parse("DEDUP_CAPACITY", defaults.dedup_capacity).max(1),
        }
    }
}

impl Config {
    /// 환경 변수에서 설정 로드
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let room_defaults = RoomConfig::default();

        Self {
            port: env_parse("PORT", 5502),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            cors_origins: env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3500".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            room: RoomConfig {
                max_size: env_parse("MAX_ROOM_SIZE", room_defaults.max_size),
                timeout_ms: env_parse("ROOM_TIMEOUT", room_defaults.timeout_ms),
            },
            engine: EngineConfig::from_env(),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5502,
            host: "0.0.0.0".to_string(),
            cors_origins: vec!["http://localhost:3500".to_string()],
            room: RoomConfig::default(),
            engine: EngineConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_defaults_match_liveness_constants() {
        let config = EngineConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.heartbeat_timeout, 3 * config.heartbeat_interval);
        assert_eq!(config.reconnect_max_attempts, 5);
        assert_eq!(config.reconnect_backoff_base, Duration::from_secs(2));
        assert_eq!(config.reconnect_backoff_cap, Duration::from_secs(30));
    }

    #[test]
    fn unparseable_values_fall_back_to_defaults() {
        env::set_var("PONSWARP_TEST_BAD_NUMBER", "not-a-number");
        assert_eq!(env_parse("PONSWARP_TEST_BAD_NUMBER", 7u32), 7);
        assert_eq!(
            env_millis("PONSWARP_TEST_BAD_NUMBER", Duration::from_millis(10)),
            Duration::from_millis(10)
        );

        env::set_var("PONSWARP_TEST_GOOD_MILLIS", "250");
        assert_eq!(
            env_millis("PONSWARP_TEST_GOOD_MILLIS", Duration::ZERO),
            Duration::from_millis(250)
        );
    }
}
