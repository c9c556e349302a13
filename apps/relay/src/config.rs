use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: String,
    /// TTL for offline presence documents persisted in Redis.
    pub presence_ttl_seconds: u64,
    /// Sockets silent for longer than this are reaped by the heartbeat
    /// monitor.
    pub heartbeat_timeout_seconds: u64,
    /// Voice participants idle for longer than this are reaped.
    pub voice_idle_minutes: i64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("LANTERN_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            presence_ttl_seconds: env::var("LANTERN_PRESENCE_TTL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(86400),
            heartbeat_timeout_seconds: env::var("LANTERN_HEARTBEAT_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(600),
            voice_idle_minutes: env::var("LANTERN_VOICE_IDLE_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            redis_url: "redis://localhost:6379".to_string(),
            presence_ttl_seconds: 86400,
            heartbeat_timeout_seconds: 600,
            voice_idle_minutes: 30,
        }
    }
}
