use std::time::Duration;

/// A STUN or TURN server used for connectivity discovery.
#[derive(Debug, Clone)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: username.into(),
            credential: credential.into(),
        }
    }
}

/// Configuration for the client connection core.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Base URL of the relay, e.g. `http://localhost:8080`.
    pub relay_url: String,
    pub ice_servers: Vec<IceServer>,
    /// Health sweep period for the connection monitor.
    pub sweep_interval: Duration,
    /// Consecutive unacknowledged heartbeats before a peer is marked failed.
    pub heartbeat_failure_threshold: u32,
    /// How long a `disconnected` peer may linger before escalating to failed.
    /// Defaults to twice the sweep interval.
    pub disconnect_grace: Duration,
    /// First reconnect delay; subsequent attempts multiply by `backoff_factor`.
    pub backoff_base: Duration,
    pub backoff_factor: f64,
    pub backoff_max_attempts: u32,
    /// Poll period for the HTTP fallback transport profile.
    pub poll_interval: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        let sweep_interval = Duration::from_secs(3);
        // LANTERN_LOCALHOST_ONLY skips STUN for loopback-only test setups.
        let ice_servers = if std::env::var("LANTERN_LOCALHOST_ONLY").is_ok() {
            vec![]
        } else {
            vec![IceServer::stun("stun:stun.l.google.com:19302")]
        };

        Self {
            relay_url: "http://localhost:8080".to_string(),
            ice_servers,
            sweep_interval,
            heartbeat_failure_threshold: 3,
            disconnect_grace: sweep_interval * 2,
            backoff_base: Duration::from_secs(1),
            backoff_factor: 1.5,
            backoff_max_attempts: 5,
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl MeshConfig {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            ..Default::default()
        }
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self.disconnect_grace = interval * 2;
        self
    }

    pub fn add_ice_server(mut self, server: IceServer) -> Self {
        self.ice_servers.push(server);
        self
    }

    pub fn backoff(mut self, base: Duration, factor: f64, max_attempts: u32) -> Self {
        self.backoff_base = base;
        self.backoff_factor = factor;
        self.backoff_max_attempts = max_attempts;
        self
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        self.backoff_base.mul_f64(factor)
    }
}
