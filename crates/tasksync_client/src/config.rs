//! Configuration for the sync client.

use crate::error::ClientResult;
use rand::Rng;
use std::time::Duration;
use url::Url;

/// Configuration for a sync client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the REST API (e.g. `https://tasks.example.com`).
    pub base_url: Url,
    /// URL of the change-notification socket.
    pub ws_url: Url,
    /// Reconnect behaviour of the transport.
    pub reconnect: ReconnectConfig,
    /// Timeout for a single REST request.
    pub request_timeout: Duration,
}

impl ClientConfig {
    /// Creates a configuration for a server base URL.
    ///
    /// The socket URL is derived from it: `http` becomes `ws`, `https`
    /// becomes `wss`, and the path is `/ws`.
    pub fn new(base_url: &str) -> ClientResult<Self> {
        let base_url = Url::parse(base_url)?;
        let mut ws_url = base_url.join("/ws")?;
        let scheme = if base_url.scheme() == "https" { "wss" } else { "ws" };
        // http(s) -> ws(s) is always a permitted scheme change.
        let _ = ws_url.set_scheme(scheme);

        Ok(Self {
            base_url,
            ws_url,
            reconnect: ReconnectConfig::default(),
            request_timeout: Duration::from_secs(30),
        })
    }

    /// Overrides the socket URL.
    pub fn with_ws_url(mut self, ws_url: Url) -> Self {
        self.ws_url = ws_url;
        self
    }

    /// Sets the reconnect configuration.
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Returns the absolute URL of an API path.
    pub fn endpoint(&self, path: &str) -> ClientResult<Url> {
        Ok(self.base_url.join(path)?)
    }
}

/// Configuration for reconnect behaviour.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive failed attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the first reconnect.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl ReconnectConfig {
    /// Creates a new reconnect configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration that never reconnects.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Returns true if another attempt is allowed after `failures` failures.
    pub fn allows(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }

    /// Calculates the delay before reconnect attempt `attempt` (1-indexed).
    ///
    /// Attempt 0 is the initial connect and has no delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter && delay_secs > 0.0 {
            // Up to 25% jitter so tabs that lost the server together spread out.
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_derives_socket_url() {
        let config = ClientConfig::new("https://tasks.example.com/app/").unwrap();
        assert_eq!(config.ws_url.as_str(), "wss://tasks.example.com/ws");

        let config = ClientConfig::new("http://127.0.0.1:8080")
            .unwrap()
            .with_request_timeout(Duration::from_secs(5));
        assert_eq!(config.ws_url.as_str(), "ws://127.0.0.1:8080/ws");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(
            config.endpoint("/api/tasks").unwrap().as_str(),
            "http://127.0.0.1:8080/api/tasks"
        );
    }

    #[test]
    fn invalid_base_url() {
        assert!(ClientConfig::new("not a url").is_err());
    }

    #[test]
    fn no_retry_allows_nothing() {
        let config = ReconnectConfig::no_retry();
        assert!(!config.allows(0));
        assert!(ReconnectConfig::new(2).allows(1));
        assert!(!ReconnectConfig::new(2).allows(2));
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let config = ReconnectConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn delay_with_jitter_stays_in_bounds() {
        let config = ReconnectConfig::new(5).with_initial_delay(Duration::from_millis(100));
        let delay = config.delay_for_attempt(1);
        assert!(delay >= Duration::from_millis(100));
        assert!(delay <= Duration::from_millis(125));
    }

    #[test]
    fn delay_respects_max() {
        let config = ReconnectConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0);

        let delay = config.delay_for_attempt(5);
        assert!(delay <= Duration::from_millis(6250)); // 5s + 25% jitter
    }
}
