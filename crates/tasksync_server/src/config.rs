//! Server configuration.

use crate::auth::AuthConfig;
use std::net::SocketAddr;
use std::time::Duration;

/// Secret used when none is configured. Only suitable for development.
pub const DEV_SECRET: &[u8] = b"dev-secret-change-in-production";

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Capacity of each connection's outbound queue.
    pub send_queue_capacity: usize,
    /// Interval between server pings.
    pub ping_period: Duration,
    /// How long a connection may stay silent before it is dropped.
    pub pong_wait: Duration,
    /// Deadline for a single outbound write.
    pub write_wait: Duration,
    /// Largest inbound WebSocket message accepted.
    pub max_message_size: usize,
    /// Secret key for access token signatures.
    pub auth_secret: Vec<u8>,
    /// Lifetime of access tokens.
    pub access_token_ttl: Duration,
    /// Lifetime of refresh tokens.
    pub refresh_token_ttl: Duration,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            send_queue_capacity: 256,
            ping_period: Duration::from_secs(54),
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            max_message_size: 512,
            auth_secret: DEV_SECRET.to_vec(),
            access_token_ttl: Duration::from_secs(15 * 60),
            refresh_token_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }

    /// Sets the outbound queue capacity per connection.
    pub fn with_send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity.max(1);
        self
    }

    /// Sets the keep-alive timings.
    ///
    /// `ping_period` must be shorter than `pong_wait`, otherwise healthy
    /// connections would time out between pings; it is clamped to 9/10 of
    /// `pong_wait`.
    pub fn with_keepalive(mut self, ping_period: Duration, pong_wait: Duration) -> Self {
        self.pong_wait = pong_wait;
        self.ping_period = ping_period.min(pong_wait.mul_f64(0.9));
        self
    }

    /// Sets the write deadline.
    pub fn with_write_wait(mut self, write_wait: Duration) -> Self {
        self.write_wait = write_wait;
        self
    }

    /// Sets the token signing secret.
    pub fn with_auth(mut self, secret: Vec<u8>) -> Self {
        self.auth_secret = secret;
        self
    }

    /// Sets the token lifetimes.
    pub fn with_token_ttl(mut self, access: Duration, refresh: Duration) -> Self {
        self.access_token_ttl = access;
        self.refresh_token_ttl = refresh;
        self
    }

    /// Returns the access token settings.
    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig::new(self.auth_secret.clone()).with_expiry(self.access_token_ttl)
    }

    /// Returns true if the development secret is still in use.
    pub fn uses_dev_secret(&self) -> bool {
        self.auth_secret == DEV_SECRET
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 8080)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.send_queue_capacity, 256);
        assert_eq!(config.max_message_size, 512);
        assert!(config.ping_period < config.pong_wait);
        assert!(config.uses_dev_secret());
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new("0.0.0.0:9000".parse().unwrap())
            .with_send_queue_capacity(0)
            .with_keepalive(Duration::from_secs(30), Duration::from_secs(10))
            .with_auth(vec![1, 2, 3, 4]);

        assert_eq!(config.send_queue_capacity, 1);
        assert_eq!(config.pong_wait, Duration::from_secs(10));
        assert_eq!(config.ping_period, Duration::from_secs(9));
        assert!(!config.uses_dev_secret());
    }
}
