//! Centralized configuration for courier.
//!
//! Constants hold the defaults; the option structs carry the values a caller
//! actually configures.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{CourierError, Result};

/// Remoting defaults shared by every transport.
pub struct RemotingConfig;

impl RemotingConfig {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_CONCURRENCY: usize = 1;
}

/// Queue broker limits and defaults.
pub struct BrokerConfig;

impl BrokerConfig {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 5680;
    pub const DEFAULT_REQUESTS_QUEUE: &'static str = "courier.requests";
    pub const DEFAULT_REPLIES_QUEUE: &'static str = "courier.replies";
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const MAX_CONNECTIONS: usize = 256;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Unacked limit for a transport's private reply queue.
    pub const REPLY_PREFETCH: u32 = 1024;
    pub const OUTBOUND_BUFFER: usize = 256;
}

/// Options every remoting setup recognizes.
#[derive(Debug, Clone)]
pub struct RemotingOptions {
    /// How long a caller waits for a correlated reply.
    pub timeout: Duration,
}

impl Default for RemotingOptions {
    fn default() -> Self {
        Self {
            timeout: RemotingConfig::DEFAULT_TIMEOUT,
        }
    }
}

impl RemotingOptions {
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(CourierError::Config {
                message: "timeout must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Options for [`crate::broker::BrokerTransport`].
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Address of the broker server.
    pub address: SocketAddr,
    /// Queue that carries requests to receivers.
    pub requests_queue: String,
    /// Prefix of the private reply queue each transport consumes.
    pub replies_queue: String,
    /// Number of requests a receiver handles at once.
    pub concurrency: usize,
    pub connect_timeout: Duration,
}

impl BrokerOptions {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            requests_queue: BrokerConfig::DEFAULT_REQUESTS_QUEUE.to_string(),
            replies_queue: BrokerConfig::DEFAULT_REPLIES_QUEUE.to_string(),
            concurrency: RemotingConfig::DEFAULT_CONCURRENCY,
            connect_timeout: BrokerConfig::CONNECT_TIMEOUT,
        }
    }

    pub fn requests_queue(mut self, name: impl Into<String>) -> Self {
        self.requests_queue = name.into();
        self
    }

    pub fn replies_queue(mut self, name: impl Into<String>) -> Self {
        self.replies_queue = name.into();
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.requests_queue.is_empty() || self.replies_queue.is_empty() {
            return Err(CourierError::Config {
                message: "queue names must not be empty".to_string(),
            });
        }
        if self.concurrency == 0 {
            return Err(CourierError::Config {
                message: "concurrency must be at least 1".to_string(),
            });
        }
        // Concurrency doubles as the broker prefetch, a u32 on the wire.
        if u32::try_from(self.concurrency).is_err() {
            return Err(CourierError::Config {
                message: format!("concurrency must be at most {}", u32::MAX),
            });
        }
        Ok(())
    }
}
