use std::time::Duration;

use crate::gateway::backoff::Backoff;
use crate::gateway::GatewayOptions;

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub url: String,
    pub token: Option<String>,
}

pub struct Config {
    pub port: u16,
    /// `None` runs the relay without an upstream connection.
    pub upstream: Option<UpstreamConfig>,
    pub webhook_secret: String,
    pub room_token_secret: String,
    pub webhook_max_skew_secs: u64,
    pub queue_max_size: usize,
    pub command_max_retries: u32,
    pub command_backoff_ms: u64,
    pub ack_timeout_ms: u64,
    pub max_reconnect_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let upstream = std::env::var("ACCORD_GATEWAY_URL")
            .ok()
            .filter(|url| !url.is_empty())
            .map(|url| UpstreamConfig {
                url,
                token: std::env::var("ACCORD_GATEWAY_TOKEN")
                    .ok()
                    .filter(|t| !t.is_empty()),
            });

        let webhook_secret =
            std::env::var("ACCORD_WEBHOOK_SECRET").expect("ACCORD_WEBHOOK_SECRET is required");
        let room_token_secret = std::env::var("ACCORD_ROOM_TOKEN_SECRET")
            .expect("ACCORD_ROOM_TOKEN_SECRET is required");

        let backoff_base_ms = env_or("ACCORD_BACKOFF_BASE_MS", 1000u64);

        Self {
            port: env_or("PORT", 39100),
            upstream,
            webhook_secret,
            room_token_secret,
            webhook_max_skew_secs: env_or("ACCORD_WEBHOOK_MAX_SKEW_SECS", 300),
            queue_max_size: env_or("ACCORD_QUEUE_MAX_SIZE", 100usize).clamp(2, 1000),
            command_max_retries: env_or("ACCORD_COMMAND_MAX_RETRIES", 3),
            command_backoff_ms: env_or("ACCORD_COMMAND_BACKOFF_MS", 500),
            ack_timeout_ms: env_or("ACCORD_ACK_TIMEOUT_MS", 10_000),
            max_reconnect_attempts: env_or("ACCORD_MAX_RECONNECT_ATTEMPTS", 10),
            backoff_base_ms,
            backoff_max_ms: env_or("ACCORD_BACKOFF_MAX_MS", 30_000u64).max(backoff_base_ms),
        }
    }

    /// Gateway options for the configured upstream, if any.
    pub fn gateway_options(&self) -> Option<GatewayOptions> {
        let upstream = self.upstream.as_ref()?;
        Some(GatewayOptions {
            url: upstream.url.clone(),
            link_token: upstream.token.clone(),
            queue_max_size: self.queue_max_size,
            command_max_retries: self.command_max_retries,
            command_backoff: Duration::from_millis(self.command_backoff_ms),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
            backoff: Backoff::new(
                Duration::from_millis(self.backoff_base_ms),
                Duration::from_millis(self.backoff_max_ms),
            ),
        })
    }
}
