//! Connectivity probe
//!
//! Retries a check a bounded number of times with a fixed delay. Used after a
//! tunnel comes up to absorb the startup latency of the service behind it.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::{debug, error};

/// Retry configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (at least one is always made)
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Delay between failed attempts, in milliseconds
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

fn default_attempts() -> u32 {
    10
}

fn default_delay_ms() -> u64 {
    1000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            delay_ms: default_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// No sleeping between attempts (tests)
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            delay_ms: 0,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Run `check` until it succeeds, returning its value, or `None` once the
/// attempts are exhausted.
pub async fn retry<F, Fut, T, E>(policy: &RetryPolicy, mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = policy.attempts.max(1);

    for attempt in 1..=attempts {
        match check().await {
            Ok(value) => {
                debug!("Probe succeeded on attempt {}/{}", attempt, attempts);
                return Some(value);
            }
            Err(e) => {
                debug!("Probe attempt {}/{} failed: {}", attempt, attempts, e);
                if attempt < attempts {
                    tokio::time::sleep(policy.delay()).await;
                }
            }
        }
    }

    error!("Probe failed after {} attempts", attempts);
    None
}

/// True on the first successful `check`, false after exhausting the policy
pub async fn probe<F, Fut, T, E>(policy: &RetryPolicy, check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    retry(policy, check).await.is_some()
}

/// True once something accepts TCP connections on `host:port`
pub async fn probe_tcp(host: &str, port: u16, policy: &RetryPolicy) -> bool {
    probe(policy, || TcpStream::connect((host, port))).await
}
