//! Keep-alive monitor
//!
//! A client that negotiated keep-alive `k` seconds is considered gone after
//! `1.5 * k` seconds without any inbound packet. `k = 0` disables the check.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct KeepAlive {
    timeout: Option<Duration>,
    deadline: Instant,
}

impl KeepAlive {
    pub fn new(keep_alive_secs: u16) -> Self {
        let timeout =
            (keep_alive_secs > 0).then(|| Duration::from_millis(u64::from(keep_alive_secs) * 1500));
        let mut monitor = Self {
            timeout,
            deadline: Instant::now(),
        };
        monitor.reset();
        monitor
    }

    /// Grace period, `None` when disabled
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Inbound traffic seen: push the deadline out
    pub fn reset(&mut self) {
        if let Some(timeout) = self.timeout {
            self.deadline = Instant::now() + timeout;
        }
    }

    /// Resolves once the deadline passes. Never resolves when disabled.
    pub async fn expired(&self) {
        match self.timeout {
            Some(_) => tokio::time::sleep_until(self.deadline).await,
            None => std::future::pending::<()>().await,
        }
    }
}
