//! Alert notifications.
//!
//! The retry loop escalates repeated failures, and announces recovery,
//! through [`Notifier`]. The default implementation writes to the log; a
//! deployment wires a real channel (pager, chat webhook) behind the same
//! trait.

use async_trait::async_trait;
use tracing::{error, info};

/// A channel for operator-facing notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// An operation keeps failing and needs attention.
    async fn alert(&self, subject: &str, body: &str);

    /// A previously-failing operation succeeded again.
    async fn recovered(&self, subject: &str, body: &str);
}

/// Notifier that writes alerts to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn alert(&self, subject: &str, body: &str) {
        error!(subject, "ALERT: {body}");
    }

    async fn recovered(&self, subject: &str, body: &str) {
        info!(subject, "Recovered: {body}");
    }
}
