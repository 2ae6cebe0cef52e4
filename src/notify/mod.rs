// src/notify/mod.rs
pub mod telegram;

use anyhow::Result;

pub use telegram::TelegramNotifier;

/// Outbound delivery of a finished rollup.
///
/// `Ok(false)` means the channel refused the message in a way retrying will
/// not fix (unknown destination, disabled channel); transport errors are `Err`.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, destination: &str, text: &str) -> Result<bool>;
    fn name(&self) -> &'static str;
}

/// Writes the rollup to the log instead of sending it. Used when no bot token
/// is configured.
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, destination: &str, text: &str) -> Result<bool> {
        tracing::info!(target: "deliver", destination, lines = text.lines().count(), "notifier disabled, rollup logged only");
        tracing::debug!(target: "deliver", destination, %text);
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
