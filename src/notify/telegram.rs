// src/notify/telegram.rs
//! Telegram Bot API delivery (`sendMessage`, HTML parse mode).
//!
//! The plain-text rollup is re-rendered line by line:
//! - `"<date> - <category> Rollup"` → underlined bold italic
//! - subcategory header (ends with its emoji) → underlined bold, emoji kept
//! - `"author: summary"` followed by a URL line → bold author, linked summary
//!
//! Everything user-supplied is HTML-escaped.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::Notifier;
use crate::error::HarvestError;

pub const ENV_BOT_TOKEN: &str = "TELEGRAM_BOT_TOKEN";

const SERVICE: &str = "telegram";

#[derive(Clone)]
pub struct TelegramNotifier {
    api_base: String,
    token: String,
    client: Client,
}

impl TelegramNotifier {
    pub fn new(api_base: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("building telegram http client")?;
        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
            client,
        })
    }

    /// `None` when `TELEGRAM_BOT_TOKEN` is not set.
    pub fn from_env(api_base: &str, timeout: Duration) -> Result<Option<Self>> {
        match std::env::var(ENV_BOT_TOKEN) {
            Ok(t) if !t.trim().is_empty() => Self::new(api_base, t.trim(), timeout).map(Some),
            _ => Ok(None),
        }
    }
}

#[derive(Deserialize)]
struct ApiReply {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

#[async_trait::async_trait]
impl Notifier for TelegramNotifier {
    async fn deliver(&self, destination: &str, text: &str) -> Result<bool> {
        if destination.trim().is_empty() {
            warn!(target: "deliver", "empty telegram destination, skipping");
            return Ok(false);
        }
        let body = json!({
            "chat_id": destination,
            "text": render_html(text),
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.token);

        let rsp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| HarvestError::ExternalService {
                service: SERVICE,
                // reqwest errors embed the URL, which carries the token
                message: format!("request failed: {}", e.without_url()),
            })?;

        let status = rsp.status();
        let reply: Option<ApiReply> = rsp.json().await.ok();

        // 400/403 from the Bot API: bad chat id or bot not in channel.
        if status == reqwest::StatusCode::BAD_REQUEST || status == reqwest::StatusCode::FORBIDDEN {
            let why = reply.and_then(|r| r.description).unwrap_or_default();
            warn!(target: "deliver", destination, %status, reason = %why, "telegram rejected message");
            return Ok(false);
        }
        if !status.is_success() {
            return Err(HarvestError::ExternalService {
                service: SERVICE,
                message: format!("HTTP {status}"),
            }
            .into());
        }
        match reply {
            Some(r) if r.ok => {
                info!(target: "deliver", destination, "message sent");
                Ok(true)
            }
            Some(r) => Err(HarvestError::ExternalService {
                service: SERVICE,
                message: r.description.unwrap_or_else(|| "ok=false".into()),
            }
            .into()),
            None => Err(HarvestError::ExternalService {
                service: SERVICE,
                message: "malformed response".into(),
            }
            .into()),
        }
    }

    fn name(&self) -> &'static str {
        "telegram"
    }
}

fn looks_like_url(line: &str) -> bool {
    let l = line.trim();
    (l.starts_with("http://") || l.starts_with("https://")) && !l.contains(' ')
}

fn is_header(line: &str) -> bool {
    line.contains(" - ") && line.trim_end().ends_with("Rollup")
}

/// A subcategory header is a short line whose last token is not alphanumeric
/// (the emoji) and that is not an `author: summary` line.
fn is_subcategory(line: &str) -> bool {
    let last = line.trim_end().chars().last();
    matches!(last, Some(c) if !c.is_alphanumeric() && !c.is_ascii_punctuation())
        && !line.contains(": ")
}

pub fn render_html(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let mut out = Vec::with_capacity(lines.len());
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        if line.trim().is_empty() {
            out.push(String::new());
        } else if is_header(line) {
            out.push(format!(
                "<u><b><i>{}</i></b></u>",
                html_escape::encode_text(line.trim())
            ));
        } else if let Some((author, summary)) = line.split_once(": ").filter(|_| {
            lines.get(i + 1).is_some_and(|next| looks_like_url(next))
        }) {
            let url = lines[i + 1].trim();
            out.push(format!(
                "<b>{}</b>: <a href=\"{}\">{}</a>",
                html_escape::encode_text(author.trim()),
                html_escape::encode_double_quoted_attribute(url),
                html_escape::encode_text(summary.trim())
            ));
            i += 1;
        } else if is_subcategory(line) {
            out.push(format!("<u><b>{}</b></u>", html_escape::encode_text(line.trim())));
        } else {
            out.push(html_escape::encode_text(line).into_owned());
        }
        i += 1;
    }

    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_rollup_sections() {
        let text = "20250101 - DefAI Rollup\n\nTreasury 💰\nalice: <b>grant</b> & more\nhttps://x.com/alice/status/1\n\nOther Updates 📌\nbob: misc\nhttps://x.com/bob/status/2";
        let html = render_html(text);
        let lines: Vec<&str> = html.lines().collect();
        assert_eq!(lines[0], "<u><b><i>20250101 - DefAI Rollup</i></b></u>");
        assert_eq!(lines[1], "");
        assert_eq!(lines[2], "<u><b>Treasury 💰</b></u>");
        assert_eq!(
            lines[3],
            "<b>alice</b>: <a href=\"https://x.com/alice/status/1\">&lt;b&gt;grant&lt;/b&gt; &amp; more</a>"
        );
        // URL line folded into the link.
        assert_eq!(lines[4], "");
        assert_eq!(lines[5], "<u><b>Other Updates 📌</b></u>");
        assert_eq!(lines.len(), 7);
    }

    #[test]
    fn author_line_without_url_is_escaped_verbatim() {
        assert_eq!(render_html("note: a < b"), "note: a &lt; b");
    }
}
