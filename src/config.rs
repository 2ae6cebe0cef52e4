// src/config.rs
//! Process configuration.
//!
//! Lookup order:
//! 1) `$HARVEST_CONFIG_PATH` (must exist when set)
//! 2) `config/harvest.toml`
//! 3) built-in defaults
//!
//! Every section is optional. Out-of-range numbers are sanitised back to
//! their defaults instead of failing the load. Secrets never live here; they
//! are read from the environment by the collaborators that need them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::categories::CategoryMap;
use crate::poller::PollerConfig;
use crate::retry::RetryPolicy;

pub const ENV_CONFIG_PATH: &str = "HARVEST_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/harvest.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub data: DataSection,
    pub source: SourceSection,
    pub poller: PollerSection,
    pub retry: RetrySection,
    pub batch: BatchSection,
    pub classifier: ClassifierSection,
    pub notifier: NotifierSection,
    pub api: ApiSection,
    /// source id → category name (merged over the built-in seed)
    pub categories: BTreeMap<String, String>,
    /// category name → destination id (merged over the built-in seed)
    pub destinations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSection {
    pub root: PathBuf,
}

impl Default for DataSection {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSection {
    /// Automation sidecar; `SOURCE_ADAPTER_URL` wins when set.
    pub adapter_url: String,
    pub startup_attempts: u32,
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            adapter_url: "http://127.0.0.1:9400".into(),
            startup_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerSection {
    pub min_scrape_interval_ms: u64,
    pub max_backoff_ms: u64,
    pub fetch_timeout_ms: u64,
    pub escalate_after: u32,
    pub grace_period_ms: u64,
}

impl Default for PollerSection {
    fn default() -> Self {
        Self {
            min_scrape_interval_ms: 100,
            max_backoff_ms: 5_000,
            fetch_timeout_ms: 30_000,
            escalate_after: 3,
            grace_period_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSection {
    /// "HH:MM", UTC.
    pub daily_at: String,
    pub process_previous_day: bool,
    pub confidence_gate: f32,
    pub strict_confidence_gate: f32,
    /// Scored items at or below this relevance are dropped.
    pub min_relevance: f32,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            daily_at: "00:05".into(),
            process_previous_day: true,
            confidence_gate: 0.9,
            strict_confidence_gate: 0.95,
            min_relevance: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSection {
    pub base_url: String,
    pub model: String,
    pub timeout_ms: u64,
}

impl Default for ClassifierSection {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepseek.com/v1".into(),
            model: "deepseek-chat".into(),
            timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierSection {
    pub api_base: String,
    pub timeout_ms: u64,
}

impl Default for NotifierSection {
    fn default() -> Self {
        Self {
            api_base: "https://api.telegram.org".into(),
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    pub bind: String,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".into(),
        }
    }
}

impl AppConfig {
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: AppConfig = toml::from_str(s)?;
        Ok(cfg.sanitized())
    }

    /// Env path, then the default path, then built-ins.
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
            }
            return Self::load_from(&pb);
        }
        let default = PathBuf::from(DEFAULT_CONFIG_PATH);
        if default.exists() {
            return Self::load_from(&default);
        }
        Ok(Self::default())
    }

    fn sanitized(mut self) -> Self {
        let p = PollerSection::default();
        if self.poller.min_scrape_interval_ms == 0 {
            self.poller.min_scrape_interval_ms = p.min_scrape_interval_ms;
        }
        if self.poller.max_backoff_ms < self.poller.min_scrape_interval_ms {
            self.poller.max_backoff_ms = self.poller.min_scrape_interval_ms;
        }
        if self.poller.fetch_timeout_ms == 0 {
            self.poller.fetch_timeout_ms = p.fetch_timeout_ms;
        }
        self.poller.escalate_after = self.poller.escalate_after.max(1);

        self.retry.max_attempts = self.retry.max_attempts.max(1);
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            std::mem::swap(&mut self.retry.max_delay_ms, &mut self.retry.base_delay_ms);
        }

        let b = BatchSection::default();
        if !(0.0..=1.0).contains(&self.batch.confidence_gate) {
            self.batch.confidence_gate = b.confidence_gate;
        }
        if !(0.0..=1.0).contains(&self.batch.strict_confidence_gate) {
            self.batch.strict_confidence_gate = b.strict_confidence_gate;
        }
        if self.batch.strict_confidence_gate < self.batch.confidence_gate {
            self.batch.strict_confidence_gate = self.batch.confidence_gate;
        }
        if !(0.0..=1.0).contains(&self.batch.min_relevance) {
            self.batch.min_relevance = b.min_relevance;
        }
        if parse_daily_at(&self.batch.daily_at).is_none() {
            self.batch.daily_at = b.daily_at;
        }

        self.source.startup_attempts = self.source.startup_attempts.max(1);
        if self.classifier.timeout_ms == 0 {
            self.classifier.timeout_ms = ClassifierSection::default().timeout_ms;
        }
        if self.notifier.timeout_ms == 0 {
            self.notifier.timeout_ms = NotifierSection::default().timeout_ms;
        }
        self
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            min_scrape_interval: Duration::from_millis(self.poller.min_scrape_interval_ms),
            max_backoff: Duration::from_millis(self.poller.max_backoff_ms),
            escalate_after: self.poller.escalate_after,
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.poller.fetch_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.poller.grace_period_ms)
    }

    pub fn stage_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
        )
    }

    pub fn daily_at(&self) -> NaiveTime {
        parse_daily_at(&self.batch.daily_at).unwrap_or_else(|| NaiveTime::from_hms_opt(0, 5, 0).unwrap_or_default())
    }

    pub fn category_map(&self) -> CategoryMap {
        CategoryMap::default_seed().with_overrides(&self.categories, &self.destinations)
    }

    pub fn adapter_url(&self) -> String {
        std::env::var("SOURCE_ADAPTER_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| self.source.adapter_url.clone())
    }
}

fn parse_daily_at(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}
