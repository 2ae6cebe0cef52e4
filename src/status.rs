// src/status.rs
//! Shared, read-mostly view of poller health for `/status` and the logs.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    Idle,
    Fetching,
    BackingOff,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub label: String,
    pub state: PollState,
    pub consecutive_errors: u32,
    pub items_captured: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorTotals {
    pub started_at: DateTime<Utc>,
    pub total_checks: u64,
    pub total_new_items: u64,
    pub total_errors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub totals: MonitorTotals,
    pub sources: BTreeMap<String, SourceStatus>,
}

#[derive(Debug)]
struct Board {
    totals: MonitorTotals,
    sources: BTreeMap<String, SourceStatus>,
}

#[derive(Debug, Clone)]
pub struct StatusBoard {
    inner: Arc<RwLock<Board>>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Board {
                totals: MonitorTotals {
                    started_at: Utc::now(),
                    total_checks: 0,
                    total_new_items: 0,
                    total_errors: 0,
                },
                sources: BTreeMap::new(),
            })),
        }
    }

    pub fn register(&self, id: &str, label: &str) {
        let mut b = self.inner.write().expect("status board poisoned");
        b.sources.entry(id.to_string()).or_insert_with(|| SourceStatus {
            label: label.to_string(),
            state: PollState::Idle,
            consecutive_errors: 0,
            items_captured: 0,
            last_success: None,
            last_error: None,
        });
    }

    pub fn set_state(&self, id: &str, state: PollState) {
        let mut b = self.inner.write().expect("status board poisoned");
        if let Some(s) = b.sources.get_mut(id) {
            s.state = state;
        }
    }

    pub fn record_success(&self, id: &str, new_items: usize) {
        let mut b = self.inner.write().expect("status board poisoned");
        b.totals.total_checks += 1;
        b.totals.total_new_items += new_items as u64;
        if let Some(s) = b.sources.get_mut(id) {
            s.state = PollState::Idle;
            s.consecutive_errors = 0;
            s.items_captured += new_items as u64;
            s.last_success = Some(Utc::now());
        }
    }

    pub fn record_failure(&self, id: &str, consecutive_errors: u32, error: &str) {
        let mut b = self.inner.write().expect("status board poisoned");
        b.totals.total_checks += 1;
        b.totals.total_errors += 1;
        if let Some(s) = b.sources.get_mut(id) {
            s.state = PollState::BackingOff;
            s.consecutive_errors = consecutive_errors;
            s.last_error = Some(error.to_string());
        }
    }

    pub fn get(&self, id: &str) -> Option<SourceStatus> {
        let b = self.inner.read().expect("status board poisoned");
        b.sources.get(id).cloned()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let b = self.inner.read().expect("status board poisoned");
        StatusSnapshot {
            totals: b.totals.clone(),
            sources: b.sources.clone(),
        }
    }
}
