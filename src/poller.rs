// src/poller.rs
//! Per-source polling task.
//!
//! Each source gets its own task and owns its limiter/backoff state, so a
//! degraded source only ever slows itself down. A cycle is
//! `IDLE -> FETCHING -> (SUCCESS | ERROR) -> IDLE`; on success with new items
//! the raw log is rewritten first and the dedup cursor second, so a crash can
//! never leave the cursor pointing at an id that is not on disk.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::{Escalation, ScrapeGate};
use crate::dedup_index::{new_items_since, DedupIndex};
use crate::source::SharedSession;
use crate::status::{PollState, StatusBoard};
use crate::store::{self, DataLayout};
use crate::types::{RawItem, Source};

#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    pub min_scrape_interval: Duration,
    pub max_backoff: Duration,
    /// Consecutive errors before the coordinator is asked to rebuild the session.
    pub escalate_after: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_scrape_interval: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            escalate_after: 3,
        }
    }
}

/// Decimating limiter: a request inside the interval is dropped, not queued.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    min_interval: Duration,
    last: Option<Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last {
            if now.saturating_duration_since(last) < self.min_interval {
                return false;
            }
        }
        self.last = Some(now);
        true
    }
}

/// Consecutive-error counter with `min(base * 2^errors, max)` delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    errors: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            errors: 0,
        }
    }

    pub fn errors(&self) -> u32 {
        self.errors
    }

    /// Count a failure and return the pause before the next attempt.
    pub fn record_failure(&mut self) -> Duration {
        self.errors = self.errors.saturating_add(1);
        let factor = 1u32.checked_shl(self.errors).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }

    pub fn reset(&mut self) {
        self.errors = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Capture the full visible sequence and replace today's log.
    Initial,
    /// Capture only items above the dedup cursor and prepend them.
    Monitoring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    RateLimited,
    Suspended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Skipped(SkipReason),
    NoNew,
    Captured(usize),
    Failed { consecutive_errors: u32, backoff: Duration },
}

pub struct Poller {
    source: Source,
    session: SharedSession,
    index: Arc<DedupIndex>,
    layout: DataLayout,
    gate: Arc<ScrapeGate>,
    status: StatusBoard,
    escalations: Option<mpsc::Sender<Escalation>>,
    cfg: PollerConfig,
    limiter: RateLimiter,
    backoff: Backoff,
}

impl Poller {
    pub fn new(
        source: Source,
        session: SharedSession,
        index: Arc<DedupIndex>,
        layout: DataLayout,
        gate: Arc<ScrapeGate>,
        status: StatusBoard,
        cfg: PollerConfig,
    ) -> Self {
        status.register(&source.id, &source.label);
        Self {
            source,
            session,
            index,
            layout,
            gate,
            status,
            escalations: None,
            limiter: RateLimiter::new(cfg.min_scrape_interval),
            backoff: Backoff::new(cfg.min_scrape_interval, cfg.max_backoff),
            cfg,
        }
    }

    pub fn with_escalations(mut self, tx: mpsc::Sender<Escalation>) -> Self {
        self.escalations = Some(tx);
        self
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.backoff.errors()
    }

    /// One cycle. Never propagates errors: failures feed the backoff.
    pub async fn poll_once(&mut self, mode: PollMode) -> PollOutcome {
        let id = self.source.id.clone();

        // Held through fetch + write; the batch waits for it before starting.
        let gate = self.gate.clone();
        let Some(_cycle) = gate.try_begin_cycle() else {
            counter!("harvest_polls_skipped_total", "reason" => "suspended").increment(1);
            return PollOutcome::Skipped(SkipReason::Suspended);
        };
        if mode == PollMode::Monitoring && !self.limiter.try_acquire(Instant::now()) {
            counter!("harvest_polls_skipped_total", "reason" => "rate_limited").increment(1);
            return PollOutcome::Skipped(SkipReason::RateLimited);
        }

        self.status.set_state(&id, PollState::Fetching);
        counter!("harvest_polls_total", "source" => id.clone()).increment(1);

        match self.capture(mode).await {
            Ok(n) => {
                self.backoff.reset();
                self.status.record_success(&id, n);
                if n == 0 {
                    PollOutcome::NoNew
                } else {
                    counter!("harvest_new_items_total", "source" => id.clone()).increment(n as u64);
                    info!(target: "poller", source = %id, label = %self.source.label, new = n, ?mode, "captured items");
                    PollOutcome::Captured(n)
                }
            }
            Err(e) => {
                let delay = self.backoff.record_failure();
                let errors = self.backoff.errors();
                let msg = format!("{e:#}");
                counter!("harvest_poll_errors_total", "source" => id.clone()).increment(1);
                self.status.record_failure(&id, errors, &msg);
                warn!(
                    target: "poller",
                    source = %id,
                    attempt = errors,
                    error = %msg,
                    backoff_ms = delay.as_millis() as u64,
                    "poll failed, backing off"
                );
                self.maybe_escalate(errors);
                PollOutcome::Failed {
                    consecutive_errors: errors,
                    backoff: delay,
                }
            }
        }
    }

    fn maybe_escalate(&self, errors: u32) {
        let every = self.cfg.escalate_after.max(1);
        if errors % every != 0 {
            return;
        }
        if let Some(tx) = &self.escalations {
            let ev = Escalation {
                source_id: self.source.id.clone(),
                consecutive_errors: errors,
            };
            // A full queue means a rebuild is already pending.
            if tx.try_send(ev).is_err() {
                debug!(target: "poller", source = %self.source.id, "escalation queue full, skipping");
            }
        }
    }

    async fn capture(&mut self, mode: PollMode) -> Result<usize> {
        let id = &self.source.id;
        let head = self.session.fetch_head(id).await?;
        let Some(head_id) = head.first().map(|it| it.id.clone()) else {
            return Ok(0);
        };

        let date = store::today();
        let path = self.layout.raw_log(&date, id);

        let (log, captured) = match mode {
            PollMode::Initial => {
                let n = head.len();
                (head, n)
            }
            PollMode::Monitoring => {
                let last = self.index.last_seen(id).await;
                let fresh = new_items_since(head, last.as_deref());
                if fresh.is_empty() {
                    return Ok(0);
                }
                let existing: Vec<RawItem> = store::read_json_opt(&path)
                    .await
                    .with_context(|| format!("loading raw log for source {id}"))?
                    .unwrap_or_default();
                merge_newest_first(fresh, existing)
            }
        };

        store::write_json_atomic(&path, &log)
            .await
            .with_context(|| format!("writing raw log for source {id}"))?;
        self.index
            .advance(id, &head_id)
            .await
            .with_context(|| format!("advancing cursor for source {id}"))?;
        Ok(captured)
    }

    /// Poll until `shutdown` fires. An in-flight cycle always runs to completion.
    pub async fn run(mut self, initial: bool, shutdown: CancellationToken) {
        let mut mode = if initial {
            PollMode::Initial
        } else {
            PollMode::Monitoring
        };
        info!(target: "poller", source = %self.source.id, label = %self.source.label, "poller started");

        while !shutdown.is_cancelled() {
            let outcome = self.poll_once(mode).await;
            let pause = match outcome {
                PollOutcome::Failed { backoff, .. } => backoff,
                PollOutcome::Captured(_) | PollOutcome::NoNew => {
                    mode = PollMode::Monitoring;
                    self.cfg.min_scrape_interval
                }
                PollOutcome::Skipped(_) => self.cfg.min_scrape_interval,
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        info!(target: "poller", source = %self.source.id, "poller stopped");
    }
}

/// Prepend `fresh` to `existing`, dropping ids the log already holds.
/// Returns the merged log and how many items were actually added.
fn merge_newest_first(fresh: Vec<RawItem>, existing: Vec<RawItem>) -> (Vec<RawItem>, usize) {
    let known: HashSet<&str> = existing.iter().map(|it| it.id.as_str()).collect();
    let mut seen = HashSet::new();
    let added: Vec<RawItem> = fresh
        .into_iter()
        .filter(|it| !known.contains(it.id.as_str()) && seen.insert(it.id.clone()))
        .collect();
    let n = added.len();
    let mut log = added;
    log.extend(existing);
    (log, n)
}

/// Spawn one independent task per source.
#[allow(clippy::too_many_arguments)]
pub fn spawn_pollers(
    sources: &[Source],
    session: &SharedSession,
    index: &Arc<DedupIndex>,
    layout: &DataLayout,
    gate: &Arc<ScrapeGate>,
    status: &StatusBoard,
    escalations: &mpsc::Sender<Escalation>,
    cfg: PollerConfig,
    shutdown: &CancellationToken,
) -> JoinSet<()> {
    let mut set = JoinSet::new();
    for src in sources {
        let poller = Poller::new(
            src.clone(),
            session.clone(),
            index.clone(),
            layout.clone(),
            gate.clone(),
            status.clone(),
            cfg,
        )
        .with_escalations(escalations.clone());
        set.spawn(poller.run(true, shutdown.clone()));
    }
    set
}
