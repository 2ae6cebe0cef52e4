// src/coordinator.rs
//! Live polling vs. the daily batch.
//!
//! `ScrapeGate` is the only state pollers and the batch share:
//! - `enabled` is checked before every poll cycle; a disabled gate skips the
//!   cycle instead of queueing it
//! - every poll cycle holds a read guard on `cycle` through fetch + write, and
//!   the batch takes the write guard, so it starts only after in-flight
//!   cycles have persisted and no raw-log write can happen while it runs
//!
//! The batch re-enables polling from `Drop`, so a failed, panicking or
//! cancelled batch never leaves polling switched off.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregate::Aggregator;
use crate::dedup_index::DedupIndex;
use crate::error::{ErrorKind, HarvestError};
use crate::poller::{spawn_pollers, PollerConfig};
use crate::retry::RetryPolicy;
use crate::source::SharedSession;
use crate::stages::{self, StageContext};
use crate::status::StatusBoard;
use crate::store::{self, DataLayout};
use crate::types::Source;

/// A poller asking for its session to be rebuilt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Escalation {
    pub source_id: String,
    pub consecutive_errors: u32,
}

#[derive(Debug)]
pub struct ScrapeGate {
    enabled: AtomicBool,
    cycle: RwLock<()>,
}

impl Default for ScrapeGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ScrapeGate {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            cycle: RwLock::new(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// `None` while a batch is pending or running.
    pub fn try_begin_cycle(&self) -> Option<RwLockReadGuard<'_, ()>> {
        if !self.is_enabled() {
            return None;
        }
        let guard = self.cycle.try_read().ok()?;
        // The batch may have flipped the flag between the check and the lock.
        self.is_enabled().then_some(guard)
    }

    /// Stop new cycles and wait for in-flight ones to finish.
    pub async fn suspend(&self) -> BatchWindow<'_> {
        self.enabled.store(false, Ordering::SeqCst);
        gauge!("harvest_scraping_enabled").set(0.0);
        info!(target: "batch", "scraping disabled, waiting for in-flight polls");
        let cycles = self.cycle.write().await;
        BatchWindow {
            gate: self,
            _cycles: cycles,
        }
    }
}

/// Exclusive batch window. Polling resumes when it is dropped.
pub struct BatchWindow<'a> {
    gate: &'a ScrapeGate,
    _cycles: RwLockWriteGuard<'a, ()>,
}

impl Drop for BatchWindow<'_> {
    fn drop(&mut self) {
        self.gate.enabled.store(true, Ordering::SeqCst);
        gauge!("harvest_scraping_enabled").set(1.0);
        info!(target: "batch", "scraping re-enabled");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Aggregate,
    Filter,
    Score,
    Refine,
    Categorize,
    Deliver,
}

impl Stage {
    pub const ORDER: [Stage; 6] = [
        Stage::Aggregate,
        Stage::Filter,
        Stage::Score,
        Stage::Refine,
        Stage::Categorize,
        Stage::Deliver,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Aggregate => "aggregate",
            Stage::Filter => "filter",
            Stage::Score => "score",
            Stage::Refine => "refine",
            Stage::Categorize => "categorize",
            Stage::Deliver => "deliver",
        }
    }

    pub fn kind(self) -> ErrorKind {
        match self {
            Stage::Aggregate | Stage::Refine => ErrorKind::DataProcessing,
            Stage::Filter | Stage::Score | Stage::Categorize => ErrorKind::Classification,
            Stage::Deliver => ErrorKind::Notification,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum BatchOutcome {
    Completed,
    Failed { stage: Stage, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchRecord {
    pub date: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages_completed: Vec<Stage>,
    pub outcome: BatchOutcome,
}

pub struct PipelineCoordinator {
    gate: Arc<ScrapeGate>,
    batch_lock: Arc<Mutex<()>>,
    aggregator: Aggregator,
    stages: StageContext,
    retry: RetryPolicy,
    session: SharedSession,
    status: StatusBoard,
    last_run: StdRwLock<Option<BatchRecord>>,
}

impl PipelineCoordinator {
    pub fn new(
        layout: DataLayout,
        stages: StageContext,
        retry: RetryPolicy,
        session: SharedSession,
        status: StatusBoard,
    ) -> Self {
        gauge!("harvest_scraping_enabled").set(1.0);
        Self {
            gate: Arc::new(ScrapeGate::new()),
            batch_lock: Arc::new(Mutex::new(())),
            aggregator: Aggregator::new(layout),
            stages,
            retry,
            session,
            status,
            last_run: StdRwLock::new(None),
        }
    }

    pub fn gate(&self) -> Arc<ScrapeGate> {
        self.gate.clone()
    }

    pub fn status(&self) -> &StatusBoard {
        &self.status
    }

    pub fn scraping_enabled(&self) -> bool {
        self.gate.is_enabled()
    }

    pub fn batch_running(&self) -> bool {
        self.batch_lock.try_lock().is_err()
    }

    pub fn last_run(&self) -> Option<BatchRecord> {
        self.last_run.read().expect("last_run poisoned").clone()
    }

    fn acquire(&self) -> Result<OwnedMutexGuard<()>, HarvestError> {
        self.batch_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| HarvestError::Coordination("batch already running".into()))
    }

    /// Run the batch for `date` on the current task.
    pub async fn run_batch(&self, date: &str) -> Result<BatchRecord, HarvestError> {
        let exclusive = self.acquire()?;
        self.run_locked(exclusive, date).await
    }

    /// Claim the batch lock now and run the batch on a new task. Fails with
    /// `Coordination` when a batch already holds the lock.
    pub fn start_batch(
        self: &Arc<Self>,
        date: String,
    ) -> Result<JoinHandle<Result<BatchRecord, HarvestError>>, HarvestError> {
        store::parse_date(&date).map_err(|e| HarvestError::Validation(format!("{e:#}")))?;
        let exclusive = self.acquire()?;
        let this = self.clone();
        Ok(tokio::spawn(async move { this.run_locked(exclusive, &date).await }))
    }

    async fn run_locked(
        &self,
        _exclusive: OwnedMutexGuard<()>,
        date: &str,
    ) -> Result<BatchRecord, HarvestError> {
        counter!("batch_runs_total").increment(1);
        let started_at = Utc::now();
        info!(target: "batch", %date, "batch starting");

        let window = self.gate.suspend().await;
        let mut completed = Vec::new();
        let mut failure = None;

        for stage in Stage::ORDER {
            let res = self
                .retry
                .execute(stage.kind(), stage.name(), || self.run_stage(stage, date))
                .await;
            match res {
                Ok(()) => completed.push(stage),
                Err(e) => {
                    counter!("batch_stage_failures_total", "stage" => stage.name()).increment(1);
                    error!(target: "batch", %date, stage = stage.name(), error = %format!("{e:#}"), "stage failed, aborting remaining stages");
                    failure = Some((stage, e));
                    break;
                }
            }
        }
        drop(window);

        let outcome = match &failure {
            None => BatchOutcome::Completed,
            Some((stage, e)) => BatchOutcome::Failed {
                stage: *stage,
                error: format!("{e:#}"),
            },
        };
        let record = BatchRecord {
            date: date.to_string(),
            started_at,
            finished_at: Utc::now(),
            stages_completed: completed,
            outcome,
        };
        *self.last_run.write().expect("last_run poisoned") = Some(record.clone());

        match failure {
            None => {
                info!(target: "batch", %date, "batch completed");
                Ok(record)
            }
            Some((_, e)) => Err(e),
        }
    }

    async fn run_stage(&self, stage: Stage, date: &str) -> anyhow::Result<()> {
        match stage {
            Stage::Aggregate => {
                self.aggregator.run(date).await?;
            }
            Stage::Filter => {
                let removed = stages::filter_stage(&self.stages, date).await?;
                info!(target: "batch", %date, removed, "filter done");
            }
            Stage::Score => {
                let r = stages::score_stage(&self.stages, date).await?;
                info!(target: "batch", %date, scored = r.scored, dropped = r.dropped, "score done");
            }
            Stage::Refine => {
                let r = stages::refine_stage(&self.stages, date).await?;
                info!(
                    target: "batch",
                    %date,
                    input = r.input,
                    output = r.output,
                    reposts = r.reposts_dropped,
                    quotes = r.quotes_dropped,
                    merged = r.merged,
                    unresolved = r.unresolved,
                    "refine done"
                );
            }
            Stage::Categorize => {
                stages::categorize_stage(&self.stages, date).await?;
            }
            Stage::Deliver => {
                stages::deliver_stage(&self.stages, date).await?;
            }
        }
        Ok(())
    }

    /// Fire the batch once a day at `at` (UTC) until shutdown.
    pub async fn run_schedule(
        self: Arc<Self>,
        at: NaiveTime,
        process_previous_day: bool,
        shutdown: CancellationToken,
    ) {
        loop {
            let now = Utc::now();
            let next = next_run_after(now, at);
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            info!(target: "batch", next_run = %next, "batch scheduled");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            let today = store::today();
            let date = if process_previous_day {
                match store::previous_day(&today) {
                    Ok(d) => d,
                    Err(e) => {
                        error!(target: "batch", error = %format!("{e:#}"), "cannot compute batch date");
                        continue;
                    }
                }
            } else {
                today
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                res = self.run_batch(&date) => {
                    if let Err(e) = res {
                        warn!(target: "batch", %date, error = %e, "scheduled batch did not complete");
                    }
                }
            }
        }
        info!(target: "batch", "scheduler stopped");
    }

    /// Rebuild the Source Adapter session when a poller keeps failing.
    /// A failed rebuild is logged; the poller keeps backing off.
    pub async fn supervise_escalations(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Escalation>,
        shutdown: CancellationToken,
    ) {
        let policy = RetryPolicy::new(2, Duration::from_secs(1), Duration::from_secs(5));
        loop {
            let ev = tokio::select! {
                _ = shutdown.cancelled() => break,
                ev = rx.recv() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };
            counter!("harvest_escalations_total").increment(1);
            warn!(target: "poller", source = %ev.source_id, errors = ev.consecutive_errors, "reinitializing source session");

            let session = self.session.clone();
            match policy
                .execute(ErrorKind::Browser, "reinitialize", || {
                    let session = session.clone();
                    async move { session.reinitialize().await }
                })
                .await
            {
                Ok(()) => info!(target: "poller", adapter = self.session.adapter_name(), "source session reinitialized"),
                Err(e) => error!(target: "poller", error = %e, "session reinitialization failed"),
            }
            // Requests that queued up during the rebuild are already served.
            while rx.try_recv().is_ok() {}
        }
    }

    /// Start pollers, the scheduler and the escalation supervisor, then wait
    /// for `shutdown`. In-flight polls get `grace` to persist before abort.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        self: Arc<Self>,
        sources: Vec<Source>,
        index: Arc<DedupIndex>,
        layout: DataLayout,
        poller_cfg: PollerConfig,
        daily_at: NaiveTime,
        process_previous_day: bool,
        grace: Duration,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let (esc_tx, esc_rx) = mpsc::channel(sources.len().max(1));
        let mut pollers = spawn_pollers(
            &sources,
            &self.session,
            &index,
            &layout,
            &self.gate,
            &self.status,
            &esc_tx,
            poller_cfg,
            &shutdown,
        );
        drop(esc_tx);
        info!(target: "poller", count = sources.len(), "pollers started");

        let scheduler = tokio::spawn(self.clone().run_schedule(
            daily_at,
            process_previous_day,
            shutdown.clone(),
        ));
        let supervisor = tokio::spawn(self.clone().supervise_escalations(esc_rx, shutdown.clone()));

        shutdown.cancelled().await;
        info!(target: "poller", grace_ms = grace.as_millis() as u64, "shutdown requested, draining");

        let drained = tokio::time::timeout(grace, async {
            while pollers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(target: "poller", "grace period elapsed, aborting remaining pollers");
            pollers.abort_all();
            while pollers.join_next().await.is_some() {}
        }
        // Dropping a running batch releases its lock and re-enables the gate.
        scheduler.abort();
        supervisor.abort();
        let _ = scheduler.await;
        let _ = supervisor.await;
        info!("shutdown complete");
        Ok(())
    }
}

/// Next instant strictly after `now` whose UTC time of day is `at`.
pub fn next_run_after(now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    }
}
