// tests/common/mod.rs
//
// Scripted in-memory collaborators shared by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use column_harvester::categories::OTHER_UPDATES;
use column_harvester::classify::{CategoryHint, Classification, ContentClassifier, DigestEntry};
use column_harvester::coordinator::PipelineCoordinator;
use column_harvester::notify::Notifier;
use column_harvester::refine::{RefineConfig, SimilarityRefiner};
use column_harvester::retry::RetryPolicy;
use column_harvester::source::{SharedSession, SourceAdapter};
use column_harvester::stages::StageContext;
use column_harvester::status::StatusBoard;
use column_harvester::store::{self, DataLayout};
use column_harvester::types::{ItemScores, RawItem, Source};
use column_harvester::categories::CategoryMap;
use tokio::sync::Semaphore;

pub fn item(id: &str, text: &str, author: &str) -> RawItem {
    RawItem {
        url: format!("https://x.com/{author}/status/{id}"),
        ..RawItem::new(id, text, author)
    }
}

pub fn ids(items: &[RawItem]) -> Vec<&str> {
    items.iter().map(|i| i.id.as_str()).collect()
}

// ---------------------------------------------------------------------------
// Source Adapter
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ScriptedAdapter {
    heads: Mutex<HashMap<String, Vec<RawItem>>>,
    failures: Mutex<HashMap<String, u32>>,
    fetch_gate: Mutex<Option<Arc<Semaphore>>>,
    reinit_fails: AtomicBool,
    pub fetches: AtomicU32,
    pub reinits: AtomicU32,
}

impl ScriptedAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_head(&self, source: &str, items: Vec<RawItem>) {
        self.heads
            .lock()
            .unwrap()
            .insert(source.to_string(), items);
    }

    /// Make the next `n` fetches of `source` fail.
    pub fn fail_next(&self, source: &str, n: u32) {
        self.failures
            .lock()
            .unwrap()
            .insert(source.to_string(), n);
    }

    /// Every fetch waits for a permit from `gate` before answering.
    pub fn hold_fetches(&self, gate: Arc<Semaphore>) {
        *self.fetch_gate.lock().unwrap() = Some(gate);
    }

    /// Every session rebuild fails.
    pub fn fail_reinit(&self) {
        self.reinit_fails.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl SourceAdapter for ScriptedAdapter {
    async fn list_columns(&self) -> Result<Vec<Source>> {
        let mut ids: Vec<String> = self.heads.lock().unwrap().keys().cloned().collect();
        ids.sort();
        Ok(ids
            .into_iter()
            .map(|id| Source {
                label: format!("Column {id}"),
                id,
                raw_log_path: None,
            })
            .collect())
    }

    async fn fetch_head(&self, source_id: &str) -> Result<Vec<RawItem>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let gate = self.fetch_gate.lock().unwrap().clone();
        if let Some(g) = gate {
            g.acquire().await?.forget();
        }
        {
            let mut f = self.failures.lock().unwrap();
            if let Some(n) = f.get_mut(source_id) {
                if *n > 0 {
                    *n -= 1;
                    return Err(anyhow!("column {source_id} not rendered"));
                }
            }
        }
        Ok(self
            .heads
            .lock()
            .unwrap()
            .get(source_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn reinitialize(&self) -> Result<()> {
        self.reinits.fetch_add(1, Ordering::SeqCst);
        if self.reinit_fails.load(Ordering::SeqCst) {
            return Err(anyhow!("browser did not come back"));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

pub fn session(adapter: Arc<ScriptedAdapter>) -> SharedSession {
    SharedSession::new(adapter, Duration::from_secs(5))
}

pub fn source(id: &str) -> Source {
    Source {
        id: id.to_string(),
        label: format!("Column {id}"),
        raw_log_path: None,
    }
}

// ---------------------------------------------------------------------------
// Content Classifier
// ---------------------------------------------------------------------------

/// Keeps every item, scores every item as relevant, files everything under
/// one subcategory and answers group questions with a fixed confidence.
pub struct ScriptedClassifier {
    pub group_confidence: f32,
    pub combine_groups: bool,
    failures: AtomicU32,
    gate: Option<Arc<Semaphore>>,
    pub calls: Mutex<Vec<&'static str>>,
}

impl ScriptedClassifier {
    pub fn new() -> Self {
        Self {
            group_confidence: 0.97,
            combine_groups: true,
            failures: AtomicU32::new(0),
            gate: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next `n` calls.
    pub fn failing(self, n: u32) -> Self {
        self.failures.store(n, Ordering::SeqCst);
        self
    }

    /// Block every call until the semaphore hands out a permit.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ContentClassifier for ScriptedClassifier {
    async fn classify(&self, items: &[RawItem], hint: &CategoryHint) -> Result<Classification> {
        if let Some(g) = &self.gate {
            g.acquire().await?.forget();
        }
        self.calls.lock().unwrap().push(hint.label());
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(anyhow!("HTTP 503"));
        }

        let kept_ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
        Ok(match hint {
            CategoryHint::Filter { .. } => Classification {
                kept_ids,
                confidence: 1.0,
                ..Default::default()
            },
            CategoryHint::Score { .. } => Classification {
                scores: items
                    .iter()
                    .map(|i| (i.id.clone(), ItemScores::uniform(0.9, "on topic")))
                    .collect(),
                kept_ids,
                confidence: 1.0,
                ..Default::default()
            },
            CategoryHint::ResolveGroup { .. } => Classification {
                kept_ids: kept_ids[..1].to_vec(),
                combined_text: self
                    .combine_groups
                    .then(|| format!("{} (combined)", items[0].text)),
                confidence: self.group_confidence,
                reason: "same announcement".into(),
                ..Default::default()
            },
            CategoryHint::Categorize { .. } => {
                let entries = items
                    .iter()
                    .map(|i| DigestEntry {
                        author: i.author_handle.clone(),
                        summary: i.text.clone(),
                        url: i.url.clone(),
                    })
                    .collect();
                let mut groupings = std::collections::BTreeMap::new();
                groupings.insert(OTHER_UPDATES.to_string(), entries);
                Classification {
                    kept_ids,
                    groupings,
                    filtered_count: 1,
                    confidence: 1.0,
                    ..Default::default()
                }
            }
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(String, String)>>,
    failures: AtomicU32,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(n: u32) -> Arc<Self> {
        let me = Self::default();
        me.failures.store(n, Ordering::SeqCst);
        Arc::new(me)
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(&self, destination: &str, text: &str) -> Result<bool> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(anyhow!("connection reset"));
        }
        self.sent
            .lock()
            .unwrap()
            .push((destination.to_string(), text.to_string()));
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(1))
}

pub fn coordinator(
    root: &Path,
    classifier: Arc<dyn ContentClassifier>,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
) -> Arc<PipelineCoordinator> {
    coordinator_with_session(root, classifier, notifier, retry, session(ScriptedAdapter::new()))
}

/// Like [`coordinator`], driving the given adapter session.
pub fn coordinator_with_session(
    root: &Path,
    classifier: Arc<dyn ContentClassifier>,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    session: SharedSession,
) -> Arc<PipelineCoordinator> {
    let layout = DataLayout::new(root);
    let stages = StageContext {
        layout: layout.clone(),
        categories: CategoryMap::default_seed(),
        classifier: classifier.clone(),
        notifier,
        refiner: SimilarityRefiner::new(classifier, RefineConfig::default()),
        min_relevance: 0.7,
    };
    Arc::new(PipelineCoordinator::new(
        layout,
        stages,
        retry,
        session,
        StatusBoard::new(),
    ))
}

pub async fn write_raw(layout: &DataLayout, date: &str, source_id: &str, items: &[RawItem]) {
    store::write_json_atomic(&layout.raw_log(date, source_id), items)
        .await
        .expect("write raw log");
}
