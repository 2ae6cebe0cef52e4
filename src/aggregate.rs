// src/aggregate.rs
//! Daily merge of every per-source raw log into one canonical set.
//!
//! - Logs are read in file-name order; within a log, file order is
//!   authoritative and the first occurrence of an id wins.
//! - Text is normalised before validation and the normalised text is what
//!   gets persisted.
//! - An unreadable log is logged and skipped; it never fails the whole run.
//! - Output is written atomically and is byte-identical for unchanged input.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use regex::Regex;
use tracing::{info, warn};

use crate::error::HarvestError;
use crate::store::{self, DataLayout};
use crate::types::{CanonicalSet, RawItem};

/// Collapse whitespace, drop non-printables, ASCII-fy common punctuation and
/// strip embedded URLs.
pub fn normalize_text(s: &str) -> String {
    static RE_URL: OnceCell<Regex> = OnceCell::new();
    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_url = RE_URL.get_or_init(|| Regex::new(r"https?://\S+").expect("static regex"));
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").expect("static regex"));

    let out: String = s
        .chars()
        .filter(|c| !(c.is_control() && !c.is_whitespace()))
        .filter(|c| !matches!(c, '\u{200B}'..='\u{200D}' | '\u{2060}' | '\u{FEFF}'))
        .collect();

    let out = out
        .replace(['\u{201C}', '\u{201D}', '\u{201E}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}', '\u{201A}'], "'")
        .replace('\u{2026}', "...")
        .replace(['\u{2013}', '\u{2014}', '\u{2012}', '\u{2212}'], "-")
        .replace('\u{00A0}', " ");

    let out = re_url.replace_all(&out, "");
    re_ws.replace_all(&out, " ").trim().to_string()
}

fn word_count(s: &str) -> usize {
    s.split_whitespace().count()
}

/// Normalise an item in place and check it is worth keeping.
pub fn validate(mut item: RawItem) -> Result<RawItem, HarvestError> {
    if item.id.trim().is_empty() {
        return Err(HarvestError::Validation("missing id".into()));
    }
    if item.author_handle.trim().is_empty() {
        return Err(HarvestError::Validation(format!("item {} has no author", item.id)));
    }
    item.text = normalize_text(&item.text);
    if item.text.is_empty() {
        return Err(HarvestError::Validation(format!("item {} has empty text", item.id)));
    }
    if word_count(&item.text) < 2 {
        return Err(HarvestError::Validation(format!(
            "item {} has fewer than 2 words",
            item.id
        )));
    }
    if let Some(q) = item.quoted_content.as_mut() {
        q.text = normalize_text(&q.text);
    }
    if let Some(r) = item.reposted_content.as_mut() {
        r.text = normalize_text(&r.text);
    }
    Ok(item)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateReport {
    pub sources_read: usize,
    pub sources_skipped: usize,
    pub dropped_invalid: usize,
    pub duplicates: usize,
}

/// Dedup one source's log by id (first occurrence wins) and drop invalid items.
pub fn canonicalize_log(
    source_id: &str,
    items: Vec<RawItem>,
    report: &mut AggregateReport,
) -> Vec<RawItem> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(items.len());
    for raw in items {
        let item = match validate(raw) {
            Ok(it) => it,
            Err(e) => {
                report.dropped_invalid += 1;
                tracing::debug!(target: "aggregate", source = source_id, error = %e, "dropping item");
                continue;
            }
        };
        if !seen.insert(item.id.clone()) {
            report.duplicates += 1;
            continue;
        }
        let mut item = item;
        if item.source_id.is_empty() {
            item.source_id = source_id.to_string();
        }
        out.push(item);
    }
    out
}

#[derive(Debug, Clone)]
pub struct Aggregator {
    layout: DataLayout,
}

impl Aggregator {
    pub fn new(layout: DataLayout) -> Self {
        Self { layout }
    }

    async fn raw_logs(&self, date: &str) -> Result<Vec<PathBuf>> {
        let dir = self.layout.raw_dir(date);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut rd = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("listing {}", dir.display()))?;
        let mut paths = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            let p = entry.path();
            let is_log = p.extension().is_some_and(|e| e == "json")
                && store::source_id_from_log(&p).is_some();
            if is_log {
                paths.push(p);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Build the canonical set for `date` without writing it.
    pub async fn aggregate(&self, date: &str) -> Result<(CanonicalSet, AggregateReport)> {
        let mut set = CanonicalSet::new(date);
        let mut report = AggregateReport::default();

        let logs = self.raw_logs(date).await?;
        if logs.is_empty() {
            warn!(target: "aggregate", %date, "no raw logs for date");
        }

        for path in logs {
            let Some(source_id) = store::source_id_from_log(&path) else {
                continue;
            };
            let items: Vec<RawItem> = match store::read_json(&path).await {
                Ok(v) => v,
                Err(e) => {
                    report.sources_skipped += 1;
                    warn!(target: "aggregate", source = %source_id, error = %format!("{e:#}"), "skipping unreadable raw log");
                    continue;
                }
            };
            report.sources_read += 1;
            let kept = canonicalize_log(&source_id, items, &mut report);
            set.columns.insert(source_id, kept);
        }

        set.recount();
        Ok((set, report))
    }

    /// Aggregate and persist `processed_tweets_<date>.json`.
    pub async fn run(&self, date: &str) -> Result<CanonicalSet> {
        let (set, report) = self.aggregate(date).await?;
        store::write_json_atomic(&self.layout.processed(date), &set)
            .await
            .context("writing canonical set")?;
        info!(
            target: "aggregate",
            %date,
            total = set.total_count,
            sources = report.sources_read,
            skipped = report.sources_skipped,
            invalid = report.dropped_invalid,
            duplicates = report.duplicates,
            "canonical set written"
        );
        Ok(set)
    }
}
