// src/stages.rs
//! Batch stages that run after aggregation: filter, score, refine,
//! categorize, deliver.
//!
//! Each stage reads its input from disk and writes its output atomically at
//! the end, so a retried stage always starts from the same state.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::categories::{self, CategoryMap};
use crate::classify::{CategoryHint, ContentClassifier, DigestEntry};
use crate::error::HarvestError;
use crate::notify::Notifier;
use crate::refine::{RefineReport, SimilarityRefiner};
use crate::store::{self, DataLayout};
use crate::types::CanonicalSet;

/// Everything the post-aggregation stages need.
pub struct StageContext {
    pub layout: DataLayout,
    pub categories: CategoryMap,
    pub classifier: Arc<dyn ContentClassifier>,
    pub notifier: Arc<dyn Notifier>,
    pub refiner: SimilarityRefiner,
    /// Score stage keeps items whose relevance is strictly above this.
    pub min_relevance: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CategorySummary {
    pub text: String,
    pub subcategories: BTreeMap<String, Vec<DigestEntry>>,
    pub filtered_count: usize,
}

/// `summaries_<date>.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SummaryFile {
    pub date: String,
    pub total_filtered: usize,
    pub summaries: BTreeMap<String, CategorySummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub category: String,
    pub destination: String,
    pub delivered_at: DateTime<Utc>,
}

/// `delivered_<date>.json`: digest of (destination, text) → delivery record.
pub type DeliveryLedger = BTreeMap<String, LedgerEntry>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScoreReport {
    pub scored: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliverReport {
    pub sent: usize,
    pub already_sent: usize,
    pub rejected: usize,
    pub skipped: usize,
}

async fn load_canonical(layout: &DataLayout, date: &str) -> Result<CanonicalSet> {
    store::read_json(&layout.processed(date))
        .await
        .with_context(|| format!("loading canonical set for {date}"))
}

fn classifier_error(message: String) -> anyhow::Error {
    HarvestError::ExternalService {
        service: "classifier",
        message,
    }
    .into()
}

/// Keep only the ids the classifier returns for each mapped column.
///
/// An answer that keeps none of a non-empty column's ids is treated as a
/// classifier failure; the stage errors and nothing is written.
pub async fn filter_stage(ctx: &StageContext, date: &str) -> Result<usize> {
    let mut set = load_canonical(&ctx.layout, date).await?;
    let mut removed = 0usize;

    for (source_id, items) in set.columns.iter_mut() {
        let Some(category) = ctx.categories.category_for(source_id) else {
            continue;
        };
        if items.is_empty() {
            continue;
        }
        let hint = CategoryHint::Filter {
            category: category.to_string(),
            focus: ctx.categories.focus_for(category).to_vec(),
        };
        let answer = ctx
            .classifier
            .classify(items, &hint)
            .await
            .with_context(|| format!("filtering column {source_id}"))?;
        let keep: HashSet<&str> = answer.kept_ids.iter().map(String::as_str).collect();
        if !items.iter().any(|it| keep.contains(it.id.as_str())) {
            return Err(classifier_error(format!(
                "filter kept none of {} items in column {source_id}",
                items.len()
            )));
        }
        let before = items.len();
        items.retain(|it| keep.contains(it.id.as_str()));
        removed += before - items.len();
        info!(target: "batch", source = %source_id, %category, kept = items.len(), removed = before - items.len(), "column filtered");
    }

    set.recount();
    store::write_json_atomic(&ctx.layout.processed(date), &set).await?;
    Ok(removed)
}

/// Score each mapped column and keep items above `min_relevance`, with their
/// scores attached. Items the classifier did not score are dropped.
pub async fn score_stage(ctx: &StageContext, date: &str) -> Result<ScoreReport> {
    let mut set = load_canonical(&ctx.layout, date).await?;
    let mut report = ScoreReport::default();

    for (source_id, items) in set.columns.iter_mut() {
        let Some(category) = ctx.categories.category_for(source_id) else {
            continue;
        };
        if items.is_empty() {
            continue;
        }
        let hint = CategoryHint::Score {
            category: category.to_string(),
            focus: ctx.categories.focus_for(category).to_vec(),
        };
        let mut answer = ctx
            .classifier
            .classify(items, &hint)
            .await
            .with_context(|| format!("scoring column {source_id}"))?;
        if !items.iter().any(|it| answer.scores.contains_key(&it.id)) {
            return Err(classifier_error(format!(
                "scores cover none of {} items in column {source_id}",
                items.len()
            )));
        }

        let before = items.len();
        let mut kept = Vec::with_capacity(before);
        for mut it in items.drain(..) {
            match answer.scores.remove(&it.id) {
                Some(scores) if scores.relevance > ctx.min_relevance => {
                    it.scores = Some(scores);
                    kept.push(it);
                }
                _ => {}
            }
        }
        *items = kept;
        report.scored += items.len();
        report.dropped += before - items.len();
        info!(target: "batch", source = %source_id, %category, kept = items.len(), dropped = before - items.len(), "column scored");
    }

    set.recount();
    store::write_json_atomic(&ctx.layout.processed(date), &set).await?;
    Ok(report)
}

/// Run the similarity refiner over the canonical set in place.
pub async fn refine_stage(ctx: &StageContext, date: &str) -> Result<RefineReport> {
    let mut set = load_canonical(&ctx.layout, date).await?;
    let report = ctx.refiner.refine_set(&mut set).await;
    store::write_json_atomic(&ctx.layout.processed(date), &set).await?;
    Ok(report)
}

/// Build the per-category rollups and write `summaries_<date>.json`.
pub async fn categorize_stage(ctx: &StageContext, date: &str) -> Result<SummaryFile> {
    let set = load_canonical(&ctx.layout, date).await?;
    let mut out = SummaryFile {
        date: date.to_string(),
        ..Default::default()
    };

    for (source_id, items) in &set.columns {
        if items.is_empty() {
            info!(target: "batch", source = %source_id, "skipping empty column");
            continue;
        }
        let Some(category) = ctx.categories.category_for(source_id) else {
            warn!(target: "batch", source = %source_id, "no category mapping for column");
            continue;
        };
        let hint = CategoryHint::Categorize {
            category: category.to_string(),
            focus: ctx.categories.focus_for(category).to_vec(),
        };
        let answer = ctx
            .classifier
            .classify(items, &hint)
            .await
            .with_context(|| format!("categorizing column {source_id}"))?;

        out.total_filtered += answer.filtered_count;
        let entry = out
            .summaries
            .entry(category.to_string())
            .or_insert_with(|| CategorySummary {
                text: String::new(),
                subcategories: BTreeMap::new(),
                filtered_count: 0,
            });
        entry.filtered_count += answer.filtered_count;
        for (name, entries) in answer.groupings {
            entry.subcategories.entry(name).or_default().extend(entries);
        }
    }

    for (category, summary) in out.summaries.iter_mut() {
        summary.text = categories::format_summary(date, category, &summary.subcategories);
    }

    store::write_json_atomic(&ctx.layout.summaries(date), &out).await?;
    info!(target: "batch", %date, categories = out.summaries.len(), filtered = out.total_filtered, "summaries written");
    Ok(out)
}

pub fn delivery_digest(destination: &str, text: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(destination.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Send every non-empty rollup to its destination.
///
/// Successful sends are recorded in the ledger immediately, so a retried run
/// only resends what has not gone out yet. A transport error on one category
/// does not stop the others; the first error is returned at the end.
pub async fn deliver_stage(ctx: &StageContext, date: &str) -> Result<DeliverReport> {
    let summaries: SummaryFile = store::read_json(&ctx.layout.summaries(date))
        .await
        .with_context(|| format!("loading summaries for {date}"))?;
    let ledger_path = ctx.layout.delivery_ledger(date);
    let mut ledger: DeliveryLedger = store::read_json_opt(&ledger_path).await?.unwrap_or_default();

    let mut report = DeliverReport::default();
    let mut first_err: Option<anyhow::Error> = None;

    for (category, summary) in &summaries.summaries {
        let has_entries = summary.subcategories.values().any(|v| !v.is_empty());
        if !has_entries || !categories::has_content(&summary.text) {
            report.skipped += 1;
            continue;
        }
        let Some(destination) = ctx.categories.destination_for(category) else {
            warn!(target: "deliver", %category, "no destination for category");
            report.skipped += 1;
            continue;
        };
        let digest = delivery_digest(destination, &summary.text);
        if ledger.contains_key(&digest) {
            report.already_sent += 1;
            continue;
        }

        match ctx.notifier.deliver(destination, &summary.text).await {
            Ok(true) => {
                ledger.insert(
                    digest,
                    LedgerEntry {
                        category: category.clone(),
                        destination: destination.to_string(),
                        delivered_at: Utc::now(),
                    },
                );
                store::write_json_atomic(&ledger_path, &ledger).await?;
                report.sent += 1;
            }
            Ok(false) => {
                warn!(target: "deliver", %category, destination, "notifier refused message");
                report.rejected += 1;
            }
            Err(e) => {
                warn!(target: "deliver", %category, destination, error = %format!("{e:#}"), "delivery failed");
                if first_err.is_none() {
                    first_err = Some(e.context(format!("delivering {category}")));
                }
            }
        }
    }

    if let Some(e) = first_err {
        return Err(e);
    }
    info!(
        target: "deliver",
        %date,
        sent = report.sent,
        already_sent = report.already_sent,
        rejected = report.rejected,
        skipped = report.skipped,
        "delivery finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::classify::chat::parse_classification;
    use crate::classify::{Classification, PassthroughClassifier};
    use crate::notify::LogNotifier;
    use crate::refine::RefineConfig;
    use crate::types::RawItem;

    const DATE: &str = "20250301";

    /// Answers every question with the same raw model reply.
    struct CannedReply(&'static str);

    #[async_trait::async_trait]
    impl ContentClassifier for CannedReply {
        async fn classify(&self, _items: &[RawItem], hint: &CategoryHint) -> Result<Classification> {
            parse_classification(self.0, hint)
        }

        fn name(&self) -> &'static str {
            "canned"
        }
    }

    fn context(root: &std::path::Path, classifier: Arc<dyn ContentClassifier>) -> StageContext {
        StageContext {
            layout: DataLayout::new(root),
            categories: CategoryMap::default_seed(),
            classifier: classifier.clone(),
            notifier: Arc::new(LogNotifier),
            refiner: SimilarityRefiner::new(classifier, RefineConfig::default()),
            min_relevance: 0.7,
        }
    }

    async fn seed(ctx: &StageContext) -> Vec<u8> {
        let mut set = CanonicalSet::new(DATE);
        set.columns.insert(
            "0".into(),
            vec![
                RawItem::new("1", "NEAR intents went live", "near"),
                RawItem::new("2", "Aurora bridge volume doubled", "aurora"),
            ],
        );
        set.recount();
        let path = ctx.layout.processed(DATE);
        store::write_json_atomic(&path, &set).await.unwrap();
        tokio::fs::read(&path).await.unwrap()
    }

    fn is_classifier_error(err: &anyhow::Error) -> bool {
        err.chain().any(|e| {
            matches!(
                e.downcast_ref::<HarvestError>(),
                Some(HarvestError::ExternalService { .. })
            )
        })
    }

    #[tokio::test]
    async fn filter_answer_missing_kept_ids_leaves_column_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), Arc::new(CannedReply(r#"{"keep":["1","2"],"confidence":0.99}"#)));
        let before = seed(&ctx).await;

        let err = filter_stage(&ctx, DATE).await.unwrap_err();
        assert!(is_classifier_error(&err), "{err:#}");
        let after = tokio::fs::read(ctx.layout.processed(DATE)).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn filter_keeping_nothing_of_a_full_column_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), Arc::new(CannedReply(r#"{"kept_ids":["9"],"confidence":0.9}"#)));
        let before = seed(&ctx).await;

        let err = filter_stage(&ctx, DATE).await.unwrap_err();
        assert!(is_classifier_error(&err), "{err:#}");
        assert_eq!(before, tokio::fs::read(ctx.layout.processed(DATE)).await.unwrap());
    }

    #[tokio::test]
    async fn filter_keeps_returned_ids() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), Arc::new(CannedReply(r#"{"kept_ids":["2"],"confidence":0.9}"#)));
        seed(&ctx).await;

        assert_eq!(filter_stage(&ctx, DATE).await.unwrap(), 1);
        let set: CanonicalSet = store::read_json(&ctx.layout.processed(DATE)).await.unwrap();
        assert_eq!(set.columns["0"].len(), 1);
        assert_eq!(set.columns["0"][0].id, "2");
        assert_eq!(set.total_count, 1);
    }

    #[tokio::test]
    async fn score_keeps_relevant_items_with_scores_attached() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(
            dir.path(),
            Arc::new(CannedReply(
                r#"{"scores":{
                    "1":{"relevance":0.9,"significance":0.8,"impact":0.7,"ecosystem_relevance":0.6,"reasoning":"launch"},
                    "2":{"relevance":0.7,"significance":0.9,"impact":0.9,"ecosystem_relevance":0.9}
                }}"#,
            )),
        );
        seed(&ctx).await;

        let report = score_stage(&ctx, DATE).await.unwrap();
        assert_eq!(report, ScoreReport { scored: 1, dropped: 1 });
        let set: CanonicalSet = store::read_json(&ctx.layout.processed(DATE)).await.unwrap();
        let kept = &set.columns["0"];
        assert_eq!(kept.len(), 1);
        let scores = kept[0].scores.as_ref().expect("scores attached");
        assert_eq!(kept[0].id, "1");
        assert_eq!(scores.reasoning, "launch");
        assert!((scores.average_score - 0.75).abs() < 1e-6);
        assert_eq!(set.total_count, 1);
    }

    #[tokio::test]
    async fn score_answer_for_unknown_ids_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(
            dir.path(),
            Arc::new(CannedReply(r#"{"scores":{"77":{"relevance":0.99}}}"#)),
        );
        let before = seed(&ctx).await;

        let err = score_stage(&ctx, DATE).await.unwrap_err();
        assert!(is_classifier_error(&err), "{err:#}");
        assert_eq!(before, tokio::fs::read(ctx.layout.processed(DATE)).await.unwrap());
    }

    #[tokio::test]
    async fn passthrough_scoring_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), Arc::new(PassthroughClassifier));
        seed(&ctx).await;

        let report = score_stage(&ctx, DATE).await.unwrap();
        assert_eq!(report.scored, 2);
        assert_eq!(report.dropped, 0);
    }

    #[test]
    fn digest_depends_on_destination_and_text() {
        let a = delivery_digest("near", "hello");
        assert_eq!(a.len(), 64);
        assert_eq!(a, delivery_digest("near", "hello"));
        assert_ne!(a, delivery_digest("iota", "hello"));
        // Separator keeps ("ab","c") apart from ("a","bc").
        assert_ne!(delivery_digest("ab", "c"), delivery_digest("a", "bc"));
    }

    #[test]
    fn summary_file_uses_camel_case() {
        let mut f = SummaryFile {
            date: "20250101".into(),
            total_filtered: 4,
            ..Default::default()
        };
        f.summaries.insert(
            "DefAI".into(),
            CategorySummary {
                text: "t".into(),
                subcategories: BTreeMap::new(),
                filtered_count: 4,
            },
        );
        let s = serde_json::to_string(&f).unwrap();
        assert!(s.contains("\"totalFiltered\":4"));
        assert!(s.contains("\"filteredCount\":4"));
    }
}
