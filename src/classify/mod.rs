// src/classify/mod.rs
//! Content Classifier seam.
//!
//! The batch asks one question per call: which items survive a category
//! filter, how relevant each survivor is, how a similarity group should be
//! resolved, or how the surviving items break down into subcategories. Implementations only answer; every
//! gate on the answer (confidence, id validity) is enforced by the caller.

pub mod chat;

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::categories::OTHER_UPDATES;
use crate::types::{ItemScores, RawItem};

pub use chat::ChatClassifier;

#[derive(Debug, Clone, PartialEq)]
pub enum CategoryHint {
    /// Keep only items relevant to `category`.
    Filter { category: String, focus: Vec<String> },
    /// Score every item for relevance, significance, impact and ecosystem fit.
    Score { category: String, focus: Vec<String> },
    /// Decide whether a near-duplicate group is one event. `strict` selects the
    /// higher confidence gate used for repost/quote collapsing.
    ResolveGroup { strict: bool },
    /// Break surviving items into subcategories with one-line summaries.
    Categorize { category: String, focus: Vec<String> },
}

impl CategoryHint {
    pub fn label(&self) -> &'static str {
        match self {
            CategoryHint::Filter { .. } => "filter",
            CategoryHint::Score { .. } => "score",
            CategoryHint::ResolveGroup { .. } => "resolve_group",
            CategoryHint::Categorize { .. } => "categorize",
        }
    }
}

/// One line of a rollup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DigestEntry {
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Classification {
    /// Ids the classifier wants to keep, in its preferred order.
    pub kept_ids: Vec<String>,
    /// Merged text when a group collapses into one item.
    pub combined_text: Option<String>,
    /// Subcategory name → entries. Empty for filter / resolve answers.
    pub groupings: BTreeMap<String, Vec<DigestEntry>>,
    /// Item id → scores. Only filled for score answers.
    #[serde(default)]
    pub scores: BTreeMap<String, ItemScores>,
    pub filtered_count: usize,
    pub confidence: f32,
    pub reason: String,
}

#[async_trait::async_trait]
pub trait ContentClassifier: Send + Sync {
    async fn classify(&self, items: &[RawItem], hint: &CategoryHint) -> Result<Classification>;
    fn name(&self) -> &'static str;
}

/// Used when no classifier is configured: keeps everything, scores everything
/// as fully relevant, never merges, and files every item under "Other Updates"
/// with its own text as the summary.
pub struct PassthroughClassifier;

const PASSTHROUGH_SUMMARY_CHARS: usize = 120;

#[async_trait::async_trait]
impl ContentClassifier for PassthroughClassifier {
    async fn classify(&self, items: &[RawItem], hint: &CategoryHint) -> Result<Classification> {
        let kept_ids = items.iter().map(|it| it.id.clone()).collect();
        let out = match hint {
            CategoryHint::Filter { .. } => Classification {
                kept_ids,
                confidence: 1.0,
                reason: "passthrough".into(),
                ..Default::default()
            },
            CategoryHint::Score { .. } => Classification {
                scores: items
                    .iter()
                    .map(|it| (it.id.clone(), ItemScores::uniform(1.0, "passthrough")))
                    .collect(),
                kept_ids,
                confidence: 1.0,
                reason: "passthrough".into(),
                ..Default::default()
            },
            // Zero confidence keeps the group unresolved.
            CategoryHint::ResolveGroup { .. } => Classification {
                kept_ids,
                confidence: 0.0,
                reason: "passthrough".into(),
                ..Default::default()
            },
            CategoryHint::Categorize { .. } => {
                let entries = items
                    .iter()
                    .map(|it| DigestEntry {
                        author: it.author_handle.clone(),
                        summary: truncate_chars(&it.text, PASSTHROUGH_SUMMARY_CHARS),
                        url: it.url.clone(),
                    })
                    .collect::<Vec<_>>();
                let mut groupings = BTreeMap::new();
                if !entries.is_empty() {
                    groupings.insert(OTHER_UPDATES.to_string(), entries);
                }
                Classification {
                    kept_ids,
                    groupings,
                    confidence: 1.0,
                    reason: "passthrough".into(),
                    ..Default::default()
                }
            }
        };
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "passthrough"
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}
