// src/types.rs
use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One independently polled feed ("column").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_log_path: Option<PathBuf>,
}

/// Text + author of a quoted or reposted post.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedContent {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub author_handle: String,
}

/// Per-item relevance scores attached by the score stage, each in `[0, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ItemScores {
    pub relevance: f32,
    pub significance: f32,
    pub impact: f32,
    pub ecosystem_relevance: f32,
    pub average_score: f32,
    #[serde(default)]
    pub reasoning: String,
}

impl ItemScores {
    /// All four categories at `value`, average included.
    pub fn uniform(value: f32, reasoning: impl Into<String>) -> Self {
        Self {
            relevance: value,
            significance: value,
            impact: value,
            ecosystem_relevance: value,
            average_score: value,
            reasoning: reasoning.into(),
        }
    }

    pub fn mean(&self) -> f32 {
        (self.relevance + self.significance + self.impact + self.ecosystem_relevance) / 4.0
    }
}

/// A post as reported by the Source Adapter.
///
/// String fields default to empty so a malformed record still deserializes and
/// can be dropped by validation instead of failing the whole log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawItem {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub author_handle: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub is_repost: bool,
    #[serde(default)]
    pub is_quote_retweet: bool,
    #[serde(default)]
    pub quoted_content: Option<EmbeddedContent>,
    #[serde(default)]
    pub reposted_content: Option<EmbeddedContent>,
    #[serde(default)]
    pub source_id: String,
    /// Ids merged into this item by the refiner.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub combined_from: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combination_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scores: Option<ItemScores>,
}

impl RawItem {
    /// Bare item with no permalink; the Source Adapter supplies `url`.
    pub fn new(id: impl Into<String>, text: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            author_handle: author.into(),
            ..Default::default()
        }
    }

    pub fn with_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = source_id.into();
        self
    }

    pub fn reposting(mut self, text: impl Into<String>, author: impl Into<String>) -> Self {
        self.is_repost = true;
        self.is_quote_retweet = false;
        self.reposted_content = Some(EmbeddedContent {
            text: text.into(),
            author_handle: author.into(),
        });
        self
    }

    pub fn quoting(mut self, text: impl Into<String>, author: impl Into<String>) -> Self {
        self.is_quote_retweet = true;
        self.is_repost = false;
        self.quoted_content = Some(EmbeddedContent {
            text: text.into(),
            author_handle: author.into(),
        });
        self
    }
}

/// Deduplicated per-date merge of every source's raw log.
///
/// Serialized as `processed_tweets_<date>.json`. `BTreeMap` keeps the output
/// byte-stable across runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalSet {
    pub date: String,
    pub total_count: usize,
    pub columns: BTreeMap<String, Vec<RawItem>>,
}

impl CanonicalSet {
    pub fn new(date: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            ..Default::default()
        }
    }

    pub fn recount(&mut self) {
        self.total_count = self.columns.values().map(Vec::len).sum();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_item_uses_camel_case_and_tolerates_missing_fields() {
        let json = r#"{"id":"7","text":"hello there","isRepost":true,
                       "repostedContent":{"text":"orig","authorHandle":"alice"}}"#;
        let it: RawItem = serde_json::from_str(json).unwrap();
        assert_eq!(it.id, "7");
        assert!(it.author_handle.is_empty());
        assert!(it.is_repost);
        assert_eq!(it.reposted_content.unwrap().author_handle, "alice");

        let out = serde_json::to_string(&RawItem::new("1", "a b", "bob")).unwrap();
        assert!(out.contains("\"authorHandle\":\"bob\""));
        assert!(!out.contains("combinedFrom"));
        assert!(!out.contains("scores"));
    }

    #[test]
    fn bare_item_has_no_invented_permalink() {
        let it = RawItem::new("42", "a b", "bob");
        assert!(it.url.is_empty());
        assert!(it.source_id.is_empty());
    }

    #[test]
    fn scores_serialize_camel_case_on_the_item() {
        let mut it = RawItem::new("9", "mainnet launch", "near");
        it.scores = Some(ItemScores {
            relevance: 0.9,
            significance: 0.8,
            impact: 0.6,
            ecosystem_relevance: 0.7,
            average_score: 0.75,
            reasoning: "concrete launch".into(),
        });
        let out = serde_json::to_string(&it).unwrap();
        assert!(out.contains("\"ecosystemRelevance\":0.7"));
        assert!(out.contains("\"averageScore\":0.75"));
        let back: RawItem = serde_json::from_str(&out).unwrap();
        assert_eq!(back.scores, it.scores);
        assert!((it.scores.unwrap().mean() - 0.75).abs() < 1e-6);
    }
}
