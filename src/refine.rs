// src/refine.rs
//! Near-duplicate clustering within one source's canonical items.
//!
//! Phases, in order:
//! 1. identity: repeated ids collapse to the first occurrence
//! 2. structural: reposts and low-novelty quotes collapse onto their original
//!    when that original is in the working set
//! 3. lexical: greedy seed clustering with a conjunctive, high-threshold test
//!
//! Every multi-item group that needs judgement goes to the classifier, and
//! its answer is only applied when it clears the confidence gate. Anything
//! else (low confidence, classifier error, nonsense ids) keeps the whole group.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::classify::{CategoryHint, Classification, ContentClassifier};
use crate::types::{CanonicalSet, RawItem};

#[derive(Debug, Clone, Copy)]
pub struct RefineConfig {
    pub confidence_gate: f32,
    /// Used for groups built from an ambiguous repost match.
    pub strict_confidence_gate: f32,
    pub min_jaccard: f64,
    pub min_positional: f64,
    pub max_size_diff: usize,
    /// A quote adding more than this share of new tokens stands on its own.
    pub quote_novelty: f64,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            confidence_gate: 0.9,
            strict_confidence_gate: 0.95,
            min_jaccard: 0.9,
            min_positional: 0.9,
            max_size_diff: 3,
            quote_novelty: 0.3,
        }
    }
}

/// Lowercased tokens with URLs removed and edge punctuation trimmed.
pub fn token_seq(text: &str) -> Vec<String> {
    static RE_URL: OnceCell<Regex> = OnceCell::new();
    let re_url = RE_URL.get_or_init(|| Regex::new(r"https?://\S+").expect("static regex"));
    let lower = text.to_lowercase();
    re_url
        .replace_all(&lower, " ")
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn token_set(seq: &[String]) -> BTreeSet<&str> {
    seq.iter().map(String::as_str).collect()
}

pub fn jaccard(a: &[String], b: &[String]) -> f64 {
    let (sa, sb) = (token_set(a), token_set(b));
    let union = sa.union(&sb).count();
    if union == 0 {
        return 0.0;
    }
    sa.intersection(&sb).count() as f64 / union as f64
}

/// Share of positions (over the shorter sequence) holding the same token.
pub fn positional_overlap(a: &[String], b: &[String]) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let same = a.iter().zip(b.iter()).filter(|(x, y)| x == y).count();
    same as f64 / n as f64
}

/// Share of the quote's tokens that are absent from the quoted text,
/// relative to the quoted text's token set.
pub fn quote_novelty(quote: &str, quoted: &str) -> f64 {
    let (q, o) = (token_seq(quote), token_seq(quoted));
    let (sq, so) = (token_set(&q), token_set(&o));
    if so.is_empty() {
        return 1.0;
    }
    sq.difference(&so).count() as f64 / so.len() as f64
}

pub fn lexically_similar(a: &[String], b: &[String], cfg: &RefineConfig) -> bool {
    let size_diff = token_set(a).len().abs_diff(token_set(b).len());
    size_diff <= cfg.max_size_diff
        && jaccard(a, b) >= cfg.min_jaccard
        && positional_overlap(a, b) >= cfg.min_positional
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    /// Repost whose text did not match exactly; paired with an item by the
    /// reposted author.
    Repost,
    Lexical,
}

#[derive(Debug, Clone)]
pub struct SimilarityGroup {
    pub kind: GroupKind,
    /// Indices into the working set, in input order.
    pub members: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GroupResolution {
    /// Distinct but related. `unresolved` when the gate was not met.
    KeepAll { unresolved: bool },
    KeepSubset {
        ids: Vec<String>,
        confidence: f32,
        reason: String,
    },
    Combine {
        text: String,
        confidence: f32,
        reason: String,
    },
}

/// Apply the confidence gate to a classifier answer for `member_ids`.
pub fn gate_resolution(member_ids: &[&str], answer: &Classification, gate: f32) -> GroupResolution {
    if answer.confidence.is_nan() || answer.confidence < gate {
        return GroupResolution::KeepAll { unresolved: true };
    }
    if let Some(text) = answer.combined_text.as_ref() {
        return GroupResolution::Combine {
            text: text.clone(),
            confidence: answer.confidence,
            reason: answer.reason.clone(),
        };
    }
    let members: HashSet<&str> = member_ids.iter().copied().collect();
    let mut seen = HashSet::new();
    let kept: Vec<String> = answer
        .kept_ids
        .iter()
        .filter(|id| members.contains(id.as_str()) && seen.insert(id.as_str()))
        .cloned()
        .collect();
    if kept.is_empty() || kept.len() == member_ids.len() {
        // Never drop a whole group on an answer that names none of it.
        return GroupResolution::KeepAll {
            unresolved: kept.is_empty(),
        };
    }
    GroupResolution::KeepSubset {
        ids: kept,
        confidence: answer.confidence,
        reason: answer.reason.clone(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefineReport {
    pub input: usize,
    pub output: usize,
    pub identity_dropped: usize,
    pub reposts_dropped: usize,
    pub quotes_dropped: usize,
    pub groups: usize,
    pub merged: usize,
    pub unresolved: usize,
}

impl RefineReport {
    fn absorb(&mut self, other: &RefineReport) {
        self.input += other.input;
        self.output += other.output;
        self.identity_dropped += other.identity_dropped;
        self.reposts_dropped += other.reposts_dropped;
        self.quotes_dropped += other.quotes_dropped;
        self.groups += other.groups;
        self.merged += other.merged;
        self.unresolved += other.unresolved;
    }
}

pub struct SimilarityRefiner {
    classifier: Arc<dyn ContentClassifier>,
    cfg: RefineConfig,
}

impl SimilarityRefiner {
    pub fn new(classifier: Arc<dyn ContentClassifier>, cfg: RefineConfig) -> Self {
        Self { classifier, cfg }
    }

    pub fn config(&self) -> &RefineConfig {
        &self.cfg
    }

    /// Refine one source's items. Surviving items keep their relative order.
    pub async fn refine(&self, items: Vec<RawItem>) -> (Vec<RawItem>, RefineReport) {
        let mut report = RefineReport {
            input: items.len(),
            ..Default::default()
        };
        let mut alive = vec![true; items.len()];
        // Items already decided by an earlier phase stay out of later ones.
        let mut grouped = vec![false; items.len()];

        // Phase 1: identity. Repeated ids keep their first occurrence, no
        // classifier call.
        let mut first_by_id: HashMap<&str, usize> = HashMap::new();
        for (i, it) in items.iter().enumerate() {
            if first_by_id.contains_key(it.id.as_str()) {
                alive[i] = false;
                report.identity_dropped += 1;
            } else {
                first_by_id.insert(it.id.as_str(), i);
            }
        }

        // Phase 2: structural.
        let mut groups = Vec::new();
        self.structural_phase(&items, &mut alive, &mut grouped, &mut groups, &mut report);

        // Phase 3: lexical.
        let seqs: Vec<Vec<String>> = items.iter().map(|it| token_seq(&it.text)).collect();
        let candidates: Vec<usize> = (0..items.len())
            .filter(|&i| alive[i] && !grouped[i] && !seqs[i].is_empty())
            .collect();
        let mut taken = vec![false; items.len()];
        for (pos, &seed) in candidates.iter().enumerate() {
            if taken[seed] {
                continue;
            }
            let mut members = vec![seed];
            for &j in &candidates[pos + 1..] {
                if !taken[j] && lexically_similar(&seqs[seed], &seqs[j], &self.cfg) {
                    members.push(j);
                }
            }
            if members.len() > 1 {
                for &m in &members {
                    taken[m] = true;
                }
                groups.push(SimilarityGroup {
                    kind: GroupKind::Lexical,
                    members,
                });
            }
        }

        // Resolve.
        let mut replacements: HashMap<usize, RawItem> = HashMap::new();
        for g in &groups {
            report.groups += 1;
            let resolution = self.resolve(&items, g).await;
            self.apply(&items, g, resolution, &mut alive, &mut replacements, &mut report);
        }

        let out: Vec<RawItem> = items
            .into_iter()
            .enumerate()
            .filter(|(i, _)| alive[*i])
            .map(|(i, it)| replacements.remove(&i).unwrap_or(it))
            .collect();
        report.output = out.len();
        (out, report)
    }

    fn structural_phase(
        &self,
        items: &[RawItem],
        alive: &mut [bool],
        grouped: &mut [bool],
        groups: &mut Vec<SimilarityGroup>,
        report: &mut RefineReport,
    ) {
        let originals = |alive: &[bool], skip: usize| -> Vec<usize> {
            (0..items.len())
                .filter(|&j| j != skip && alive[j] && !items[j].is_repost)
                .collect()
        };

        for i in 0..items.len() {
            if !alive[i] || grouped[i] {
                continue;
            }
            let it = &items[i];

            if it.is_repost {
                let Some(rc) = it.reposted_content.as_ref() else {
                    continue;
                };
                let target = rc.text.trim();
                if !target.is_empty()
                    && originals(&*alive, i)
                        .iter()
                        .any(|&j| items[j].text.trim() == target)
                {
                    alive[i] = false;
                    report.reposts_dropped += 1;
                    debug!(target: "refine", id = %it.id, "repost dropped, original present");
                    continue;
                }
                if !rc.author_handle.trim().is_empty() {
                    // Same author is weak evidence; let the classifier decide.
                    let hit = originals(&*alive, i).into_iter().find(|&j| {
                        !grouped[j] && items[j].author_handle.eq_ignore_ascii_case(rc.author_handle.trim())
                    });
                    if let Some(j) = hit {
                        grouped[i] = true;
                        grouped[j] = true;
                        let mut members = vec![j, i];
                        members.sort_unstable();
                        groups.push(SimilarityGroup {
                            kind: GroupKind::Repost,
                            members,
                        });
                    }
                }
                continue;
            }

            if it.is_quote_retweet {
                let Some(qc) = it.quoted_content.as_ref() else {
                    continue;
                };
                if quote_novelty(&it.text, &qc.text) > self.cfg.quote_novelty {
                    continue;
                }
                let quoted = token_set_owned(&qc.text);
                let present = !quoted.is_empty()
                    && originals(&*alive, i)
                        .iter()
                        .any(|&j| token_set_owned(&items[j].text) == quoted);
                if present {
                    alive[i] = false;
                    report.quotes_dropped += 1;
                    debug!(target: "refine", id = %it.id, "low-novelty quote dropped, original present");
                }
            }
        }
    }

    async fn resolve(&self, items: &[RawItem], g: &SimilarityGroup) -> GroupResolution {
        let members: Vec<RawItem> = g.members.iter().map(|&i| items[i].clone()).collect();
        let ids: Vec<&str> = g.members.iter().map(|&i| items[i].id.as_str()).collect();
        let strict = g.kind == GroupKind::Repost;
        let gate = if strict {
            self.cfg.strict_confidence_gate
        } else {
            self.cfg.confidence_gate
        };
        match self
            .classifier
            .classify(&members, &CategoryHint::ResolveGroup { strict })
            .await
        {
            Ok(answer) => gate_resolution(&ids, &answer, gate),
            Err(e) => {
                warn!(target: "refine", ids = ?ids, error = %format!("{e:#}"), "classifier failed, keeping group");
                GroupResolution::KeepAll { unresolved: true }
            }
        }
    }

    fn apply(
        &self,
        items: &[RawItem],
        g: &SimilarityGroup,
        resolution: GroupResolution,
        alive: &mut [bool],
        replacements: &mut HashMap<usize, RawItem>,
        report: &mut RefineReport,
    ) {
        match resolution {
            GroupResolution::KeepAll { unresolved } => {
                if unresolved {
                    report.unresolved += 1;
                }
            }
            GroupResolution::Combine {
                text,
                confidence,
                reason,
            } => {
                let head = g.members[0];
                let mut merged = items[head].clone();
                merged.text = text;
                merged.combined_from = g.members.iter().map(|&i| items[i].id.clone()).collect();
                merged.combination_reason = Some(reason);
                for &m in &g.members[1..] {
                    alive[m] = false;
                }
                replacements.insert(head, merged);
                report.merged += 1;
                info!(target: "refine", into = %items[head].id, size = g.members.len(), confidence, "group combined");
            }
            GroupResolution::KeepSubset {
                ids,
                confidence,
                reason,
            } => {
                let keep: HashSet<&str> = ids.iter().map(String::as_str).collect();
                let dropped: Vec<String> = g
                    .members
                    .iter()
                    .filter(|&&i| !keep.contains(items[i].id.as_str()))
                    .map(|&i| items[i].id.clone())
                    .collect();
                let mut first_kept = None;
                for &m in &g.members {
                    if keep.contains(items[m].id.as_str()) {
                        first_kept.get_or_insert(m);
                    } else {
                        alive[m] = false;
                    }
                }
                if let Some(k) = first_kept {
                    let mut it = items[k].clone();
                    it.combined_from = dropped;
                    it.combination_reason = Some(reason);
                    replacements.insert(k, it);
                }
                report.merged += 1;
                info!(target: "refine", kept = ids.len(), size = g.members.len(), confidence, "group reduced");
            }
        }
    }

    /// Refine every column of `set` independently and refresh `totalCount`.
    pub async fn refine_set(&self, set: &mut CanonicalSet) -> RefineReport {
        let mut total = RefineReport::default();
        let columns = std::mem::take(&mut set.columns);
        for (source_id, items) in columns {
            let (refined, report) = self.refine(items).await;
            info!(
                target: "refine",
                source = %source_id,
                input = report.input,
                output = report.output,
                groups = report.groups,
                unresolved = report.unresolved,
                "column refined"
            );
            total.absorb(&report);
            set.columns.insert(source_id, refined);
        }
        set.recount();
        total
    }
}

fn token_set_owned(text: &str) -> BTreeSet<String> {
    token_seq(text).into_iter().collect()
}
