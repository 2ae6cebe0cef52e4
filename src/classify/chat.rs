// src/classify/chat.rs
//! OpenAI-compatible chat-completions classifier (JSON response mode).
//!
//! Requires `CLASSIFIER_API_KEY`. The request timeout is set on the client, so
//! a hung call surfaces as an error and feeds the caller's retry policy.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{CategoryHint, Classification, ContentClassifier, DigestEntry};
use crate::error::HarvestError;
use crate::types::{ItemScores, RawItem};

pub const ENV_API_KEY: &str = "CLASSIFIER_API_KEY";

const SERVICE: &str = "classifier";

pub struct ChatClassifier {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl ChatClassifier {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("column-harvester/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(4))
            .timeout(timeout)
            .build()
            .context("building classifier http client")?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }

    /// `None` when the key is not set.
    pub fn from_env(base_url: &str, model: &str, timeout: Duration) -> Result<Option<Self>> {
        match std::env::var(ENV_API_KEY) {
            Ok(k) if !k.trim().is_empty() => Self::new(base_url, model, k.trim(), timeout).map(Some),
            _ => Ok(None),
        }
    }

    fn temperature(hint: &CategoryHint) -> f32 {
        match hint {
            CategoryHint::Score { .. } => 0.1,
            CategoryHint::ResolveGroup { .. } => 0.2,
            _ => 0.3,
        }
    }
}

#[async_trait::async_trait]
impl ContentClassifier for ChatClassifier {
    async fn classify(&self, items: &[RawItem], hint: &CategoryHint) -> Result<Classification> {
        if self.api_key.is_empty() {
            return Err(HarvestError::ExternalService {
                service: SERVICE,
                message: format!("{ENV_API_KEY} is not set"),
            }
            .into());
        }

        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            max_tokens: u32,
            response_format: serde_json::Value,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: String,
        }

        let system = system_prompt(hint);
        let user = user_prompt(items)?;
        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: &system,
                },
                Msg {
                    role: "user",
                    content: &user,
                },
            ],
            temperature: Self::temperature(hint),
            max_tokens: 4096,
            response_format: json!({ "type": "json_object" }),
        };

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| HarvestError::ExternalService {
                service: SERVICE,
                message: format!("request failed: {e}"),
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(HarvestError::ExternalService {
                service: SERVICE,
                message: format!("HTTP {status}"),
            }
            .into());
        }
        let body: Resp = resp.json().await.map_err(|e| HarvestError::ExternalService {
            service: SERVICE,
            message: format!("malformed response: {e}"),
        })?;
        let content = body
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("");
        debug!(target: "classify", hint = hint.label(), items = items.len(), "classifier answered");
        parse_classification(content, hint)
    }

    fn name(&self) -> &'static str {
        "chat"
    }
}

/// Lenient view of the model's JSON answer. Which fields are required
/// depends on the question asked; see [`parse_classification`].
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Answer {
    kept_ids: Option<Vec<String>>,
    combined_text: Option<String>,
    subcategories: Option<BTreeMap<String, Vec<DigestEntry>>>,
    scores: Option<BTreeMap<String, ScoreAnswer>>,
    filtered_count: usize,
    confidence: f32,
    reason: String,
}

#[derive(Debug, Deserialize)]
struct ScoreAnswer {
    relevance: f32,
    #[serde(default)]
    significance: f32,
    #[serde(default)]
    impact: f32,
    #[serde(default)]
    ecosystem_relevance: f32,
    #[serde(default)]
    average_score: Option<f32>,
    #[serde(default)]
    reasoning: String,
}

impl ScoreAnswer {
    fn into_scores(self) -> ItemScores {
        let mut s = ItemScores {
            relevance: unit(self.relevance),
            significance: unit(self.significance),
            impact: unit(self.impact),
            ecosystem_relevance: unit(self.ecosystem_relevance),
            average_score: 0.0,
            reasoning: self.reasoning.trim().to_string(),
        };
        s.average_score = match self.average_score {
            Some(avg) if avg.is_finite() => unit(avg),
            _ => s.mean(),
        };
        s
    }
}

fn unit(v: f32) -> f32 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn missing(field: &str, hint: &CategoryHint) -> anyhow::Error {
    HarvestError::ExternalService {
        service: SERVICE,
        message: format!("{} answer has no `{field}`", hint.label()),
    }
    .into()
}

/// Parses the model's answer to `hint`.
///
/// A filter answer must carry `kept_ids`, a score answer `scores`, a
/// categorize answer `subcategories`, and a group resolution either
/// `kept_ids` or `combined_text`. An answer missing its field is an
/// external-service error so the caller retries instead of acting on it.
pub fn parse_classification(content: &str, hint: &CategoryHint) -> Result<Classification> {
    let a: Answer = serde_json::from_str(content.trim()).map_err(|e| HarvestError::ExternalService {
        service: SERVICE,
        message: format!("unparseable classification: {e}"),
    })?;
    let combined_text = a.combined_text.filter(|t| !t.trim().is_empty());
    match hint {
        CategoryHint::Filter { .. } if a.kept_ids.is_none() => return Err(missing("kept_ids", hint)),
        CategoryHint::Score { .. } if a.scores.is_none() => return Err(missing("scores", hint)),
        CategoryHint::Categorize { .. } if a.subcategories.is_none() => {
            return Err(missing("subcategories", hint))
        }
        CategoryHint::ResolveGroup { .. } if a.kept_ids.is_none() && combined_text.is_none() => {
            return Err(missing("kept_ids", hint))
        }
        _ => {}
    }
    let scores = a
        .scores
        .unwrap_or_default()
        .into_iter()
        .map(|(id, s)| (id, s.into_scores()))
        .collect();
    Ok(Classification {
        kept_ids: a.kept_ids.unwrap_or_default(),
        combined_text,
        groupings: a.subcategories.unwrap_or_default(),
        scores,
        filtered_count: a.filtered_count,
        confidence: unit(a.confidence),
        reason: a.reason.trim().to_string(),
    })
}

fn user_prompt(items: &[RawItem]) -> Result<String> {
    let rows: Vec<serde_json::Value> = items
        .iter()
        .map(|it| {
            json!({
                "id": it.id,
                "author": it.author_handle,
                "text": it.text,
                "url": it.url,
                "isRepost": it.is_repost,
                "isQuote": it.is_quote_retweet,
                "quoted": it.quoted_content.as_ref().map(|q| &q.text),
            })
        })
        .collect();
    let body = serde_json::to_string_pretty(&rows).context("serializing items for classifier")?;
    Ok(format!("Posts to analyze:\n{body}"))
}

fn focus_block(focus: &[String]) -> String {
    if focus.is_empty() {
        return String::from("(no specific focus areas)");
    }
    focus
        .iter()
        .map(|f| format!("- {f}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn system_prompt(hint: &CategoryHint) -> String {
    match hint {
        CategoryHint::Filter { category, focus } => format!(
            "You are a specialized crypto and web3 analyst focusing on {category}.\n\
             Drop posts that lack direct relevance to {category}, contain no concrete \
             verifiable information, are generic announcements without specifics, \
             reposts without additional context, or purely promotional.\n\
             Focus areas:\n{}\n\
             Reply with JSON: {{\"kept_ids\": [string], \"filtered_count\": int, \
             \"confidence\": number between 0 and 1, \"reason\": string}}.",
            focus_block(focus)
        ),
        CategoryHint::Score { category, focus } => format!(
            "You are a specialized crypto and web3 analyst focusing on {category}.\n\
             Score every post from 0 to 1 on relevance to {category}, significance of \
             the update, likely impact, and relevance to the wider ecosystem.\n\
             Focus areas:\n{}\n\
             Reply with JSON: {{\"scores\": {{\"<post id>\": {{\"relevance\": number, \
             \"significance\": number, \"impact\": number, \"ecosystem_relevance\": number, \
             \"average_score\": number, \"reasoning\": string}}}}}}.",
            focus_block(focus)
        ),
        CategoryHint::ResolveGroup { strict } => format!(
            "The following posts were flagged as possible duplicates of one event.\n\
             Decide whether they describe the SAME event. If they do, either keep the \
             single most informative id or write one combined text that preserves \
             every concrete detail. If they do not, keep all ids.\n\
             Only collapse when you are {} sure.\n\
             Reply with JSON: {{\"kept_ids\": [string], \"combined_text\": string or null, \
             \"confidence\": number between 0 and 1, \"reason\": string}}.",
            if *strict { "extremely" } else { "very" }
        ),
        CategoryHint::Categorize { category, focus } => format!(
            "You are a specialized crypto and web3 analyst focusing on {category}.\n\
             Organise the posts into at most 5 subcategories plus \"Other Updates\". \
             A subcategory needs at least 3 posts; smaller groups go to \"Other Updates\". \
             Summaries are at most 12 words: concrete facts and metrics.\n\
             Focus areas:\n{}\n\
             Reply with JSON: {{\"filtered_count\": int, \"subcategories\": \
             {{\"Name\": [{{\"author\": string, \"summary\": string, \"url\": string}}]}}, \
             \"confidence\": number between 0 and 1}}.",
            focus_block(focus)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> CategoryHint {
        CategoryHint::Filter {
            category: "NEAR Ecosystem".into(),
            focus: vec![],
        }
    }

    fn classifier_error(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<HarvestError>(),
            Some(HarvestError::ExternalService { .. })
        )
    }

    #[test]
    fn parses_lenient_answer_and_clamps_confidence() {
        let c = parse_classification(
            r#"{"kept_ids":["a","b"],"combined_text":"  ","confidence":1.4,"reason":" same launch "}"#,
            &CategoryHint::ResolveGroup { strict: false },
        )
        .unwrap();
        assert_eq!(c.kept_ids, vec!["a", "b"]);
        assert!(c.combined_text.is_none());
        assert_eq!(c.confidence, 1.0);
        assert_eq!(c.reason, "same launch");
    }

    #[test]
    fn parses_subcategories() {
        let c = parse_classification(
            r#"{"filtered_count":3,"subcategories":{"Governance":[{"author":"dot","summary":"ref 123 passed","url":"u"}]}}"#,
            &CategoryHint::Categorize {
                category: "Polkadot Ecosystem".into(),
                focus: vec![],
            },
        )
        .unwrap();
        assert_eq!(c.filtered_count, 3);
        assert_eq!(c.groupings["Governance"][0].summary, "ref 123 passed");
        assert_eq!(c.confidence, 0.0);
    }

    #[test]
    fn garbage_is_an_external_service_error() {
        let err = parse_classification("not json", &filter()).unwrap_err();
        assert!(classifier_error(&err));
    }

    #[test]
    fn filter_answer_without_kept_ids_is_rejected() {
        let err = parse_classification(r#"{"keep":["1","2"],"confidence":0.99}"#, &filter()).unwrap_err();
        assert!(classifier_error(&err));
        assert!(err.to_string().contains("kept_ids"), "{err}");

        let empty = parse_classification(r#"{"kept_ids":[],"confidence":0.9}"#, &filter()).unwrap();
        assert!(empty.kept_ids.is_empty());
    }

    #[test]
    fn each_question_requires_its_own_field() {
        let score = CategoryHint::Score {
            category: "NEAR Ecosystem".into(),
            focus: vec![],
        };
        assert!(parse_classification(r#"{"kept_ids":["1"]}"#, &score).is_err());
        let categorize = CategoryHint::Categorize {
            category: "NEAR Ecosystem".into(),
            focus: vec![],
        };
        assert!(parse_classification(r#"{"kept_ids":["1"]}"#, &categorize).is_err());
        let resolve = CategoryHint::ResolveGroup { strict: true };
        assert!(parse_classification(r#"{"confidence":0.99}"#, &resolve).is_err());
        let merged =
            parse_classification(r#"{"combined_text":"one launch","confidence":0.99}"#, &resolve).unwrap();
        assert_eq!(merged.combined_text.as_deref(), Some("one launch"));
    }

    #[test]
    fn score_answer_clamps_and_fills_missing_average() {
        let score = CategoryHint::Score {
            category: "NEAR Ecosystem".into(),
            focus: vec![],
        };
        let c = parse_classification(
            r#"{"scores":{"1":{"relevance":1.3,"significance":0.6,"impact":0.2,"ecosystem_relevance":0.6,"reasoning":" mainnet "}}}"#,
            &score,
        )
        .unwrap();
        let s = &c.scores["1"];
        assert_eq!(s.relevance, 1.0);
        assert!((s.average_score - 0.6).abs() < 1e-6);
        assert_eq!(s.reasoning, "mainnet");

        // relevance is the one field a score cannot do without
        assert!(parse_classification(r#"{"scores":{"1":{"impact":0.9}}}"#, &score).is_err());
    }

    #[test]
    fn prompts_carry_category_and_focus() {
        let p = system_prompt(&CategoryHint::Categorize {
            category: "IOTA Ecosystem".into(),
            focus: vec!["Smart Contract Platform".into()],
        });
        assert!(p.contains("IOTA Ecosystem"));
        assert!(p.contains("- Smart Contract Platform"));
    }
}
