// src/categories.rs
//! Column → category mapping, category focus areas, delivery destinations and
//! the plain-text rollup format.
//!
//! - Seeded with built-in defaults (`default_seed()`), overridable from
//!   `[categories]` / `[destinations]` in the config file.
//! - The rollup text is the single source of truth for every notifier; the
//!   Telegram renderer re-parses it line by line.

use std::collections::BTreeMap;

use crate::classify::DigestEntry;

pub const OTHER_UPDATES: &str = "Other Updates";

/// Checked in order; the first key contained in the subcategory name wins.
const EMOJI_MAP: &[(&str, &str)] = &[
    ("Protocol Development", "⚡"),
    ("Technical Infrastructure", "🔧"),
    ("Infrastructure Development", "🔧"),
    ("Network Security", "🔒"),
    ("Developer Tools", "🛠️"),
    ("Cross-chain Integration", "🌉"),
    ("Industry Partnerships", "🤝"),
    ("Ecosystem Partnerships", "🤝"),
    ("IoT Integration", "📱"),
    ("Governance", "⚖️"),
    ("Treasury", "💰"),
    ("DAO Activities", "🏛️"),
    ("Ecosystem Growth", "📈"),
    ("Adoption", "🚀"),
    ("TVL", "💹"),
    ("AI Integration", "🤖"),
    ("AI Development", "🧠"),
    ("AI Safety", "🛡️"),
    ("Multi-agent Systems", "🎯"),
];

const DEFAULT_EMOJI: &str = "📌";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryMap {
    /// source id → category name
    columns: BTreeMap<String, String>,
    /// category name → destination id
    destinations: BTreeMap<String, String>,
    /// category name → focus areas handed to the classifier
    focus: BTreeMap<String, Vec<String>>,
}

impl Default for CategoryMap {
    fn default() -> Self {
        Self::default_seed()
    }
}

impl CategoryMap {
    pub fn new(
        columns: BTreeMap<String, String>,
        destinations: BTreeMap<String, String>,
        focus: BTreeMap<String, Vec<String>>,
    ) -> Self {
        Self {
            columns,
            destinations,
            focus,
        }
    }

    pub fn default_seed() -> Self {
        let mut columns = BTreeMap::new();
        let mut destinations = BTreeMap::new();
        let mut focus = BTreeMap::new();

        for (id, name, dest, areas) in [
            (
                "0",
                "NEAR Ecosystem",
                "near",
                &[
                    "Protocol Development & Infrastructure",
                    "DeFi and Smart Contract Innovations",
                    "Cross-chain Integrations & Bridges",
                    "Developer Tools & SDKs",
                    "Ecosystem Growth & Adoption",
                    "AI & Web3 Integration",
                ][..],
            ),
            (
                "1",
                "Polkadot Ecosystem",
                "polkadot",
                &[
                    "Parachain Development & Integration",
                    "Cross-chain Messaging (XCM)",
                    "Governance & Treasury",
                    "Technical Infrastructure",
                    "Ecosystem Partnerships",
                ][..],
            ),
            (
                "2",
                "Arbitrum Ecosystem",
                "arbitrum",
                &[
                    "Layer 2 Scaling Solutions",
                    "Protocol Deployments & TVL",
                    "Governance & DAO Activities",
                    "Infrastructure Development",
                    "Ecosystem Growth Initiatives",
                ][..],
            ),
            (
                "3",
                "IOTA Ecosystem",
                "iota",
                &[
                    "Protocol Development & Updates",
                    "Smart Contract Platform",
                    "IoT Integration & Use Cases",
                    "Network Security & Performance",
                    "Industry Partnerships",
                ][..],
            ),
            (
                "4",
                "AI Agents",
                "ai_agent",
                &[
                    "Agent Development Frameworks",
                    "AI-Blockchain Integration",
                    "Autonomous Systems & DAOs",
                    "Multi-agent Systems",
                    "AI Safety & Governance",
                    "Real-world Applications",
                ][..],
            ),
            (
                "5",
                "DefAI",
                "defai",
                &[
                    "Decentralized AI Infrastructure",
                    "AI Model Training & Deployment",
                    "Data Privacy & Security",
                    "Tokenized AI Systems",
                    "Cross-chain AI Solutions",
                ][..],
            ),
        ] {
            columns.insert(id.to_string(), name.to_string());
            destinations.insert(name.to_string(), dest.to_string());
            focus.insert(
                name.to_string(),
                areas.iter().map(|s| s.to_string()).collect(),
            );
        }

        Self {
            columns,
            destinations,
            focus,
        }
    }

    /// Layer config overrides on top of the current map. Empty values are ignored.
    pub fn with_overrides(
        mut self,
        columns: &BTreeMap<String, String>,
        destinations: &BTreeMap<String, String>,
    ) -> Self {
        for (k, v) in columns {
            if !v.trim().is_empty() {
                self.columns.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
        for (k, v) in destinations {
            if !v.trim().is_empty() {
                self.destinations
                    .insert(k.trim().to_string(), v.trim().to_string());
            }
        }
        self
    }

    pub fn category_for(&self, source_id: &str) -> Option<&str> {
        self.columns.get(source_id).map(String::as_str)
    }

    pub fn destination_for(&self, category: &str) -> Option<&str> {
        self.destinations.get(category).map(String::as_str)
    }

    pub fn focus_for(&self, category: &str) -> &[String] {
        self.focus.get(category).map(Vec::as_slice).unwrap_or(&[])
    }
}

pub fn emoji_for(subcategory: &str) -> &'static str {
    let lower = subcategory.to_lowercase();
    EMOJI_MAP
        .iter()
        .find(|(key, _)| lower.contains(&key.to_lowercase()))
        .map(|(_, e)| *e)
        .unwrap_or(DEFAULT_EMOJI)
}

pub fn header_line(date: &str, category: &str) -> String {
    format!("{date} - {category} Rollup")
}

/// Plain-text rollup: header, blank line, one block per non-empty
/// subcategory, "Other Updates" last.
pub fn format_summary(
    date: &str,
    category: &str,
    subcategories: &BTreeMap<String, Vec<DigestEntry>>,
) -> String {
    let mut lines = vec![header_line(date, category), String::new()];

    let push_block = |lines: &mut Vec<String>, name: &str, entries: &[DigestEntry]| {
        lines.push(format!("{name} {}", emoji_for(name)));
        for e in entries {
            lines.push(format!("{}: {}", e.author, e.summary));
            lines.push(e.url.clone());
        }
    };

    for (name, entries) in subcategories {
        if name == OTHER_UPDATES || entries.is_empty() {
            continue;
        }
        push_block(&mut lines, name, entries);
        lines.push(String::new());
    }
    if let Some(other) = subcategories.get(OTHER_UPDATES).filter(|v| !v.is_empty()) {
        push_block(&mut lines, OTHER_UPDATES, other);
    }

    lines.join("\n")
}

/// A rollup with nothing but its header is not worth sending.
pub fn has_content(text: &str) -> bool {
    text.lines().filter(|l| !l.trim().is_empty()).count() > 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(author: &str, summary: &str) -> DigestEntry {
        DigestEntry {
            author: author.into(),
            summary: summary.into(),
            url: format!("https://x.com/{author}/status/1"),
        }
    }

    #[test]
    fn seed_maps_columns_to_destinations() {
        let m = CategoryMap::default_seed();
        assert_eq!(m.category_for("2"), Some("Arbitrum Ecosystem"));
        assert_eq!(m.destination_for("AI Agents"), Some("ai_agent"));
        assert_eq!(m.focus_for("DefAI").len(), 5);
        assert!(m.category_for("9").is_none());
    }

    #[test]
    fn overrides_replace_and_extend() {
        let mut cols = BTreeMap::new();
        cols.insert("9".to_string(), "Solana".to_string());
        cols.insert("0".to_string(), "  ".to_string());
        let mut dest = BTreeMap::new();
        dest.insert("Solana".to_string(), "-100123".to_string());
        let m = CategoryMap::default_seed().with_overrides(&cols, &dest);
        assert_eq!(m.category_for("9"), Some("Solana"));
        assert_eq!(m.category_for("0"), Some("NEAR Ecosystem"));
        assert_eq!(m.destination_for("Solana"), Some("-100123"));
    }

    #[test]
    fn emoji_lookup_is_case_insensitive_with_default() {
        assert_eq!(emoji_for("on-chain governance votes"), "⚖️");
        assert_eq!(emoji_for("Layer 2 Scaling"), "📌");
    }

    #[test]
    fn summary_puts_other_updates_last() {
        let mut subs = BTreeMap::new();
        subs.insert(OTHER_UPDATES.to_string(), vec![entry("carol", "misc")]);
        subs.insert("Treasury".to_string(), vec![entry("alice", "grant paid")]);
        subs.insert("Empty".to_string(), vec![]);

        let text = format_summary("20250101", "Polkadot Ecosystem", &subs);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "20250101 - Polkadot Ecosystem Rollup");
        assert_eq!(lines[1], "");
        assert_eq!(lines[2], "Treasury 💰");
        assert_eq!(lines[3], "alice: grant paid");
        assert_eq!(lines[6], "Other Updates 📌");
        assert!(!text.contains("Empty"));
        assert!(has_content(&text));
        assert!(!has_content(&header_line("20250101", "DefAI")));
    }
}
