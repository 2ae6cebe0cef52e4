// src/dedup_index.rs
//! Per-source "last seen id" cursor, persisted as `latest_tweets.json`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::store;
use crate::types::RawItem;

#[derive(Debug)]
pub struct DedupIndex {
    path: PathBuf,
    // Held across the snapshot write so concurrent pollers persist in order.
    cursors: Mutex<BTreeMap<String, String>>,
}

impl DedupIndex {
    /// Load the snapshot; a missing or unreadable file starts an empty index.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cursors = match store::read_json_opt::<BTreeMap<String, String>>(&path).await {
            Ok(Some(map)) => {
                info!(count = map.len(), "loaded latest item ids");
                map
            }
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "dedup index unreadable, starting empty");
                BTreeMap::new()
            }
        };
        Self {
            path,
            cursors: Mutex::new(cursors),
        }
    }

    pub async fn last_seen(&self, source_id: &str) -> Option<String> {
        self.cursors.lock().await.get(source_id).cloned()
    }

    /// Move the cursor and rewrite the snapshot.
    ///
    /// Callers must have persisted the raw log containing `id` first.
    pub async fn advance(&self, source_id: &str, id: &str) -> Result<()> {
        let mut guard = self.cursors.lock().await;
        guard.insert(source_id.to_string(), id.to_string());
        store::write_json_atomic(&self.path, &*guard).await
    }

    pub async fn snapshot(&self) -> BTreeMap<String, String> {
        self.cursors.lock().await.clone()
    }
}

/// Items newer than `last_seen` in a newest-first head.
///
/// Everything from the head down to (excluding) `last_seen` is new. When the
/// cursor is absent from the head, every fetched item counts as new; items
/// older than the cursor that show up later are never reported.
pub fn new_items_since(head: Vec<RawItem>, last_seen: Option<&str>) -> Vec<RawItem> {
    match last_seen {
        None => head,
        Some(last) => head.into_iter().take_while(|it| it.id != last).collect(),
    }
}
