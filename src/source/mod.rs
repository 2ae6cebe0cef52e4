// src/source/mod.rs
//! Source Adapter seam: the collaborator that turns a rendered feed page into
//! `RawItem`s. The automation session behind it is not safe for concurrent
//! use, so every call goes through [`SharedSession`].

pub mod http;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Mutex;

use crate::retry::with_timeout;
use crate::types::{RawItem, Source};

#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Every column currently visible in the session.
    async fn list_columns(&self) -> Result<Vec<Source>>;
    /// Newest-first, bounded head of one column.
    async fn fetch_head(&self, source_id: &str) -> Result<Vec<RawItem>>;
    /// Tear down and rebuild the automation session.
    async fn reinitialize(&self) -> Result<()>;
    fn name(&self) -> &'static str;
}

/// One adapter shared by every poller, serialized behind a single mutex and
/// bounded by a per-call timeout.
#[derive(Clone)]
pub struct SharedSession {
    adapter: Arc<dyn SourceAdapter>,
    gate: Arc<Mutex<()>>,
    call_timeout: Duration,
}

impl SharedSession {
    pub fn new(adapter: Arc<dyn SourceAdapter>, call_timeout: Duration) -> Self {
        Self {
            adapter,
            gate: Arc::new(Mutex::new(())),
            call_timeout,
        }
    }

    pub fn adapter_name(&self) -> &'static str {
        self.adapter.name()
    }

    pub async fn list_columns(&self) -> Result<Vec<Source>> {
        let _session = self.gate.lock().await;
        with_timeout(self.call_timeout, "list_columns", self.adapter.list_columns()).await
    }

    /// Items come back stamped with `source_id` when the adapter left it blank.
    pub async fn fetch_head(&self, source_id: &str) -> Result<Vec<RawItem>> {
        let mut items = {
            let _session = self.gate.lock().await;
            with_timeout(
                self.call_timeout,
                "fetch_head",
                self.adapter.fetch_head(source_id),
            )
            .await?
        };
        for it in items.iter_mut().filter(|it| it.source_id.is_empty()) {
            it.source_id = source_id.to_string();
        }
        Ok(items)
    }

    pub async fn reinitialize(&self) -> Result<()> {
        let _session = self.gate.lock().await;
        // Session rebuilds are slower than a fetch; allow a few call budgets.
        with_timeout(
            self.call_timeout.saturating_mul(4),
            "reinitialize",
            self.adapter.reinitialize(),
        )
        .await
    }
}
