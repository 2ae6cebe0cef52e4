// src/source/http.rs
//! Adapter for an automation sidecar that owns the browser session and exposes
//! the columns it sees over HTTP.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;

use super::SourceAdapter;
use crate::error::HarvestError;
use crate::types::{RawItem, Source};

pub struct HttpSourceAdapter {
    base: String,
    client: Client,
}

impl HttpSourceAdapter {
    pub fn new(base: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent("column-harvester/0.1")
            .connect_timeout(Duration::from_secs(4))
            .timeout(timeout)
            .build()
            .context("building source adapter http client")?;
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base, path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| HarvestError::TransientIo(format!("GET {url}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(HarvestError::TransientIo(format!("GET {url}: HTTP {status}")).into());
        }
        resp.json::<T>()
            .await
            .with_context(|| format!("decoding {url}"))
    }
}

#[async_trait::async_trait]
impl SourceAdapter for HttpSourceAdapter {
    async fn list_columns(&self) -> Result<Vec<Source>> {
        self.get_json("/columns").await
    }

    async fn fetch_head(&self, source_id: &str) -> Result<Vec<RawItem>> {
        self.get_json(&format!("/columns/{source_id}/head")).await
    }

    async fn reinitialize(&self) -> Result<()> {
        let url = format!("{}/session/reinit", self.base);
        self.client
            .post(&url)
            .send()
            .await
            .map_err(|e| HarvestError::TransientIo(format!("POST {url}: {e}")))?
            .error_for_status()
            .map_err(|e| HarvestError::TransientIo(format!("POST {url}: {e}")))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http-sidecar"
    }
}
