// src/store.rs
//! On-disk layout and atomic JSON persistence.
//!
//! Every write goes to a sibling `*.tmp` file and is renamed into place, so a
//! reader sees either the previous content or the complete new content.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, Utc};
use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;

pub const DATE_FORMAT: &str = "%Y%m%d";

#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_dir(&self, date: &str) -> PathBuf {
        self.root.join("raw").join(date)
    }

    pub fn raw_log(&self, date: &str, source_id: &str) -> PathBuf {
        self.raw_dir(date)
            .join(format!("column_{}.json", file_safe(source_id)))
    }

    /// DedupIndex snapshot.
    pub fn latest_index(&self) -> PathBuf {
        self.root.join("latest_tweets.json")
    }

    pub fn processed(&self, date: &str) -> PathBuf {
        self.root
            .join("processed")
            .join(format!("processed_tweets_{date}.json"))
    }

    pub fn summaries(&self, date: &str) -> PathBuf {
        self.root
            .join("summaries")
            .join(format!("summaries_{date}.json"))
    }

    pub fn delivery_ledger(&self, date: &str) -> PathBuf {
        self.root
            .join("summaries")
            .join(format!("delivered_{date}.json"))
    }
}

/// Source ids become part of a file name. Percent-encoding keeps the mapping
/// reversible, so distinct ids never share a raw log.
pub fn file_safe(id: &str) -> String {
    urlencoding::encode(id).into_owned()
}

/// Source id encoded in a `column_<id>.json` file name.
pub fn source_id_from_log(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let encoded = stem.strip_prefix("column_")?;
    urlencoding::decode(encoded).ok().map(|id| id.into_owned())
}

pub fn today() -> String {
    Utc::now().format(DATE_FORMAT).to_string()
}

pub fn previous_day(date: &str) -> Result<String> {
    let d = parse_date(date)?;
    Ok((d - Duration::days(1)).format(DATE_FORMAT).to_string())
}

pub fn parse_date(date: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(date, DATE_FORMAT)
        .with_context(|| format!("invalid date {date:?}, expected YYYYMMDD"))
}

pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}

/// `Ok(None)` when the file does not exist yet.
pub async fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::try_exists(path).await {
        Ok(true) => read_json(path).await.map(Some),
        Ok(false) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("probing {}", path.display())),
    }
}

pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = serde_json::to_vec_pretty(value).context("serializing json")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &json)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}
