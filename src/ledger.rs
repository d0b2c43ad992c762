//! The progress ledger, which makes runs resumable.
//!
//! The ledger is a single JSON file in the output directory. It's rewritten
//! in full after every change, via a temporary file and a rename, so a crash
//! loses at most the update that was in flight.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use tokio::sync::Mutex;

use crate::{
    async_utils::io::{ensure_dir, write_atomically},
    document::{DocumentId, ProviderId},
    prelude::*,
};

/// A document which finished successfully.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CompletedEntry {
    /// Number of pages in the document.
    pub pages: u32,
    /// The provider which produced most of the document's pages.
    pub provider: String,
    /// When the document was recorded.
    pub timestamp: DateTime<Utc>,
}

/// A document which could not be processed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FailedEntry {
    pub document: DocumentId,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Everything we persist in `progress.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LedgerData {
    /// Completed documents, by ID.
    #[serde(default)]
    pub completed: BTreeMap<DocumentId, CompletedEntry>,
    /// Failed attempts, oldest first.
    #[serde(default)]
    pub failed: Vec<FailedEntry>,
    /// When this output directory was first used.
    pub start_time: DateTime<Utc>,
    /// Pages recorded across all runs.
    #[serde(default)]
    pub total_pages_processed: u64,
    /// Recognition requests made across all runs.
    #[serde(default)]
    pub total_requests: u64,
    /// Estimated spend in US dollars, by provider.
    #[serde(default)]
    pub estimated_cost: BTreeMap<ProviderId, f64>,
}

impl LedgerData {
    fn empty() -> Self {
        Self {
            completed: BTreeMap::new(),
            failed: Vec::new(),
            start_time: Utc::now(),
            total_pages_processed: 0,
            total_requests: 0,
            estimated_cost: BTreeMap::new(),
        }
    }

    /// Read a saved ledger without creating anything. Returns `None` if there
    /// is no ledger at `path`.
    pub async fn read(path: &Path) -> Result<Option<Self>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("cannot read {:?}", path));
            }
        };
        let data = serde_json::from_slice(&bytes)
            .with_context(|| format!("cannot parse progress ledger {:?}", path))?;
        Ok(Some(data))
    }

    /// Total estimated spend across providers.
    pub fn total_cost(&self) -> f64 {
        self.estimated_cost.values().sum()
    }

    /// The most recent failure for each document that hasn't since completed.
    pub fn outstanding_failures(&self) -> Vec<&FailedEntry> {
        let mut latest = BTreeMap::new();
        for entry in &self.failed {
            if !self.completed.contains_key(&entry.document) {
                latest.insert(&entry.document, entry);
            }
        }
        latest.into_values().collect()
    }
}

/// What a completed document used, for the cumulative totals.
#[derive(Clone, Debug, Default)]
pub struct UsageDelta {
    pub requests: u64,
    pub pages_by_provider: BTreeMap<ProviderId, u64>,
}

/// Durable, shared record of which documents are done.
pub struct ProgressLedger {
    path: PathBuf,
    data: Mutex<LedgerData>,
}

impl ProgressLedger {
    /// Load the ledger at `path`. A missing or unreadable file starts a fresh
    /// ledger.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn open(path: &Path) -> Result<Self> {
        let data = match tokio::fs::read(path).await {
            Ok(bytes) => match serde_json::from_slice::<LedgerData>(&bytes) {
                Ok(data) => {
                    debug!(completed = data.completed.len(), "Loaded progress ledger");
                    data
                }
                Err(err) => {
                    warn!("Ignoring corrupt progress ledger {:?}: {}", path, err);
                    LedgerData::empty()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => LedgerData::empty(),
            Err(err) => {
                warn!("Ignoring unreadable progress ledger {:?}: {}", path, err);
                LedgerData::empty()
            }
        };
        if let Some(parent) = path.parent() {
            ensure_dir(parent).await?;
        }
        Ok(Self {
            path: path.to_owned(),
            data: Mutex::new(data),
        })
    }

    /// Has this document already been completed?
    pub async fn is_completed(&self, id: &DocumentId) -> bool {
        self.data.lock().await.completed.contains_key(id)
    }

    /// Record a successfully processed document, and persist.
    pub async fn mark_completed(
        &self,
        id: &DocumentId,
        pages: u32,
        provider: &str,
        usage: &UsageDelta,
    ) -> Result<()> {
        self.update(|data| {
            data.completed.insert(
                id.clone(),
                CompletedEntry {
                    pages,
                    provider: provider.to_owned(),
                    timestamp: Utc::now(),
                },
            );
            data.total_pages_processed += u64::from(pages);
            data.total_requests += usage.requests;
            for (&provider, &count) in &usage.pages_by_provider {
                *data.estimated_cost.entry(provider).or_default() +=
                    provider.estimated_page_cost() * count as f64;
            }
        })
        .await
    }

    /// Record a failed document, and persist.
    pub async fn mark_failed(&self, id: &DocumentId, error: &str) -> Result<()> {
        self.update(|data| {
            data.failed.push(FailedEntry {
                document: id.clone(),
                error: error.to_owned(),
                timestamp: Utc::now(),
            });
        })
        .await
    }

    /// A copy of the current state.
    pub async fn snapshot(&self) -> LedgerData {
        self.data.lock().await.clone()
    }

    /// Apply `change` to a copy of the state, and keep it only once it has
    /// been saved. Memory never gets ahead of disk.
    async fn update(&self, change: impl FnOnce(&mut LedgerData)) -> Result<()> {
        let mut data = self.data.lock().await;
        let mut next = data.clone();
        change(&mut next);
        self.save(&next).await?;
        *data = next;
        Ok(())
    }

    async fn save(&self, data: &LedgerData) -> Result<()> {
        let json = serde_json::to_vec_pretty(data).context("failed to serialize ledger")?;
        write_atomically(&self.path, &json)
            .await
            .with_context(|| format!("failed to save progress ledger {:?}", self.path))
    }
}
