//! The append-only query history sink. The gateway records every handed-over
//! query asynchronously and ignores sink failures; the entries feed admin
//! tooling, never routing decisions.

use std::{collections::VecDeque, time::SystemTime};

use enum_dispatch::enum_dispatch;
use snafu::Snafu;
use tokio::sync::RwLock;
use tracing::instrument;
use trino_gateway_core::{BackendName, TrinoQueryId};

#[derive(Snafu, Debug)]
pub enum Error {
    /// Surface for sinks with real I/O behind them. The in-memory sink never
    /// produces it.
    #[snafu(display("Failed to record query history entry: {message}"))]
    Record { message: String },
}

#[derive(Clone, Debug)]
pub struct QueryHistoryEntry {
    pub query_id: TrinoQueryId,
    pub user: Option<String>,
    pub source: Option<String>,
    pub query: Option<String>,
    pub backend: BackendName,
    pub submitted_at: SystemTime,
}

#[enum_dispatch(QueryHistoryImplementation)]
#[trait_variant::make(SendQueryHistory: Send)]
pub trait QueryHistory {
    async fn record(&self, entry: QueryHistoryEntry) -> Result<(), Error>;

    /// Most recent entries first.
    async fn recent(&self, limit: usize) -> Result<Vec<QueryHistoryEntry>, Error>;
}

#[enum_dispatch]
pub enum QueryHistoryImplementation {
    InMemory(InMemoryQueryHistory),
}

pub struct InMemoryQueryHistory {
    entries: RwLock<VecDeque<QueryHistoryEntry>>,
    capacity: usize,
}

impl InMemoryQueryHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }
}

impl Default for InMemoryQueryHistory {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl QueryHistory for InMemoryQueryHistory {
    #[instrument(skip(self, entry), fields(query_id = %entry.query_id))]
    async fn record(&self, entry: QueryHistoryEntry) -> Result<(), Error> {
        let mut entries = self.entries.write().await;
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);

        Ok(())
    }

    #[instrument(skip(self))]
    async fn recent(&self, limit: usize) -> Result<Vec<QueryHistoryEntry>, Error> {
        let entries = self.entries.read().await;
        Ok(entries.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(query_id: &str) -> QueryHistoryEntry {
        QueryHistoryEntry {
            query_id: query_id.to_string(),
            user: Some("will".to_string()),
            source: Some("trino-cli".to_string()),
            query: Some("SELECT 1".to_string()),
            backend: "trino-1".to_string(),
            submitted_at: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn test_record_and_recent() {
        let history = InMemoryQueryHistory::new(10);

        history.record(entry("20240101_000000_00001_aaaaa")).await.unwrap();
        history.record(entry("20240101_000000_00002_bbbbb")).await.unwrap();

        let recent = history.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].query_id, "20240101_000000_00002_bbbbb");
        assert_eq!(recent[1].query_id, "20240101_000000_00001_aaaaa");
    }

    #[tokio::test]
    async fn test_capacity_is_bounded() {
        let history = InMemoryQueryHistory::new(2);

        history.record(entry("20240101_000000_00001_aaaaa")).await.unwrap();
        history.record(entry("20240101_000000_00002_bbbbb")).await.unwrap();
        history.record(entry("20240101_000000_00003_ccccc")).await.unwrap();

        let recent = history.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].query_id, "20240101_000000_00003_ccccc");
        assert_eq!(recent[1].query_id, "20240101_000000_00002_bbbbb");
    }
}
