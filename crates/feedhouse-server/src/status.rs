//! Shared Host Status Table
//!
//! Every node records its lifecycle in a table shared by the whole cluster. Access is
//! scoped: `open()` acquires the table, the session works on a private copy, and
//! `close()` persists the copy and releases the table. A session dropped without
//! `close()` releases the table and discards its changes.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedhouse_core::ServerId;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Initializing,
    Up,
    Down,
}

impl std::fmt::Display for HostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostStatus::Initializing => write!(f, "initializing"),
            HostStatus::Up => write!(f, "up"),
            HostStatus::Down => write!(f, "down"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub server_id: ServerId,
    pub endpoint: String,
    pub status: HostStatus,
    pub updated_at: DateTime<Utc>,
}

/// Table of host statuses shared between nodes
#[async_trait]
pub trait StatusTable: Send + Sync {
    /// Acquire the table; held until the session is closed or dropped
    async fn open(&self) -> Result<Box<dyn StatusSession>>;
}

#[async_trait]
pub trait StatusSession: Send {
    fn set_status(&mut self, server_id: &ServerId, endpoint: &str, status: HostStatus);

    fn get_status(&self, server_id: &ServerId) -> Option<HostStatus>;

    fn entries(&self) -> Vec<StatusEntry>;

    /// Persist changes and release the table
    async fn close(self: Box<Self>) -> Result<()>;
}

type Entries = BTreeMap<ServerId, StatusEntry>;

/// In-memory status table
#[derive(Clone, Default)]
pub struct MemoryStatusTable {
    entries: Arc<Mutex<Entries>>,
}

impl MemoryStatusTable {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusTable for MemoryStatusTable {
    async fn open(&self) -> Result<Box<dyn StatusSession>> {
        let guard = self.entries.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryStatusSession { guard, working }))
    }
}

struct MemoryStatusSession {
    guard: OwnedMutexGuard<Entries>,
    working: Entries,
}

#[async_trait]
impl StatusSession for MemoryStatusSession {
    fn set_status(&mut self, server_id: &ServerId, endpoint: &str, status: HostStatus) {
        self.working.insert(
            server_id.clone(),
            StatusEntry {
                server_id: server_id.clone(),
                endpoint: endpoint.to_string(),
                status,
                updated_at: Utc::now(),
            },
        );
    }

    fn get_status(&self, server_id: &ServerId) -> Option<HostStatus> {
        self.working.get(server_id).map(|entry| entry.status)
    }

    fn entries(&self) -> Vec<StatusEntry> {
        self.working.values().cloned().collect()
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let MemoryStatusSession { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_persists_changes() {
        let table = MemoryStatusTable::new();
        let id = ServerId::new("a");

        let mut session = table.open().await.unwrap();
        session.set_status(&id, "inproc://a", HostStatus::Initializing);
        session.set_status(&id, "inproc://a", HostStatus::Up);
        session.close().await.unwrap();

        let session = table.open().await.unwrap();
        assert_eq!(session.get_status(&id), Some(HostStatus::Up));
        let entries = session.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].endpoint, "inproc://a");
    }

    #[tokio::test]
    async fn test_dropped_session_discards_changes() {
        let table = MemoryStatusTable::new();

        let mut session = table.open().await.unwrap();
        session.set_status(&ServerId::new("a"), "inproc://a", HostStatus::Up);
        drop(session);

        let session = table.open().await.unwrap();
        assert!(session.entries().is_empty());
    }

    #[tokio::test]
    async fn test_open_waits_for_release() {
        let table = MemoryStatusTable::new();
        let session = table.open().await.unwrap();

        let second = tokio::time::timeout(std::time::Duration::from_millis(50), table.open()).await;
        assert!(second.is_err());

        session.close().await.unwrap();
        assert!(table.open().await.is_ok());
    }
}
