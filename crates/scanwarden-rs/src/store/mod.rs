use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::models::{ScanRecord, ScanState, VulnerabilityRecord};

/// Persistence collaborator. Receives finalized snapshots only; the
/// orchestrator never reads them back.
#[async_trait::async_trait]
pub trait ScanStore: Send + Sync {
    async fn mark_running(&self, scan_id: &str, started_at: DateTime<Utc>) -> anyhow::Result<()>;

    async fn save_final(&self, scan: ScanRecord, vulnerabilities: Vec<VulnerabilityRecord>) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryScanStore {
    scans: Arc<RwLock<HashMap<String, ScanRecord>>>,
    vulnerabilities: Arc<RwLock<HashMap<String, Vec<VulnerabilityRecord>>>>,
}

impl MemoryScanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn scan(&self, scan_id: &str) -> Option<ScanRecord> {
        self.scans.read().await.get(scan_id).cloned()
    }

    pub async fn vulnerabilities(&self, scan_id: &str) -> Vec<VulnerabilityRecord> {
        self.vulnerabilities
            .read()
            .await
            .get(scan_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl ScanStore for MemoryScanStore {
    async fn mark_running(&self, scan_id: &str, started_at: DateTime<Utc>) -> anyhow::Result<()> {
        let mut scans = self.scans.write().await;
        let record = scans.entry(scan_id.to_string()).or_insert_with(|| ScanRecord {
            id: scan_id.to_string(),
            status: ScanState::Pending,
            scan_type: String::new(),
            started_at: None,
            completed_at: None,
            error_message: None,
            results: None,
        });
        record.status = ScanState::Running;
        record.started_at = Some(started_at);
        Ok(())
    }

    async fn save_final(&self, scan: ScanRecord, vulnerabilities: Vec<VulnerabilityRecord>) -> anyhow::Result<()> {
        anyhow::ensure!(scan.status.is_terminal(), "scan {} saved in non-terminal state {}", scan.id, scan.status);
        self.vulnerabilities
            .write()
            .await
            .insert(scan.id.clone(), vulnerabilities);
        self.scans.write().await.insert(scan.id.clone(), scan);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(id: &str, status: ScanState) -> ScanRecord {
        ScanRecord {
            id: id.to_string(),
            status,
            scan_type: "network-recon".into(),
            started_at: Some(Utc::now()),
            completed_at: Some(Utc::now()),
            error_message: None,
            results: Some("{}".into()),
        }
    }

    #[tokio::test]
    async fn running_then_final_snapshot() {
        let store = MemoryScanStore::new();
        store.mark_running("s1", Utc::now()).await.unwrap();
        assert_eq!(store.scan("s1").await.unwrap().status, ScanState::Running);

        store
            .save_final(finished("s1", ScanState::Completed), vec![])
            .await
            .unwrap();
        let saved = store.scan("s1").await.unwrap();
        assert_eq!(saved.status, ScanState::Completed);
        assert_eq!(saved.scan_type, "network-recon");
    }

    #[tokio::test]
    async fn non_terminal_snapshot_is_refused() {
        let store = MemoryScanStore::new();
        let err = store
            .save_final(finished("s1", ScanState::Running), vec![])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("non-terminal"));
    }
}
