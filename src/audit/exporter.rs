//! Log Exporter
//!
//! Periodically hands rows older than a configured age to a pluggable
//! export handler and, when policy allows, deletes the exported rows. Rows
//! that other surviving rows still link to are never deleted, so the chain
//! stays verifiable.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::audit::actions::{AnomalyActionDispatcher, AnomalyCause};
use crate::audit::row::{HashAlgorithm, LogEventIdentifier, LogEventRow};
use crate::config::ProtectedLogConfig;
use crate::database::LogStore;
use crate::error::ProtectedLogError;

/// Result of one export run.
#[derive(Debug, Clone, Default)]
pub struct ExportSummary {
    pub exported_rows: u64,
    pub deleted_rows: u64,
    /// Where the handler put the rows, in handler-specific form.
    pub destination: String,
    /// Digest over the exported rows' canonical bytes (signatures included).
    pub digest: Vec<u8>,
}

/// Export destination capability; format and destination belong to the
/// collaborator, not to this subsystem.
#[async_trait]
pub trait ExportHandler: Send + Sync {
    /// Export the given rows, returning a handler-specific destination
    /// description.
    async fn handle(&self, rows: &[LogEventRow]) -> Result<String, ProtectedLogError>;
}

/// Writes exported rows as JSON lines into a timestamped file.
pub struct JsonFileExportHandler {
    directory: PathBuf,
}

impl JsonFileExportHandler {
    pub fn new(directory: PathBuf) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl ExportHandler for JsonFileExportHandler {
    async fn handle(&self, rows: &[LogEventRow]) -> Result<String, ProtectedLogError> {
        std::fs::create_dir_all(&self.directory)
            .map_err(|e| ProtectedLogError::ExportError(format!("create export dir: {}", e)))?;
        let path = self
            .directory
            .join(format!("protectedlog-{}.jsonl", Utc::now().timestamp_millis()));
        let mut file = File::create(&path)
            .map_err(|e| ProtectedLogError::ExportError(format!("create export file: {}", e)))?;
        for row in rows {
            let json = serde_json::to_string(row)?;
            writeln!(file, "{}", json)
                .map_err(|e| ProtectedLogError::ExportError(format!("write export: {}", e)))?;
        }
        file.flush()
            .map_err(|e| ProtectedLogError::ExportError(format!("flush export: {}", e)))?;
        Ok(path.to_string_lossy().to_string())
    }
}

pub struct LogExporter {
    store: Arc<dyn LogStore>,
    actions: Arc<AnomalyActionDispatcher>,
    handler: Arc<dyn ExportHandler>,
    export_older_than_ms: i64,
    delete_after_export: bool,
    hash_algorithm: HashAlgorithm,
    busy: AtomicBool,
    canceled: AtomicBool,
    canceled_permanently: AtomicBool,
}

impl LogExporter {
    pub fn new(
        store: Arc<dyn LogStore>,
        actions: Arc<AnomalyActionDispatcher>,
        handler: Arc<dyn ExportHandler>,
        config: &ProtectedLogConfig,
    ) -> Self {
        LogExporter {
            store,
            actions,
            handler,
            export_older_than_ms: config.export_older_than_ms,
            delete_after_export: config.delete_after_export,
            hash_algorithm: config.hash_algorithm,
            busy: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            canceled_permanently: AtomicBool::new(false),
        }
    }

    /// Run one export unless a run is already in flight or exports have
    /// been canceled permanently. Never queues.
    pub async fn run_if_not_busy(&self) -> Option<ExportSummary> {
        if self.canceled_permanently.load(Ordering::SeqCst) {
            return None;
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Export already in progress, skipping trigger");
            return None;
        }
        let result = self.run().await;
        self.canceled.store(false, Ordering::SeqCst);
        self.busy.store(false, Ordering::SeqCst);
        match result {
            Ok(summary) => Some(summary),
            Err(e) => {
                error!("Log export failed: {}", e);
                self.actions
                    .dispatch(AnomalyCause::InternalError, &format!("export failed: {}", e))
                    .await;
                None
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn cancel_permanently(&self) {
        self.canceled_permanently.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst) || self.canceled_permanently.load(Ordering::SeqCst)
    }

    async fn run(&self) -> Result<ExportSummary, ProtectedLogError> {
        let now = Utc::now().timestamp_millis();
        let cutoff = now - self.export_older_than_ms;
        let rows = self.store.rows_older_than(cutoff).await?;
        if rows.is_empty() {
            return Ok(ExportSummary::default());
        }
        if self.is_canceled() {
            return Ok(ExportSummary::default());
        }

        let mut concatenated = Vec::new();
        for row in &rows {
            concatenated.extend_from_slice(&row.canonical_bytes(true));
        }
        let digest = self.hash_algorithm.digest(&concatenated);

        let destination = self.handler.handle(&rows).await?;
        let mut summary = ExportSummary {
            exported_rows: rows.len() as u64,
            deleted_rows: 0,
            destination,
            digest,
        };

        if self.delete_after_export && !self.is_canceled() {
            let deletable = self.deletable_rows(&rows, cutoff).await?;
            summary.deleted_rows = self.store.delete_rows(&deletable).await?;
        }
        info!(
            "Exported {} log rows to {} ({} deleted), digest {}",
            summary.exported_rows,
            summary.destination,
            summary.deleted_rows,
            hex::encode(&summary.digest)
        );
        Ok(summary)
    }

    /// Exported rows that no surviving row links to, directly or through a
    /// chain of kept exported rows.
    async fn deletable_rows(
        &self,
        exported: &[LogEventRow],
        cutoff: i64,
    ) -> Result<Vec<LogEventIdentifier>, ProtectedLogError> {
        let mut keep = self.store.link_targets_since(cutoff).await?;
        let by_id: HashMap<LogEventIdentifier, &LogEventRow> = exported
            .iter()
            .map(|row| (row.identifier, row))
            .collect();
        // A kept row keeps its own link targets alive as well.
        let mut pending: Vec<LogEventIdentifier> = keep.iter().copied().collect();
        while let Some(id) = pending.pop() {
            if let Some(row) = by_id.get(&id) {
                for target in &row.linked_in_identifiers {
                    if keep.insert(*target) {
                        pending.push(*target);
                    }
                }
            }
        }
        Ok(exported
            .iter()
            .map(|row| row.identifier)
            .filter(|id| !keep.contains(id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryLogStore;
    use std::sync::Mutex;

    struct RecordingHandler {
        batches: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl ExportHandler for RecordingHandler {
        async fn handle(&self, rows: &[LogEventRow]) -> Result<String, ProtectedLogError> {
            self.batches.lock().unwrap().push(rows.len());
            Ok("recorded".to_string())
        }
    }

    fn row(node_id: u64, counter: u64, event_time: i64) -> LogEventRow {
        LogEventRow {
            admin_type: "admin".to_string(),
            admin_data: "test".to_string(),
            ca_id: 1,
            module: 2,
            event_time,
            username: None,
            certificate_serial_number: None,
            certificate_issuer_dn: None,
            event_code: 3,
            comment: "row".to_string(),
            identifier: LogEventIdentifier::new(node_id, counter),
            node_ip: "127.0.0.1".to_string(),
            linked_in_identifiers: if counter > 0 {
                vec![LogEventIdentifier::new(node_id, counter - 1)]
            } else {
                vec![]
            },
            linked_in_hash: None,
            hash_algorithm: HashAlgorithm::Sha256,
            protection_key_identifier: "token-1".to_string(),
            protection_algorithm: "SHA256withECDSA".to_string(),
            protection: None,
        }
    }

    fn exporter(
        store: Arc<MemoryLogStore>,
        older_than_ms: i64,
        delete: bool,
    ) -> LogExporter {
        let config = ProtectedLogConfig {
            export_older_than_ms: older_than_ms,
            delete_after_export: delete,
            ..Default::default()
        };
        LogExporter::new(
            store,
            Arc::new(AnomalyActionDispatcher::new()),
            Arc::new(RecordingHandler {
                batches: Mutex::new(Vec::new()),
            }),
            &config,
        )
    }

    #[tokio::test]
    async fn test_export_without_delete_keeps_rows() {
        let store = Arc::new(MemoryLogStore::new());
        let now = Utc::now().timestamp_millis();
        store.add_row(&row(1, 0, now - 100_000)).await.unwrap();
        store.add_row(&row(1, 1, now)).await.unwrap();

        let exporter = exporter(store.clone(), 50_000, false);
        let summary = exporter.run_if_not_busy().await.unwrap();
        assert_eq!(summary.exported_rows, 1);
        assert_eq!(summary.deleted_rows, 0);
        assert_eq!(store.row_count(), 2);
        assert!(!summary.digest.is_empty());
    }

    #[tokio::test]
    async fn test_delete_spares_rows_still_linked_to() {
        let store = Arc::new(MemoryLogStore::new());
        let now = Utc::now().timestamp_millis();
        // Rows 0 and 1 are old; row 2 is recent and links to row 1, which
        // in turn links to row 0: neither may be deleted.
        store.add_row(&row(1, 0, now - 200_000)).await.unwrap();
        store.add_row(&row(1, 1, now - 100_000)).await.unwrap();
        store.add_row(&row(1, 2, now)).await.unwrap();

        let exporter = exporter(store.clone(), 50_000, true);
        let summary = exporter.run_if_not_busy().await.unwrap();
        assert_eq!(summary.exported_rows, 2);
        assert_eq!(summary.deleted_rows, 0);
        assert_eq!(store.row_count(), 3);
    }

    #[tokio::test]
    async fn test_delete_removes_unreferenced_rows() {
        let store = Arc::new(MemoryLogStore::new());
        let now = Utc::now().timestamp_millis();
        // A retired node's whole chain is old and nothing recent links it.
        store.add_row(&row(7, 0, now - 300_000)).await.unwrap();
        store.add_row(&row(7, 1, now - 250_000)).await.unwrap();
        store.add_row(&row(1, 0, now)).await.unwrap();

        let exporter = exporter(store.clone(), 50_000, true);
        let summary = exporter.run_if_not_busy().await.unwrap();
        assert_eq!(summary.exported_rows, 2);
        assert_eq!(summary.deleted_rows, 2);
        assert_eq!(store.row_count(), 1);
    }

    #[tokio::test]
    async fn test_canceled_permanently_refuses_runs() {
        let store = Arc::new(MemoryLogStore::new());
        let exporter = exporter(store, 0, false);
        exporter.cancel_permanently();
        assert!(exporter.run_if_not_busy().await.is_none());
    }

    #[tokio::test]
    async fn test_json_file_handler_writes_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let handler = JsonFileExportHandler::new(dir.path().to_path_buf());
        let rows = vec![row(1, 0, 100), row(1, 1, 200)];
        let destination = handler.handle(&rows).await.unwrap();
        let contents = std::fs::read_to_string(&destination).unwrap();
        assert_eq!(contents.lines().count(), 2);
        let parsed: LogEventRow =
            serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.identifier, LogEventIdentifier::new(1, 0));
    }
}
