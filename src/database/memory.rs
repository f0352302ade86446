//! In-memory log store, used by tests and embeddable deployments. Rows are
//! held in an ordered map keyed by `(node_id, counter)`.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;

use crate::audit::row::{LogEventIdentifier, LogEventRow};
use crate::database::{LogFilter, LogStore};
use crate::error::ProtectedLogError;

#[derive(Default)]
pub struct MemoryLogStore {
    rows: RwLock<BTreeMap<(u64, u64), LogEventRow>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a persisted row in place. Test hook for tamper scenarios;
    /// a real store never mutates rows.
    pub fn overwrite_row(&self, row: LogEventRow) {
        let mut rows = self.rows.write().expect("log store lock poisoned");
        rows.insert((row.identifier.node_id, row.identifier.counter), row);
    }

    pub fn row_count(&self) -> usize {
        self.rows.read().expect("log store lock poisoned").len()
    }

    fn lock_err<T>(_: T) -> ProtectedLogError {
        ProtectedLogError::StoreError("log store lock poisoned".to_string())
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn add_row(&self, row: &LogEventRow) -> Result<(), ProtectedLogError> {
        let mut rows = self.rows.write().map_err(Self::lock_err)?;
        let key = (row.identifier.node_id, row.identifier.counter);
        if rows.contains_key(&key) {
            return Err(ProtectedLogError::StoreError(format!(
                "Duplicate log row identifier {}",
                row.identifier
            )));
        }
        rows.insert(key, row.clone());
        Ok(())
    }

    async fn get_row(
        &self,
        id: &LogEventIdentifier,
    ) -> Result<Option<LogEventRow>, ProtectedLogError> {
        let rows = self.rows.read().map_err(Self::lock_err)?;
        Ok(rows.get(&(id.node_id, id.counter)).cloned())
    }

    async fn newest_row(&self) -> Result<Option<LogEventRow>, ProtectedLogError> {
        let rows = self.rows.read().map_err(Self::lock_err)?;
        Ok(rows.values().max_by_key(|r| r.event_time).cloned())
    }

    async fn newest_row_for_node(
        &self,
        node_id: u64,
    ) -> Result<Option<LogEventRow>, ProtectedLogError> {
        let rows = self.rows.read().map_err(Self::lock_err)?;
        Ok(rows
            .range((node_id, 0)..=(node_id, u64::MAX))
            .next_back()
            .map(|(_, row)| row.clone()))
    }

    async fn newest_rows_for_other_nodes(
        &self,
        node_id: u64,
        after: i64,
    ) -> Result<Vec<LogEventIdentifier>, ProtectedLogError> {
        let rows = self.rows.read().map_err(Self::lock_err)?;
        let mut newest: BTreeMap<u64, &LogEventRow> = BTreeMap::new();
        for row in rows.values() {
            if row.identifier.node_id == node_id || row.event_time <= after {
                continue;
            }
            let entry = newest.entry(row.identifier.node_id).or_insert(row);
            if row.identifier.counter > entry.identifier.counter {
                *entry = row;
            }
        }
        Ok(newest.values().map(|row| row.identifier).collect())
    }

    async fn node_ids(&self) -> Result<Vec<u64>, ProtectedLogError> {
        let rows = self.rows.read().map_err(Self::lock_err)?;
        let mut ids: Vec<u64> = rows.keys().map(|(node_id, _)| *node_id).collect();
        ids.dedup();
        Ok(ids)
    }

    async fn rows_older_than(
        &self,
        cutoff: i64,
    ) -> Result<Vec<LogEventRow>, ProtectedLogError> {
        let rows = self.rows.read().map_err(Self::lock_err)?;
        let mut old: Vec<LogEventRow> = rows
            .values()
            .filter(|row| row.event_time < cutoff)
            .cloned()
            .collect();
        old.sort_by_key(|row| row.event_time);
        Ok(old)
    }

    async fn link_targets_since(
        &self,
        cutoff: i64,
    ) -> Result<HashSet<LogEventIdentifier>, ProtectedLogError> {
        let rows = self.rows.read().map_err(Self::lock_err)?;
        let mut targets = HashSet::new();
        for row in rows.values() {
            if row.event_time >= cutoff {
                targets.extend(row.linked_in_identifiers.iter().copied());
            }
        }
        Ok(targets)
    }

    async fn delete_rows(
        &self,
        ids: &[LogEventIdentifier],
    ) -> Result<u64, ProtectedLogError> {
        let mut rows = self.rows.write().map_err(Self::lock_err)?;
        let mut removed = 0;
        for id in ids {
            if rows.remove(&(id.node_id, id.counter)).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn query(
        &self,
        filter: &LogFilter,
        _privileges: Option<&str>,
    ) -> Result<Vec<LogEventRow>, ProtectedLogError> {
        // The privilege expression is SQL owned by the storage collaborator;
        // the in-memory store has no SQL surface to AND it into.
        let rows = self.rows.read().map_err(Self::lock_err)?;
        let mut matched: Vec<LogEventRow> = rows
            .values()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.event_time.cmp(&a.event_time));
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::row::HashAlgorithm;

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
            comment: "test row".to_string(),
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

    #[tokio::test]
    async fn test_duplicate_identifier_rejected() {
        let store = MemoryLogStore::new();
        store.add_row(&row(1, 0, 100)).await.unwrap();
        assert!(store.add_row(&row(1, 0, 200)).await.is_err());
    }

    #[tokio::test]
    async fn test_newest_lookups() {
        let store = MemoryLogStore::new();
        store.add_row(&row(1, 0, 100)).await.unwrap();
        store.add_row(&row(1, 1, 200)).await.unwrap();
        store.add_row(&row(2, 0, 300)).await.unwrap();

        let newest = store.newest_row().await.unwrap().unwrap();
        assert_eq!(newest.identifier, LogEventIdentifier::new(2, 0));

        let newest_node1 = store.newest_row_for_node(1).await.unwrap().unwrap();
        assert_eq!(newest_node1.identifier, LogEventIdentifier::new(1, 1));

        let others = store.newest_rows_for_other_nodes(1, 0).await.unwrap();
        assert_eq!(others, vec![LogEventIdentifier::new(2, 0)]);

        let none_recent = store.newest_rows_for_other_nodes(1, 300).await.unwrap();
        assert!(none_recent.is_empty());
    }

    #[tokio::test]
    async fn test_query_ordered_descending() {
        let store = MemoryLogStore::new();
        store.add_row(&row(1, 0, 100)).await.unwrap();
        store.add_row(&row(1, 1, 300)).await.unwrap();
        store.add_row(&row(1, 2, 200)).await.unwrap();

        let result = store.query(&LogFilter::default(), None).await.unwrap();
        let times: Vec<i64> = result.iter().map(|r| r.event_time).collect();
        assert_eq!(times, vec![300, 200, 100]);

        let filter = LogFilter {
            occurred_after: Some(150),
            ..Default::default()
        };
        assert_eq!(store.query(&filter, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_link_targets_and_delete() {
        let store = MemoryLogStore::new();
        store.add_row(&row(1, 0, 100)).await.unwrap();
        store.add_row(&row(1, 1, 200)).await.unwrap();

        let targets = store.link_targets_since(150).await.unwrap();
        assert!(targets.contains(&LogEventIdentifier::new(1, 0)));

        let removed = store
            .delete_rows(&[LogEventIdentifier::new(1, 0)])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store
            .get_row(&LogEventIdentifier::new(1, 0))
            .await
            .unwrap()
            .is_none());
    }
}
