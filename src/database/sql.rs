//! SQLite-backed log store.
//!
//! Node ids are stored as their i64 bit pattern; SQLite has no unsigned
//! 64-bit column type.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashSet;
use std::str::FromStr;

use crate::audit::row::{HashAlgorithm, LogEventIdentifier, LogEventRow};
use crate::database::{LogFilter, LogStore};
use crate::error::ProtectedLogError;

const SELECT_COLUMNS: &str = "node_id, counter, admin_type, admin_data, ca_id, module, \
     event_time, username, certificate_serial_number, certificate_issuer_dn, \
     event_code, comment, node_ip, linked_in_identifiers, linked_in_hash, \
     hash_algorithm, protection_key_identifier, protection_algorithm, protection";

pub struct SqlLogStore {
    pool: SqlitePool,
}

impl SqlLogStore {
    pub async fn new(database_url: &str) -> Result<Self, ProtectedLogError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| ProtectedLogError::ConfigError(format!("Bad database URL: {}", e)))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Ok(SqlLogStore { pool })
    }

    /// In-memory database, primarily for tests. A single connection keeps
    /// the database alive for the pool's lifetime.
    pub async fn new_in_memory() -> Result<Self, ProtectedLogError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(SqlLogStore { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), ProtectedLogError> {
        sqlx::raw_sql(include_str!("../migrations/001_protected_log.sql"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn decode_row(row: &SqliteRow) -> Result<LogEventRow, ProtectedLogError> {
        let linked_json: String = row.get("linked_in_identifiers");
        let linked_in_identifiers: Vec<LogEventIdentifier> =
            serde_json::from_str(&linked_json)?;
        let hash_algorithm: String = row.get("hash_algorithm");
        Ok(LogEventRow {
            admin_type: row.get("admin_type"),
            admin_data: row.get("admin_data"),
            ca_id: row.get::<i64, _>("ca_id") as u32,
            module: row.get::<i64, _>("module") as u32,
            event_time: row.get("event_time"),
            username: row.get("username"),
            certificate_serial_number: row.get("certificate_serial_number"),
            certificate_issuer_dn: row.get("certificate_issuer_dn"),
            event_code: row.get::<i64, _>("event_code") as u32,
            comment: row.get("comment"),
            identifier: LogEventIdentifier::new(
                row.get::<i64, _>("node_id") as u64,
                row.get::<i64, _>("counter") as u64,
            ),
            node_ip: row.get("node_ip"),
            linked_in_identifiers,
            linked_in_hash: row.get("linked_in_hash"),
            hash_algorithm: hash_algorithm.parse::<HashAlgorithm>()?,
            protection_key_identifier: row.get("protection_key_identifier"),
            protection_algorithm: row.get("protection_algorithm"),
            protection: row.get("protection"),
        })
    }
}

#[async_trait]
impl LogStore for SqlLogStore {
    async fn add_row(&self, row: &LogEventRow) -> Result<(), ProtectedLogError> {
        let linked_json = serde_json::to_string(&row.linked_in_identifiers)?;
        let result = sqlx::query(
            "INSERT INTO protected_log_rows (node_id, counter, admin_type, admin_data, \
             ca_id, module, event_time, username, certificate_serial_number, \
             certificate_issuer_dn, event_code, comment, node_ip, \
             linked_in_identifiers, linked_in_hash, hash_algorithm, \
             protection_key_identifier, protection_algorithm, protection) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(row.identifier.node_id as i64)
        .bind(row.identifier.counter as i64)
        .bind(&row.admin_type)
        .bind(&row.admin_data)
        .bind(row.ca_id as i64)
        .bind(row.module as i64)
        .bind(row.event_time)
        .bind(&row.username)
        .bind(&row.certificate_serial_number)
        .bind(&row.certificate_issuer_dn)
        .bind(row.event_code as i64)
        .bind(&row.comment)
        .bind(&row.node_ip)
        .bind(linked_json)
        .bind(&row.linked_in_hash)
        .bind(row.hash_algorithm.name())
        .bind(&row.protection_key_identifier)
        .bind(&row.protection_algorithm)
        .bind(&row.protection)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(ProtectedLogError::StoreError(format!(
                    "Duplicate log row identifier {}",
                    row.identifier
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_row(
        &self,
        id: &LogEventIdentifier,
    ) -> Result<Option<LogEventRow>, ProtectedLogError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM protected_log_rows WHERE node_id = ? AND counter = ?",
            SELECT_COLUMNS
        ))
        .bind(id.node_id as i64)
        .bind(id.counter as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::decode_row).transpose()
    }

    async fn newest_row(&self) -> Result<Option<LogEventRow>, ProtectedLogError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM protected_log_rows ORDER BY event_time DESC LIMIT 1",
            SELECT_COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::decode_row).transpose()
    }

    async fn newest_row_for_node(
        &self,
        node_id: u64,
    ) -> Result<Option<LogEventRow>, ProtectedLogError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM protected_log_rows WHERE node_id = ? \
             ORDER BY counter DESC LIMIT 1",
            SELECT_COLUMNS
        ))
        .bind(node_id as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::decode_row).transpose()
    }

    async fn newest_rows_for_other_nodes(
        &self,
        node_id: u64,
        after: i64,
    ) -> Result<Vec<LogEventIdentifier>, ProtectedLogError> {
        let rows = sqlx::query(
            "SELECT node_id, MAX(counter) AS counter FROM protected_log_rows \
             WHERE node_id != ? AND event_time > ? GROUP BY node_id",
        )
        .bind(node_id as i64)
        .bind(after)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| {
                LogEventIdentifier::new(
                    row.get::<i64, _>("node_id") as u64,
                    row.get::<i64, _>("counter") as u64,
                )
            })
            .collect())
    }

    async fn node_ids(&self) -> Result<Vec<u64>, ProtectedLogError> {
        let rows = sqlx::query("SELECT DISTINCT node_id FROM protected_log_rows")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| row.get::<i64, _>("node_id") as u64)
            .collect())
    }

    async fn rows_older_than(
        &self,
        cutoff: i64,
    ) -> Result<Vec<LogEventRow>, ProtectedLogError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM protected_log_rows WHERE event_time < ? \
             ORDER BY event_time ASC",
            SELECT_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::decode_row).collect()
    }

    async fn link_targets_since(
        &self,
        cutoff: i64,
    ) -> Result<HashSet<LogEventIdentifier>, ProtectedLogError> {
        let rows = sqlx::query(
            "SELECT linked_in_identifiers FROM protected_log_rows WHERE event_time >= ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        let mut targets = HashSet::new();
        for row in rows {
            let linked_json: String = row.get("linked_in_identifiers");
            let linked: Vec<LogEventIdentifier> = serde_json::from_str(&linked_json)?;
            targets.extend(linked);
        }
        Ok(targets)
    }

    async fn delete_rows(
        &self,
        ids: &[LogEventIdentifier],
    ) -> Result<u64, ProtectedLogError> {
        let mut removed = 0;
        for id in ids {
            let result =
                sqlx::query("DELETE FROM protected_log_rows WHERE node_id = ? AND counter = ?")
                    .bind(id.node_id as i64)
                    .bind(id.counter as i64)
                    .execute(&self.pool)
                    .await?;
            removed += result.rows_affected();
        }
        Ok(removed)
    }

    async fn query(
        &self,
        filter: &LogFilter,
        privileges: Option<&str>,
    ) -> Result<Vec<LogEventRow>, ProtectedLogError> {
        let mut sql = format!(
            "SELECT {} FROM protected_log_rows WHERE 1=1",
            SELECT_COLUMNS
        );
        if filter.ca_id.is_some() {
            sql.push_str(" AND ca_id = ?");
        }
        if filter.module.is_some() {
            sql.push_str(" AND module = ?");
        }
        if filter.event_code.is_some() {
            sql.push_str(" AND event_code = ?");
        }
        if filter.username.is_some() {
            sql.push_str(" AND username = ?");
        }
        if filter.admin_type.is_some() {
            sql.push_str(" AND admin_type = ?");
        }
        if filter.occurred_after.is_some() {
            sql.push_str(" AND event_time >= ?");
        }
        if filter.occurred_before.is_some() {
            sql.push_str(" AND event_time <= ?");
        }
        // The caller's privilege predicate is ANDed in verbatim; it belongs
        // to the storage collaborator's schema, not to this subsystem.
        if let Some(privileges) = privileges {
            sql.push_str(&format!(" AND ({})", privileges));
        }
        sql.push_str(" ORDER BY event_time DESC");

        let mut query = sqlx::query(&sql);
        if let Some(ca_id) = filter.ca_id {
            query = query.bind(ca_id as i64);
        }
        if let Some(module) = filter.module {
            query = query.bind(module as i64);
        }
        if let Some(event_code) = filter.event_code {
            query = query.bind(event_code as i64);
        }
        if let Some(username) = &filter.username {
            query = query.bind(username);
        }
        if let Some(admin_type) = &filter.admin_type {
            query = query.bind(admin_type);
        }
        if let Some(after) = filter.occurred_after {
            query = query.bind(after);
        }
        if let Some(before) = filter.occurred_before {
            query = query.bind(before);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::decode_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(node_id: u64, counter: u64, event_time: i64) -> LogEventRow {
        LogEventRow {
            admin_type: "admin".to_string(),
            admin_data: "test".to_string(),
            ca_id: 1,
            module: 2,
            event_time,
            username: Some("alice".to_string()),
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
            linked_in_hash: Some(vec![0xAB; 32]),
            hash_algorithm: HashAlgorithm::Sha256,
            protection_key_identifier: "token-1".to_string(),
            protection_algorithm: "SHA256withECDSA".to_string(),
            protection: Some(vec![0xCD; 70]),
        }
    }

    async fn store() -> SqlLogStore {
        let store = SqlLogStore::new_in_memory().await.unwrap();
        store.run_migrations().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_insert_and_roundtrip() {
        let store = store().await;
        let original = row(1, 0, 100);
        store.add_row(&original).await.unwrap();

        let loaded = store
            .get_row(&LogEventIdentifier::new(1, 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, original);
        assert_eq!(loaded.row_hash(), original.row_hash());
    }

    #[tokio::test]
    async fn test_duplicate_identifier_rejected() {
        let store = store().await;
        store.add_row(&row(1, 0, 100)).await.unwrap();
        assert!(store.add_row(&row(1, 0, 200)).await.is_err());
    }

    #[tokio::test]
    async fn test_newest_and_node_scans() {
        let store = store().await;
        store.add_row(&row(1, 0, 100)).await.unwrap();
        store.add_row(&row(1, 1, 200)).await.unwrap();
        store.add_row(&row(2, 0, 300)).await.unwrap();

        let newest = store.newest_row().await.unwrap().unwrap();
        assert_eq!(newest.identifier, LogEventIdentifier::new(2, 0));

        let newest_node1 = store.newest_row_for_node(1).await.unwrap().unwrap();
        assert_eq!(newest_node1.identifier.counter, 1);

        let others = store.newest_rows_for_other_nodes(1, 250).await.unwrap();
        assert_eq!(others, vec![LogEventIdentifier::new(2, 0)]);

        let mut ids = store.node_ids().await.unwrap();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_filtered_query_descending() {
        let store = store().await;
        store.add_row(&row(1, 0, 100)).await.unwrap();
        store.add_row(&row(1, 1, 300)).await.unwrap();
        store.add_row(&row(1, 2, 200)).await.unwrap();

        let filter = LogFilter {
            username: Some("alice".to_string()),
            occurred_after: Some(150),
            ..Default::default()
        };
        let result = store.query(&filter, None).await.unwrap();
        let times: Vec<i64> = result.iter().map(|r| r.event_time).collect();
        assert_eq!(times, vec![300, 200]);

        let privileged = store
            .query(&LogFilter::default(), Some("ca_id = 1"))
            .await
            .unwrap();
        assert_eq!(privileged.len(), 3);
        let none = store
            .query(&LogFilter::default(), Some("ca_id = 99"))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_link_targets_and_delete() {
        let store = store().await;
        store.add_row(&row(1, 0, 100)).await.unwrap();
        store.add_row(&row(1, 1, 200)).await.unwrap();

        let targets = store.link_targets_since(150).await.unwrap();
        assert!(targets.contains(&LogEventIdentifier::new(1, 0)));

        let removed = store
            .delete_rows(&[LogEventIdentifier::new(1, 0), LogEventIdentifier::new(9, 9)])
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }
}
