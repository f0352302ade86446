//! End-to-end tests for the protected log: append, chain linking, signing,
//! verification and the degraded shutdown path, all against the in-memory
//! store.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::sync::Mutex;

use protected_log::audit::row::{EVENT_SYSTEM_STOPPED_LOGGING, MODULE_LOG};
use protected_log::audit::{
    AnomalyAction, AnomalyActionDispatcher, AnomalyCause, HashAlgorithm, LogAppender, LogEvent,
    LogEventIdentifier, LogEventRow, LogVerifier,
};
use protected_log::config::ProtectedLogConfig;
use protected_log::crypto::{EcdsaToken, ProtectionToken, TokenRegistry};
use protected_log::database::{LogFilter, LogStore, MemoryLogStore};

/// Records dispatched anomaly causes for assertions.
#[derive(Default)]
struct RecordingAction {
    causes: Mutex<Vec<AnomalyCause>>,
}

impl RecordingAction {
    fn recorded(&self) -> Vec<AnomalyCause> {
        self.causes.lock().unwrap().clone()
    }
}

#[async_trait]
impl AnomalyAction for RecordingAction {
    async fn execute(&self, cause: AnomalyCause, _context: &str) {
        self.causes.lock().unwrap().push(cause);
    }
}

struct Harness {
    store: Arc<MemoryLogStore>,
    tokens: Arc<TokenRegistry>,
    recorder: Arc<RecordingAction>,
    appender: LogAppender,
    config: ProtectedLogConfig,
}

fn harness(config: ProtectedLogConfig) -> Harness {
    let store = Arc::new(MemoryLogStore::new());
    let token: Arc<dyn ProtectionToken> =
        Arc::new(EcdsaToken::generate("token-1".to_string()));
    let tokens = Arc::new(TokenRegistry::new(token));
    let recorder = Arc::new(RecordingAction::default());
    let actions = Arc::new(
        AnomalyActionDispatcher::new().with_default_actions(vec![recorder.clone()]),
    );
    let appender = LogAppender::new(store.clone(), tokens.clone(), actions, config.clone());
    Harness {
        store,
        tokens,
        recorder,
        appender,
        config,
    }
}

fn verifier_for(h: &Harness) -> LogVerifier {
    let actions = Arc::new(
        AnomalyActionDispatcher::new().with_default_actions(vec![h.recorder.clone()]),
    );
    LogVerifier::new(h.store.clone(), h.tokens.clone(), actions, &h.config)
}

fn cert_issued_event(event_time: i64) -> LogEvent {
    LogEvent {
        admin_type: "CA_ADMIN".to_string(),
        admin_data: "cn=admin".to_string(),
        ca_id: 42,
        module: 1,
        event_code: 100,
        event_time,
        username: Some("operator".to_string()),
        certificate: None,
        comment: "certificate issued".to_string(),
        error: None,
    }
}

async fn node_rows(store: &MemoryLogStore, node_id: u64) -> Vec<LogEventRow> {
    let mut rows = Vec::new();
    let mut counter = 0;
    while let Some(row) = store
        .get_row(&LogEventIdentifier::new(node_id, counter))
        .await
        .unwrap()
    {
        rows.push(row);
        counter += 1;
    }
    rows
}

#[tokio::test]
async fn test_first_append_bootstraps_chain() {
    let h = harness(ProtectedLogConfig::default());
    let now = Utc::now().timestamp_millis();

    h.appender.append(cert_issued_event(now)).await.unwrap();

    // Appending to an empty store reports the empty log before proceeding.
    assert!(h.recorded_contains(AnomalyCause::EmptyLog));

    let node_id = h.appender.node_id().await;
    let rows = node_rows(&h.store, node_id).await;
    assert_eq!(rows.len(), 2);

    // The marker row precedes the caller's event by one millisecond and is
    // the genesis of this node's chain.
    let marker = &rows[0];
    assert_eq!(marker.event_time, now - 1);
    assert_eq!(marker.module, MODULE_LOG);
    assert!(marker.linked_in_identifiers.is_empty());
    assert!(marker.linked_in_hash.is_none());
    assert!(marker.protection.is_some());

    // The event row commits to the marker.
    let event_row = &rows[1];
    assert_eq!(
        event_row.linked_in_identifiers,
        vec![LogEventIdentifier::new(node_id, 0)]
    );
    let expected = HashAlgorithm::Sha256.digest(&marker.row_hash());
    assert_eq!(event_row.linked_in_hash.as_deref(), Some(expected.as_slice()));
    assert!(event_row.protection.is_some());
}

impl Harness {
    fn recorded_contains(&self, cause: AnomalyCause) -> bool {
        self.recorder.recorded().contains(&cause)
    }
}

#[tokio::test]
async fn test_concurrent_appends_produce_gapless_counters() {
    let h = harness(ProtectedLogConfig::default());
    let appender = Arc::new(h.appender);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let appender = appender.clone();
        handles.push(tokio::spawn(async move {
            appender
                .append(cert_issued_event(Utc::now().timestamp_millis()))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let node_id = appender.node_id().await;
    let rows = node_rows(&h.store, node_id).await;
    // 16 events plus the initiation marker, counters 0..=16 without gaps.
    assert_eq!(rows.len(), 17);
    assert_eq!(h.store.row_count(), 17);
    for (counter, row) in rows.iter().enumerate() {
        assert_eq!(row.identifier.counter, counter as u64);
    }
}

#[tokio::test]
async fn test_every_row_self_links_to_predecessor() {
    let h = harness(ProtectedLogConfig::default());
    let base = Utc::now().timestamp_millis();
    for i in 0..5 {
        h.appender
            .append(cert_issued_event(base + i * 100))
            .await
            .unwrap();
    }

    let node_id = h.appender.node_id().await;
    let rows = node_rows(&h.store, node_id).await;
    assert_eq!(rows.len(), 6);
    for row in rows.iter().skip(1) {
        let prev = LogEventIdentifier::new(node_id, row.identifier.counter - 1);
        assert!(
            row.linked_in_identifiers.contains(&prev),
            "row {} does not link to {}",
            row.identifier,
            prev
        );
    }
}

#[tokio::test]
async fn test_clean_log_verifies() {
    let h = harness(ProtectedLogConfig::default());
    let base = Utc::now().timestamp_millis();
    for i in 0..4 {
        h.appender
            .append(cert_issued_event(base + i * 100))
            .await
            .unwrap();
    }

    let verifier = verifier_for(&h);
    let result = verifier.run_if_not_busy().await.unwrap();
    assert!(result.is_valid(), "failures: {:?}", result.failures);
    assert_eq!(result.rows_verified, 5);
    assert!(verifier.last_successful_verification() > 0);
}

#[tokio::test]
async fn test_modified_row_is_detected_and_taints_successor() {
    let h = harness(ProtectedLogConfig::default());
    let base = Utc::now().timestamp_millis();
    for i in 0..3 {
        h.appender
            .append(cert_issued_event(base + i * 100))
            .await
            .unwrap();
    }
    let node_id = h.appender.node_id().await;

    let mut tampered = h
        .store
        .get_row(&LogEventIdentifier::new(node_id, 1))
        .await
        .unwrap()
        .unwrap();
    tampered.comment = "nothing to see here".to_string();
    h.store.overwrite_row(tampered);

    let verifier = verifier_for(&h);
    let result = verifier.verify_entire_log().await.unwrap();
    assert!(!result.is_valid());

    let modified: Vec<LogEventIdentifier> = result
        .failures
        .iter()
        .filter(|f| f.cause == AnomalyCause::ModifiedLogRow)
        .filter_map(|f| f.identifier)
        .collect();
    // The tampered row fails its signature and the successor's link hash no
    // longer matches.
    assert!(modified.contains(&LogEventIdentifier::new(node_id, 1)));
    assert!(modified.contains(&LogEventIdentifier::new(node_id, 2)));
    assert!(h.recorded_contains(AnomalyCause::ModifiedLogRow));
}

#[tokio::test]
async fn test_deleted_genesis_row_is_reported() {
    let h = harness(ProtectedLogConfig::default());
    let base = Utc::now().timestamp_millis();
    for i in 0..3 {
        h.appender
            .append(cert_issued_event(base + i * 100))
            .await
            .unwrap();
    }
    let node_id = h.appender.node_id().await;
    h.store
        .delete_rows(&[LogEventIdentifier::new(node_id, 0)])
        .await
        .unwrap();

    let verifier = verifier_for(&h);
    let result = verifier.verify_entire_log().await.unwrap();
    assert!(!result.is_valid());
    let missing: Vec<LogEventIdentifier> = result
        .failures
        .iter()
        .filter(|f| f.cause == AnomalyCause::MissingLogRow)
        .filter_map(|f| f.identifier)
        .collect();
    assert!(missing.contains(&LogEventIdentifier::new(node_id, 0)));
}

#[tokio::test]
async fn test_rollback_of_newest_event_is_detected() {
    let h = harness(ProtectedLogConfig::default());
    let base = Utc::now().timestamp_millis();
    h.appender.append(cert_issued_event(base)).await.unwrap();
    h.appender
        .append(cert_issued_event(base + 1_000))
        .await
        .unwrap();

    let verifier = verifier_for(&h);
    assert!(verifier.verify_last_event().await.unwrap().is_none());

    // Removing the newest row leaves an older row as the newest: the
    // watermark exposes the rollback.
    let newest = h.store.newest_row().await.unwrap().unwrap();
    h.store.delete_rows(&[newest.identifier]).await.unwrap();

    let failure = verifier.verify_last_event().await.unwrap().unwrap();
    assert_eq!(failure.cause, AnomalyCause::RolledBack);
    assert!(h.recorded_contains(AnomalyCause::RolledBack));
}

#[tokio::test]
async fn test_protection_intensity_signs_periodically() {
    let config = ProtectedLogConfig {
        protection_intensity_ms: 5_000,
        ..Default::default()
    };
    let h = harness(config);
    let base = Utc::now().timestamp_millis();

    // Marker at base-1 takes the first signature. base is too close to it,
    // base+6000 crosses the intensity window, base+8000 does not.
    h.appender.append(cert_issued_event(base)).await.unwrap();
    h.appender
        .append(cert_issued_event(base + 6_000))
        .await
        .unwrap();
    h.appender
        .append(cert_issued_event(base + 8_000))
        .await
        .unwrap();

    let node_id = h.appender.node_id().await;
    let rows = node_rows(&h.store, node_id).await;
    assert!(rows[0].protection.is_some());
    assert!(rows[1].protection.is_none());
    assert!(rows[2].protection.is_some());
    assert!(rows[3].protection.is_none());
}

#[tokio::test]
async fn test_unsigned_rows_still_chain_and_verify() {
    let config = ProtectedLogConfig {
        protection_intensity_ms: 60_000,
        ..Default::default()
    };
    let h = harness(config);
    let base = Utc::now().timestamp_millis();
    for i in 0..3 {
        h.appender
            .append(cert_issued_event(base + i * 100))
            .await
            .unwrap();
    }

    let verifier = verifier_for(&h);
    let result = verifier.verify_entire_log().await.unwrap();
    assert!(result.is_valid(), "failures: {:?}", result.failures);
}

#[tokio::test]
async fn test_shutdown_degrades_to_unprotected_appends() {
    let h = harness(ProtectedLogConfig::default());
    let base = Utc::now().timestamp_millis();
    h.appender.append(cert_issued_event(base)).await.unwrap();

    h.appender.shutdown().await.unwrap();
    assert!(h.appender.has_shutdown_notice());

    let node_id = h.appender.node_id().await;
    let stop_marker = h
        .store
        .get_row(&LogEventIdentifier::new(node_id, 2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stop_marker.event_code, EVENT_SYSTEM_STOPPED_LOGGING);

    // A late event still lands, unsigned but self-linked.
    h.appender
        .append(cert_issued_event(base + 1_000))
        .await
        .unwrap();
    let late = h
        .store
        .get_row(&LogEventIdentifier::new(node_id, 3))
        .await
        .unwrap()
        .unwrap();
    assert!(late.protection.is_none());
    assert_eq!(late.protection_key_identifier, "none");
    assert_eq!(
        late.linked_in_identifiers,
        vec![LogEventIdentifier::new(node_id, 2)]
    );
    let expected = HashAlgorithm::Sha256.digest(&stop_marker.row_hash());
    assert_eq!(late.linked_in_hash.as_deref(), Some(expected.as_slice()));
}

#[tokio::test]
async fn test_frozen_node_is_reported_unless_retired() {
    let h = harness(ProtectedLogConfig::default());
    let stale = Utc::now().timestamp_millis() - 10 * 3_600_000;

    let mut frozen_row = genesis_row(7, stale);
    frozen_row.comment = "last sign of life".to_string();
    h.store.add_row(&frozen_row).await.unwrap();

    let mut retired_row = genesis_row(8, stale);
    retired_row.module = MODULE_LOG;
    retired_row.event_code = EVENT_SYSTEM_STOPPED_LOGGING;
    h.store.add_row(&retired_row).await.unwrap();

    let verifier = verifier_for(&h);
    let result = verifier.verify_entire_log().await.unwrap();
    let frozen: Vec<LogEventIdentifier> = result
        .failures
        .iter()
        .filter(|f| f.cause == AnomalyCause::Frozen)
        .filter_map(|f| f.identifier)
        .collect();
    assert_eq!(frozen, vec![LogEventIdentifier::new(7, 0)]);
}

fn genesis_row(node_id: u64, event_time: i64) -> LogEventRow {
    LogEventRow {
        admin_type: "INTERNAL".to_string(),
        admin_data: "protected-log".to_string(),
        ca_id: 0,
        module: 1,
        event_time,
        username: None,
        certificate_serial_number: None,
        certificate_issuer_dn: None,
        event_code: 100,
        comment: "genesis".to_string(),
        identifier: LogEventIdentifier::new(node_id, 0),
        node_ip: "127.0.0.1".to_string(),
        linked_in_identifiers: vec![],
        linked_in_hash: None,
        hash_algorithm: HashAlgorithm::Sha256,
        protection_key_identifier: "token-1".to_string(),
        protection_algorithm: "SHA256withECDSA".to_string(),
        protection: None,
    }
}

#[tokio::test]
async fn test_tampered_foreign_candidate_dropped_without_aborting_append() {
    let h = harness(ProtectedLogConfig::default());
    let now = Utc::now().timestamp_millis();

    // A signed foreign row whose content was altered after signing: the
    // candidate must fail verification and be dropped, while the append
    // itself still succeeds.
    let mut foreign = genesis_row(9, now - 10);
    let token = h.tokens.current();
    let signature = token.protect(&foreign.canonical_bytes(false)).unwrap();
    foreign.set_protection(signature);
    foreign.comment = "rewritten after signing".to_string();
    h.store.add_row(&foreign).await.unwrap();

    h.appender.append(cert_issued_event(now)).await.unwrap();
    assert!(h.recorded_contains(AnomalyCause::ModifiedLogRow));

    let node_id = h.appender.node_id().await;
    let rows = node_rows(&h.store, node_id).await;
    assert_eq!(rows.len(), 2);
    assert!(rows[0].linked_in_identifiers.is_empty());
    assert!(rows[0].linked_in_hash.is_none());
    assert!(!rows[1]
        .linked_in_identifiers
        .contains(&foreign.identifier));
}

#[tokio::test]
async fn test_unsigned_foreign_candidate_ignored_without_anomaly() {
    let h = harness(ProtectedLogConfig::default());
    let now = Utc::now().timestamp_millis();

    // An unsigned foreign row cannot anchor a cross-node link; it is left
    // out quietly because its own chain will commit to it once a signed
    // successor appears.
    h.store.add_row(&genesis_row(9, now - 10)).await.unwrap();

    h.appender.append(cert_issued_event(now)).await.unwrap();
    assert!(h.recorder.recorded().is_empty());

    let node_id = h.appender.node_id().await;
    let rows = node_rows(&h.store, node_id).await;
    assert!(rows[0].linked_in_identifiers.is_empty());
}

#[tokio::test]
async fn test_max_verification_steps_bounds_the_walk() {
    let config = ProtectedLogConfig {
        max_verification_steps: 1,
        ..Default::default()
    };
    let h = harness(config);
    let base = Utc::now().timestamp_millis();
    for i in 0..3 {
        h.appender
            .append(cert_issued_event(base + i * 100))
            .await
            .unwrap();
    }

    let verifier = verifier_for(&h);
    let result = verifier.verify_entire_log().await.unwrap();
    assert!(result.is_valid());
    assert_eq!(result.rows_verified, 1);
}

#[tokio::test]
async fn test_cancel_stops_verification_at_row_boundary() {
    let h = harness(ProtectedLogConfig::default());
    let base = Utc::now().timestamp_millis();
    h.appender.append(cert_issued_event(base)).await.unwrap();

    let verifier = verifier_for(&h);
    verifier.cancel();
    let result = verifier.verify_entire_log().await.unwrap();
    assert!(result.canceled);
    assert_eq!(result.rows_verified, 0);
}

#[tokio::test]
async fn test_allow_configurable_events_reflects_config() {
    let h = harness(ProtectedLogConfig::default());
    assert!(!h.appender.allow_configurable_events().await);

    let permissive = ProtectedLogConfig {
        allow_configurable_events: true,
        ..Default::default()
    };
    h.appender.reset(permissive).await;
    assert!(h.appender.allow_configurable_events().await);
}

#[tokio::test]
async fn test_query_requires_privilege_expression() {
    let h = harness(ProtectedLogConfig::default());
    let base = Utc::now().timestamp_millis();
    h.appender.append(cert_issued_event(base)).await.unwrap();

    assert!(h
        .appender
        .query(&LogFilter::default(), "")
        .await
        .is_err());

    let filter = LogFilter {
        ca_id: Some(42),
        ..Default::default()
    };
    let rows = h.appender.query(&filter, "1=1").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].ca_id, 42);
}

#[tokio::test]
async fn test_reset_starts_a_fresh_chain() {
    let h = harness(ProtectedLogConfig::default());
    let base = Utc::now().timestamp_millis();
    h.appender.append(cert_issued_event(base)).await.unwrap();
    let old_node = h.appender.node_id().await;

    h.appender.reset(ProtectedLogConfig::default()).await;
    let new_node = h.appender.node_id().await;
    assert_ne!(old_node, new_node);

    // The fresh chain bootstraps again and links across to the old one.
    h.appender
        .append(cert_issued_event(base + 1_000))
        .await
        .unwrap();
    let rows = node_rows(&h.store, new_node).await;
    assert_eq!(rows.len(), 2);
    assert!(rows[0]
        .linked_in_identifiers
        .iter()
        .any(|id| id.node_id == old_node));
}
