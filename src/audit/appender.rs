//! Log Appender
//!
//! Serializes and writes new protected log rows: link selection, link
//! verification, hashing and conditional signing. One appender instance is
//! one node of the cluster; all of its writes are totally ordered by a
//! FIFO-fair lock.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::audit::actions::{AnomalyActionDispatcher, AnomalyCause};
use crate::audit::row::{
    LogEvent, LogEventIdentifier, LogEventRow, EVENT_SYSTEM_INITIALIZED_LOGGING,
    EVENT_SYSTEM_STOPPED_LOGGING, MODULE_LOG,
};
use crate::config::ProtectedLogConfig;
use crate::crypto::token::{TokenRegistry, UNPROTECTED_TOKEN_IDENTIFIER};
use crate::database::{LogFilter, LogStore};
use crate::error::ProtectedLogError;

/// Cached hash and event time of a row this node wrote, keyed by counter.
#[derive(Debug, Clone)]
struct CachedRow {
    hash: Vec<u8>,
    event_time: i64,
}

/// Sliding window over this node's own recent rows, so self-linking never
/// has to trust a store re-read. Eviction drops entries older than the
/// search window but never the single newest entry.
#[derive(Debug, Default)]
struct ChainCache {
    entries: BTreeMap<u64, CachedRow>,
}

impl ChainCache {
    fn insert(&mut self, counter: u64, hash: Vec<u8>, event_time: i64) {
        self.entries.insert(counter, CachedRow { hash, event_time });
    }

    fn get(&self, counter: u64) -> Option<&CachedRow> {
        self.entries.get(&counter)
    }

    fn oldest(&self) -> Option<(u64, &CachedRow)> {
        self.entries.iter().next().map(|(c, r)| (*c, r))
    }

    fn prune(&mut self, now: i64, search_window_ms: i64) {
        while self.entries.len() > 1 {
            let Some((&counter, cached)) = self.entries.iter().next() else {
                break;
            };
            if cached.event_time >= now - search_window_ms {
                break;
            }
            self.entries.remove(&counter);
        }
    }
}

struct AppenderState {
    config: ProtectedLogConfig,
    node_id: u64,
    counter: u64,
    /// Counter of this node's newest individually signed row.
    protected_counter: u64,
    last_signed_event_time: i64,
    chain_cache: ChainCache,
    last_scan_for_foreign_events: i64,
    last_scan_for_own_event: i64,
    first_event: bool,
}

impl AppenderState {
    fn new(config: ProtectedLogConfig) -> Self {
        let node_id: u64 = rand::random();
        debug!("Protected log appender uses node id {}", node_id);
        AppenderState {
            config,
            node_id,
            counter: 0,
            protected_counter: 0,
            last_signed_event_time: 0,
            chain_cache: ChainCache::default(),
            last_scan_for_foreign_events: 0,
            last_scan_for_own_event: 0,
            first_event: true,
        }
    }
}

/// The write half of the protected log. Owned by the application's
/// composition root and shared by handle.
pub struct LogAppender {
    store: Arc<dyn LogStore>,
    tokens: Arc<TokenRegistry>,
    actions: Arc<AnomalyActionDispatcher>,
    shutdown_notice: AtomicBool,
    state: Mutex<AppenderState>,
}

impl LogAppender {
    pub fn new(
        store: Arc<dyn LogStore>,
        tokens: Arc<TokenRegistry>,
        actions: Arc<AnomalyActionDispatcher>,
        config: ProtectedLogConfig,
    ) -> Self {
        config.warn_on_unsafe_combinations();
        LogAppender {
            store,
            tokens,
            actions,
            shutdown_notice: AtomicBool::new(false),
            state: Mutex::new(AppenderState::new(config)),
        }
    }

    /// This node's random identity. Assigned at construction and on `reset`.
    pub async fn node_id(&self) -> u64 {
        self.state.lock().await.node_id
    }

    /// Reload configuration. Re-initializes all per-node state, including a
    /// fresh node id, exactly like a process restart.
    pub async fn reset(&self, config: ProtectedLogConfig) {
        config.warn_on_unsafe_combinations();
        let mut state = self.state.lock().await;
        *state = AppenderState::new(config);
        self.shutdown_notice.store(false, Ordering::SeqCst);
    }

    /// Write the final "stopped logging" marker through the protected path
    /// and switch the appender to its degraded shutdown mode.
    pub async fn shutdown(&self) -> Result<(), ProtectedLogError> {
        let marker = internal_event(
            EVENT_SYSTEM_STOPPED_LOGGING,
            Utc::now().timestamp_millis(),
            "Terminating log session for this node.",
        );
        let result = self.append(marker).await;
        self.shutdown_notice.store(true, Ordering::SeqCst);
        result
    }

    pub fn has_shutdown_notice(&self) -> bool {
        self.shutdown_notice.load(Ordering::SeqCst)
    }

    /// Whether callers may log event codes outside the built-in set. The
    /// appender records whatever it is handed; enforcement is the caller's.
    pub async fn allow_configurable_events(&self) -> bool {
        self.state.lock().await.config.allow_configurable_events
    }

    /// Append one event to the protected log.
    ///
    /// Link problems are recoverable: the offending link is dropped, the
    /// anomaly dispatched and the append continues. Store or signing
    /// failures are fatal and propagate, because failing to audit a
    /// security event must be visible to the caller.
    pub async fn append(&self, event: LogEvent) -> Result<(), ProtectedLogError> {
        let mut state = self.state.lock().await;
        if state.first_event {
            state.first_event = false;
            let marker = internal_event(
                EVENT_SYSTEM_INITIALIZED_LOGGING,
                event.event_time - 1,
                "Initiating log for this node.",
            );
            self.append_protected(&mut state, &marker).await?;
        }
        if self.has_shutdown_notice() && event.event_code != EVENT_SYSTEM_STOPPED_LOGGING {
            self.append_on_shutdown(&mut state, &event).await;
            return Ok(());
        }
        self.append_protected(&mut state, &event).await
    }

    /// Read API. The privilege expression is mandatory and is ANDed into
    /// the store query verbatim.
    pub async fn query(
        &self,
        filter: &LogFilter,
        privileges: &str,
    ) -> Result<Vec<LogEventRow>, ProtectedLogError> {
        if privileges.is_empty() {
            return Err(ProtectedLogError::ConfigError(
                "Log queries require a caller privilege expression".to_string(),
            ));
        }
        self.store.query(filter, Some(privileges)).await
    }

    async fn append_protected(
        &self,
        state: &mut AppenderState,
        event: &LogEvent,
    ) -> Result<(), ProtectedLogError> {
        match self.append_inner(state, event).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.actions
                    .dispatch(
                        AnomalyCause::InternalError,
                        &format!("append of {} failed: {}", event.event_code, e),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn append_inner(
        &self,
        state: &mut AppenderState,
        event: &LogEvent,
    ) -> Result<(), ProtectedLogError> {
        let now = Utc::now().timestamp_millis();

        // Link selection: candidates from other nodes (and, for the very
        // first row, the newest row of the whole cluster).
        let mut candidates: Vec<LogEventIdentifier> = Vec::new();
        if state.counter == 0 {
            match self.store.newest_row().await? {
                Some(row) => candidates.push(row.identifier),
                None => {
                    self.actions
                        .dispatch(AnomalyCause::EmptyLog, "store contains no log rows")
                        .await;
                }
            }
            state.last_scan_for_foreign_events = now;
        } else if state.config.link_in_intensity_ms >= 0
            && state.last_scan_for_foreign_events + state.config.link_in_intensity_ms <= now
        {
            let search_limit = std::cmp::min(
                now - state.config.search_window_ms,
                state.last_scan_for_foreign_events - 50,
            );
            candidates.extend(
                self.store
                    .newest_rows_for_other_nodes(state.node_id, search_limit)
                    .await?,
            );
            state.last_scan_for_foreign_events = now;
        }

        // Verify every candidate before committing to it. A failing
        // candidate is dropped from the link set; the append continues.
        let mut links: Vec<(LogEventIdentifier, Vec<u8>)> = Vec::new();
        for id in candidates {
            match self.verify_link_candidate(&id).await? {
                Some(hash) => links.push((id, hash)),
                None => {}
            }
        }

        if state.counter != 0 {
            // The own-previous link is trusted from the in-memory cache, so
            // a re-signed forgery in the store cannot be substituted for it.
            let prev_counter = state.counter - 1;
            let cached = state.chain_cache.get(prev_counter).ok_or_else(|| {
                ProtectedLogError::InternalError(format!(
                    "Chain cache lost own row {} for node {}",
                    prev_counter, state.node_id
                ))
            })?;
            links.push((
                LogEventIdentifier::new(state.node_id, prev_counter),
                cached.hash.clone(),
            ));

            if state.config.verify_own_intensity_ms >= 0
                && state.last_scan_for_own_event + state.config.verify_own_intensity_ms <= now
            {
                self.verify_own_tail(state, now).await?;
                state.last_scan_for_own_event = now;
            }
        }

        // Hash the ordered link set.
        let link_ids: Vec<LogEventIdentifier> = links.iter().map(|(id, _)| *id).collect();
        let linked_in_hash = if links.is_empty() {
            None
        } else {
            let mut concatenated = Vec::new();
            for (_, hash) in &links {
                concatenated.extend_from_slice(hash);
            }
            Some(state.config.hash_algorithm.digest(&concatenated))
        };

        let token = self.tokens.current();
        let mut row = LogEventRow {
            admin_type: event.admin_type.clone(),
            admin_data: event.admin_data.clone(),
            ca_id: event.ca_id,
            module: event.module,
            event_time: event.event_time,
            username: event.username.clone(),
            certificate_serial_number: event
                .certificate
                .as_ref()
                .map(|c| c.serial_number.clone()),
            certificate_issuer_dn: event.certificate.as_ref().map(|c| c.issuer_dn.clone()),
            event_code: event.event_code,
            comment: event.full_comment(),
            identifier: LogEventIdentifier::new(state.node_id, state.counter),
            node_ip: state.config.node_ip.clone(),
            linked_in_identifiers: link_ids,
            linked_in_hash,
            hash_algorithm: state.config.hash_algorithm,
            protection_key_identifier: token.identifier().to_string(),
            protection_algorithm: token.protection_algorithm().to_string(),
            protection: None,
        };

        // Conditional protection: intensity 0 signs every row; otherwise
        // rows between signatures rely on the hash chain alone.
        if state.config.protection_intensity_ms == 0
            || state.last_signed_event_time + state.config.protection_intensity_ms
                <= event.event_time
        {
            let signature = token.protect(&row.canonical_bytes(false))?;
            row.set_protection(signature);
            state.last_signed_event_time = event.event_time;
        }

        self.store.add_row(&row).await?;
        state
            .chain_cache
            .insert(state.counter, row.row_hash(), row.event_time);
        if row.protection.is_some() {
            state.protected_counter = state.counter;
        }
        state.counter += 1;
        Ok(())
    }

    /// Fetch and verify one foreign link candidate. Returns its row hash,
    /// computed from the same fetched row the signature was checked on, or
    /// `None` when the candidate must be dropped.
    async fn verify_link_candidate(
        &self,
        id: &LogEventIdentifier,
    ) -> Result<Option<Vec<u8>>, ProtectedLogError> {
        let Some(row) = self.store.get_row(id).await? else {
            self.actions
                .dispatch(
                    AnomalyCause::MissingLogRow,
                    &format!("link candidate {} not found in store", id),
                )
                .await;
            return Ok(None);
        };
        let Some(signature) = &row.protection else {
            // An unsigned row cannot anchor a cross-node link; its own
            // chain will commit to it once a signed successor appears.
            return Ok(None);
        };
        let Some(token) = self.tokens.get(&row.protection_key_identifier) else {
            self.actions
                .dispatch(
                    AnomalyCause::MissingToken,
                    &format!(
                        "token {} for row {} not found",
                        row.protection_key_identifier, id
                    ),
                )
                .await;
            return Ok(None);
        };
        if !token.verify(&row.canonical_bytes(false), signature)? {
            self.actions
                .dispatch(
                    AnomalyCause::ModifiedLogRow,
                    &format!("link candidate {} failed signature verification", id),
                )
                .await;
            return Ok(None);
        }
        Ok(Some(row.row_hash()))
    }

    /// Compare this node's newest stored row against the chain cache, so an
    /// operator or another process corrupting our own tail is noticed.
    async fn verify_own_tail(
        &self,
        state: &mut AppenderState,
        now: i64,
    ) -> Result<(), ProtectedLogError> {
        let node_id = state.node_id;
        match self.store.newest_row_for_node(node_id).await? {
            None => {
                if let Some((lowest, cached)) = state.chain_cache.oldest() {
                    if lowest != 0 || cached.event_time < now - state.config.search_window_ms {
                        self.actions
                            .dispatch(
                                AnomalyCause::MissingLogRow,
                                &format!(
                                    "no rows for node {} in store, earliest cached counter {}",
                                    node_id, lowest
                                ),
                            )
                            .await;
                    }
                }
            }
            Some(row) => {
                let counter = row.identifier.counter;
                match state.chain_cache.get(counter) {
                    None => {
                        self.actions
                            .dispatch(
                                AnomalyCause::MissingLogRow,
                                &format!(
                                    "newest stored row {} for node {} is outside the chain cache",
                                    row.identifier, node_id
                                ),
                            )
                            .await;
                    }
                    Some(cached) if cached.hash != row.row_hash() => {
                        self.actions
                            .dispatch(
                                AnomalyCause::ModifiedLogRow,
                                &format!(
                                    "own row {} differs from cached hash",
                                    row.identifier
                                ),
                            )
                            .await;
                    }
                    Some(_) => {
                        if now - row.event_time > state.config.search_window_ms {
                            // Only stale rows visible. With every row signed
                            // the newest must be counter-1; otherwise it must
                            // be the newest signed one.
                            let expected = if state.config.protection_intensity_ms == 0 {
                                state.counter - 1
                            } else {
                                state.protected_counter
                            };
                            if counter != expected {
                                self.actions
                                    .dispatch(
                                        AnomalyCause::MissingLogRow,
                                        &format!(
                                            "newest stored row for node {} is {}, expected counter {}",
                                            node_id, row.identifier, expected
                                        ),
                                    )
                                    .await;
                            }
                        }
                        state
                            .chain_cache
                            .prune(now, state.config.search_window_ms);
                    }
                }
            }
        }
        Ok(())
    }

    /// Degraded append once a shutdown notice is in effect: only the
    /// in-memory self-link, best-effort persistence and a non-audited side
    /// channel on failure. Rows written here require manual operator
    /// reconciliation.
    async fn append_on_shutdown(&self, state: &mut AppenderState, event: &LogEvent) {
        let mut linked_in_identifiers = Vec::new();
        let mut linked_in_hash = None;
        if state.counter > 0 {
            let prev_counter = state.counter - 1;
            if let Some(cached) = state.chain_cache.get(prev_counter) {
                linked_in_identifiers.push(LogEventIdentifier::new(state.node_id, prev_counter));
                linked_in_hash = Some(state.config.hash_algorithm.digest(&cached.hash));
            }
        }
        let row = LogEventRow {
            admin_type: event.admin_type.clone(),
            admin_data: event.admin_data.clone(),
            ca_id: event.ca_id,
            module: event.module,
            event_time: event.event_time,
            username: event.username.clone(),
            certificate_serial_number: event
                .certificate
                .as_ref()
                .map(|c| c.serial_number.clone()),
            certificate_issuer_dn: event.certificate.as_ref().map(|c| c.issuer_dn.clone()),
            event_code: event.event_code,
            comment: event.full_comment(),
            identifier: LogEventIdentifier::new(state.node_id, state.counter),
            node_ip: state.config.node_ip.clone(),
            linked_in_identifiers,
            linked_in_hash,
            hash_algorithm: state.config.hash_algorithm,
            protection_key_identifier: UNPROTECTED_TOKEN_IDENTIFIER.to_string(),
            protection_algorithm: "none".to_string(),
            protection: None,
        };
        if let Err(e) = self.store.add_row(&row).await {
            error!(
                "Protected log event dropped during shutdown ({}): {:?}",
                e, event
            );
            return;
        }
        error!(
            "Protected log event written unprotected during shutdown: {}",
            row.summary()
        );
        state
            .chain_cache
            .insert(state.counter, row.row_hash(), row.event_time);
        state.counter += 1;
    }
}

/// Marker events the log subsystem writes about itself.
fn internal_event(event_code: u32, event_time: i64, comment: &str) -> LogEvent {
    LogEvent {
        admin_type: "INTERNAL".to_string(),
        admin_data: "protected-log".to_string(),
        ca_id: 0,
        module: MODULE_LOG,
        event_code,
        event_time,
        username: None,
        certificate: None,
        comment: comment.to_string(),
        error: None,
    }
}
