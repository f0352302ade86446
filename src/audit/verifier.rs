//! Log Verifier
//!
//! Walks the protected log validating signatures and link hashes, and
//! watches the newest event for rollback. At most one verification pass is
//! in flight at any time; a trigger that finds the verifier busy is a no-op.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::audit::actions::{AnomalyActionDispatcher, AnomalyCause};
use crate::audit::row::{
    LogEventIdentifier, LogEventRow, EVENT_SYSTEM_STOPPED_LOGGING, MODULE_LOG,
};
use crate::config::ProtectedLogConfig;
use crate::crypto::token::TokenRegistry;
use crate::database::LogStore;
use crate::error::ProtectedLogError;

/// One problem found during verification.
#[derive(Debug, Clone)]
pub struct VerificationFailure {
    pub identifier: Option<LogEventIdentifier>,
    pub cause: AnomalyCause,
    pub detail: String,
}

/// Outcome of a verification pass. Verification keeps going after failures
/// (unless configured otherwise) so the result reports every problem found.
#[derive(Debug, Clone, Default)]
pub struct VerificationResult {
    pub rows_verified: u64,
    pub failures: Vec<VerificationFailure>,
    pub canceled: bool,
}

impl VerificationResult {
    pub fn is_valid(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn summary(&self) -> String {
        if self.is_valid() {
            format!("log verified, {} rows checked", self.rows_verified)
        } else {
            format!(
                "log verification found {} problem(s) across {} rows",
                self.failures.len(),
                self.rows_verified
            )
        }
    }

    fn push(&mut self, failure: VerificationFailure) {
        self.failures.push(failure);
    }
}

pub struct LogVerifier {
    store: Arc<dyn LogStore>,
    tokens: Arc<TokenRegistry>,
    actions: Arc<AnomalyActionDispatcher>,
    freeze_threshold_ms: i64,
    max_verification_steps: u64,
    stop_at_first_failure: bool,
    busy: AtomicBool,
    canceled: AtomicBool,
    canceled_permanently: AtomicBool,
    /// Newest event time observed by this verifier instance. Deliberately
    /// not persisted: a restart re-arms rollback detection from scratch,
    /// matching the behavior of the system this replaces.
    last_known_event_time: AtomicI64,
    time_of_last_execution: AtomicI64,
    last_successful_verification: AtomicI64,
}

impl LogVerifier {
    pub fn new(
        store: Arc<dyn LogStore>,
        tokens: Arc<TokenRegistry>,
        actions: Arc<AnomalyActionDispatcher>,
        config: &ProtectedLogConfig,
    ) -> Self {
        LogVerifier {
            store,
            tokens,
            actions,
            freeze_threshold_ms: config.freeze_threshold_ms,
            max_verification_steps: config.max_verification_steps,
            stop_at_first_failure: false,
            busy: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            canceled_permanently: AtomicBool::new(false),
            last_known_event_time: AtomicI64::new(0),
            time_of_last_execution: AtomicI64::new(0),
            last_successful_verification: AtomicI64::new(0),
        }
    }

    pub fn with_stop_at_first_failure(mut self, stop: bool) -> Self {
        self.stop_at_first_failure = stop;
        self
    }

    /// Run a full verification pass unless one is already in flight or
    /// verification has been canceled permanently. Never queues.
    pub async fn run_if_not_busy(&self) -> Option<VerificationResult> {
        if self.canceled_permanently.load(Ordering::SeqCst) {
            return None;
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Verification already in progress, skipping trigger");
            return None;
        }
        let result = self.run().await;
        self.canceled.store(false, Ordering::SeqCst);
        self.busy.store(false, Ordering::SeqCst);
        Some(result)
    }

    pub fn is_running(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Ask a running pass to stop at the next row boundary. Advisory only.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    /// Stop the current pass and refuse all future triggers.
    pub fn cancel_permanently(&self) {
        self.canceled_permanently.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst) || self.canceled_permanently.load(Ordering::SeqCst)
    }

    /// Milliseconds timestamp of when the last pass began, 0 if none ran.
    pub fn time_of_last_execution(&self) -> i64 {
        self.time_of_last_execution.load(Ordering::SeqCst)
    }

    /// Milliseconds timestamp of when the last fully clean pass began.
    pub fn last_successful_verification(&self) -> i64 {
        self.last_successful_verification.load(Ordering::SeqCst)
    }

    async fn run(&self) -> VerificationResult {
        let start = Utc::now().timestamp_millis();
        let result = match self.verify_last_event().await {
            Ok(None) => match self.verify_entire_log().await {
                Ok(result) => result,
                Err(e) => self.internal_failure(e).await,
            },
            Ok(Some(failure)) => {
                let mut result = VerificationResult::default();
                result.push(failure);
                result
            }
            Err(e) => self.internal_failure(e).await,
        };
        if result.is_valid() && !result.canceled {
            self.last_successful_verification
                .store(start, Ordering::SeqCst);
        }
        self.time_of_last_execution.store(start, Ordering::SeqCst);
        info!("{}", result.summary());
        result
    }

    async fn internal_failure(&self, error: ProtectedLogError) -> VerificationResult {
        self.actions
            .dispatch(
                AnomalyCause::InternalError,
                &format!("verification aborted: {}", error),
            )
            .await;
        let mut result = VerificationResult::default();
        result.push(VerificationFailure {
            identifier: None,
            cause: AnomalyCause::InternalError,
            detail: error.to_string(),
        });
        result
    }

    /// Check the globally newest row: empty store, signature validity and
    /// rollback against the watermark this instance carries.
    pub async fn verify_last_event(
        &self,
    ) -> Result<Option<VerificationFailure>, ProtectedLogError> {
        let Some(row) = self.store.newest_row().await? else {
            self.actions
                .dispatch(AnomalyCause::EmptyLog, "store contains no log rows")
                .await;
            return Ok(Some(VerificationFailure {
                identifier: None,
                cause: AnomalyCause::EmptyLog,
                detail: "store contains no log rows".to_string(),
            }));
        };
        if let Some(failure) = self.check_row_protection(&row).await? {
            return Ok(Some(failure));
        }
        let current = row.event_time;
        let last_known = self.last_known_event_time.load(Ordering::SeqCst);
        if last_known > current {
            let detail = format!(
                "newest stored event {} at {} is older than previously observed {}",
                row.identifier, current, last_known
            );
            self.actions
                .dispatch(AnomalyCause::RolledBack, &detail)
                .await;
            return Ok(Some(VerificationFailure {
                identifier: Some(row.identifier),
                cause: AnomalyCause::RolledBack,
                detail,
            }));
        }
        self.last_known_event_time.store(current, Ordering::SeqCst);
        Ok(None)
    }

    /// Walk all rows from genesis forward, node by node, verifying
    /// signatures and recomputing link hashes; also detect frozen nodes.
    pub async fn verify_entire_log(&self) -> Result<VerificationResult, ProtectedLogError> {
        let now = Utc::now().timestamp_millis();
        let mut result = VerificationResult::default();
        let mut steps: u64 = 0;

        'nodes: for node_id in self.store.node_ids().await? {
            let Some(newest) = self.store.newest_row_for_node(node_id).await? else {
                continue;
            };
            // A node that announced the end of its log session is retired,
            // not frozen.
            let retired = newest.module == MODULE_LOG
                && newest.event_code == EVENT_SYSTEM_STOPPED_LOGGING;
            if !retired && now - newest.event_time > self.freeze_threshold_ms {
                let detail = format!(
                    "node {} has logged nothing since {} (threshold {} ms)",
                    node_id, newest.event_time, self.freeze_threshold_ms
                );
                self.actions.dispatch(AnomalyCause::Frozen, &detail).await;
                result.push(VerificationFailure {
                    identifier: Some(newest.identifier),
                    cause: AnomalyCause::Frozen,
                    detail,
                });
                if self.stop_at_first_failure {
                    break 'nodes;
                }
            }

            for counter in 0..=newest.identifier.counter {
                if self.is_canceled() {
                    result.canceled = true;
                    break 'nodes;
                }
                if self.max_verification_steps != 0 && steps >= self.max_verification_steps {
                    debug!(
                        "Stopping verification after {} of max {} steps",
                        steps, self.max_verification_steps
                    );
                    break 'nodes;
                }
                steps += 1;

                let id = LogEventIdentifier::new(node_id, counter);
                let Some(row) = self.store.get_row(&id).await? else {
                    let detail = format!("row {} is missing from the store", id);
                    self.actions
                        .dispatch(AnomalyCause::MissingLogRow, &detail)
                        .await;
                    result.push(VerificationFailure {
                        identifier: Some(id),
                        cause: AnomalyCause::MissingLogRow,
                        detail,
                    });
                    if self.stop_at_first_failure {
                        break 'nodes;
                    }
                    continue;
                };

                result.rows_verified += 1;
                if let Some(failure) = self.check_row_protection(&row).await? {
                    result.push(failure);
                    if self.stop_at_first_failure {
                        break 'nodes;
                    }
                }
                if let Some(failure) = self.check_linked_in_hash(&row).await? {
                    result.push(failure);
                    if self.stop_at_first_failure {
                        break 'nodes;
                    }
                }
            }
        }
        Ok(result)
    }

    /// Verify a row's signature when it carries one. Rows without
    /// individual protection rely on the hash chain alone.
    async fn check_row_protection(
        &self,
        row: &LogEventRow,
    ) -> Result<Option<VerificationFailure>, ProtectedLogError> {
        let Some(signature) = &row.protection else {
            return Ok(None);
        };
        let Some(token) = self.tokens.get(&row.protection_key_identifier) else {
            let detail = format!(
                "token {} for row {} not found",
                row.protection_key_identifier, row.identifier
            );
            self.actions
                .dispatch(AnomalyCause::MissingToken, &detail)
                .await;
            return Ok(Some(VerificationFailure {
                identifier: Some(row.identifier),
                cause: AnomalyCause::MissingToken,
                detail,
            }));
        };
        if !token.verify(&row.canonical_bytes(false), signature)? {
            let detail = format!("row {} failed signature verification", row.identifier);
            self.actions
                .dispatch(AnomalyCause::ModifiedLogRow, &detail)
                .await;
            return Ok(Some(VerificationFailure {
                identifier: Some(row.identifier),
                cause: AnomalyCause::ModifiedLogRow,
                detail,
            }));
        }
        Ok(None)
    }

    /// Recompute the digest over the ordered hashes of the rows this row
    /// links to and compare with the stored `linked_in_hash`.
    async fn check_linked_in_hash(
        &self,
        row: &LogEventRow,
    ) -> Result<Option<VerificationFailure>, ProtectedLogError> {
        let expected = match (&row.linked_in_hash, row.linked_in_identifiers.is_empty()) {
            (None, true) => return Ok(None), // genesis row
            (Some(expected), false) => expected,
            _ => {
                let detail = format!(
                    "row {} has inconsistent link hash and link set",
                    row.identifier
                );
                self.actions
                    .dispatch(AnomalyCause::ModifiedLogRow, &detail)
                    .await;
                return Ok(Some(VerificationFailure {
                    identifier: Some(row.identifier),
                    cause: AnomalyCause::ModifiedLogRow,
                    detail,
                }));
            }
        };
        let mut concatenated = Vec::new();
        for linked_id in &row.linked_in_identifiers {
            let Some(linked) = self.store.get_row(linked_id).await? else {
                let detail = format!(
                    "row {} links to missing row {}",
                    row.identifier, linked_id
                );
                self.actions
                    .dispatch(AnomalyCause::MissingLogRow, &detail)
                    .await;
                return Ok(Some(VerificationFailure {
                    identifier: Some(*linked_id),
                    cause: AnomalyCause::MissingLogRow,
                    detail,
                }));
            };
            concatenated.extend_from_slice(&linked.row_hash());
        }
        let recomputed = row.hash_algorithm.digest(&concatenated);
        if &recomputed != expected {
            let detail = format!("row {} link hash does not match its linked rows", row.identifier);
            self.actions
                .dispatch(AnomalyCause::ModifiedLogRow, &detail)
                .await;
            return Ok(Some(VerificationFailure {
                identifier: Some(row.identifier),
                cause: AnomalyCause::ModifiedLogRow,
                detail,
            }));
        }
        Ok(None)
    }
}
