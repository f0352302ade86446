//! Anomaly Actions
//!
//! Maps integrity-violation causes to configured responses. The dispatcher
//! only looks up and invokes the configured actions for a cause; business
//! consequences live in the actions themselves, which are external
//! collaborators behind the [`AnomalyAction`] capability.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{error, trace};

/// Fixed taxonomy of integrity violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnomalyCause {
    /// The whole log is missing.
    EmptyLog,
    /// A row's protection token is not available for verification.
    MissingToken,
    /// A row that should exist cannot be found.
    MissingLogRow,
    /// A row's signature or hash no longer matches its content.
    ModifiedLogRow,
    /// The newest stored event is older than one previously observed.
    RolledBack,
    /// A node's newest row is older than the freeze threshold.
    Frozen,
    /// Crypto or store failure inside the subsystem itself.
    InternalError,
}

impl fmt::Display for AnomalyCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AnomalyCause::EmptyLog => "EMPTY_LOG",
            AnomalyCause::MissingToken => "MISSING_TOKEN",
            AnomalyCause::MissingLogRow => "MISSING_LOGROW",
            AnomalyCause::ModifiedLogRow => "MODIFIED_LOGROW",
            AnomalyCause::RolledBack => "ROLLED_BACK",
            AnomalyCause::Frozen => "FROZEN",
            AnomalyCause::InternalError => "INTERNAL_ERROR",
        };
        f.write_str(name)
    }
}

/// A configured response to an anomaly. Implementations must not panic; a
/// failing action is reported and the remaining actions still run.
#[async_trait]
pub trait AnomalyAction: Send + Sync {
    async fn execute(&self, cause: AnomalyCause, context: &str);
}

/// Policy map `cause -> ordered actions`. Causes without an explicit entry
/// fall back to the default action list.
pub struct AnomalyActionDispatcher {
    actions: HashMap<AnomalyCause, Vec<Arc<dyn AnomalyAction>>>,
    default_actions: Vec<Arc<dyn AnomalyAction>>,
}

impl AnomalyActionDispatcher {
    pub fn new() -> Self {
        Self {
            actions: HashMap::new(),
            default_actions: vec![Arc::new(LogAction)],
        }
    }

    pub fn with_default_actions(mut self, actions: Vec<Arc<dyn AnomalyAction>>) -> Self {
        self.default_actions = actions;
        self
    }

    pub fn with_actions_for(
        mut self,
        cause: AnomalyCause,
        actions: Vec<Arc<dyn AnomalyAction>>,
    ) -> Self {
        self.actions.insert(cause, actions);
        self
    }

    pub async fn dispatch(&self, cause: AnomalyCause, context: &str) {
        trace!("Dispatching anomaly {}: {}", cause, context);
        let actions = self.actions.get(&cause).unwrap_or(&self.default_actions);
        for action in actions {
            action.execute(cause, context).await;
        }
    }
}

impl Default for AnomalyActionDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Records the anomaly through the process log and continues.
pub struct LogAction;

#[async_trait]
impl AnomalyAction for LogAction {
    async fn execute(&self, cause: AnomalyCause, context: &str) {
        error!("Protected log anomaly {}: {}", cause, context);
    }
}

/// Runs a configured executable with the cause as its argument, so operators
/// can wire in pagers, service shutdown or any other response.
pub struct ScriptAction {
    target_script: String,
}

impl ScriptAction {
    pub fn new(target_script: String) -> Self {
        Self { target_script }
    }
}

#[async_trait]
impl AnomalyAction for ScriptAction {
    async fn execute(&self, cause: AnomalyCause, context: &str) {
        if self.target_script.is_empty() {
            error!("Script action has no target script configured");
            return;
        }
        let result = tokio::process::Command::new(&self.target_script)
            .arg(cause.to_string())
            .arg(context)
            .status()
            .await;
        match result {
            Ok(status) if status.success() => {}
            Ok(status) => {
                error!(
                    "Script action {} exited with status {} for cause {}",
                    self.target_script, status, cause
                );
            }
            Err(e) => {
                error!(
                    "Script action {} failed to run for cause {}: {}",
                    self.target_script, cause, e
                );
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Records dispatched causes for assertions.
    #[derive(Default)]
    pub struct RecordingAction {
        pub causes: Mutex<Vec<AnomalyCause>>,
    }

    impl RecordingAction {
        pub fn recorded(&self) -> Vec<AnomalyCause> {
            self.causes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AnomalyAction for RecordingAction {
        async fn execute(&self, cause: AnomalyCause, _context: &str) {
            self.causes.lock().unwrap().push(cause);
        }
    }
}
