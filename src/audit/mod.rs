//! Protected Log System
//!
//! Provides tamper-evident logging with cryptographic hash chains linking
//! every row to earlier rows, periodic signatures, whole-log verification
//! and export of aged rows.

pub mod actions;
pub mod appender;
pub mod exporter;
pub mod row;
pub mod verifier;

pub use actions::{AnomalyAction, AnomalyActionDispatcher, AnomalyCause, LogAction, ScriptAction};
pub use appender::LogAppender;
pub use exporter::{ExportHandler, ExportSummary, JsonFileExportHandler, LogExporter};
pub use row::{HashAlgorithm, LogEvent, LogEventIdentifier, LogEventRow, SubjectCertificate};
pub use verifier::{LogVerifier, VerificationFailure, VerificationResult};
