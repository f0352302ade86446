//! Audit Log Row
//!
//! Defines the immutable unit of the protected log, its composite key and
//! the canonical byte encoding used for hashing and signing.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;

use crate::error::ProtectedLogError;

/// Module identifier for events the log subsystem emits about itself.
pub const MODULE_LOG: u32 = 600;
/// Event code of the marker row written before the first real event of a node.
pub const EVENT_SYSTEM_INITIALIZED_LOGGING: u32 = 601;
/// Event code of the final row written when a node stops logging.
pub const EVENT_SYSTEM_STOPPED_LOGGING: u32 = 602;

/// Digest algorithm used for row hashes and link hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[serde(rename = "SHA-256")]
    Sha256,
    #[serde(rename = "SHA-512")]
    Sha512,
}

impl HashAlgorithm {
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "SHA-256",
            HashAlgorithm::Sha512 => "SHA-512",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = ProtectedLogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SHA-256" | "sha-256" | "sha256" => Ok(HashAlgorithm::Sha256),
            "SHA-512" | "sha-512" | "sha512" => Ok(HashAlgorithm::Sha512),
            other => Err(ProtectedLogError::ConfigError(format!(
                "Unsupported hash algorithm: {}",
                other
            ))),
        }
    }
}

/// Composite key of a log row: which node wrote it and its per-node sequence
/// number. Counters start at 0, are assigned only by that node's appender and
/// are never reused or decremented.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct LogEventIdentifier {
    pub node_id: u64,
    pub counter: u64,
}

impl LogEventIdentifier {
    pub fn new(node_id: u64, counter: u64) -> Self {
        LogEventIdentifier { node_id, counter }
    }
}

impl fmt::Display for LogEventIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.node_id, self.counter)
    }
}

/// Subject certificate context attached to certificate-related events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectCertificate {
    pub serial_number: String,
    pub issuer_dn: String,
}

/// A caller-supplied event to be appended to the protected log.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub admin_type: String,
    pub admin_data: String,
    pub ca_id: u32,
    pub module: u32,
    pub event_code: u32,
    /// Caller-supplied timestamp in milliseconds, not the appender's clock,
    /// so ordering reflects the true origin of the event.
    pub event_time: i64,
    pub username: Option<String>,
    pub certificate: Option<SubjectCertificate>,
    pub comment: String,
    /// An error message is folded into the comment, as the original log
    /// device folded exceptions.
    pub error: Option<String>,
}

impl LogEvent {
    /// The comment with any attached error folded in.
    pub fn full_comment(&self) -> String {
        match &self.error {
            Some(err) => format!("{}, Error: {}", self.comment, err),
            None => self.comment.clone(),
        }
    }
}

/// One row of the protected log. Immutable once constructed; the only
/// permitted mutation is attaching a deferred signature via
/// [`LogEventRow::set_protection`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEventRow {
    pub admin_type: String,
    pub admin_data: String,
    pub ca_id: u32,
    pub module: u32,
    pub event_time: i64,
    pub username: Option<String>,
    pub certificate_serial_number: Option<String>,
    pub certificate_issuer_dn: Option<String>,
    pub event_code: u32,
    pub comment: String,
    pub identifier: LogEventIdentifier,
    pub node_ip: String,
    /// Identifiers of rows this row cryptographically commits to.
    pub linked_in_identifiers: Vec<LogEventIdentifier>,
    /// Digest over the ordered row hashes of `linked_in_identifiers`;
    /// `None` only for the genesis row.
    pub linked_in_hash: Option<Vec<u8>>,
    pub hash_algorithm: HashAlgorithm,
    pub protection_key_identifier: String,
    pub protection_algorithm: String,
    /// Signature over the canonical bytes (excluding this field); `None`
    /// when the row relies solely on hash chaining.
    pub protection: Option<Vec<u8>>,
}

impl LogEventRow {
    /// Canonical byte form: fixed field order, length-prefixed values and an
    /// explicit present/absent marker for optional fields, so semantically
    /// equal rows produce byte-identical encodings.
    pub fn canonical_bytes(&self, include_protection: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        put_str(&mut buf, &self.admin_type);
        put_str(&mut buf, &self.admin_data);
        put_u32(&mut buf, self.ca_id);
        put_u32(&mut buf, self.module);
        put_i64(&mut buf, self.event_time);
        put_opt_str(&mut buf, self.username.as_deref());
        put_opt_str(&mut buf, self.certificate_serial_number.as_deref());
        put_opt_str(&mut buf, self.certificate_issuer_dn.as_deref());
        put_u32(&mut buf, self.event_code);
        put_str(&mut buf, &self.comment);
        put_u64(&mut buf, self.identifier.node_id);
        put_u64(&mut buf, self.identifier.counter);
        put_str(&mut buf, &self.node_ip);
        put_u32(&mut buf, self.linked_in_identifiers.len() as u32);
        for id in &self.linked_in_identifiers {
            put_u64(&mut buf, id.node_id);
            put_u64(&mut buf, id.counter);
        }
        put_opt_bytes(&mut buf, self.linked_in_hash.as_deref());
        put_str(&mut buf, self.hash_algorithm.name());
        put_str(&mut buf, &self.protection_key_identifier);
        put_str(&mut buf, &self.protection_algorithm);
        if include_protection {
            put_opt_bytes(&mut buf, self.protection.as_deref());
        }
        buf
    }

    /// Digest of this row under its own hash algorithm, excluding the
    /// protection signature.
    pub fn row_hash(&self) -> Vec<u8> {
        self.hash_algorithm.digest(&self.canonical_bytes(false))
    }

    /// Attach a deferred signature. The sole sanctioned mutation of a row.
    pub fn set_protection(&mut self, protection: Vec<u8>) {
        self.protection = Some(protection);
    }

    /// Short human-readable form for operator-facing log records.
    pub fn summary(&self) -> String {
        format!(
            "{} module={} event={} time={} admin={} {}",
            self.identifier,
            self.module,
            self.event_code,
            self.event_time,
            self.admin_type,
            self.admin_data
        )
    }
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn put_i64(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn put_str(buf: &mut Vec<u8>, value: &str) {
    put_u32(buf, value.len() as u32);
    buf.extend_from_slice(value.as_bytes());
}

fn put_opt_str(buf: &mut Vec<u8>, value: Option<&str>) {
    match value {
        Some(s) => {
            buf.push(1);
            put_str(buf, s);
        }
        None => buf.push(0),
    }
}

fn put_opt_bytes(buf: &mut Vec<u8>, value: Option<&[u8]>) {
    match value {
        Some(bytes) => {
            buf.push(1);
            put_u32(buf, bytes.len() as u32);
            buf.extend_from_slice(bytes);
        }
        None => buf.push(0),
    }
}
