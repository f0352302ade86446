//! Cryptographic protection tokens for log rows.

pub mod token;

pub use token::{EcdsaToken, ProtectionToken, TokenRegistry, UnprotectedToken};
