//! Crate error taxonomy.

use thiserror::Error;

/// Errors surfaced by the expert agent and its adapters.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or out-of-protocol event (wrong kind, wrong tag, bad payload).
    #[error("invalid event: {0}")]
    Validation(String),
    /// Encryption or decryption failure (MAC mismatch, padding, version).
    #[error("crypto failure: {0}")]
    Crypto(String),
    /// The supplied preimage does not hash to the conversation's payment hash.
    #[error("preimage does not match payment hash")]
    PaymentHashMismatch,
    /// The invoice for the current turn has not settled.
    #[error("invoice not settled")]
    PaymentUnsettled,
    /// Transport or remote failure talking to the wallet.
    #[error("payment backend: {0}")]
    PaymentBackend(String),
    /// Every relay rejected the event.
    #[error("no relay accepted event {0}")]
    Publish(String),
    /// A user-supplied handler failed.
    #[error("handler failure: {0}")]
    Handler(String),
    /// Bad configuration detected at construction.
    #[error("configuration: {0}")]
    Config(String),
    #[error("secp256k1: {0}")]
    Secp(#[from] secp256k1::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
