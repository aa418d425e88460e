//! Ledger core library: batch validation and signing, the pending batch set,
//! and positional decoding of server responses into typed results.
#![deny(missing_docs)]

use vend_spec::{BatchKind, ValidationError};

/// Pending batch set and batch signing.
pub mod batch;
/// Server response decoding and typed batch results.
pub mod response;
/// Signer capability and the ed25519 implementation.
pub mod signing;

pub use batch::{sign_batch, sign_command, BatchSet};
pub use response::{
    BatchResult, BatchResultList, IdBatchResult, PostBatchResult, PulseBatchResult,
    QueryBatchResult, QueryResult, ResponseDecoder, SentBatch, WithdrawBatchResult,
};
pub use signing::{Ed25519Signer, KeyMaterial, Signer, SigningError};

/// Errors raised while building, transmitting or decoding batches.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// A command failed local validation; nothing was sent.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The signer could not sign.
    #[error(transparent)]
    Signing(#[from] SigningError),
    /// The server payload could not be decoded.
    #[error("malformed response: {reason}")]
    MalformedResponse {
        /// What was wrong.
        reason: String,
        /// Raw payload, for diagnostics.
        payload: String,
    },
    /// The server rejected the transmission. Fees already charged stay charged.
    #[error("batch {batch} rejected by server: {message}")]
    ServerRejected {
        /// Index of the failing batch.
        batch: usize,
        /// Server error code, if any.
        code: Option<String>,
        /// Server message.
        message: String,
        /// Failing command inside the batch, if reported.
        position: Option<u64>,
        /// Amount charged for the batch before it failed.
        already_charged: Option<i64>,
    },
    /// A query result was truncated and truncation is treated as fatal.
    #[error("query {query} of batch {batch} was truncated; rows are missing")]
    TruncatedResult {
        /// Batch index.
        batch: usize,
        /// Query index inside the batch.
        query: usize,
    },
    /// A result was read as the wrong kind.
    #[error("result {index} is a {actual} result, expected {expected}")]
    KindMismatch {
        /// Result index.
        index: usize,
        /// Requested kind.
        expected: BatchKind,
        /// Actual kind.
        actual: BatchKind,
    },
    /// No result at that index.
    #[error("no result at index {index}")]
    MissingResult {
        /// Requested index.
        index: usize,
    },
    /// Transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
    /// Background execution requested outside a tokio runtime.
    #[error("no tokio runtime available for background transmission")]
    NoRuntime,
}

impl LedgerError {
    /// Amount the server charged before rejecting, if this is a rejection.
    pub fn already_charged(&self) -> Option<i64> {
        match self {
            LedgerError::ServerRejected {
                already_charged, ..
            } => *already_charged,
            _ => None,
        }
    }
}
