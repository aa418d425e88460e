//! Ledger agent: owns an identity and a pending batch set, transmits signed
//! batches, serves named services from call pulses and calls remote services
//! by posting envelopes and polling for their replies.
#![deny(missing_docs)]

use std::time::Duration;

use vend_core::LedgerError;
use vend_spec::ValidationError;

/// Identity, pending batches and transmission.
pub mod agent;
/// Client side of service calls.
pub mod call;
/// Agent, dispatcher and call settings.
pub mod config;
/// SQL used by the agent.
pub mod queries;
/// Service registry and the dispatcher.
pub mod service;
/// JSON variables published as posts.
pub mod vars;

pub use agent::Agent;
pub use call::CallOutcome;
pub use config::{AgentConfig, CallOptions, ServiceConfig};
pub use service::{RequestMeta, Service, ServiceAgent, ServiceHandler, WorkReport};

pub use vend_core::{
    BatchResult, BatchResultList, Ed25519Signer, KeyMaterial, QueryResult, Signer,
};
pub use vend_spec::{Command, Pulse, Query, QuerySpec, Withdraw};
pub use vend_transport::{HttpTransport, ScriptedTransport, Transport};

/// Errors raised by agent-level operations.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Building, sending or decoding a transmission failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// `work` was called before any service was registered.
    #[error("register services before working")]
    NoServicesRegistered,
    /// The pending-call query came back truncated; raise its size budget.
    #[error("pending call query truncated; max size cost too low")]
    QueryTruncated,
    /// The remote service answered with an error.
    #[error("error in serving script: {message}")]
    RemoteServiceError {
        /// Message posted by the service.
        message: String,
    },
    /// No reply arrived in time.
    #[error("no reply after {elapsed:?}")]
    Timeout {
        /// Time spent waiting.
        elapsed: Duration,
    },
    /// A handler failed and handler errors are propagated locally.
    #[error("service {service} failed: {source}")]
    Handler {
        /// Name of the failing service.
        service: String,
        /// Handler error.
        source: anyhow::Error,
    },
    /// Post data did not follow the expected convention.
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope {
        /// What was wrong.
        reason: String,
    },
}

impl From<ValidationError> for AgentError {
    fn from(err: ValidationError) -> Self {
        AgentError::Ledger(LedgerError::Validation(err))
    }
}
