//! Pending batch set: validates, encodes and signs batches in submission order.

use vend_spec::{
    validate_batch, validate_command, Batch, BatchKind, Command, Pulse, QueryDefaults, QuerySpec,
    SignedBatch, Withdraw,
};

use crate::{LedgerError, Signer};

/// Signed batches waiting to be transmitted together.
///
/// Indices returned by the `add_*` methods are positions in this set and are
/// the indices results come back under.
#[derive(Debug, Default, Clone)]
pub struct BatchSet {
    batches: Vec<SignedBatch>,
}

impl BatchSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set made of batches that were already validated and signed.
    pub fn from_signed(batches: Vec<SignedBatch>) -> Self {
        Self { batches }
    }

    /// Queue a batch of posts.
    pub fn add_post_batch(
        &mut self,
        signer: &dyn Signer,
        posts: Vec<String>,
    ) -> Result<usize, LedgerError> {
        self.add_batch(signer, Batch::Post(posts))
    }

    /// Queue a batch of pulses.
    pub fn add_pulse_batch(
        &mut self,
        signer: &dyn Signer,
        pulses: Vec<Pulse>,
    ) -> Result<usize, LedgerError> {
        self.add_batch(signer, Batch::Pulse(pulses))
    }

    /// Queue a batch of queries; bare SQL picks up `defaults`.
    pub fn add_query_batch(
        &mut self,
        signer: &dyn Signer,
        queries: Vec<QuerySpec>,
        defaults: QueryDefaults,
    ) -> Result<usize, LedgerError> {
        let queries = queries
            .into_iter()
            .map(|spec| spec.resolve(defaults))
            .collect();
        self.add_batch(signer, Batch::Query(queries))
    }

    /// Queue a batch of withdrawals. Every entry needs a destination.
    pub fn add_withdraw_batch(
        &mut self,
        signer: &dyn Signer,
        withdraws: Vec<Withdraw>,
    ) -> Result<usize, LedgerError> {
        self.add_batch(signer, Batch::Withdraw(withdraws))
    }

    /// Validate, encode and sign `batch`, then queue it.
    ///
    /// Nothing is queued unless every command is valid and signing succeeds.
    pub fn add_batch(&mut self, signer: &dyn Signer, batch: Batch) -> Result<usize, LedgerError> {
        validate_batch(&batch, &self.kinds())?;
        let signed = sign_batch(signer, &batch)?;
        self.batches.push(signed);
        let index = self.batches.len() - 1;
        tracing::debug!(index, kind = %batch.kind(), size = batch.len(), "batch queued");
        Ok(index)
    }

    /// Kinds of the queued batches, in order.
    pub fn kinds(&self) -> Vec<BatchKind> {
        self.batches.iter().map(SignedBatch::kind).collect()
    }

    /// Queued batches, in order.
    pub fn batches(&self) -> &[SignedBatch] {
        &self.batches
    }

    /// Number of queued batches.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Drop every queued batch.
    pub fn clear(&mut self) {
        self.batches.clear();
    }

    /// Drain the set, leaving it empty.
    pub fn take(&mut self) -> BatchSet {
        std::mem::take(self)
    }

    /// Consume the set into its batches.
    pub fn into_batches(self) -> Vec<SignedBatch> {
        self.batches
    }
}

/// Encode and sign a batch without queuing it.
pub fn sign_batch(signer: &dyn Signer, batch: &Batch) -> Result<SignedBatch, LedgerError> {
    let encoded = batch.encode();
    let signature = signer.sign(encoded.as_bytes())?;
    Ok(SignedBatch::new(encoded, signature, batch.kind(), batch.len()))
}

/// Validate and sign a command as a batch of one.
pub fn sign_command(signer: &dyn Signer, command: Command) -> Result<SignedBatch, LedgerError> {
    validate_command(&command)?;
    sign_batch(signer, &command.into_batch())
}
