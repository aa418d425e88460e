use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use vend_core::{
    sign_command, BatchResult, BatchResultList, BatchSet, LedgerError, QueryResult,
    ResponseDecoder, SentBatch, Signer, WithdrawBatchResult,
};
use vend_spec::{Command, LedgerRequest, PostId, Pulse, PulseId, QuerySpec, Withdraw};
use vend_transport::Transport;

use crate::{queries, AgentConfig};

/// Ledger identity with a pending batch set.
///
/// Batches accumulate through the `add_*` methods and leave together on
/// [`Agent::transmit`]. Single-command helpers bypass the pending set.
pub struct Agent {
    signer: Arc<dyn Signer>,
    link: Link,
    config: AgentConfig,
    pending: BatchSet,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("address", &self.signer.address())
            .field("endpoint", &self.config.endpoint)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Agent {
    /// Agent signing with `signer` and talking to the ledger through `transport`.
    pub fn new(
        signer: Arc<dyn Signer>,
        transport: Arc<dyn Transport>,
        config: AgentConfig,
    ) -> Self {
        let link = Link {
            transport,
            endpoint: config.endpoint.clone(),
            version: config.protocol_version.clone(),
        };
        Self {
            signer,
            link,
            config,
            pending: BatchSet::new(),
        }
    }

    /// Address of this agent's identity.
    pub fn address(&self) -> &str {
        self.signer.address()
    }

    /// Active configuration.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Signer shared by this agent.
    pub fn signer(&self) -> &dyn Signer {
        self.signer.as_ref()
    }

    /// Batches waiting for the next transmission.
    pub fn pending(&self) -> &BatchSet {
        &self.pending
    }

    /// Queue a batch of posts; returns its index in the next result list.
    pub fn add_post_batch(&mut self, posts: Vec<String>) -> Result<usize, LedgerError> {
        self.pending.add_post_batch(self.signer.as_ref(), posts)
    }

    /// Queue a batch of pulses.
    pub fn add_pulse_batch(&mut self, pulses: Vec<Pulse>) -> Result<usize, LedgerError> {
        self.pending.add_pulse_batch(self.signer.as_ref(), pulses)
    }

    /// Queue a batch of queries; bare SQL picks up the configured budgets.
    pub fn add_query_batch(&mut self, queries: Vec<QuerySpec>) -> Result<usize, LedgerError> {
        let defaults = self.config.query_defaults;
        self.pending
            .add_query_batch(self.signer.as_ref(), queries, defaults)
    }

    /// Queue a batch of withdrawals.
    pub fn add_withdraw_batch(&mut self, withdraws: Vec<Withdraw>) -> Result<usize, LedgerError> {
        self.pending
            .add_withdraw_batch(self.signer.as_ref(), withdraws)
    }

    /// Drop every pending batch.
    pub fn clear_batches(&mut self) {
        self.pending.clear();
    }

    /// Send every pending batch in one request.
    ///
    /// The pending set is drained before the request goes out, so a failed
    /// transmission is not retried by the next call.
    pub fn transmit(&mut self) -> Result<BatchResultList, LedgerError> {
        let set = self.pending.take();
        self.transmit_set(set)
    }

    /// Send a batch set built outside the pending queue.
    pub fn transmit_set(&self, set: BatchSet) -> Result<BatchResultList, LedgerError> {
        self.transmit_set_with(set, self.decoder())
    }

    /// Send a batch set, decoding with `decoder`.
    pub fn transmit_set_with(
        &self,
        set: BatchSet,
        decoder: ResponseDecoder,
    ) -> Result<BatchResultList, LedgerError> {
        self.link.send(set, decoder)
    }

    /// Sign and send one command on its own, leaving the pending set alone.
    pub fn command(&self, command: Command) -> Result<BatchResult, LedgerError> {
        let set = self.single(command)?;
        first_result(self.transmit_set(set)?)
    }

    /// Post `data`; returns the new post id.
    pub fn post(&self, data: impl Into<String>) -> Result<PostId, LedgerError> {
        let results = self.transmit_set(self.single(Command::Post(data.into()))?)?;
        Ok(results.post(0)?.first_id)
    }

    /// Send one pulse; returns the new pulse id.
    pub fn pulse(&self, pulse: Pulse) -> Result<PulseId, LedgerError> {
        let results = self.transmit_set(self.single(Command::Pulse(pulse))?)?;
        Ok(results.pulse(0)?.first_id)
    }

    /// Run one query.
    pub fn query(&self, query: impl Into<QuerySpec>) -> Result<QueryResult, LedgerError> {
        self.query_with(query, self.decoder())
    }

    pub(crate) fn query_with(
        &self,
        query: impl Into<QuerySpec>,
        decoder: ResponseDecoder,
    ) -> Result<QueryResult, LedgerError> {
        let query = query.into().resolve(self.config.query_defaults);
        let set = self.single(Command::Query(query))?;
        let results = self.transmit_set_with(set, decoder)?;
        results
            .query(0)?
            .get(0)
            .cloned()
            .ok_or(LedgerError::MissingResult { index: 0 })
    }

    /// Withdraw; the destination may be left out for a lone withdrawal.
    pub fn withdraw(&self, withdraw: Withdraw) -> Result<WithdrawBatchResult, LedgerError> {
        let results = self.transmit_set(self.single(Command::Withdraw(withdraw))?)?;
        Ok(results.withdraw(0)?.clone())
    }

    /// Current balance net of the costs of asking for it.
    pub fn fetch_balance(&self) -> Result<i64, LedgerError> {
        let sql = queries::balance(self.address());
        let result = self.query(sql.as_str())?;
        let balance = result
            .int(0, 0)
            .ok_or_else(|| LedgerError::MalformedResponse {
                reason: format!("no balance row for {}", self.address()),
                payload: format!("{:?}", result.rows),
            })?;
        Ok(balance - result.time_cost - result.size_cost)
    }

    /// Send one command in the legacy single-command form; returns the raw body.
    pub fn raw_command(&self, command: &str) -> Result<Vec<u8>, LedgerError> {
        let signed = self.signer.sign(command.as_bytes())?;
        let request = LedgerRequest::Legacy {
            version: self.config.protocol_version.clone(),
            address: self.address().to_string(),
            command: command.to_string(),
            signed,
        };
        self.link.exchange(request)
    }

    /// Drain the pending set and transmit it on tokio's blocking pool.
    ///
    /// Fails with [`LedgerError::NoRuntime`] outside a runtime, leaving the
    /// pending set untouched.
    pub fn spawn_transmit(
        &mut self,
    ) -> Result<JoinHandle<Result<BatchResultList, LedgerError>>, LedgerError> {
        let handle = runtime()?;
        let set = self.pending.take();
        let link = self.link.clone();
        let decoder = self.decoder();
        Ok(handle.spawn_blocking(move || link.send(set, decoder)))
    }

    /// Sign `command` now and send it on tokio's blocking pool.
    pub fn spawn_command(
        &self,
        command: Command,
    ) -> Result<JoinHandle<Result<BatchResult, LedgerError>>, LedgerError> {
        let handle = runtime()?;
        let set = self.single(command)?;
        let link = self.link.clone();
        let decoder = self.decoder();
        Ok(handle.spawn_blocking(move || first_result(link.send(set, decoder)?)))
    }

    /// Like [`Agent::spawn_transmit`], delivering the outcome to `callback` exactly once.
    ///
    /// The callback is dropped without being called if no runtime is available.
    pub fn transmit_with_callback<F>(&mut self, callback: F) -> Result<JoinHandle<()>, LedgerError>
    where
        F: FnOnce(Result<BatchResultList, LedgerError>) + Send + 'static,
    {
        let handle = runtime()?;
        let set = self.pending.take();
        let link = self.link.clone();
        let decoder = self.decoder();
        Ok(handle.spawn_blocking(move || callback(link.send(set, decoder))))
    }

    /// Like [`Agent::spawn_command`], delivering the outcome to `callback` exactly once.
    pub fn command_with_callback<F>(
        &self,
        command: Command,
        callback: F,
    ) -> Result<JoinHandle<()>, LedgerError>
    where
        F: FnOnce(Result<BatchResult, LedgerError>) + Send + 'static,
    {
        let handle = runtime()?;
        let set = self.single(command)?;
        let link = self.link.clone();
        let decoder = self.decoder();
        Ok(handle.spawn_blocking(move || {
            callback(link.send(set, decoder).and_then(first_result))
        }))
    }

    fn single(&self, command: Command) -> Result<BatchSet, LedgerError> {
        let signed = sign_command(self.signer.as_ref(), command)?;
        Ok(BatchSet::from_signed(vec![signed]))
    }

    fn decoder(&self) -> ResponseDecoder {
        ResponseDecoder::new(self.config.raise_on_query_truncate)
    }
}

/// Owned view of where and how requests are sent; cloned into background tasks.
#[derive(Clone)]
struct Link {
    transport: Arc<dyn Transport>,
    endpoint: String,
    version: String,
}

impl Link {
    fn send(
        &self,
        set: BatchSet,
        decoder: ResponseDecoder,
    ) -> Result<BatchResultList, LedgerError> {
        let batches = set.into_batches();
        let sent: Vec<SentBatch> = batches.iter().map(SentBatch::from).collect();
        let span = tracing::info_span!(
            "transmit",
            batches = sent.len() as u64,
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty
        );
        let _guard = span.enter();
        let start = Instant::now();
        let request = LedgerRequest::Batches {
            version: self.version.clone(),
            batches,
        };
        let res = self
            .exchange(request)
            .and_then(|raw| decoder.decode(&raw, &sent));
        let elapsed = start.elapsed().as_millis() as u64;
        span.record("latency_ms", &elapsed);
        match &res {
            Ok(_) => {
                span.record("outcome", &"ok");
                tracing::debug!("transmission decoded");
            }
            Err(err) => {
                span.record("outcome", &"error");
                tracing::error!(error = %err, "transmission failed");
            }
        }
        res
    }

    fn exchange(&self, request: LedgerRequest) -> Result<Vec<u8>, LedgerError> {
        let form = request.into_form();
        let raw = self
            .transport
            .exchange(&self.endpoint, &form)
            .with_context(|| format!("exchange with {}", self.endpoint))?;
        Ok(raw)
    }
}

fn runtime() -> Result<Handle, LedgerError> {
    Handle::try_current().map_err(|_| LedgerError::NoRuntime)
}

fn first_result(results: BatchResultList) -> Result<BatchResult, LedgerError> {
    results
        .into_results()
        .into_iter()
        .next()
        .ok_or(LedgerError::MissingResult { index: 0 })
}
