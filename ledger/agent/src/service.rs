//! Serving side of the call protocol.
//!
//! A call is a `c:` post paired with a pulse to the service address. `work`
//! finds unserved call pulses above the service's `l:` marker, runs the named
//! handlers and answers in a single transmission: one post batch with the
//! replies and the advanced marker, plus a pulse batch with refunds for failed
//! calls when there are any.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use vend_core::{BatchSet, PostBatchResult, PulseBatchResult, QueryResult, ResponseDecoder};
use vend_spec::envelope::{CallEnvelope, LastReadMarker, ReturnEnvelope};
use vend_spec::{is_valid_address, Address, PostId, Pulse, PulseId, Query};

use crate::{queries, Agent, AgentError, ServiceConfig};

/// What a handler returns: a value to post back, nothing, or an error.
pub type HandlerResult = anyhow::Result<Option<Value>>;

type SimpleFn = dyn Fn(&Value) -> HandlerResult + Send + Sync;
type AdvancedFn = dyn Fn(&RequestMeta, &Value) -> HandlerResult + Send + Sync;

/// Pulse details handed to advanced handlers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestMeta {
    /// Id of the call pulse.
    pub pulse_id: PulseId,
    /// Caller address.
    pub from_address: Address,
    /// Value paid with the call.
    pub pulse_value: i64,
    /// Id of the call post.
    pub post_id: PostId,
}

/// Callable behind a service name.
#[derive(Clone)]
pub enum ServiceHandler {
    /// Receives the call arguments only.
    Simple(Arc<SimpleFn>),
    /// Receives the pulse details as well.
    Advanced(Arc<AdvancedFn>),
}

impl ServiceHandler {
    /// Handler taking only the arguments.
    pub fn simple<F>(f: F) -> Self
    where
        F: Fn(&Value) -> HandlerResult + Send + Sync + 'static,
    {
        ServiceHandler::Simple(Arc::new(f))
    }

    /// Handler taking the pulse details and the arguments.
    pub fn advanced<F>(f: F) -> Self
    where
        F: Fn(&RequestMeta, &Value) -> HandlerResult + Send + Sync + 'static,
    {
        ServiceHandler::Advanced(Arc::new(f))
    }

    fn invoke(&self, meta: &RequestMeta, args: &Value) -> HandlerResult {
        match self {
            ServiceHandler::Simple(f) => f(args),
            ServiceHandler::Advanced(f) => f(meta, args),
        }
    }
}

impl std::fmt::Debug for ServiceHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceHandler::Simple(_) => f.write_str("Simple(..)"),
            ServiceHandler::Advanced(_) => f.write_str("Advanced(..)"),
        }
    }
}

/// A named, priced handler.
#[derive(Debug, Clone)]
pub struct Service {
    /// Name callers put in their call envelope.
    pub name: String,
    /// Code run per call.
    pub handler: ServiceHandler,
    /// Minimum pulse value accepted for a call.
    pub fee: u64,
}

/// Outcome of one [`ServiceAgent::work`] round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkReport {
    /// Result of the reply post batch, if anything was posted.
    pub responses: Option<PostBatchResult>,
    /// Result of the refund pulse batch, if any refund was due.
    pub refunds: Option<PulseBatchResult>,
    /// Calls answered by a handler.
    pub served: usize,
    /// Calls to names not registered here.
    pub skipped: usize,
    /// Calls answered with an error.
    pub failed: usize,
}

/// Agent that serves named services and calls remote ones.
#[derive(Debug)]
pub struct ServiceAgent {
    agent: Agent,
    services: BTreeMap<String, Service>,
    config: ServiceConfig,
}

enum Outcome {
    Reply(Option<Value>),
    Failed(String),
    Skipped,
}

impl ServiceAgent {
    /// Wrap `agent` with an empty service registry.
    pub fn new(agent: Agent, config: ServiceConfig) -> Self {
        Self {
            agent,
            services: BTreeMap::new(),
            config,
        }
    }

    /// Underlying agent.
    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Underlying agent, for queuing batches.
    pub fn agent_mut(&mut self) -> &mut Agent {
        &mut self.agent
    }

    /// Address calls must be pulsed to.
    pub fn address(&self) -> &str {
        self.agent.address()
    }

    /// Dispatcher settings.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Amount kept from each refund.
    pub fn set_refund_fee(&mut self, refund_fee: u64) {
        self.config.refund_fee = refund_fee;
    }

    /// Register `service`, replacing any service of the same name.
    pub fn register_service(&mut self, service: Service) -> Option<Service> {
        tracing::debug!(service = %service.name, fee = service.fee, "service registered");
        self.services.insert(service.name.clone(), service)
    }

    /// Register a handler that takes only the call arguments.
    pub fn register_simple<F>(&mut self, name: impl Into<String>, fee: u64, f: F)
    where
        F: Fn(&Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.register_service(Service {
            name: name.into(),
            handler: ServiceHandler::simple(f),
            fee,
        });
    }

    /// Register a handler that also sees the call pulse.
    pub fn register_advanced<F>(&mut self, name: impl Into<String>, fee: u64, f: F)
    where
        F: Fn(&RequestMeta, &Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.register_service(Service {
            name: name.into(),
            handler: ServiceHandler::advanced(f),
            fee,
        });
    }

    /// Registered service by name.
    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    /// Lowest fee across registered services.
    pub fn lowest_fee(&self) -> Option<u64> {
        self.services.values().map(|service| service.fee).min()
    }

    /// Serve every pending call once.
    ///
    /// Budgets default to the agent's query defaults. Nothing is transmitted
    /// when there are no pending calls.
    pub fn work(
        &self,
        max_time_cost: Option<i64>,
        max_size_cost: Option<i64>,
    ) -> Result<WorkReport, AgentError> {
        let min_fee = self.lowest_fee().ok_or(AgentError::NoServicesRegistered)?;
        let defaults = self.agent.config().query_defaults;
        let query = Query::new(
            queries::pending_calls(self.address(), min_fee),
            max_time_cost.unwrap_or(defaults.max_time_cost),
            max_size_cost.unwrap_or(defaults.max_size_cost),
        );
        let calls = self.agent.query_with(query, ResponseDecoder::new(false))?;
        if calls.truncated {
            tracing::warn!(rows = calls.rows.len(), "pending call query truncated");
            return Err(AgentError::QueryTruncated);
        }
        self.answer(&calls)
    }

    fn answer(&self, calls: &QueryResult) -> Result<WorkReport, AgentError> {
        let mut report = WorkReport::default();
        let mut replies = Vec::new();
        let mut refunds = Vec::new();
        let mut last_read: Option<PulseId> = None;

        for row in 0..calls.rows.len() {
            let meta = request_meta(calls, row)?;
            last_read = last_read.max(Some(meta.pulse_id));
            let data = calls.text(row, 4).unwrap_or_default();

            let outcome = match CallEnvelope::parse(&data) {
                Err(err) => Outcome::Failed(format!("malformed call: {err}")),
                Ok(call) => self.dispatch(&meta, &call)?,
            };
            match outcome {
                Outcome::Skipped => report.skipped += 1,
                Outcome::Reply(value) => {
                    report.served += 1;
                    if let Some(result) = value {
                        replies.push(
                            ReturnEnvelope::Success {
                                request: meta.post_id,
                                result,
                            }
                            .encode(),
                        );
                    }
                }
                Outcome::Failed(message) => {
                    report.failed += 1;
                    replies.push(
                        ReturnEnvelope::Failure {
                            request: meta.post_id,
                            message,
                        }
                        .encode(),
                    );
                    let refund = meta
                        .pulse_value
                        .saturating_sub(fee_amount(self.config.refund_fee));
                    if refund > 0 && !is_valid_address(&meta.from_address) {
                        tracing::warn!(
                            from = %meta.from_address,
                            refund,
                            "refund recipient unusable, refund skipped"
                        );
                    } else if refund > 0 {
                        // Refunds point at the error reply in post batch 0.
                        let position = (replies.len() - 1) as i64;
                        refunds.push(
                            Pulse::new(meta.from_address.clone(), refund)
                                .with_batch_post(0, position),
                        );
                    }
                }
            }
        }

        let Some(last_read) = last_read else {
            tracing::debug!("no pending calls");
            return Ok(report);
        };
        replies.push(LastReadMarker(last_read).encode());

        let signer = self.agent.signer();
        let mut set = BatchSet::new();
        let post_batch = set.add_post_batch(signer, replies)?;
        let refund_batch = if refunds.is_empty() {
            None
        } else {
            Some(set.add_pulse_batch(signer, refunds)?)
        };
        let results = self.agent.transmit_set(set)?;
        report.responses = Some(results.post(post_batch)?.clone());
        report.refunds = match refund_batch {
            Some(index) => Some(results.pulse(index)?.clone()),
            None => None,
        };
        tracing::info!(
            served = report.served,
            skipped = report.skipped,
            failed = report.failed,
            last_read,
            "work round answered"
        );
        Ok(report)
    }

    fn dispatch(&self, meta: &RequestMeta, call: &CallEnvelope) -> Result<Outcome, AgentError> {
        let Some(service) = self.services.get(&call.service) else {
            tracing::debug!(
                service = %call.service,
                pulse_id = meta.pulse_id,
                "skipped unknown service"
            );
            return Ok(Outcome::Skipped);
        };
        let fee = fee_amount(service.fee);
        if meta.pulse_value < fee {
            tracing::warn!(
                service = %service.name,
                paid = meta.pulse_value,
                fee,
                "insufficient fee"
            );
            return Ok(Outcome::Failed(format!(
                "insufficient fee: paid {}, {} costs {fee}",
                meta.pulse_value, service.name
            )));
        }
        match service.handler.invoke(meta, &call.args) {
            Ok(value) => {
                tracing::debug!(service = %service.name, post_id = meta.post_id, "served");
                Ok(Outcome::Reply(value))
            }
            Err(source) if self.config.raise_handler_errors => Err(AgentError::Handler {
                service: service.name.clone(),
                source,
            }),
            Err(err) => {
                tracing::warn!(
                    service = %service.name,
                    post_id = meta.post_id,
                    error = %err,
                    "handler failed"
                );
                Ok(Outcome::Failed(err.to_string()))
            }
        }
    }
}

fn request_meta(calls: &QueryResult, row: usize) -> Result<RequestMeta, AgentError> {
    let malformed = |column: &str| AgentError::MalformedEnvelope {
        reason: format!("call row {row} has no usable {column}"),
    };
    Ok(RequestMeta {
        pulse_id: calls
            .int(row, 0)
            .and_then(|id| u64::try_from(id).ok())
            .ok_or_else(|| malformed("pulse id"))?,
        from_address: calls.text(row, 1).ok_or_else(|| malformed("sender"))?,
        pulse_value: calls.int(row, 2).ok_or_else(|| malformed("value"))?,
        post_id: calls
            .int(row, 3)
            .and_then(|id| u64::try_from(id).ok())
            .ok_or_else(|| malformed("post id"))?,
    })
}

fn fee_amount(fee: u64) -> i64 {
    i64::try_from(fee).unwrap_or(i64::MAX)
}
