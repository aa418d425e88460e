//! Calling side of the service protocol: post a `c:` envelope, pulse the fee
//! at it, then poll for the service's `r:` reply.

use std::time::Instant;

use serde_json::Value;
use vend_core::{BatchResultList, BatchSet};
use vend_spec::envelope::{CallEnvelope, ReturnEnvelope};
use vend_spec::{PostId, Pulse};

use crate::{queries, AgentError, CallOptions, ServiceAgent};

/// Result of [`ServiceAgent::call`].
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// The call was sent without waiting; results of the post and pulse batches.
    Sent(BatchResultList),
    /// The service replied with this value.
    Returned(Value),
}

impl CallOutcome {
    /// Replied value, if the call waited for one.
    pub fn into_returned(self) -> Option<Value> {
        match self {
            CallOutcome::Returned(value) => Some(value),
            CallOutcome::Sent(_) => None,
        }
    }
}

impl ServiceAgent {
    /// Call `service_name` at `service_address`, paying `fee`.
    ///
    /// `args` must be a JSON list or mapping. Blocks the calling thread while
    /// polling; the timeout is checked between polls.
    pub fn call(
        &self,
        service_address: &str,
        service_name: &str,
        args: Value,
        fee: i64,
        options: &CallOptions,
    ) -> Result<CallOutcome, AgentError> {
        let envelope = CallEnvelope::new(service_name, args)?;
        let signer = self.agent().signer();
        let mut set = BatchSet::new();
        let post_batch = set.add_post_batch(signer, vec![envelope.encode()])?;
        set.add_pulse_batch(
            signer,
            vec![Pulse::new(service_address, fee).with_batch_post(post_batch as i64, 0)],
        )?;
        let sent = self.agent().transmit_set(set)?;
        if !options.wait_for_response {
            return Ok(CallOutcome::Sent(sent));
        }
        let request = sent.post(post_batch)?.first_id;
        tracing::debug!(service = service_name, request, "call posted");
        self.await_reply(service_address, request, options)
            .map(CallOutcome::Returned)
    }

    fn await_reply(
        &self,
        service_address: &str,
        request: PostId,
        options: &CallOptions,
    ) -> Result<Value, AgentError> {
        let start = Instant::now();
        let mut last_checked = request;
        let mut polls = 0u64;
        loop {
            polls += 1;
            let signer = self.agent().signer();
            let mut set = BatchSet::new();
            let defaults = self.agent().config().query_defaults;
            set.add_query_batch(
                signer,
                vec![
                    queries::reply_to(last_checked, service_address, request).into(),
                    queries::MAX_POST_ID.into(),
                ],
                defaults,
            )?;
            let results = self.agent().transmit_set(set)?;
            let batch = results.query(0)?;

            if let Some(data) = batch.get(0).and_then(|reply| reply.text(0, 0)) {
                tracing::debug!(request, polls, "reply found");
                return match ReturnEnvelope::parse(request, &data) {
                    Ok(ReturnEnvelope::Success { result, .. }) => Ok(result),
                    Ok(ReturnEnvelope::Failure { message, .. }) => {
                        Err(AgentError::RemoteServiceError { message })
                    }
                    Err(err) => Err(AgentError::MalformedEnvelope {
                        reason: err.to_string(),
                    }),
                };
            }
            if let Some(max) = batch
                .get(1)
                .and_then(|latest| latest.int(0, 0))
                .and_then(|id| PostId::try_from(id).ok())
            {
                last_checked = last_checked.max(max);
            }

            let elapsed = start.elapsed();
            if options.timeout.is_some_and(|timeout| elapsed > timeout) {
                tracing::debug!(request, polls, ?elapsed, "call timed out");
                return Err(AgentError::Timeout { elapsed });
            }
            let pause = options.poll_interval(elapsed);
            tracing::debug!(request, polls, last_checked, ?pause, "no reply yet");
            std::thread::sleep(pause);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::{Agent, AgentConfig, ServiceConfig};
    use serde_json::json;
    use vend_core::{Ed25519Signer, KeyMaterial, LedgerError};
    use vend_spec::{parse_batches_field, Batch, PostRef, ValidationError};
    use vend_transport::ScriptedTransport;

    fn caller(transport: Arc<ScriptedTransport>) -> ServiceAgent {
        let signer = Ed25519Signer::from_material(&KeyMaterial::Seed("caller".into())).unwrap();
        let agent = Agent::new(Arc::new(signer), transport, AgentConfig::default());
        ServiceAgent::new(agent, ServiceConfig::default())
    }

    fn quick() -> CallOptions {
        CallOptions {
            min_poll_interval: Duration::from_millis(1),
            ..CallOptions::default()
        }
    }

    fn poll(reply: Option<&str>, max_post: i64) -> String {
        let rows = match reply {
            Some(data) => json!([[data]]),
            None => json!([]),
        };
        json!([[true, [9, 1, [[rows, 1, 1, 0], [[[max_post]], 1, 1, 0]]]]]).to_string()
    }

    #[test]
    fn args_must_be_list_or_mapping() {
        let transport = Arc::new(ScriptedTransport::new());
        let agent = caller(transport.clone());
        let err = agent
            .call("svc1", "double", json!(21), 5, &quick())
            .unwrap_err();
        assert!(matches!(
            err,
            AgentError::Ledger(LedgerError::Validation(ValidationError::InvalidArgs))
        ));
        assert_eq!(transport.request_count(), 0);
    }

    #[test]
    fn fire_and_forget_returns_batch_results() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_response(json!([[true, [1, 2, [70]]], [true, [2, 5, [33]]]]).to_string());
        let agent = caller(transport.clone());
        let outcome = agent
            .call("svc1", "double", json!([21]), 5, &CallOptions::fire_and_forget())
            .unwrap();
        match outcome {
            CallOutcome::Sent(results) => {
                assert_eq!(results.post(0).unwrap().first_id, 70);
                assert_eq!(results.pulse(1).unwrap().first_id, 33);
            }
            other => panic!("unexpected {other:?}"),
        }
        let form = &transport.requests()[0].form;
        let batches: Vec<Batch> = parse_batches_field(&form["batches"])
            .unwrap()
            .into_iter()
            .map(|(encoded, _)| Batch::decode(&encoded).unwrap())
            .collect();
        assert_eq!(batches[0], Batch::Post(vec![r#"c:["double",[21]]"#.into()]));
        match &batches[1] {
            Batch::Pulse(pulses) => {
                assert_eq!(pulses[0].to, "svc1");
                assert_eq!(pulses[0].amount, 5);
                assert_eq!(pulses[0].post, Some(PostRef::InBatch { batch: 0, position: 0 }));
            }
            other => panic!("unexpected batch {other:?}"),
        }
    }

    #[test]
    fn remote_errors_surface_with_message() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_response(json!([[true, [1, 2, [70]]], [true, [2, 5, [33]]]]).to_string());
        transport.push_response(poll(Some("r:70:e:division: by zero"), 75));
        let agent = caller(transport);
        match agent.call("svc1", "div", json!([1, 0]), 5, &quick()) {
            Err(AgentError::RemoteServiceError { message }) => {
                assert_eq!(message, "division: by zero")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn watermark_follows_latest_post() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_response(json!([[true, [1, 2, [70]]], [true, [2, 5, [33]]]]).to_string());
        transport.push_response(poll(None, 90));
        transport.push_response(poll(Some("r:70:{\"ok\":true}"), 95));
        let agent = caller(transport.clone());
        let value = agent
            .call("svc1", "status", json!({}), 5, &quick())
            .unwrap()
            .into_returned();
        assert_eq!(value, Some(json!({"ok": true})));

        let second = &transport.requests()[2].form["batches"];
        let (encoded, _) = parse_batches_field(second).unwrap().remove(0);
        match Batch::decode(&encoded).unwrap() {
            Batch::Query(queries) => {
                assert!(queries[0].sql.contains("post_id > 90"));
                assert_eq!(queries[1].sql, queries::MAX_POST_ID);
            }
            other => panic!("unexpected batch {other:?}"),
        }
    }
}
