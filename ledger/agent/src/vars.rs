use serde_json::Value;
use vend_spec::envelope::{encode_var, validate_var_name};
use vend_spec::{is_valid_address, PostId, Query, ValidationError};

use crate::{queries, Agent, AgentError};

impl Agent {
    /// Publish `value` as the latest version of variable `name`.
    pub fn post_var_json(&self, name: &str, value: &Value) -> Result<PostId, AgentError> {
        let data = encode_var(name, value)?;
        Ok(self.post(data)?)
    }

    /// Latest value of variable `name` published by `address`, if any.
    pub fn fetch_var_json(
        &self,
        address: &str,
        name: &str,
        max_size_cost: Option<i64>,
    ) -> Result<Option<Value>, AgentError> {
        validate_var_name(name)?;
        if !is_valid_address(address) {
            return Err(ValidationError::InvalidAddress {
                index: 0,
                address: address.to_string(),
            }
            .into());
        }
        let defaults = self.config().query_defaults;
        let query = Query::new(
            queries::latest_var(address, name),
            defaults.max_time_cost,
            max_size_cost.unwrap_or(defaults.max_size_cost),
        );
        let result = self.query(query)?;
        let Some(text) = result.text(0, 0) else {
            return Ok(None);
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|err| AgentError::MalformedEnvelope {
                reason: format!("variable {name} of {address}: {err}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::AgentConfig;
    use serde_json::json;
    use vend_core::{Ed25519Signer, KeyMaterial};
    use vend_spec::{parse_batches_field, Batch};
    use vend_transport::ScriptedTransport;

    fn agent(transport: Arc<ScriptedTransport>) -> Agent {
        let signer = Ed25519Signer::from_material(&KeyMaterial::Seed("vars".into())).unwrap();
        Agent::new(Arc::new(signer), transport, AgentConfig::default())
    }

    fn var_rows(rows: Value) -> String {
        json!([[true, [4, 1, [[rows, 2, 3, 0]]]]]).to_string()
    }

    #[test]
    fn publishes_prefixed_json() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_response(json!([[true, [1, 1, [12]]]]).to_string());
        let agent = agent(transport.clone());
        let id = agent.post_var_json("motd", &json!({"text": "hi"})).unwrap();
        assert_eq!(id, 12);
        let (encoded, _) = parse_batches_field(&transport.requests()[0].form["batches"])
            .unwrap()
            .remove(0);
        assert_eq!(
            Batch::decode(&encoded).unwrap(),
            Batch::Post(vec![r#"v:json:motd:{"text":"hi"}"#.into()])
        );
    }

    #[test]
    fn fetch_reads_latest_or_none() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_response(var_rows(json!([["[1,2,3]"]])));
        transport.push_response(var_rows(json!([])));
        transport.push_response(var_rows(json!([["{broken"]])));
        let agent = agent(transport.clone());
        assert_eq!(
            agent.fetch_var_json("abc", "list", Some(50)).unwrap(),
            Some(json!([1, 2, 3]))
        );
        assert_eq!(agent.fetch_var_json("abc", "list", None).unwrap(), None);
        assert!(matches!(
            agent.fetch_var_json("abc", "list", None),
            Err(AgentError::MalformedEnvelope { .. })
        ));

        let (encoded, _) = parse_batches_field(&transport.requests()[0].form["batches"])
            .unwrap()
            .remove(0);
        match Batch::decode(&encoded).unwrap() {
            Batch::Query(queries) => assert_eq!(queries[0].max_size_cost, 50),
            other => panic!("unexpected batch {other:?}"),
        }
    }

    #[test]
    fn names_with_separators_are_rejected() {
        let transport = Arc::new(ScriptedTransport::new());
        let agent = agent(transport.clone());
        assert!(matches!(
            agent.post_var_json("a:b", &json!(1)),
            Err(AgentError::Ledger(vend_core::LedgerError::Validation(
                ValidationError::InvalidName(_)
            )))
        ));
        assert!(agent.fetch_var_json("abc", "", None).is_err());
        assert!(matches!(
            agent.fetch_var_json("x' OR '1'='1", "list", None),
            Err(AgentError::Ledger(vend_core::LedgerError::Validation(
                ValidationError::InvalidAddress { .. }
            )))
        ));
        assert_eq!(transport.request_count(), 0);
    }
}
