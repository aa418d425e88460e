#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};
use vend_agent::{Agent, AgentConfig, ServiceAgent, ServiceConfig};
use vend_core::{Ed25519Signer, KeyMaterial};
use vend_spec::{parse_batches_field, Batch};
use vend_transport::ScriptedTransport;

pub fn signer(seed: &str) -> Arc<Ed25519Signer> {
    let material = KeyMaterial::Seed(seed.to_string());
    Arc::new(Ed25519Signer::from_material(&material).expect("seed keys always derive"))
}

pub fn agent(seed: &str, transport: &Arc<ScriptedTransport>) -> Agent {
    Agent::new(
        signer(seed),
        transport.clone(),
        AgentConfig::with_endpoint("http://ledger.test/command.php"),
    )
}

pub fn service_agent(
    seed: &str,
    transport: &Arc<ScriptedTransport>,
    config: ServiceConfig,
) -> ServiceAgent {
    ServiceAgent::new(agent(seed, transport), config)
}

/// Batches carried by the `index`-th request.
pub fn sent_batches(transport: &ScriptedTransport, index: usize) -> Vec<Batch> {
    let requests = transport.requests();
    let field = &requests[index].form["batches"];
    parse_batches_field(field)
        .expect("batches field")
        .into_iter()
        .map(|(encoded, _)| Batch::decode(&encoded).expect("decodable batch"))
        .collect()
}

/// Success response for id-assigning batches, one `(history_id, first_id)` each.
pub fn ids_response(batches: &[(u64, u64)]) -> String {
    let entries: Vec<Value> = batches
        .iter()
        .map(|(history, first)| json!([true, [history, 1, [first]]]))
        .collect();
    Value::Array(entries).to_string()
}

/// Success response for one query batch, one `(rows, truncated)` per query.
pub fn query_response(results: Vec<(Value, bool)>) -> String {
    let items: Vec<Value> = results
        .into_iter()
        .map(|(rows, truncated)| json!([rows, 1, 1, truncated]))
        .collect();
    json!([[true, [1, 2, items]]]).to_string()
}

/// Pending-call rows as the dispatcher's query returns them.
pub fn call_row(pulse_id: u64, from: &str, value: i64, post_id: u64, data: &str) -> Value {
    json!([pulse_id, from, value, post_id, data])
}

/// One correlator poll: optional reply row plus the latest post id.
pub fn poll_response(reply: Option<&str>, max_post_id: u64) -> String {
    let rows = match reply {
        Some(data) => json!([[data]]),
        None => json!([]),
    };
    query_response(vec![(rows, false), (json!([[max_post_id]]), false)])
}
