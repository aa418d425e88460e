//! Ledger wire model: commands, batches, signed batch framing and validation.
//!
//! This crate defines how commands are shaped, which invariants a batch must
//! satisfy before it may be signed, and the deterministic JSON encoding that
//! the server verifies signatures against. It performs no I/O.
#![deny(missing_docs)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Post data conventions layered on top of the ledger (calls, returns, markers, variables).
pub mod envelope;
/// Value units and human readable formatting.
pub mod units;

/// Ledger address (derived from key material by a signer).
pub type Address = String;

/// Server-assigned post id.
pub type PostId = u64;

/// Server-assigned pulse id.
pub type PulseId = u64;

/// Protocol version sent with every request.
pub const PROTOCOL_VERSION: &str = "1_0";

/// Default time budget for a query given as a bare SQL string.
pub const DEFAULT_QUERY_MAX_TIME_COST: i64 = 1000;

/// Default size budget for a query given as a bare SQL string.
pub const DEFAULT_QUERY_MAX_SIZE_COST: i64 = 100_000;

/// Kind of a batch. The server never echoes it; clients must remember it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BatchKind {
    /// Data records.
    Post,
    /// Value transfers.
    Pulse,
    /// SQL reads.
    Query,
    /// Balance withdrawals.
    Withdraw,
}

impl BatchKind {
    /// Numeric code used in the encoded batch.
    pub fn code(self) -> u8 {
        match self {
            BatchKind::Post => 0,
            BatchKind::Pulse => 1,
            BatchKind::Query => 2,
            BatchKind::Withdraw => 3,
        }
    }

    /// Inverse of [`BatchKind::code`].
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(BatchKind::Post),
            1 => Some(BatchKind::Pulse),
            2 => Some(BatchKind::Query),
            3 => Some(BatchKind::Withdraw),
            _ => None,
        }
    }

    /// Lowercase label for logs and error messages.
    pub fn label(self) -> &'static str {
        match self {
            BatchKind::Post => "post",
            BatchKind::Pulse => "pulse",
            BatchKind::Query => "query",
            BatchKind::Withdraw => "withdraw",
        }
    }
}

impl std::fmt::Display for BatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Post referenced by a pulse.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PostRef {
    /// A post that already exists on the ledger.
    Id(i64),
    /// The `position`-th post of post batch `batch` in the same transmission.
    InBatch {
        /// Index of the post batch within the pending set.
        batch: i64,
        /// Position of the post inside that batch.
        position: i64,
    },
}

/// Value transfer command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pulse {
    /// Recipient address.
    pub to: Address,
    /// Amount in base units.
    pub amount: i64,
    /// Optional post the pulse points at.
    pub post: Option<PostRef>,
}

impl Pulse {
    /// Pulse without a referenced post.
    pub fn new(to: impl Into<Address>, amount: i64) -> Self {
        Self {
            to: to.into(),
            amount,
            post: None,
        }
    }

    /// Reference an existing post id.
    pub fn with_post(mut self, post_id: i64) -> Self {
        self.post = Some(PostRef::Id(post_id));
        self
    }

    /// Reference a post queued in the same transmission.
    pub fn with_batch_post(mut self, batch: i64, position: i64) -> Self {
        self.post = Some(PostRef::InBatch { batch, position });
        self
    }

    fn encode(&self) -> Value {
        match self.post {
            None => json!([self.to, self.amount]),
            Some(PostRef::Id(id)) => json!([self.to, self.amount, id]),
            Some(PostRef::InBatch { batch, position }) => {
                json!([self.to, self.amount, position, batch])
            }
        }
    }
}

/// Budgets applied to queries given as bare SQL.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryDefaults {
    /// Maximum time cost the server may charge.
    pub max_time_cost: i64,
    /// Maximum size cost the server may charge.
    pub max_size_cost: i64,
}

impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            max_time_cost: DEFAULT_QUERY_MAX_TIME_COST,
            max_size_cost: DEFAULT_QUERY_MAX_SIZE_COST,
        }
    }
}

/// Fully specified query command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Query {
    /// SQL text.
    pub sql: String,
    /// Maximum time cost.
    pub max_time_cost: i64,
    /// Maximum size cost.
    pub max_size_cost: i64,
}

impl Query {
    /// Query with explicit budgets.
    pub fn new(sql: impl Into<String>, max_time_cost: i64, max_size_cost: i64) -> Self {
        Self {
            sql: sql.into(),
            max_time_cost,
            max_size_cost,
        }
    }

    fn encode(&self) -> Value {
        json!([self.sql, self.max_time_cost, self.max_size_cost])
    }
}

/// Query as accepted by the batch builder: bare SQL or SQL with budgets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuerySpec {
    /// Bare SQL, expanded with [`QueryDefaults`].
    Sql(String),
    /// SQL with explicit budgets.
    Costed(Query),
}

impl QuerySpec {
    /// Expand into a full [`Query`].
    pub fn resolve(self, defaults: QueryDefaults) -> Query {
        match self {
            QuerySpec::Sql(sql) => Query::new(sql, defaults.max_time_cost, defaults.max_size_cost),
            QuerySpec::Costed(query) => query,
        }
    }
}

impl From<&str> for QuerySpec {
    fn from(sql: &str) -> Self {
        QuerySpec::Sql(sql.to_string())
    }
}

impl From<String> for QuerySpec {
    fn from(sql: String) -> Self {
        QuerySpec::Sql(sql)
    }
}

impl From<Query> for QuerySpec {
    fn from(query: Query) -> Self {
        QuerySpec::Costed(query)
    }
}

/// Withdrawal command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Withdraw {
    /// Amount in base units.
    pub amount: i64,
    /// Destination address; required inside explicit withdraw batches.
    pub destination: Option<String>,
}

impl Withdraw {
    /// Withdraw to an explicit destination.
    pub fn to(amount: i64, destination: impl Into<String>) -> Self {
        Self {
            amount,
            destination: Some(destination.into()),
        }
    }

    fn encode(&self) -> Value {
        match &self.destination {
            Some(dest) => json!([self.amount, dest]),
            None => json!([self.amount]),
        }
    }
}

/// A single command of any kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Publish data.
    Post(String),
    /// Transfer value.
    Pulse(Pulse),
    /// Read with SQL.
    Query(Query),
    /// Withdraw balance.
    Withdraw(Withdraw),
}

impl Command {
    /// Kind of batch this command belongs to.
    pub fn kind(&self) -> BatchKind {
        match self {
            Command::Post(_) => BatchKind::Post,
            Command::Pulse(_) => BatchKind::Pulse,
            Command::Query(_) => BatchKind::Query,
            Command::Withdraw(_) => BatchKind::Withdraw,
        }
    }

    /// Wrap the command into a batch of one.
    pub fn into_batch(self) -> Batch {
        match self {
            Command::Post(data) => Batch::Post(vec![data]),
            Command::Pulse(pulse) => Batch::Pulse(vec![pulse]),
            Command::Query(query) => Batch::Query(vec![query]),
            Command::Withdraw(withdraw) => Batch::Withdraw(vec![withdraw]),
        }
    }
}

/// Same-kind commands submitted and applied atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Batch {
    /// Post batch.
    Post(Vec<String>),
    /// Pulse batch.
    Pulse(Vec<Pulse>),
    /// Query batch.
    Query(Vec<Query>),
    /// Withdraw batch.
    Withdraw(Vec<Withdraw>),
}

impl Batch {
    /// Kind of the batch.
    pub fn kind(&self) -> BatchKind {
        match self {
            Batch::Post(_) => BatchKind::Post,
            Batch::Pulse(_) => BatchKind::Pulse,
            Batch::Query(_) => BatchKind::Query,
            Batch::Withdraw(_) => BatchKind::Withdraw,
        }
    }

    /// Number of commands.
    pub fn len(&self) -> usize {
        match self {
            Batch::Post(items) => items.len(),
            Batch::Pulse(items) => items.len(),
            Batch::Query(items) => items.len(),
            Batch::Withdraw(items) => items.len(),
        }
    }

    /// Whether the batch holds no commands.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deterministic compact JSON encoding: `[kindCode, [command, ...]]`.
    pub fn encode(&self) -> String {
        let commands: Vec<Value> = match self {
            Batch::Post(items) => items.iter().map(|data| json!(data)).collect(),
            Batch::Pulse(items) => items.iter().map(Pulse::encode).collect(),
            Batch::Query(items) => items.iter().map(Query::encode).collect(),
            Batch::Withdraw(items) => items.iter().map(Withdraw::encode).collect(),
        };
        json!([self.kind().code(), commands]).to_string()
    }

    /// Parse an encoded batch back into typed commands.
    pub fn decode(encoded: &str) -> Result<Self, WireError> {
        let value: Value = serde_json::from_str(encoded)?;
        let parts = value
            .as_array()
            .filter(|parts| parts.len() == 2)
            .ok_or_else(|| WireError::Shape("batch must be [kind, commands]".into()))?;
        let kind = parts[0]
            .as_u64()
            .and_then(BatchKind::from_code)
            .ok_or_else(|| WireError::Shape(format!("unknown batch kind {}", parts[0])))?;
        let commands = parts[1]
            .as_array()
            .ok_or_else(|| WireError::Shape("commands must be a list".into()))?;
        match kind {
            BatchKind::Post => commands
                .iter()
                .map(|c| {
                    c.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| WireError::Shape("post must be a string".into()))
                })
                .collect::<Result<_, _>>()
                .map(Batch::Post),
            BatchKind::Pulse => commands
                .iter()
                .map(decode_pulse)
                .collect::<Result<_, _>>()
                .map(Batch::Pulse),
            BatchKind::Query => commands
                .iter()
                .map(decode_query)
                .collect::<Result<_, _>>()
                .map(Batch::Query),
            BatchKind::Withdraw => commands
                .iter()
                .map(decode_withdraw)
                .collect::<Result<_, _>>()
                .map(Batch::Withdraw),
        }
    }
}

fn int_at(parts: &[Value], idx: usize, what: &str) -> Result<i64, WireError> {
    parts
        .get(idx)
        .and_then(Value::as_i64)
        .ok_or_else(|| WireError::Shape(format!("{what} must be an integer")))
}

fn decode_pulse(value: &Value) -> Result<Pulse, WireError> {
    let parts = value
        .as_array()
        .ok_or_else(|| WireError::Shape("pulse must be a list".into()))?;
    let to = parts
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| WireError::Shape("pulse recipient must be a string".into()))?;
    let amount = int_at(parts, 1, "pulse amount")?;
    let post = match parts.len() {
        2 => None,
        3 => Some(PostRef::Id(int_at(parts, 2, "post id")?)),
        4 => Some(PostRef::InBatch {
            position: int_at(parts, 2, "post position")?,
            batch: int_at(parts, 3, "batch index")?,
        }),
        n => return Err(WireError::Shape(format!("pulse has {n} fields"))),
    };
    Ok(Pulse {
        to: to.to_string(),
        amount,
        post,
    })
}

fn decode_query(value: &Value) -> Result<Query, WireError> {
    let parts = value
        .as_array()
        .ok_or_else(|| WireError::Shape("query must be a list".into()))?;
    let sql = parts
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| WireError::Shape("query sql must be a string".into()))?;
    Ok(Query::new(
        sql,
        int_at(parts, 1, "max time cost")?,
        int_at(parts, 2, "max size cost")?,
    ))
}

fn decode_withdraw(value: &Value) -> Result<Withdraw, WireError> {
    let parts = value
        .as_array()
        .ok_or_else(|| WireError::Shape("withdraw must be a list".into()))?;
    Ok(Withdraw {
        amount: int_at(parts, 0, "withdraw amount")?,
        destination: parts.get(1).and_then(Value::as_str).map(str::to_string),
    })
}

/// Errors raised while reading wire-encoded data.
#[derive(Debug, Error)]
pub enum WireError {
    /// Not JSON.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    /// JSON of the wrong shape.
    #[error("unexpected shape: {0}")]
    Shape(String),
}

/// Validation errors. Raised locally before anything is signed or sent.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Batch without commands.
    #[error("batch must contain at least one command")]
    EmptyBatch,
    /// Negative transfer or withdrawal amount.
    #[error("command {index}: amount must be >= 0, got {amount}")]
    NegativeAmount {
        /// Position in the batch.
        index: usize,
        /// Offending amount.
        amount: i64,
    },
    /// Negative referenced post id or post position.
    #[error("command {index}: referenced post id must be >= 0")]
    NegativePostId {
        /// Position in the batch.
        index: usize,
    },
    /// Negative batch index reference.
    #[error("command {index}: referenced batch index must be >= 0")]
    NegativeBatchIndex {
        /// Position in the batch.
        index: usize,
    },
    /// Reference to a batch that is not queued.
    #[error("command {index}: batch {batch} is not queued")]
    UnknownBatchReference {
        /// Position in the batch.
        index: usize,
        /// Referenced batch index.
        batch: i64,
    },
    /// Reference to a queued batch that does not hold posts.
    #[error("command {index}: batch {batch} is a {kind} batch, expected post")]
    NotAPostBatch {
        /// Position in the batch.
        index: usize,
        /// Referenced batch index.
        batch: i64,
        /// Kind of the referenced batch.
        kind: BatchKind,
    },
    /// Recipient address empty or containing whitespace, control characters or quotes.
    #[error("command {index}: invalid address {address:?}")]
    InvalidAddress {
        /// Position in the batch.
        index: usize,
        /// Offending address.
        address: String,
    },
    /// Empty SQL text.
    #[error("command {index}: query must not be empty")]
    EmptyQuery {
        /// Position in the batch.
        index: usize,
    },
    /// Negative query budget.
    #[error("command {index}: query costs must be >= 0")]
    NegativeCost {
        /// Position in the batch.
        index: usize,
    },
    /// Withdraw inside a batch without destination.
    #[error("command {index}: withdraw requires a destination")]
    MissingDestination {
        /// Position in the batch.
        index: usize,
    },
    /// Call arguments that are neither a list nor a mapping.
    #[error("call args must be a list or a mapping")]
    InvalidArgs,
    /// Name unusable inside a post prefix.
    #[error("invalid name {0:?}: must be non-empty without ':', '%' or quotes")]
    InvalidName(String),
}

/// Whether `address` is a plausible ledger address: non-empty, without
/// whitespace, control characters or quotes.
pub fn is_valid_address(address: &str) -> bool {
    !address.is_empty()
        && !address
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '\'' || c == '"')
}

/// Validate a batch against the kinds already queued in the same set.
///
/// `queued` holds the kinds of batches ahead of this one; batch-index
/// references are resolved against it.
pub fn validate_batch(batch: &Batch, queued: &[BatchKind]) -> Result<(), ValidationError> {
    if batch.is_empty() {
        return Err(ValidationError::EmptyBatch);
    }
    match batch {
        Batch::Post(_) => Ok(()),
        Batch::Pulse(pulses) => {
            for (index, pulse) in pulses.iter().enumerate() {
                validate_pulse(index, pulse, queued)?;
            }
            Ok(())
        }
        Batch::Query(queries) => {
            for (index, query) in queries.iter().enumerate() {
                if query.sql.trim().is_empty() {
                    return Err(ValidationError::EmptyQuery { index });
                }
                if query.max_time_cost < 0 || query.max_size_cost < 0 {
                    return Err(ValidationError::NegativeCost { index });
                }
            }
            Ok(())
        }
        Batch::Withdraw(withdraws) => {
            for (index, withdraw) in withdraws.iter().enumerate() {
                if withdraw.amount < 0 {
                    return Err(ValidationError::NegativeAmount {
                        index,
                        amount: withdraw.amount,
                    });
                }
                match withdraw.destination.as_deref() {
                    Some(dest) if !dest.trim().is_empty() => {}
                    _ => return Err(ValidationError::MissingDestination { index }),
                }
            }
            Ok(())
        }
    }
}

/// Validate a command sent on its own. A lone withdraw may omit its destination.
pub fn validate_command(command: &Command) -> Result<(), ValidationError> {
    match command {
        Command::Withdraw(Withdraw {
            amount,
            destination: None,
        }) => {
            if *amount < 0 {
                return Err(ValidationError::NegativeAmount {
                    index: 0,
                    amount: *amount,
                });
            }
            Ok(())
        }
        other => validate_batch(&other.clone().into_batch(), &[]),
    }
}

fn validate_pulse(index: usize, pulse: &Pulse, queued: &[BatchKind]) -> Result<(), ValidationError> {
    if !is_valid_address(&pulse.to) {
        return Err(ValidationError::InvalidAddress {
            index,
            address: pulse.to.clone(),
        });
    }
    if pulse.amount < 0 {
        return Err(ValidationError::NegativeAmount {
            index,
            amount: pulse.amount,
        });
    }
    match pulse.post {
        None => Ok(()),
        Some(PostRef::Id(id)) if id < 0 => Err(ValidationError::NegativePostId { index }),
        Some(PostRef::Id(_)) => Ok(()),
        Some(PostRef::InBatch { batch, position }) => {
            if position < 0 {
                return Err(ValidationError::NegativePostId { index });
            }
            if batch < 0 {
                return Err(ValidationError::NegativeBatchIndex { index });
            }
            match usize::try_from(batch).ok().and_then(|b| queued.get(b)) {
                None => Err(ValidationError::UnknownBatchReference { index, batch }),
                Some(BatchKind::Post) => Ok(()),
                Some(&kind) => Err(ValidationError::NotAPostBatch { index, batch, kind }),
            }
        }
    }
}

/// Encoded batch plus its signature. Kind and size stay local.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedBatch {
    encoded: String,
    signature: String,
    kind: BatchKind,
    size: usize,
}

impl SignedBatch {
    /// Assemble a signed batch from its parts.
    pub fn new(encoded: String, signature: String, kind: BatchKind, size: usize) -> Self {
        Self {
            encoded,
            signature,
            kind,
            size,
        }
    }

    /// Encoded batch the signature covers.
    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    /// Signature over [`SignedBatch::encoded`].
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Locally recorded kind.
    pub fn kind(&self) -> BatchKind {
        self.kind
    }

    /// Number of commands.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Wire form `[encodedBatch, signature]`.
    pub fn to_wire(&self) -> Value {
        json!([self.encoded, self.signature])
    }
}

/// Outbound request, flattened into form fields by [`LedgerRequest::into_form`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerRequest {
    /// Any number of signed batches.
    Batches {
        /// Protocol version.
        version: String,
        /// Signed batches in submission order.
        batches: Vec<SignedBatch>,
    },
    /// Legacy single-command form.
    Legacy {
        /// Protocol version.
        version: String,
        /// Signing address.
        address: Address,
        /// Raw command text.
        command: String,
        /// Signature over `command`.
        signed: String,
    },
}

impl LedgerRequest {
    /// Form fields for the transport.
    pub fn into_form(self) -> BTreeMap<String, String> {
        let mut form = BTreeMap::new();
        match self {
            LedgerRequest::Batches { version, batches } => {
                let wire: Vec<Value> = batches.iter().map(SignedBatch::to_wire).collect();
                form.insert("version".to_string(), version);
                form.insert("batches".to_string(), Value::Array(wire).to_string());
            }
            LedgerRequest::Legacy {
                version,
                address,
                command,
                signed,
            } => {
                form.insert("version".to_string(), version);
                form.insert("address".to_string(), address);
                form.insert("command".to_string(), command);
                form.insert("signed".to_string(), signed);
            }
        }
        form
    }
}

/// Split a `batches` form field back into `(encodedBatch, signature)` pairs.
pub fn parse_batches_field(field: &str) -> Result<Vec<(String, String)>, WireError> {
    let value: Value = serde_json::from_str(field)?;
    let items = value
        .as_array()
        .ok_or_else(|| WireError::Shape("batches must be a list".into()))?;
    items
        .iter()
        .map(|item| match item.as_array().map(Vec::as_slice) {
            Some([Value::String(encoded), Value::String(sig)]) => Ok((encoded.clone(), sig.clone())),
            _ => Err(WireError::Shape("batch must be [encoded, signature]".into())),
        })
        .collect()
}
