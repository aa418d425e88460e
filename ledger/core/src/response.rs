//! Positional decoding of server responses.
//!
//! The wire payload carries no batch kind. Each entry is interpreted using the
//! kind recorded locally when the batch was signed, so a result list always
//! lines up with the batch set it was produced from.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use vend_spec::{BatchKind, SignedBatch};

use self::EntryError::{Shape, Truncated};
use crate::LedgerError;

/// Result of a post or pulse batch: ids are assigned contiguously from `first_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdBatchResult {
    /// Server history id of the batch.
    pub history_id: u64,
    /// Fee debited for the batch.
    pub charged: i64,
    /// Id assigned to the first command.
    pub first_id: u64,
    /// Number of commands in the batch.
    pub size: usize,
}

impl IdBatchResult {
    /// Id of the `index`-th command, if the batch has one.
    pub fn get(&self, index: usize) -> Option<u64> {
        if index >= self.size {
            return None;
        }
        self.first_id.checked_add(index as u64)
    }

    /// All ids, in submission order. Stops early if ids would overflow.
    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.size as u64).map_while(move |offset| self.first_id.checked_add(offset))
    }
}

/// Result of a post batch.
pub type PostBatchResult = IdBatchResult;
/// Result of a pulse batch.
pub type PulseBatchResult = IdBatchResult;

/// One query's rows and costs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryResult {
    /// Rows as returned by the server.
    pub rows: Vec<Vec<Value>>,
    /// Time cost charged.
    pub time_cost: i64,
    /// Size cost charged.
    pub size_cost: i64,
    /// Rows are missing because the size budget ran out.
    pub truncated: bool,
}

impl QueryResult {
    /// Cell at `row`, `col`.
    pub fn cell(&self, row: usize, col: usize) -> Option<&Value> {
        self.rows.get(row).and_then(|cells| cells.get(col))
    }

    /// Integer cell; numeric strings are accepted.
    pub fn int(&self, row: usize, col: usize) -> Option<i64> {
        self.cell(row, col).and_then(lenient_i64)
    }

    /// Text cell; numbers are rendered.
    pub fn text(&self, row: usize, col: usize) -> Option<String> {
        match self.cell(row, col)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Result of a query batch: one [`QueryResult`] per query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryBatchResult {
    /// Server history id of the batch.
    pub history_id: u64,
    /// Fee debited for the batch.
    pub charged: i64,
    /// Per-query results.
    pub results: Vec<QueryResult>,
}

impl QueryBatchResult {
    /// Result of the `index`-th query.
    pub fn get(&self, index: usize) -> Option<&QueryResult> {
        self.results.get(index)
    }
}

/// Result of a withdraw batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WithdrawBatchResult {
    /// Server history id of the batch.
    pub history_id: u64,
    /// Fee debited for the batch.
    pub charged: i64,
}

/// Result of one batch, shaped by its kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum BatchResult {
    /// Post batch.
    Post(PostBatchResult),
    /// Pulse batch.
    Pulse(PulseBatchResult),
    /// Query batch.
    Query(QueryBatchResult),
    /// Withdraw batch.
    Withdraw(WithdrawBatchResult),
}

impl BatchResult {
    /// Kind of the batch this result belongs to.
    pub fn kind(&self) -> BatchKind {
        match self {
            BatchResult::Post(_) => BatchKind::Post,
            BatchResult::Pulse(_) => BatchKind::Pulse,
            BatchResult::Query(_) => BatchKind::Query,
            BatchResult::Withdraw(_) => BatchKind::Withdraw,
        }
    }

    /// Server history id.
    pub fn history_id(&self) -> u64 {
        match self {
            BatchResult::Post(r) | BatchResult::Pulse(r) => r.history_id,
            BatchResult::Query(r) => r.history_id,
            BatchResult::Withdraw(r) => r.history_id,
        }
    }

    /// Fee debited.
    pub fn charged(&self) -> i64 {
        match self {
            BatchResult::Post(r) | BatchResult::Pulse(r) => r.charged,
            BatchResult::Query(r) => r.charged,
            BatchResult::Withdraw(r) => r.charged,
        }
    }
}

/// Ordered results of one transmission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResultList {
    results: Vec<BatchResult>,
}

impl BatchResultList {
    /// Wrap decoded results.
    pub fn new(results: Vec<BatchResult>) -> Self {
        Self { results }
    }

    /// Number of results.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Result at `index`, whatever its kind.
    pub fn get(&self, index: usize) -> Option<&BatchResult> {
        self.results.get(index)
    }

    /// Iterate in batch order.
    pub fn iter(&self) -> std::slice::Iter<'_, BatchResult> {
        self.results.iter()
    }

    /// Consume into the results.
    pub fn into_results(self) -> Vec<BatchResult> {
        self.results
    }

    fn at(&self, index: usize) -> Result<&BatchResult, LedgerError> {
        self.results
            .get(index)
            .ok_or(LedgerError::MissingResult { index })
    }

    /// Post result at `index`.
    pub fn post(&self, index: usize) -> Result<&PostBatchResult, LedgerError> {
        match self.at(index)? {
            BatchResult::Post(r) => Ok(r),
            other => Err(mismatch(index, BatchKind::Post, other)),
        }
    }

    /// Pulse result at `index`.
    pub fn pulse(&self, index: usize) -> Result<&PulseBatchResult, LedgerError> {
        match self.at(index)? {
            BatchResult::Pulse(r) => Ok(r),
            other => Err(mismatch(index, BatchKind::Pulse, other)),
        }
    }

    /// Query result at `index`.
    pub fn query(&self, index: usize) -> Result<&QueryBatchResult, LedgerError> {
        match self.at(index)? {
            BatchResult::Query(r) => Ok(r),
            other => Err(mismatch(index, BatchKind::Query, other)),
        }
    }

    /// Withdraw result at `index`.
    pub fn withdraw(&self, index: usize) -> Result<&WithdrawBatchResult, LedgerError> {
        match self.at(index)? {
            BatchResult::Withdraw(r) => Ok(r),
            other => Err(mismatch(index, BatchKind::Withdraw, other)),
        }
    }
}

impl IntoIterator for BatchResultList {
    type Item = BatchResult;
    type IntoIter = std::vec::IntoIter<BatchResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

fn mismatch(index: usize, expected: BatchKind, actual: &BatchResult) -> LedgerError {
    LedgerError::KindMismatch {
        index,
        expected,
        actual: actual.kind(),
    }
}

/// Kind and size of a transmitted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentBatch {
    /// Locally recorded kind.
    pub kind: BatchKind,
    /// Number of commands.
    pub size: usize,
}

impl From<&SignedBatch> for SentBatch {
    fn from(batch: &SignedBatch) -> Self {
        Self {
            kind: batch.kind(),
            size: batch.size(),
        }
    }
}

/// Decodes raw server payloads against the batches that were sent.
#[derive(Debug, Clone, Copy)]
pub struct ResponseDecoder {
    raise_on_truncate: bool,
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self {
            raise_on_truncate: true,
        }
    }
}

impl ResponseDecoder {
    /// Decoder; with `raise_on_truncate` a truncated query fails the decode.
    pub fn new(raise_on_truncate: bool) -> Self {
        Self { raise_on_truncate }
    }

    /// Decode `raw` into one result per entry of `sent`.
    pub fn decode(&self, raw: &[u8], sent: &[SentBatch]) -> Result<BatchResultList, LedgerError> {
        let malformed = |reason: String| LedgerError::MalformedResponse {
            reason,
            payload: String::from_utf8_lossy(raw).into_owned(),
        };
        let value: Value =
            serde_json::from_slice(raw).map_err(|err| malformed(format!("invalid json: {err}")))?;
        let entries = value
            .as_array()
            .ok_or_else(|| malformed("response is not a list".into()))?;
        let status = entries
            .last()
            .ok_or_else(|| malformed("response is empty".into()))?;

        if !entry_succeeded(status) {
            let err = rejection(entries.len() - 1, status);
            tracing::warn!(error = %err, "transmission rejected");
            return Err(err);
        }
        if entries.len() < sent.len() || entries.len() > sent.len() + 1 {
            return Err(malformed(format!(
                "expected {} batch entries, got {}",
                sent.len(),
                entries.len()
            )));
        }

        let mut results = Vec::with_capacity(sent.len());
        for (index, (entry, batch)) in entries.iter().zip(sent).enumerate() {
            let result = self
                .decode_entry(index, entry, *batch)
                .map_err(|err| match err {
                    Shape(reason) => malformed(format!("batch {index}: {reason}")),
                    Truncated { query } => LedgerError::TruncatedResult {
                        batch: index,
                        query,
                    },
                })?;
            results.push(result);
        }
        tracing::debug!(batches = results.len(), "response decoded");
        Ok(BatchResultList::new(results))
    }

    fn decode_entry(
        &self,
        index: usize,
        entry: &Value,
        batch: SentBatch,
    ) -> Result<BatchResult, EntryError> {
        if !entry_succeeded(entry) {
            return Err(Shape(format!("entry {index} reports failure")));
        }
        let body = entry
            .get(1)
            .and_then(Value::as_array)
            .ok_or_else(|| Shape("missing batch body".into()))?;
        // Body order is history id, charged, payload.
        let history_id = body
            .first()
            .and_then(lenient_u64)
            .ok_or_else(|| Shape("history id must be an integer".into()))?;
        let charged = body
            .get(1)
            .and_then(lenient_i64)
            .ok_or_else(|| Shape("charged must be an integer".into()))?;
        let payload = body.get(2).unwrap_or(&Value::Null);

        let result = match batch.kind {
            BatchKind::Post | BatchKind::Pulse => {
                let first_id = match payload {
                    Value::Array(items) => items.first().and_then(lenient_u64),
                    other => lenient_u64(other),
                }
                .ok_or_else(|| Shape("first id must be an integer".into()))?;
                let ids = IdBatchResult {
                    history_id,
                    charged,
                    first_id,
                    size: batch.size,
                };
                if batch.kind == BatchKind::Post {
                    BatchResult::Post(ids)
                } else {
                    BatchResult::Pulse(ids)
                }
            }
            BatchKind::Query => {
                let items = payload
                    .as_array()
                    .ok_or_else(|| Shape("query payload must be a list".into()))?;
                let mut results = Vec::with_capacity(items.len());
                for (query, item) in items.iter().enumerate() {
                    let result = decode_query_result(item)?;
                    if result.truncated && self.raise_on_truncate {
                        return Err(Truncated { query });
                    }
                    results.push(result);
                }
                BatchResult::Query(QueryBatchResult {
                    history_id,
                    charged,
                    results,
                })
            }
            BatchKind::Withdraw => BatchResult::Withdraw(WithdrawBatchResult {
                history_id,
                charged,
            }),
        };
        Ok(result)
    }
}

enum EntryError {
    Shape(String),
    Truncated { query: usize },
}

fn decode_query_result(item: &Value) -> Result<QueryResult, EntryError> {
    let parts = item
        .as_array()
        .ok_or_else(|| Shape("query result must be a list".into()))?;
    let rows = match parts.first() {
        Some(Value::Array(rows)) => rows
            .iter()
            .map(|row| match row {
                Value::Array(cells) => Ok(cells.clone()),
                _ => Err(Shape("row must be a list".into())),
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(Value::Null) | None => Vec::new(),
        Some(_) => return Err(Shape("rows must be a list".into())),
    };
    let time_cost = parts.get(1).and_then(lenient_i64).unwrap_or(0);
    let size_cost = parts.get(2).and_then(lenient_i64).unwrap_or(0);
    let truncated = parts.get(3).map(truthy).unwrap_or(false);
    Ok(QueryResult {
        rows,
        time_cost,
        size_cost,
        truncated,
    })
}

fn entry_succeeded(entry: &Value) -> bool {
    entry
        .as_array()
        .and_then(|parts| parts.first())
        .map(truthy)
        .unwrap_or(false)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "0",
        _ => false,
    }
}

// Failure entries carry `[false, [code, message, position, charged]]`; older
// servers send the same fields flat without the code.
fn rejection(batch: usize, status: &Value) -> LedgerError {
    let parts = status.as_array().map(Vec::as_slice).unwrap_or_default();
    let (code, info) = match parts.get(1) {
        Some(Value::Array(info)) => (info.first().and_then(text), info.get(1..).unwrap_or_default()),
        _ => (None, parts.get(1..).unwrap_or_default()),
    };
    LedgerError::ServerRejected {
        batch,
        code,
        message: info
            .first()
            .and_then(text)
            .unwrap_or_else(|| "unspecified error".to_string()),
        position: info.get(1).and_then(lenient_u64),
        already_charged: info.get(2).and_then(lenient_i64),
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Integer from a JSON number or numeric string.
pub fn lenient_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Non-negative integer from a JSON number or numeric string.
pub fn lenient_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sent(kinds: &[(BatchKind, usize)]) -> Vec<SentBatch> {
        kinds
            .iter()
            .map(|&(kind, size)| SentBatch { kind, size })
            .collect()
    }

    fn bytes(value: Value) -> Vec<u8> {
        value.to_string().into_bytes()
    }

    #[test]
    fn id_ranges_match_fixture_ids() {
        let raw = bytes(json!([[true, [10, 3, [500]]], [true, [11, 4, [77]]]]));
        let list = ResponseDecoder::default()
            .decode(&raw, &sent(&[(BatchKind::Post, 3), (BatchKind::Pulse, 2)]))
            .unwrap();
        let posts = list.post(0).unwrap();
        assert_eq!(posts.ids().collect::<Vec<_>>(), vec![500, 501, 502]);
        assert_eq!(posts.get(2), Some(502));
        assert_eq!(posts.get(3), None);
        assert_eq!(list.pulse(1).unwrap().get(1), Some(78));
        assert_eq!(list.get(1).unwrap().charged(), 4);
    }

    #[test]
    fn ids_near_the_top_of_the_range_do_not_overflow() {
        let result = IdBatchResult {
            history_id: 1,
            charged: 0,
            first_id: u64::MAX - 1,
            size: 4,
        };
        assert_eq!(result.get(1), Some(u64::MAX));
        assert_eq!(result.get(2), None);
        assert_eq!(result.ids().collect::<Vec<_>>(), vec![u64::MAX - 1, u64::MAX]);
    }

    #[test]
    fn mixed_kinds_decode_positionally() {
        let raw = bytes(json!([
            [true, [1, 0, [[[["a", "1"]], 3, 4, 0]]]],
            [true, [2, 5, [40]]],
            [true, [3, 6, []]],
            [true, [4, 1, 90]]
        ]));
        let kinds = [
            (BatchKind::Query, 1),
            (BatchKind::Post, 1),
            (BatchKind::Withdraw, 1),
            (BatchKind::Pulse, 1),
        ];
        let list = ResponseDecoder::default()
            .decode(&raw, &sent(&kinds))
            .unwrap();
        for (i, (kind, _)) in kinds.iter().enumerate() {
            assert_eq!(list.get(i).unwrap().kind(), *kind);
        }
        let query = list.query(0).unwrap().get(0).unwrap();
        assert_eq!(query.text(0, 0).as_deref(), Some("a"));
        assert_eq!(query.int(0, 1), Some(1));
        assert_eq!(list.pulse(3).unwrap().first_id, 90);
        assert!(matches!(
            list.post(0),
            Err(LedgerError::KindMismatch {
                index: 0,
                expected: BatchKind::Post,
                actual: BatchKind::Query
            })
        ));
        assert!(matches!(list.post(9), Err(LedgerError::MissingResult { index: 9 })));
    }

    #[test]
    fn failure_status_preserves_charge() {
        let raw = bytes(json!([
            [true, [1, 2, [3]]],
            [false, [17, "insufficient funds", 2, 500]]
        ]));
        let err = ResponseDecoder::default()
            .decode(&raw, &sent(&[(BatchKind::Post, 1), (BatchKind::Pulse, 3)]))
            .unwrap_err();
        match err {
            LedgerError::ServerRejected {
                batch,
                code,
                message,
                position,
                already_charged,
            } => {
                assert_eq!(batch, 1);
                assert_eq!(code.as_deref(), Some("17"));
                assert_eq!(message, "insufficient funds");
                assert_eq!(position, Some(2));
                assert_eq!(already_charged, Some(500));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn flat_failure_status_is_understood() {
        let raw = bytes(json!([[false, "bad signature", null, null]]));
        let err = ResponseDecoder::default()
            .decode(&raw, &sent(&[(BatchKind::Post, 1)]))
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::ServerRejected { batch: 0, ref message, position: None, already_charged: None, .. }
                if message == "bad signature"
        ));
    }

    #[test]
    fn truncation_is_fatal_only_when_asked() {
        let raw = bytes(json!([[true, [1, 0, [[[[1]], 1, 1, 0], [[[2]], 1, 1, 1]]]]]));
        let kinds = sent(&[(BatchKind::Query, 2)]);
        let err = ResponseDecoder::new(true).decode(&raw, &kinds).unwrap_err();
        assert!(matches!(err, LedgerError::TruncatedResult { batch: 0, query: 1 }));
        let list = ResponseDecoder::new(false).decode(&raw, &kinds).unwrap();
        assert!(list.query(0).unwrap().get(1).unwrap().truncated);
    }

    #[test]
    fn garbage_is_malformed_with_payload() {
        let err = ResponseDecoder::default()
            .decode(b"<html>502</html>", &sent(&[(BatchKind::Post, 1)]))
            .unwrap_err();
        assert!(matches!(err, LedgerError::MalformedResponse { ref payload, .. } if payload == "<html>502</html>"));
        let short = bytes(json!([[true, [1, 0, [1]]]]));
        let err = ResponseDecoder::default()
            .decode(&short, &sent(&[(BatchKind::Post, 1), (BatchKind::Post, 1)]))
            .unwrap_err();
        assert!(matches!(err, LedgerError::MalformedResponse { .. }));
    }

    #[test]
    fn trailing_status_entry_is_ignored() {
        let raw = bytes(json!([[true, [1, 0, [8]]], [true]]));
        let list = ResponseDecoder::default()
            .decode(&raw, &sent(&[(BatchKind::Post, 1)]))
            .unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list.post(0).unwrap().first_id, 8);
    }
}
