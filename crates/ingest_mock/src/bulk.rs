//! Bulk line protocol: two NDJSON lines per action, the action header
//! first and the document after it (deletes carry no document), e.g.
//!
//! ```text
//! { "create": {"_id": "5", "_index": "logs"} }
//! { "message": "hello" }
//! ```
//!
//! The assembler walks the stream in input order, asks the configured
//! [`OutcomePolicy`] what each unit of work should be answered with, and
//! builds the aggregate acknowledgement a real cluster would send.

use std::io::Read;
use std::sync::Arc;

use axum::http::StatusCode;
use flate2::read::GzDecoder;
use serde::Serialize;
use serde_json::Value;

use crate::ApiError;
use crate::odds::Odds;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionVerb {
    Index,
    Create,
    Update,
    Delete,
}

impl ActionVerb {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionVerb::Index => "index",
            ActionVerb::Create => "create",
            ActionVerb::Update => "update",
            ActionVerb::Delete => "delete",
        }
    }

    fn parse(key: &str) -> Option<Self> {
        match key {
            "index" => Some(ActionVerb::Index),
            "create" => Some(ActionVerb::Create),
            "update" => Some(ActionVerb::Update),
            "delete" => Some(ActionVerb::Delete),
            _ => None,
        }
    }

    /// Every verb except `delete` is followed by a document line.
    fn takes_document(self) -> bool {
        !matches!(self, ActionVerb::Delete)
    }

    /// Key used for this action's entry in the response `items` array.
    /// Clients built against the reduced `filter_path` contract expect
    /// `created` rather than `create`.
    fn item_key(self) -> &'static str {
        match self {
            ActionVerb::Create => "created",
            verb => verb.as_str(),
        }
    }
}

/// One unit of work scanned out of a bulk body. Lives only for the span
/// of its response item; the metadata stays opaque apart from the verb.
#[derive(Debug, Clone)]
pub struct Action {
    pub verb: ActionVerb,
    /// Whatever the action header carried (`_id`, `_index`, ...).
    pub meta: Value,
}

/// Embedder-supplied override: given the action and its raw document,
/// return the outcome status for that action.
pub type DecisionFn = Arc<dyn Fn(&Action, Option<&[u8]>) -> StatusCode + Send + Sync>;

/// Strategy seam between the assembler and the error-injection source.
/// Picked once at construction; the two implementations are mutually
/// exclusive and not switchable on a live handler.
pub trait OutcomePolicy: Send + Sync {
    /// Request-level gate, consulted exactly once before any action is
    /// scanned. 413 here short-circuits the whole request.
    fn request_status(&self) -> StatusCode;

    /// Per-action outcome. `None` means the action produces no response
    /// item; it still counts toward the tallies.
    fn action_status(&self, action: &Action, document: Option<&[u8]>) -> Option<StatusCode>;
}

/// Probabilistic mode: only `create` actions draw from the action table,
/// every other verb passes through without an outcome of its own.
pub struct SampledPolicy {
    odds: Arc<Odds>,
}

impl SampledPolicy {
    pub fn new(odds: Arc<Odds>) -> Self {
        Self { odds }
    }
}

impl OutcomePolicy for SampledPolicy {
    fn request_status(&self) -> StatusCode {
        self.odds.sample_request()
    }

    fn action_status(&self, action: &Action, _document: Option<&[u8]>) -> Option<StatusCode> {
        match action.verb {
            ActionVerb::Create => Some(self.odds.sample_action()),
            _ => None,
        }
    }
}

/// Deterministic mode: the callback's return value is the outcome for
/// every verb, `index`/`update`/`delete` included. No randomness at all,
/// so the same input yields the same response on every run.
pub struct ScriptedPolicy {
    decide: DecisionFn,
    request_status: StatusCode,
}

impl ScriptedPolicy {
    pub fn new(decide: DecisionFn) -> Self {
        Self {
            decide,
            request_status: StatusCode::OK,
        }
    }

    /// Fixes the request-level gate instead of leaving it at 200.
    pub fn with_request_status(mut self, status: StatusCode) -> Self {
        self.request_status = status;
        self
    }
}

impl OutcomePolicy for ScriptedPolicy {
    fn request_status(&self) -> StatusCode {
        self.request_status
    }

    fn action_status(&self, action: &Action, document: Option<&[u8]>) -> Option<StatusCode> {
        Some((self.decide)(action, document))
    }
}

/// Aggregate acknowledgement mirroring the wire contract of a bulk
/// response under `filter_path=errors,items.*.error,items.*.status`.
#[derive(Debug, Default, Clone, Serialize)]
pub struct BulkResponse {
    /// True iff any action outcome was non-success.
    pub errors: bool,
    /// One entry per action that produced an outcome, in input order;
    /// clients correlate results by position.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<Value>,
}

/// Per-verb, per-outcome counts for one request. Kept separate from the
/// process-wide metrics so a short-circuited or aborted request can be
/// asserted on without reading the global recorder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tallies {
    pub index: u64,
    pub update: u64,
    pub delete: u64,
    pub create_ok: u64,
    pub create_duplicate: u64,
    pub create_too_many: u64,
    pub create_non_index: u64,
    /// Scripted-mode create outcomes outside the three injected classes.
    pub create_other: u64,
}

impl Tallies {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn bump(&mut self, verb: ActionVerb, status: Option<StatusCode>) {
        match verb {
            ActionVerb::Index => self.index += 1,
            ActionVerb::Update => self.update += 1,
            ActionVerb::Delete => self.delete += 1,
            ActionVerb::Create => {
                let status = status.unwrap_or(StatusCode::OK);
                if status == StatusCode::CONFLICT {
                    self.create_duplicate += 1;
                } else if status == StatusCode::TOO_MANY_REQUESTS {
                    self.create_too_many += 1;
                } else if status == StatusCode::NOT_ACCEPTABLE {
                    self.create_non_index += 1;
                } else if status.is_success() {
                    self.create_ok += 1;
                } else {
                    self.create_other += 1;
                }
            }
        }
    }
}

/// A completed bulk request: the aggregate plus the decoded body, which
/// the caller records into the history ring.
#[derive(Debug)]
pub struct BulkOutput {
    pub response: BulkResponse,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub enum BulkDisposition {
    /// Stream fully scanned; transport status is 200, the injected
    /// failures live inside the items.
    Completed(BulkOutput),
    /// Request-level 413 fired; no action was scanned.
    TooLarge,
    /// Malformed action line or undecodable body; the request aborts and
    /// is never retried.
    Failed(ApiError),
}

#[derive(Debug)]
pub struct BulkReport {
    pub disposition: BulkDisposition,
    /// Survives a mid-stream failure: counts for actions scanned before
    /// the abort are not rolled back.
    pub tallies: Tallies,
}

/// Inflates a gzip body up front. The decoder is scoped to this call, so
/// it is released on every exit path including the error return.
pub fn decode_body(raw: &[u8], gzip: bool) -> Result<Vec<u8>, ApiError> {
    if !gzip {
        return Ok(raw.to_vec());
    }
    let mut decoder = GzDecoder::new(raw);
    let mut decoded = Vec::new();
    decoder
        .read_to_end(&mut decoded)
        .map_err(ApiError::Decompress)?;
    Ok(decoded)
}

/// Drives one bulk request end to end: request-level gate, then the
/// per-action loop in input order, tallying every verb along the way.
pub fn process_bulk(policy: &dyn OutcomePolicy, raw_body: &[u8], gzip: bool) -> BulkReport {
    let mut tallies = Tallies::default();

    // Request-level check happens before the body is even touched; a 413
    // carries no aggregate and no per-action tallies.
    if policy.request_status() == StatusCode::PAYLOAD_TOO_LARGE {
        return BulkReport {
            disposition: BulkDisposition::TooLarge,
            tallies,
        };
    }

    let body = match decode_body(raw_body, gzip) {
        Ok(body) => body,
        Err(err) => {
            return BulkReport {
                disposition: BulkDisposition::Failed(err),
                tallies,
            };
        }
    };

    let mut response = BulkResponse::default();
    let mut lines = body.split(|b| *b == b'\n');
    loop {
        let Some(line) = next_nonblank(&mut lines) else {
            break;
        };
        let action = match parse_action_line(line) {
            Ok(action) => action,
            Err(err) => {
                return BulkReport {
                    disposition: BulkDisposition::Failed(err),
                    tallies,
                };
            }
        };
        let document = if action.verb.takes_document() {
            next_nonblank(&mut lines)
        } else {
            None
        };

        let status = policy.action_status(&action, document);
        tallies.bump(action.verb, status);
        if let Some(status) = status {
            if !status.is_success() {
                response.errors = true;
            }
            let mut item = serde_json::Map::new();
            item.insert(
                action.verb.item_key().to_string(),
                serde_json::json!({"status": status.as_u16()}),
            );
            response.items.push(Value::Object(item));
        }
    }

    BulkReport {
        disposition: BulkDisposition::Completed(BulkOutput { response, body }),
        tallies,
    }
}

/// Blank lines are skipped without breaking the action/document pairing.
fn next_nonblank<'a, I: Iterator<Item = &'a [u8]>>(lines: &mut I) -> Option<&'a [u8]> {
    lines
        .by_ref()
        .map(|line| line.trim_ascii())
        .find(|line| !line.is_empty())
}

fn parse_action_line(line: &[u8]) -> Result<Action, ApiError> {
    let value: Value = serde_json::from_slice(line)?;
    let Value::Object(map) = value else {
        return Err(ApiError::ActionNotObject);
    };
    if map.len() != 1 {
        return Err(ApiError::ActionKeyCount(map.len()));
    }
    let Some((key, meta)) = map.into_iter().next() else {
        return Err(ApiError::ActionKeyCount(0));
    };
    let Some(verb) = ActionVerb::parse(&key) else {
        return Err(ApiError::UnknownVerb(key));
    };
    Ok(Action { verb, meta })
}
