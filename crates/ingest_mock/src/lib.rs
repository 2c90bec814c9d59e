//! Fake ingestion surface of a document-store cluster.
//!
//! Real log/metrics shippers are pointed at this server instead of a
//! production cluster; the operator dials in the per-document and
//! per-request error codes the shipper is supposed to survive. Nothing is
//! ever stored or indexed.

pub mod bulk;
pub mod handler;
pub mod history;
pub mod odds;

use thiserror::Error;

pub use handler::{AppState, HandlerConfig, build_router, build_state};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("create outcome percentages sum to {0}, must not exceed 100")]
    OddsSum(u32),
    #[error("too-large percentage {0} must not exceed 100")]
    TooLargePercent(u32),
    #[error("bulk action line is not valid json: {0}")]
    ActionParse(#[from] serde_json::Error),
    #[error("bulk action line must be a json object")]
    ActionNotObject,
    #[error("bulk action line has {0} keys, expected exactly 1")]
    ActionKeyCount(usize),
    #[error("unknown bulk action verb {0:?}")]
    UnknownVerb(String),
    #[error("request body could not be gunzipped: {0}")]
    Decompress(#[source] std::io::Error),
}
