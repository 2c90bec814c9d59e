use std::sync::RwLock;

use axum::http::StatusCode;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::ApiError;

/// One slot per percentage point, so the table is the distribution.
pub const TABLE_SLOTS: usize = 100;

/// Operator-facing error-injection knobs, all in whole percentage points.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OddsPercents {
    /// Chance a `create` action is answered with 409 Conflict.
    pub duplicate: u32,
    /// Chance a `create` action is answered with 429 Too Many Requests.
    pub too_many: u32,
    /// Chance a `create` action is answered with 406 Not Acceptable.
    pub non_index: u32,
    /// Chance a whole bulk request is answered with 413 Payload Too Large.
    pub too_large: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct OddsTables {
    action: [StatusCode; TABLE_SLOTS],
    request: [StatusCode; TABLE_SLOTS],
}

/// The two discrete outcome distributions consulted while serving bulk
/// traffic. Readers sample under the read guard; `reconfigure` rebuilds
/// both tables off to the side and swaps them in under the write guard,
/// so no request ever observes a half-written table.
#[derive(Debug)]
pub struct Odds {
    tables: RwLock<OddsTables>,
}

impl Odds {
    pub fn new(percents: OddsPercents) -> Result<Self, ApiError> {
        Ok(Self {
            tables: RwLock::new(build_tables(percents)?),
        })
    }

    /// Atomically replaces both tables. A validation failure leaves the
    /// previous configuration in place untouched.
    pub fn reconfigure(&self, percents: OddsPercents) -> Result<(), ApiError> {
        let next = build_tables(percents)?;
        let mut guard = self.tables.write().unwrap_or_else(|e| e.into_inner());
        *guard = next;
        Ok(())
    }

    /// Uniform draw from the per-create-action table.
    pub fn sample_action(&self) -> StatusCode {
        let guard = self.tables.read().unwrap_or_else(|e| e.into_inner());
        guard.action[rand::rng().random_range(0..TABLE_SLOTS)]
    }

    /// Uniform draw from the request-level table, once per bulk request.
    pub fn sample_request(&self) -> StatusCode {
        let guard = self.tables.read().unwrap_or_else(|e| e.into_inner());
        guard.request[rand::rng().random_range(0..TABLE_SLOTS)]
    }

    #[cfg(test)]
    fn snapshot(&self) -> OddsTables {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

fn build_tables(percents: OddsPercents) -> Result<OddsTables, ApiError> {
    let create_sum = percents
        .duplicate
        .saturating_add(percents.too_many)
        .saturating_add(percents.non_index);
    if create_sum as usize > TABLE_SLOTS {
        return Err(ApiError::OddsSum(create_sum));
    }
    if percents.too_large as usize > TABLE_SLOTS {
        return Err(ApiError::TooLargePercent(percents.too_large));
    }

    let mut action = [StatusCode::OK; TABLE_SLOTS];
    let mut n = 0;
    for _ in 0..percents.duplicate {
        action[n] = StatusCode::CONFLICT;
        n += 1;
    }
    for _ in 0..percents.too_many {
        action[n] = StatusCode::TOO_MANY_REQUESTS;
        n += 1;
    }
    for _ in 0..percents.non_index {
        action[n] = StatusCode::NOT_ACCEPTABLE;
        n += 1;
    }

    let mut request = [StatusCode::OK; TABLE_SLOTS];
    for slot in request.iter_mut().take(percents.too_large as usize) {
        *slot = StatusCode::PAYLOAD_TOO_LARGE;
    }

    Ok(OddsTables { action, request })
}
