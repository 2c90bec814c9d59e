//! The HTTP face of the mock cluster: exact paths, the product header
//! official shippers probe for, and the tagline catch-all.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::ApiError;
use crate::bulk::{self, BulkDisposition, DecisionFn, OutcomePolicy, SampledPolicy, ScriptedPolicy, Tallies};
use crate::history::HistoryRing;
use crate::odds::{Odds, OddsPercents};

/// Official clients refuse to talk to anything that does not present
/// this header on every response.
pub const PRODUCT_HEADER: &str = "x-elastic-product";
pub const PRODUCT_NAME: &str = "Elasticsearch";

const TAGLINE: &str = r#"{"tagline": "You Know, for Testing"}"#;

/// Everything the handler is built from. Apart from the odds tables
/// (which stay reconfigurable at runtime through [`AppState::odds`]) all
/// of it is immutable once the state is constructed.
pub struct HandlerConfig {
    pub cluster_uuid: String,
    pub license_uid: Uuid,
    pub license_expiry: DateTime<Utc>,
    /// Applied before any side effect of a request, metrics included.
    pub delay: Duration,
    pub history_capacity: usize,
    pub percents: OddsPercents,
    /// When set, replaces the sampler for every action verb. The mode is
    /// fixed at construction and cannot be switched on a live handler.
    pub decision: Option<DecisionFn>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            cluster_uuid: String::new(),
            license_uid: Uuid::new_v4(),
            license_expiry: Utc::now() + chrono::Duration::hours(24),
            delay: Duration::ZERO,
            history_capacity: 0,
            percents: OddsPercents::default(),
            decision: None,
        }
    }
}

struct HandlerShared {
    cluster_uuid: String,
    license_uid: Uuid,
    license_expiry: DateTime<Utc>,
    delay: Duration,
    odds: Arc<Odds>,
    policy: Box<dyn OutcomePolicy>,
    history: HistoryRing,
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<HandlerShared>,
}

impl AppState {
    /// Live odds tables; `reconfigure` here is safe against in-flight
    /// requests.
    pub fn odds(&self) -> &Arc<Odds> {
        &self.inner.odds
    }

    pub fn history(&self) -> &HistoryRing {
        &self.inner.history
    }
}

pub fn build_state(config: HandlerConfig) -> Result<AppState, ApiError> {
    let odds = Arc::new(Odds::new(config.percents)?);
    let policy: Box<dyn OutcomePolicy> = match config.decision {
        Some(decide) => Box::new(ScriptedPolicy::new(decide)),
        None => Box::new(SampledPolicy::new(odds.clone())),
    };
    Ok(AppState {
        inner: Arc::new(HandlerShared {
            cluster_uuid: config.cluster_uuid,
            license_uid: config.license_uid,
            license_expiry: config.license_expiry,
            delay: config.delay,
            odds,
            policy,
            history: HistoryRing::new(config.history_capacity),
        }),
    })
}

pub fn build_router(state: AppState) -> Router {
    // The catch-all covers wrong methods on known paths too; probing
    // clients send all sorts of requests and expect the tagline back.
    Router::new()
        .route("/", get(root).fallback(tagline))
        .route("/_bulk", post(bulk_ingest).fallback(tagline))
        .route("/_license", get(license).fallback(tagline))
        .route("/_history", get(history).fallback(tagline))
        .fallback(tagline)
        .layer(middleware::from_fn_with_state(state.clone(), product_envelope))
        .with_state(state)
}

/// Runs the artificial delay ahead of every handler side effect and
/// stamps the product header onto every response, catch-all included.
async fn product_envelope(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if !state.inner.delay.is_zero() {
        tokio::time::sleep(state.inner.delay).await;
    }
    tracing::debug!(method = %request.method(), uri = %request.uri(), "request");
    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(PRODUCT_HEADER, HeaderValue::from_static(PRODUCT_NAME));
    response
}

async fn root(State(state): State<AppState>, uri: Uri, headers: HeaderMap) -> Response {
    let ua = user_agent(&headers);
    state.inner.history.record("GET", &uri.to_string(), "");
    metrics::counter!("root.total", "user_agent" => ua.clone(), "path" => "/").increment(1);

    Json(json!({
        "name": "mock",
        "cluster_uuid": state.inner.cluster_uuid,
        "version": {
            "number": client_version(&ua),
            "build_flavor": "default",
        },
    }))
    .into_response()
}

async fn bulk_ingest(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ua = user_agent(&headers);
    tracing::debug!(body_bytes = body.len(), "bulk request body");
    metrics::counter!("bulk.create.total", "user_agent" => ua.clone(), "path" => "/_bulk")
        .increment(1);

    let gzip = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("gzip"));

    let report = bulk::process_bulk(state.inner.policy.as_ref(), &body, gzip);
    record_tallies(&report.tallies, &ua);

    match report.disposition {
        BulkDisposition::TooLarge => {
            metrics::counter!("bulk.create.too_large", "user_agent" => ua, "path" => "/_bulk")
                .increment(1);
            StatusCode::PAYLOAD_TOO_LARGE.into_response()
        }
        BulkDisposition::Failed(err) => {
            tracing::warn!(%err, "bulk request aborted");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": err.to_string()})),
            )
                .into_response()
        }
        BulkDisposition::Completed(output) => {
            state.inner.history.record(
                "POST",
                &uri.to_string(),
                &String::from_utf8_lossy(&output.body),
            );
            Json(output.response).into_response()
        }
    }
}

async fn license(State(state): State<AppState>, uri: Uri, headers: HeaderMap) -> Response {
    let ua = user_agent(&headers);
    state.inner.history.record("GET", &uri.to_string(), "");
    metrics::counter!("license.total", "user_agent" => ua, "path" => "/_license").increment(1);

    Json(json!({
        "license": {
            "status": "active",
            "uid": state.inner.license_uid.to_string(),
            "type": "trial",
            "expiry_date_in_millis": state.inner.license_expiry.timestamp_millis(),
        },
    }))
    .into_response()
}

async fn history(State(state): State<AppState>) -> Response {
    Json(state.inner.history.snapshot()).into_response()
}

/// Catch-all used by clients to probe product identity.
async fn tagline() -> Response {
    (
        [(header::CONTENT_TYPE, "application/json")],
        TAGLINE,
    )
        .into_response()
}

fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Pulls the version out of a `Product/x.y.z ...` user-agent and trims
/// it to major.minor, which is what shippers expect echoed back.
fn client_version(user_agent: &str) -> String {
    let version = user_agent
        .split_whitespace()
        .next()
        .and_then(|token| token.split_once('/'))
        .map(|(_, version)| version)
        .unwrap_or_default();
    let mut parts = version.split('.');
    match (parts.next(), parts.next()) {
        (Some(major), Some(minor)) if !major.is_empty() => format!("{major}.{minor}"),
        _ => version.to_string(),
    }
}

fn record_tallies(tallies: &Tallies, user_agent: &str) {
    for (name, count) in [
        ("bulk.index.total", tallies.index),
        ("bulk.update.total", tallies.update),
        ("bulk.delete.total", tallies.delete),
        ("bulk.create.ok", tallies.create_ok),
        ("bulk.create.duplicate", tallies.create_duplicate),
        ("bulk.create.too_many", tallies.create_too_many),
        ("bulk.create.non_index", tallies.create_non_index),
        ("bulk.create.other", tallies.create_other),
    ] {
        if count > 0 {
            metrics::counter!(name, "user_agent" => user_agent.to_string(), "path" => "/_bulk")
                .increment(count);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::SocketAddr;

    use flate2::Compression;
    use flate2::write::GzEncoder;
    use serde_json::Value;

    use super::*;
    use crate::bulk::{Action, ActionVerb};
    use crate::history::HistoryRecord;

    async fn spawn_server(config: HandlerConfig) -> (SocketAddr, AppState) {
        let state = build_state(config).expect("valid handler config");
        let app = build_router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        (addr, state)
    }

    const BULK_BODY: &str = concat!(
        "{\"create\": {\"_id\": \"1\", \"_index\": \"logs\"}}\n",
        "{\"message\": \"a\"}\n",
        "{\"index\": {\"_id\": \"2\", \"_index\": \"logs\"}}\n",
        "{\"message\": \"b\"}\n",
        "{\"delete\": {\"_id\": \"3\", \"_index\": \"logs\"}}\n",
    );

    #[tokio::test]
    async fn every_response_carries_the_product_header() {
        let (addr, _state) = spawn_server(HandlerConfig::default()).await;
        let client = reqwest::Client::new();

        for path in ["/", "/_license", "/_history", "/no/such/path"] {
            let resp = client
                .get(format!("http://{addr}{path}"))
                .send()
                .await
                .expect("request");
            assert_eq!(
                resp.headers()
                    .get(PRODUCT_HEADER)
                    .and_then(|v| v.to_str().ok()),
                Some(PRODUCT_NAME),
                "missing product header on {path}"
            );
        }
    }

    #[tokio::test]
    async fn unknown_paths_answer_with_the_tagline() {
        let (addr, _state) = spawn_server(HandlerConfig::default()).await;
        let resp = reqwest::Client::new()
            .get(format!("http://{addr}/_cat/indices"))
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: Value = resp.json().await.expect("json body");
        assert_eq!(body["tagline"], "You Know, for Testing");

        // Wrong method on a known path probes the same way.
        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/"))
            .send()
            .await
            .expect("request");
        let body: Value = resp.json().await.expect("json body");
        assert_eq!(body["tagline"], "You Know, for Testing");
    }

    #[tokio::test]
    async fn root_reports_cluster_uuid_and_client_version() {
        let (addr, _state) = spawn_server(HandlerConfig {
            cluster_uuid: "cluster-under-test".to_string(),
            ..HandlerConfig::default()
        })
        .await;

        let resp = reqwest::Client::new()
            .get(format!("http://{addr}/"))
            .header(header::USER_AGENT, "Elastic-Filebeat/8.13.2 (linux)")
            .send()
            .await
            .expect("request");
        let body: Value = resp.json().await.expect("json body");
        assert_eq!(body["name"], "mock");
        assert_eq!(body["cluster_uuid"], "cluster-under-test");
        assert_eq!(body["version"]["number"], "8.13");
        assert_eq!(body["version"]["build_flavor"], "default");
    }

    #[tokio::test]
    async fn license_is_an_active_trial_with_the_configured_expiry() {
        let uid = Uuid::new_v4();
        let expiry = Utc::now() + chrono::Duration::hours(24);
        let (addr, _state) = spawn_server(HandlerConfig {
            license_uid: uid,
            license_expiry: expiry,
            ..HandlerConfig::default()
        })
        .await;

        let resp = reqwest::Client::new()
            .get(format!("http://{addr}/_license"))
            .send()
            .await
            .expect("request");
        let body: Value = resp.json().await.expect("json body");
        assert_eq!(body["license"]["status"], "active");
        assert_eq!(body["license"]["type"], "trial");
        assert_eq!(body["license"]["uid"], uid.to_string());
        assert_eq!(
            body["license"]["expiry_date_in_millis"],
            expiry.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn bulk_roundtrip_with_zero_odds_is_all_ok() {
        let (addr, _state) = spawn_server(HandlerConfig::default()).await;
        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/_bulk"))
            .body(BULK_BODY)
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: Value = resp.json().await.expect("json body");
        assert_eq!(body["errors"], false);
        let items = body["items"].as_array().expect("items array");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["created"]["status"], 200);
    }

    #[tokio::test]
    async fn gzip_bulk_bodies_are_accepted() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(BULK_BODY.as_bytes())
            .expect("gzip write");
        let compressed = encoder.finish().expect("gzip finish");

        let (addr, _state) = spawn_server(HandlerConfig::default()).await;
        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/_bulk"))
            .header(header::CONTENT_ENCODING, "gzip")
            .body(compressed)
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: Value = resp.json().await.expect("json body");
        assert_eq!(body["errors"], false);
    }

    #[tokio::test]
    async fn forced_too_large_returns_413_with_an_empty_body() {
        let (addr, _state) = spawn_server(HandlerConfig {
            percents: OddsPercents {
                too_large: 100,
                ..OddsPercents::default()
            },
            ..HandlerConfig::default()
        })
        .await;

        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/_bulk"))
            .body(BULK_BODY)
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status(), reqwest::StatusCode::PAYLOAD_TOO_LARGE);
        assert!(resp.bytes().await.expect("body").is_empty());
    }

    #[tokio::test]
    async fn scripted_mode_injects_the_callback_status_for_every_verb() {
        let decide: DecisionFn = Arc::new(|action: &Action, _doc: Option<&[u8]>| {
            match action.verb {
                ActionVerb::Create => StatusCode::CONFLICT,
                ActionVerb::Index => StatusCode::NOT_ACCEPTABLE,
                _ => StatusCode::OK,
            }
        });
        let (addr, _state) = spawn_server(HandlerConfig {
            decision: Some(decide),
            ..HandlerConfig::default()
        })
        .await;

        let client = reqwest::Client::new();
        for _ in 0..2 {
            let resp = client
                .post(format!("http://{addr}/_bulk"))
                .body(BULK_BODY)
                .send()
                .await
                .expect("request");
            let body: Value = resp.json().await.expect("json body");
            assert_eq!(body["errors"], true);
            let items = body["items"].as_array().expect("items array");
            assert_eq!(items.len(), 3);
            assert_eq!(items[0]["created"]["status"], 409);
            assert_eq!(items[1]["index"]["status"], 406);
            assert_eq!(items[2]["delete"]["status"], 200);
        }
    }

    #[tokio::test]
    async fn malformed_bulk_aborts_with_500_and_no_history_record() {
        let (addr, state) = spawn_server(HandlerConfig {
            history_capacity: 8,
            ..HandlerConfig::default()
        })
        .await;

        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/_bulk"))
            .body("{\"create\": {\"_id\": \"1\"}, \"index\": {\"_id\": \"2\"}}\n{}\n")
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = resp.json().await.expect("diagnostic body");
        assert!(body["error"].as_str().expect("error string").contains("2 keys"));

        assert!(
            state.history().snapshot().is_empty(),
            "aborted bulk must not be recorded"
        );
    }

    #[tokio::test]
    async fn history_endpoint_serves_recent_requests_oldest_first() {
        let (addr, _state) = spawn_server(HandlerConfig {
            history_capacity: 2,
            ..HandlerConfig::default()
        })
        .await;
        let client = reqwest::Client::new();

        client
            .get(format!("http://{addr}/"))
            .send()
            .await
            .expect("root");
        client
            .get(format!("http://{addr}/_license"))
            .send()
            .await
            .expect("license");
        client
            .post(format!("http://{addr}/_bulk"))
            .body("{\"delete\": {\"_id\": \"1\"}}\n")
            .send()
            .await
            .expect("bulk");

        let records: Vec<HistoryRecord> = client
            .get(format!("http://{addr}/_history"))
            .send()
            .await
            .expect("history")
            .json()
            .await
            .expect("history json");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].method, "GET");
        assert_eq!(records[0].uri, "/_license");
        assert_eq!(records[1].method, "POST");
        assert_eq!(records[1].uri, "/_bulk");
        assert_eq!(records[1].body, "{\"delete\": {\"_id\": \"1\"}}\n");
    }

    #[tokio::test]
    async fn history_endpoint_is_an_empty_list_at_capacity_zero() {
        let (addr, _state) = spawn_server(HandlerConfig::default()).await;
        let client = reqwest::Client::new();
        client
            .get(format!("http://{addr}/"))
            .send()
            .await
            .expect("root");

        let records: Vec<Value> = client
            .get(format!("http://{addr}/_history"))
            .send()
            .await
            .expect("history")
            .json()
            .await
            .expect("history json");
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn odds_can_be_reconfigured_on_a_live_handler() {
        let (addr, state) = spawn_server(HandlerConfig::default()).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://{addr}/_bulk"))
            .body("{\"create\": {\"_id\": \"1\"}}\n{}\n")
            .send()
            .await
            .expect("request");
        let body: Value = resp.json().await.expect("json body");
        assert_eq!(body["items"][0]["created"]["status"], 200);

        state
            .odds()
            .reconfigure(OddsPercents {
                duplicate: 100,
                ..OddsPercents::default()
            })
            .expect("valid percents");

        let resp = client
            .post(format!("http://{addr}/_bulk"))
            .body("{\"create\": {\"_id\": \"1\"}}\n{}\n")
            .send()
            .await
            .expect("request");
        let body: Value = resp.json().await.expect("json body");
        assert_eq!(body["errors"], true);
        assert_eq!(body["items"][0]["created"]["status"], 409);
    }

    #[test]
    fn client_version_trims_to_major_minor() {
        assert_eq!(client_version("Elastic-Agent/8.13.2 (linux)"), "8.13");
        assert_eq!(client_version("Go-http-client/1.1"), "1.1");
        assert_eq!(client_version("curl/7"), "7");
        assert_eq!(client_version(""), "");
    }
}
