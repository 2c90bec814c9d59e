use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use axum_server::tls_rustls::RustlsConfig;
use chrono::Utc;
use clap::Parser;
use ingest_mock::odds::OddsPercents;
use ingest_mock::{HandlerConfig, build_router, build_state};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "mock-es", about = "Mock document-store ingestion cluster", version)]
struct Cli {
    /// Address to listen on, ip:port.
    #[arg(long, env = "MOCK_ES_ADDR", default_value = "0.0.0.0:9200")]
    addr: SocketAddr,
    /// Percent chance a create action is answered with 409 Conflict.
    #[arg(long, env = "MOCK_ES_PERCENT_DUPLICATE", default_value_t = 0)]
    dup: u32,
    /// Percent chance a create action is answered with 429 Too Many Requests.
    #[arg(long, env = "MOCK_ES_PERCENT_TOO_MANY", default_value_t = 0)]
    toomany: u32,
    /// Percent chance a create action is answered with 406 Not Acceptable.
    #[arg(long, env = "MOCK_ES_PERCENT_NON_INDEX", default_value_t = 0)]
    nonindex: u32,
    /// Percent chance a bulk POST is answered with 413 Payload Too Large.
    #[arg(long, env = "MOCK_ES_PERCENT_TOO_LARGE", default_value_t = 0)]
    toolarge: u32,
    /// Number of request bodies to keep, served on the _history endpoint.
    #[arg(long, env = "MOCK_ES_HISTORY", default_value_t = 0)]
    history: usize,
    /// Cluster UUID reported on the root endpoint.
    #[arg(long, env = "MOCK_ES_CLUSTER_UUID", default_value = "")]
    clusteruuid: String,
    /// Seconds between metrics dumps to stdout, 0 disables them.
    #[arg(long, env = "MOCK_ES_METRICS_INTERVAL_SECS", default_value_t = 0)]
    metrics_interval_secs: u64,
    /// Path to a PEM certificate file; requires --keyfile.
    #[arg(long, env = "MOCK_ES_CERT_FILE")]
    certfile: Option<PathBuf>,
    /// Path to a PEM private key file; requires --certfile.
    #[arg(long, env = "MOCK_ES_KEY_FILE")]
    keyfile: Option<PathBuf>,
    /// Milliseconds to wait before processing each request.
    #[arg(long, env = "MOCK_ES_DELAY_MS", default_value_t = 0)]
    delay_ms: u64,
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = observability::init_tracing("mock_server", cli.verbose);
    let prometheus = observability::init_metrics();
    install_rustls_provider();

    if cli.certfile.is_some() != cli.keyfile.is_some() {
        bail!("certfile and keyfile must be given together");
    }

    observability::spawn_metrics_printer(
        prometheus,
        Duration::from_secs(cli.metrics_interval_secs),
    );

    let state = build_state(HandlerConfig {
        cluster_uuid: cli.clusteruuid,
        license_uid: Uuid::new_v4(),
        license_expiry: Utc::now() + chrono::Duration::hours(24),
        delay: Duration::from_millis(cli.delay_ms),
        history_capacity: cli.history,
        percents: OddsPercents {
            duplicate: cli.dup,
            too_many: cli.toomany,
            non_index: cli.nonindex,
            too_large: cli.toolarge,
        },
        decision: None,
    })
    .context("invalid outcome percentages")?;

    let app = build_router(state);

    match (cli.certfile, cli.keyfile) {
        (Some(certfile), Some(keyfile)) => {
            let tls = RustlsConfig::from_pem_file(&certfile, &keyfile)
                .await
                .with_context(|| {
                    format!(
                        "loading TLS material from {} and {}",
                        certfile.display(),
                        keyfile.display()
                    )
                })?;
            tracing::info!(addr = %cli.addr, "https listener started");
            axum_server::bind_rustls(cli.addr, tls)
                .serve(app.into_make_service())
                .await?;
        }
        _ => {
            tracing::info!(addr = %cli.addr, "http listener started");
            let listener = tokio::net::TcpListener::bind(cli.addr)
                .await
                .with_context(|| format!("binding {}", cli.addr))?;
            axum::serve(listener, app).await?;
        }
    }
    Ok(())
}

fn install_rustls_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}
