//! Standalone provider serving `echo` and `sleep` operations, for smoke tests
//! and load runs against the wire transport.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tramline_core::{OperationMeta, OperationRef};
use tramline_runtime::service::{arg, fn_producer};
use tramline_runtime::{init_tracing, Engine, EngineConfig, LogFormat, ServerConfig, WireServer};

/// Serves a demo `Echo` schema over the tramline transport.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Microservice name the operations are registered under
    #[arg(long, env = "TRAMLINE_MICROSERVICE", default_value = "echo")]
    microservice: String,

    #[arg(long, env = "TRAMLINE_HOST", default_value = "127.0.0.1")]
    host: String,

    /// 0 picks a free port
    #[arg(long, env = "TRAMLINE_PORT", default_value_t = 7070)]
    port: u16,

    /// Prometheus scrape endpoint; disabled when absent
    #[arg(long, env = "TRAMLINE_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Refuse the map codec even if clients ask for it
    #[arg(long)]
    compact_only: bool,

    /// Emit JSON log lines
    #[arg(long, env = "TRAMLINE_LOG_JSON")]
    json: bool,

    /// Per-operation budget in milliseconds; 0 disables it
    #[arg(long, default_value_t = 0)]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(if args.json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    })?;

    if let Some(addr) = args.metrics_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!(%addr, "prometheus exporter listening");
    }

    let engine = Engine::builder(EngineConfig {
        microservice: args.microservice.clone(),
        ..EngineConfig::default()
    })
    .build();

    let timeout_nanos = i64::try_from(Duration::from_millis(args.timeout_ms).as_nanos())?;
    let op = |name: &str| {
        OperationMeta::new(OperationRef::new(&args.microservice, "Echo", name))
            .with_timeout_nanos(timeout_nanos)
    };
    engine.register(
        op("echo").with_params(["value"]),
        fn_producer(|args| async move { Ok(args.into_iter().next()) }),
    )?;
    engine.register(
        op("sleep").with_params(["millis"]),
        fn_producer(|args| async move {
            let millis: u64 = arg(&args, 0)?;
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(Some(rmpv::Value::from(millis)))
        }),
    )?;

    let mut server = WireServer::new(
        ServerConfig {
            host: args.host,
            port: args.port,
            allow_map_codec: !args.compact_only,
            ..ServerConfig::default()
        },
        engine,
    );
    let port = server.start().await?;
    info!(port, "echo provider ready");

    server
        .serve(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
}
