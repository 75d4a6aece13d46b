//! HTTP evaluation service.
//!
//! Loads a dataset once and evaluates model patches for its instances on
//! request, sharing one image orchestrator and one concurrency gate across
//! all requests.

mod routes;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use harness::image::ImageOrchestrator;
use harness::io::config::load_config;
use harness::io::dataset::load_records;
use harness::io::log_sink::LogPaths;
use harness::io::registry::Registry;
use harness::io::repo::GitSourceProvider;
use harness::io::runtime::DockerRuntime;
use harness::scheduler::Engine;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "harness-server")]
#[command(about = "HTTP service evaluating model patches against a dataset")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3002")]
    port: u16,

    /// Dataset file (`.json` or `.jsonl`)
    #[arg(long)]
    dataset: PathBuf,

    /// Harness configuration file
    #[arg(long, default_value = "harness.toml")]
    config: PathBuf,

    /// Instances evaluated concurrently across all requests
    #[arg(long, default_value_t = 4)]
    max_workers: usize,

    /// Instance timeout in seconds; the config value when omitted
    #[arg(long)]
    timeout: Option<u64>,

    /// Root of build logs and per-request logs
    #[arg(long, default_value = "logs/server")]
    log_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    harness::logging::init("harness=info,harness_server=info");

    let args = Args::parse();
    let cfg = load_config(&args.config)?;
    let records = load_records(&args.dataset)?;
    info!(dataset = %args.dataset.display(), records = records.len(), "loaded dataset");

    let runtime = Arc::new(DockerRuntime::connect(&cfg.docker)?);
    let sources = Arc::new(GitSourceProvider::new(cfg.git.clone()));
    let mut images = ImageOrchestrator::new(
        runtime,
        sources,
        cfg.build.clone(),
        LogPaths::new(&args.log_dir),
    );
    if cfg.registry.enabled() {
        images = images.with_registry(Registry::new(cfg.registry.clone()));
    }
    let engine = Engine::new(Arc::new(images), cfg.run.clone());

    let timeout = args
        .timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| cfg.run.timeout());
    let state = AppState::new(
        engine,
        records,
        args.max_workers,
        timeout,
        args.log_dir.join("requests"),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::router().layer(cors).with_state(state);

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port)
        .parse()
        .context("parse bind address")?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
