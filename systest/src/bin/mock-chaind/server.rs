//! `start`: block ticker plus the status RPC endpoint.
//!
//! Provides:
//! - `/status` - node info and `sync_info.latest_block_height`
//! - `/health` - empty result while the node runs

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Json, Router, extract::State, response::IntoResponse, routing::get};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::Args;
use serde_json::{Value, json};
use systest::genesis::GenesisDocument;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::home::{self, ChainState, NodeSettings};

#[derive(Args)]
pub struct StartArgs {
    /// RPC listen address
    #[arg(long = "rpc.laddr", default_value = "tcp://127.0.0.1:26657")]
    rpc_laddr: String,

    /// Stop producing blocks at this height (0 = never)
    #[arg(long, default_value_t = 0)]
    halt_height: u64,
}

/// Shared state for the RPC handlers and the block ticker.
struct NodeStatus {
    moniker: String,
    chain_id: String,
    height: AtomicU64,
    block_time: Mutex<DateTime<Utc>>,
}

impl NodeStatus {
    fn snapshot(&self) -> Value {
        let block_time = *self
            .block_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        json!({
            "node_info": {"network": self.chain_id, "moniker": self.moniker},
            "sync_info": {
                "latest_block_height": self.height.load(Ordering::SeqCst).to_string(),
                "latest_block_time": block_time.to_rfc3339_opts(SecondsFormat::Millis, true),
                "catching_up": false,
            },
        })
    }
}

fn create_router(status: Arc<NodeStatus>) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .with_state(status)
}

async fn status_handler(State(status): State<Arc<NodeStatus>>) -> impl IntoResponse {
    Json(json!({"jsonrpc": "2.0", "id": -1, "result": status.snapshot()}))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({"jsonrpc": "2.0", "id": -1, "result": {}}))
}

fn listen_addr(laddr: &str) -> &str {
    laddr.strip_prefix("tcp://").unwrap_or(laddr)
}

async fn produce_blocks(status: Arc<NodeStatus>, home: PathBuf, block_time: Duration, halt: u64) {
    let mut ticker = tokio::time::interval(block_time);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let height = status.height.load(Ordering::SeqCst) + 1;
        // Persist before publishing so a killed node never reports a height
        // it would not resume from.
        let state = ChainState { height };
        if let Err(e) = state.save(&home) {
            warn!("failed to persist height {height}: {e:#}");
        }
        *status
            .block_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Utc::now();
        status.height.store(height, Ordering::SeqCst);
        debug!(height, "committed block");
        if halt != 0 && height >= halt {
            info!(height, "halt height reached, no more blocks");
            return;
        }
    }
}

fn prepare_home(home: &Path) -> Result<(NodeSettings, ChainState)> {
    let settings = NodeSettings::load(home)?;
    // A malformed genesis is a startup failure.
    GenesisDocument::from_value(home::read_genesis(home)?)?;
    std::fs::create_dir_all(home::wasm_dir(home))?;
    std::fs::write(home::wasm_dir(home).join("modules.lock"), b"")?;
    Ok((settings, ChainState::load(home)?))
}

pub async fn run(home: PathBuf, args: StartArgs) -> Result<()> {
    let (settings, state) = prepare_home(&home)?;
    let block_time = settings.commit_timeout()?;

    let status = Arc::new(NodeStatus {
        moniker: settings.moniker.clone(),
        chain_id: settings.chain_id.clone(),
        height: AtomicU64::new(state.height),
        block_time: Mutex::new(Utc::now()),
    });

    let addr = listen_addr(&args.rpc_laddr);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding RPC listener on {addr}"))?;
    info!(
        moniker = %settings.moniker,
        height = state.height,
        block_time = %humantime::format_duration(block_time),
        "RPC listening on {addr}"
    );

    let producer = tokio::spawn(produce_blocks(
        Arc::clone(&status),
        home,
        block_time,
        args.halt_height,
    ));
    axum::serve(listener, create_router(status))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    producer.abort();
    info!("node stopped");
    Ok(())
}

/// `status --node <addr>`: the `result` object of the node's `/status`.
pub fn fetch_status(node: &str) -> Result<Value> {
    let url = format!("http://{}/status", listen_addr(node).trim_end_matches('/'));
    let agent: ureq::Agent = ureq::Agent::config_builder()
        .timeout_global(Some(Duration::from_secs(5)))
        .build()
        .into();
    let body = agent
        .get(&url)
        .call()
        .and_then(|mut response| response.body_mut().read_to_string())
        .with_context(|| format!("GET {url}"))?;
    let mut value: Value = serde_json::from_str(&body).with_context(|| format!("parsing {url}"))?;
    if let Some(result) = value.get_mut("result") {
        return Ok(result.take());
    }
    Ok(value)
}
