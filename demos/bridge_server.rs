//! Minimal bridge server with an echo handler.
//!
//! Demonstrates:
//! - Loading configuration from JSON or building it in code
//! - Answering requests from a spawned task with progress updates
//! - Watching lifecycle events
//!
//! Usage:
//!   cargo run --example bridge_server
//!   cargo run --example bridge_server -- --debug
//!   cargo run --example bridge_server -- --config bridge.json

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use automation_bridge::{BridgeConfig, BridgeEvent, ConnectionManager, Result};
use serde_json::json;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Default)]
struct Args {
    debug: bool,
    config: Option<String>,
}

impl Args {
    fn parse() -> Self {
        let mut args = Self::default();
        let mut iter = std::env::args().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--debug" => args.debug = true,
                "--config" => args.config = iter.next(),
                _ => {}
            }
        }
        args
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    if let Err(e) = run(args).await {
        eprintln!("\n[ERROR] {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => BridgeConfig::from_json_file(path)?,
        None => BridgeConfig::new()
            .with_capability_token("demo-token", true)
            .with_heartbeat_timeout(Duration::from_secs(30)),
    };

    let mut manager = ConnectionManager::builder()
        .config(config)
        .on_request(|request, handle| {
            tokio::spawn(async move {
                handle
                    .send_progress_update(&request.request_id, Some(50.0), None, true)
                    .await;
                let result = json!({ "action": request.action, "echo": request.payload });
                handle
                    .send_automation_response(&request.request_id, Some("echoed".into()), Some(result))
                    .await;
            });
        })
        .build()?;

    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                BridgeEvent::Connected { connection_id, peer_addr, .. } => {
                    println!("[+] {connection_id} from {peer_addr:?}");
                }
                BridgeEvent::Closed { connection_id, code, reason } => {
                    println!("[-] {connection_id} closed {code} {reason}");
                }
                other => println!("[*] {other:?}"),
            }
        }
    });

    manager.start().await?;
    println!("Listening on ports {:?}", manager.listener_ports());
    println!("Press Ctrl+C to exit...");

    manager
        .run(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
}

// ============================================================================
// Functions
// ============================================================================

fn init_logging(debug: bool) {
    let filter = if debug {
        "automation_bridge=debug"
    } else {
        "automation_bridge=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}
