//! Runs a minimal app against a real dock pipe: binds `echo`, declares a
//! `ping` event, and serves until the dock asks it to exit.
//!
//! Usage:
//! - `cargo run -p dock_rpc --example echo_app -- <dock_pipe_name>`

use std::error::Error;

use dock_rpc::DockApp;
use serde_json::Value;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let dock_pipe_name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| dock_rpc::DEFAULT_DOCK_PIPE_NAME.to_string());

    let mut app = DockApp::builder(
        "echo-app",
        "Echo App",
        "echoes its single argument back",
        "icon.png",
        "dock_rpc_echo_app_pipe",
    )
    .dock_pipe_name(&dock_pipe_name)
    .build();

    app.bind("echo", |value: Value| async move { Ok::<Value, String>(value) });
    app.declare_event("ping");

    tracing::info!(dock_pipe_name, "starting echo app");
    app.run().await?;
    Ok(())
}
