//! Run the HTTP surface from environment configuration.
//!
//! ```bash
//! DEFAULT_LLM_PROVIDER=mock RUST_LOG=info \
//!     cargo run --example serve --features http-server
//! ```

use std::sync::Arc;

use docullm::config::CoreConfig;
use docullm::server::{serve, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = CoreConfig::from_env();
    let orchestrator = Arc::new(config.build_orchestrator()?);
    let state = Arc::new(AppState {
        orchestrator,
        bearer_token: std::env::var("LLM_BEARER_TOKEN").ok(),
    });

    let addr = std::env::var("LLM_LISTEN_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()?;
    serve(addr, state).await?;
    Ok(())
}
