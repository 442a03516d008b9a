//! # Toolsmith
//!
//! Compose declarative primitive graphs into native executables, compiled
//! once and remembered.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   apps/toolsmith (THE BINARY)                │
//! │                                                              │
//! │  ┌─────────────┐   ┌──────────────┐   ┌──────────────────┐  │
//! │  │    CLI      │   │ Memory Server│   │   HTTP Mirror    │  │
//! │  │   (clap)    │   │    (axum)    │   │    (reqwest)     │  │
//! │  └──────┬──────┘   └──────┬───────┘   └────────┬─────────┘  │
//! │         │                 │                    │            │
//! │         └─────────────────┼────────────────────┘            │
//! │                           ▼                                 │
//! │                  ┌─────────────────┐                        │
//! │                  │ toolsmith-core  │                        │
//! │                  │   (THE LOGIC)   │                        │
//! │                  └─────────────────┘                        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! toolsmith compose sum.json --goal "add two numbers" --tags math
//! toolsmith --machine memory search add
//! toolsmith serve --host 0.0.0.0 --port 7878
//! ```

use clap::Parser;
use toolsmith::cli;
use toolsmith_core::ErrorResponse;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();
    init_tracing(cli.verbose);

    let machine = cli.machine;
    if let Err(e) = cli::execute(cli).await {
        if machine {
            let response = ErrorResponse::from(&e);
            println!(
                "{}",
                serde_json::to_string_pretty(&response).unwrap_or_default()
            );
        } else {
            tracing::debug!(kind = %e.kind(), "command failed");
            eprintln!("error: {e}");
            eprintln!("hint: {}", e.hint());
        }
        std::process::exit(1);
    }
}

/// Logs go to stderr so stdout stays clean for machine output.
/// `TOOLSMITH_LOG_FORMAT=json` enables machine-parseable logs.
fn init_tracing(verbose: bool) {
    let log_format = std::env::var("TOOLSMITH_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let default_filter = if verbose {
        "toolsmith=debug,tower_http=debug"
    } else {
        "toolsmith=info,tower_http=info"
    };
    let filter = EnvFilter::try_from_env("TOOLSMITH_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| default_filter.into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
