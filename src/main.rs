//! Gatehouse gateway binary.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ───────────────▶ http::server (request ID, trace span, body limit)
//!                          │
//!                          ▼
//!                      proxy::RouteAuthority ── robots.txt / dashboard / forward-auth
//!                          │ host lookup
//!                          ▼
//!                      RoutePipeline
//!                        timeout → cors bypass → retrieve session → strip cookies
//!                        → authenticate → authorize (external) → sign assertion
//!                        → set headers → forward ─────────────────────────────▶ Upstream
//!
//!     config file ── watcher ── mpsc ──▶ RouteAuthority::update (atomic swap)
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use gatehouse::config::load_config;
use gatehouse::lifecycle::startup;

#[derive(Parser, Debug)]
#[command(name = "gatehouse", version, about = "Identity-aware reverse-proxy gateway")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "gatehouse.toml")]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    if cli.validate {
        return match load_config(&cli.config) {
            Ok(config) => {
                println!(
                    "{}: ok ({} policies)",
                    cli.config.display(),
                    config.policies.len()
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}: {}", cli.config.display(), e);
                ExitCode::FAILURE
            }
        };
    }

    match startup::run(&cli.config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "gatehouse failed");
            eprintln!("gatehouse: {}", e);
            ExitCode::FAILURE
        }
    }
}
