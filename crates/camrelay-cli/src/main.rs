//! Command-line interface for the camera event relay.

use std::path::PathBuf;

use anyhow::{Context, Result};
use camrelay_core::BridgeConfig;
use clap::{Parser, Subcommand};
use serde_json::json;

/// Env var that switches log output to JSON.
const LOG_JSON_ENV: &str = "CAMRELAY_LOG_JSON";

/// Camera event relay - forward doorbell recordings to a webhook.
#[derive(Parser, Debug)]
#[command(name = "camrelay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay. Settings come from the environment; flags override.
    Run {
        /// Device-control service URL.
        #[arg(long)]
        ws_url: Option<String>,
        /// Port of the captcha HTTP surface.
        #[arg(long)]
        captcha_port: Option<u16>,
        /// Where recordings are staged.
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Submit a captcha solution to a running relay.
    Solve {
        /// The captcha code.
        code: String,
        /// Base URL of the relay's captcha surface.
        #[arg(long, default_value = "http://localhost:8080")]
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Run {
            ws_url,
            captcha_port,
            output_dir,
        } => {
            let mut config = BridgeConfig::from_env().context("Invalid configuration")?;
            if let Some(url) = ws_url {
                config.ws_url = url;
            }
            if let Some(port) = captcha_port {
                config.captcha_port = port;
            }
            if let Some(dir) = output_dir {
                config.output_dir = dir;
            }
            run(config).await
        }
        Command::Solve { code, url } => solve(&code, &url).await,
    }
}

fn init_logging(verbose: bool) {
    let json_logging = std::env::var(LOG_JSON_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "camrelay_core={level},camrelay_bridge={level},camrelay={level},warn",
            level = default_level
        ))
    });

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .init();
    }
}

async fn run(config: BridgeConfig) -> Result<()> {
    tracing::info!("camrelay starting");

    tokio::select! {
        result = camrelay_bridge::run_bridge(config) => {
            result.context("Relay stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }
    Ok(())
}

async fn solve(code: &str, base_url: &str) -> Result<()> {
    let url = format!("{}/captcha", base_url.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .post(&url)
        .json(&json!({ "captcha": code }))
        .send()
        .await
        .with_context(|| format!("Could not reach {}", url))?;

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        anyhow::bail!("Captcha rejected ({}): {}", status, body);
    }

    println!("{}", body);
    Ok(())
}
