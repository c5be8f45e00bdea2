// src/main.rs
use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use market_relay::{
    config::load_config,
    exchange::{BinanceClient, ExchangeClient},
    utils::setup_logging,
    AppContext,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "market-relay", version, about = "Crypto market data tools over Redis pub/sub")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve market data tool calls from the request channel
    Worker,
    /// Publish one tool call and print its result
    Call {
        /// Tool name, e.g. get_ticker
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
        /// Seconds to wait for a response (defaults to REQUEST_TIMEOUT_SECS)
        #[arg(long)]
        timeout: Option<f64>,
    },
}

fn exchange_client(ctx: &AppContext) -> Result<Arc<dyn ExchangeClient>> {
    let settings = &ctx.config().exchange;
    match settings.name.as_str() {
        "binance" => Ok(Arc::new(BinanceClient::new(&settings.base_url)?)),
        other => bail!("Unsupported exchange: {}", other),
    }
}

async fn run_worker(ctx: AppContext) -> Result<()> {
    let exchange = exchange_client(&ctx)?;
    let worker = ctx.market_worker(exchange).await;

    tokio::select! {
        result = worker.start_worker() => {
            result.context("worker loop stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Worker stopped");
        }
    }
    Ok(())
}

async fn run_call(ctx: AppContext, tool: &str, args: &str, timeout: Option<f64>) -> Result<()> {
    let arguments: Map<String, Value> = match serde_json::from_str::<Value>(args)
        .with_context(|| format!("--args is not valid JSON: {}", args))?
    {
        Value::Object(map) => map,
        other => return Err(anyhow!("--args must be a JSON object, got {}", other)),
    };
    let timeout = match timeout {
        Some(secs) if secs.is_finite() && secs > 0.0 => Duration::from_secs_f64(secs),
        Some(secs) => bail!("--timeout must be positive, got {}", secs),
        None => ctx.config().pubsub.request_timeout(),
    };

    let broker = ctx.broker();
    let outcome = broker.publish_request(tool, arguments, timeout).await;
    broker.shutdown().await;

    let result = outcome.with_context(|| format!("tool call {} failed", tool))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    setup_logging(&level).context("Failed to initialize logging")?;

    let cli = Cli::parse();
    let config = load_config()?;
    let ctx = AppContext::connect(config).await?;

    let outcome = match cli.command {
        Command::Worker => run_worker(ctx).await,
        Command::Call { tool, args, timeout } => run_call(ctx, &tool, &args, timeout).await,
    };
    if let Err(e) = &outcome {
        error!("{:#}", e);
    }
    outcome
}
