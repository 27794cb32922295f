use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "rpc-cli")]
#[command(about = "Management CLI for the resilient-rpc admin API", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://127.0.0.1:8081")]
    url: String,

    #[arg(short, long, env = "RPC_ADMIN_KEY")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version and overall status
    Status,
    /// Exit non-zero when the client is unhealthy
    Health,
    /// Dump cache, batch, admission and dispatch statistics
    Stats,
    /// List endpoint circuit, rate and latency state
    Endpoints,
}

impl Commands {
    fn path(&self) -> &'static str {
        match self {
            Commands::Status => "/admin/status",
            Commands::Health => "/admin/health",
            Commands::Stats => "/admin/stats",
            Commands::Endpoints => "/admin/endpoints",
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    let res = client
        .get(format!("{}{}", cli.url.trim_end_matches('/'), cli.command.path()))
        .headers(headers)
        .send()
        .await?;

    let healthy = print_response(res).await?;
    if matches!(cli.command, Commands::Health) && !healthy {
        std::process::exit(1);
    }
    Ok(())
}

/// Print the body; returns whether the status was a success.
async fn print_response(res: reqwest::Response) -> Result<bool, Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() && status != reqwest::StatusCode::SERVICE_UNAVAILABLE {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(false);
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(status.is_success())
}
