mod output;
mod telemetry;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use hopline_chain::server::run_chain_servers;
use hopline_core::chain::{ChainRequest, ChainResponse, TraceRecord};
use hopline_core::config::Config;

use crate::output::{print_send_human, print_trace_human};
use crate::telemetry::{init_cli_tracing, init_run_tracing};

#[derive(Parser, Debug)]
#[command(name = "hopline")]
#[command(about = "Multi-hop request tracing demo chain")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    addr: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Run every service in the configured chain")]
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    #[command(about = "Send a request into the entry service")]
    Send {
        #[arg(long, default_value_t = 1001)]
        user_id: i64,
        #[arg(long, default_value = "checkout")]
        action: String,
    },
    #[command(about = "Show the persisted records of one trace")]
    Trace { trace_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, db_path } => run_chain(config, db_path).await,
        Commands::Send { user_id, action } => {
            init_cli_tracing();
            send_request(cli.addr, user_id, action, cli.json).await
        }
        Commands::Trace { trace_id } => {
            init_cli_tracing();
            show_trace(cli.addr, trace_id, cli.json).await
        }
    }
}

async fn run_chain(config: Option<PathBuf>, db_path: Option<PathBuf>) -> anyhow::Result<()> {
    let mut cfg = match config {
        Some(path) => Config::load_from(&path).context("load config file")?,
        None => Config::load().context("load config")?,
    };
    if let Some(v) = db_path {
        cfg.db_path = v;
    }

    init_run_tracing();

    let store = hopline_store::Store::open(&cfg.db_path)?;

    eprintln!("hopline run");
    eprintln!("  db: {}", cfg.db_path.display());
    for svc in &cfg.services {
        eprintln!("  {}: http://{}", svc.name, svc.listen_addr);
    }
    eprintln!("  tip: `hopline send` in another shell, then `hopline trace <trace_id>`");

    let chain_task = tokio::spawn(run_chain_servers(cfg, store));

    tokio::select! {
        res = chain_task => {
            res??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
        }
    }
    Ok(())
}

async fn send_request(
    addr: Option<String>,
    user_id: i64,
    action: String,
    json: bool,
) -> anyhow::Result<()> {
    let addr = addr.unwrap_or_else(default_entry_addr);
    let request = ChainRequest {
        user_id: Some(user_id),
        action: Some(action),
        ..ChainRequest::default()
    };

    let response = reqwest::Client::new()
        .post(endpoint(&addr, "/process"))
        .json(&request)
        .send()
        .await
        .with_context(|| format!("send request to {addr}"))?;
    let http_status = response.status().as_u16();
    let body: ChainResponse = response.json().await.context("decode chain response")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        print_send_human(http_status, &body);
    }
    Ok(())
}

async fn show_trace(addr: Option<String>, trace_id: String, json: bool) -> anyhow::Result<()> {
    let addr = addr.unwrap_or_else(default_terminal_addr);
    let response = reqwest::Client::new()
        .get(endpoint(&addr, &format!("/traces/{trace_id}")))
        .send()
        .await
        .with_context(|| format!("query terminal service at {addr}"))?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        anyhow::bail!("no records for trace {trace_id}");
    }
    let listing: serde_json::Value = response.json().await.context("decode trace listing")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    let records: Vec<TraceRecord> =
        serde_json::from_value(listing["records"].clone()).context("decode trace records")?;
    print_trace_human(&trace_id, &records);
    Ok(())
}

fn default_entry_addr() -> String {
    let cfg = Config::load().unwrap_or_default();
    cfg.services
        .first()
        .map(|s| s.listen_addr.clone())
        .unwrap_or_else(|| "127.0.0.1:7301".to_string())
}

fn default_terminal_addr() -> String {
    let cfg = Config::load().unwrap_or_default();
    cfg.services
        .last()
        .map(|s| s.listen_addr.clone())
        .unwrap_or_else(|| "127.0.0.1:7303".to_string())
}

fn endpoint(addr: &str, path: &str) -> String {
    let base = if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", addr.trim_end_matches('/'))
    };
    format!("{base}{path}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_adds_scheme_only_when_missing() {
        assert_eq!(
            endpoint("127.0.0.1:7301", "/process"),
            "http://127.0.0.1:7301/process"
        );
        assert_eq!(
            endpoint("http://10.0.0.1:80/", "/traces"),
            "http://10.0.0.1:80/traces"
        );
        assert_eq!(
            endpoint("https://chain.example", "/health"),
            "https://chain.example/health"
        );
    }
}
