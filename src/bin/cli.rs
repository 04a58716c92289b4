//! CLI for cluster operations
//!
//! A mechanical redirect client: on a 307 NotLeader answer it retries at
//! the owner_hint carried in the response body.

use clap::{Parser, Subcommand};
use scarab::common::encode_counter_id;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "scarab")]
#[command(about = "scarab coordination service CLI")]
#[command(version)]
struct Cli {
    /// Coordinator URL
    #[arg(long, default_value = "http://localhost:7000")]
    coordinator: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate identifiers
    Id {
        /// How many identifiers to generate
        #[arg(long, default_value = "1")]
        count: usize,
    },

    /// Increment a named counter
    Incr {
        /// Counter id
        counter: String,

        /// Increment amount
        #[arg(long, default_value = "1")]
        delta: u64,
    },

    /// Read a counter
    Get {
        /// Counter id
        counter: String,
    },

    /// Allocate the next leadership epoch for a partition
    Epoch {
        /// Partition id
        partition: String,
    },

    /// Show node status
    Status,
}

/// Redirect-following request loop. NotLeader answers carry the owner in
/// the JSON body; retry there, bounded.
async fn call(
    client: &reqwest::Client,
    method: reqwest::Method,
    mut url: String,
    body: Option<Value>,
) -> anyhow::Result<Value> {
    for _ in 0..5 {
        let mut request = client.request(method.clone(), &url);
        if let Some(body) = &body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        let answer: Value = response.json().await.unwrap_or(Value::Null);

        if status == reqwest::StatusCode::TEMPORARY_REDIRECT {
            let hint = answer
                .get("owner_hint")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if hint.starts_with("http") {
                let path = url.splitn(4, '/').nth(3).map(str::to_string);
                url = format!("{}/{}", hint.trim_end_matches('/'), path.unwrap_or_default());
                continue;
            }
            anyhow::bail!("not leader and no usable owner hint: {}", answer);
        }

        if !status.is_success() {
            anyhow::bail!("request failed ({}): {}", status, answer);
        }
        return Ok(answer);
    }
    anyhow::bail!("too many redirects")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;
    let base = cli.coordinator.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Id { count } => {
            for _ in 0..count {
                let body = call(
                    &client,
                    reqwest::Method::POST,
                    format!("{}/v1/id", base),
                    None,
                )
                .await?;
                println!(
                    "{}  (ts={} node={} seq={})",
                    body["id"], body["timestamp_ms"], body["node_id"], body["sequence"]
                );
            }
        }

        Commands::Incr { counter, delta } => {
            let url = format!(
                "{}/v1/counters/{}/increment",
                base,
                encode_counter_id(&counter)
            );
            let body = call(
                &client,
                reqwest::Method::POST,
                url,
                Some(serde_json::json!({ "delta": delta })),
            )
            .await?;
            println!("{} = {} (term {})", counter, body["value"], body["term"]);
        }

        Commands::Get { counter } => {
            let url = format!("{}/v1/counters/{}", base, encode_counter_id(&counter));
            let body = call(&client, reqwest::Method::GET, url, None).await?;
            println!(
                "{} = {} (term {}, owner node {})",
                counter, body["value"], body["term"], body["owning_node"]
            );
        }

        Commands::Epoch { partition } => {
            let url = format!("{}/v1/epochs/{}", base, partition);
            let body = call(&client, reqwest::Method::POST, url, None).await?;
            println!(
                "{} epoch = {} (term {})",
                partition, body["epoch"], body["term"]
            );
        }

        Commands::Status => {
            let body = call(
                &client,
                reqwest::Method::GET,
                format!("{}/v1/status", base),
                None,
            )
            .await?;
            println!("Node {} ({})", body["node_id"], body["role"]);
            println!("  Consensus term: {}", body["term"]);
            if let Some(hint) = body["leader_hint"].as_str() {
                println!("  Leader: {}", hint);
            }
            if let Some(owned) = body["owned_counters"].as_array() {
                println!("  Owned counters: {}", owned.len());
                for c in owned {
                    println!("    {} (term {})", c["counter_id"], c["term"]);
                }
            }
            if let Some(peers) = body["peers"].as_array() {
                for p in peers {
                    println!("  Peer {}: {}", p["node_id"], p["state"]);
                }
            }
        }
    }

    Ok(())
}
