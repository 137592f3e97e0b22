//! Token Sink Demo
//!
//! Builds a client from the environment, reports where its token comes from
//! and optionally watches the sink for changes.
//!
//! # Usage
//!
//! ```bash
//! # Plaintext sink written by a local agent
//! export VAULT_TOKEN_FILE_SINK_PATH=/run/vault-agent/token
//! cargo run --example sink_demo
//!
//! # Ask the agent which sink to use (may start a key exchange)
//! export VAULT_AGENT_ADDR=http://127.0.0.1:8100
//! RUST_LOG=debug cargo run --example sink_demo -- --watch 5
//!
//! # Also call the health endpoint
//! cargo run --example sink_demo -- --health
//! ```

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::info;
use reqwest::Method;

use vaultwire_client::{Client, Config, TokenSource};

#[derive(Parser, Debug)]
#[command(author, version, about = "Token Sink Demo")]
struct Args {
    /// Re-read the sink this many times, one second apart
    #[arg(long, default_value_t = 0)]
    watch: u32,

    /// Call sys/health after resolving the token
    #[arg(long)]
    health: bool,
}

fn describe(source: TokenSource) -> &'static str {
    match source {
        TokenSource::Explicit => "explicit (VAULT_TOKEN or caller)",
        TokenSource::PlainSink => "plaintext token sink",
        TokenSource::EncryptedSink => "encrypted token sink",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    let config = Config::from_env()?;
    let client = Client::new(config).await?;

    println!("Token Sink Demo");
    println!("===============");
    println!("Address: {}", client.address());
    println!("Token source: {}", describe(client.token_source()));
    if let Some(path) = client.config().token_file_sink_path() {
        println!("Sink path: {}", path.display());
    }
    println!();

    if client.token_source() != TokenSource::Explicit {
        for round in 0..=args.watch {
            match client.sync_token_from_sink().await {
                Ok(true) => println!("[{round}] token updated"),
                Ok(false) => println!("[{round}] token unchanged"),
                Err(e) => println!("[{round}] sink not readable: {e}"),
            }
            if round < args.watch {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    println!("Token present: {}", client.token().is_some());

    if args.health {
        let request = client.new_request(Method::GET, "/v1/sys/health").await;
        match client.raw_request(request).await {
            Ok(response) => {
                info!("Health check returned {}", response.status());
                println!("Health: {} {}", response.status(), response.text());
            }
            Err(e) => println!("Health check failed: {e}"),
        }
    }

    client.stop_sink_polling();
    Ok(())
}
