use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use linkstash::{MessagePayload, Pipeline, PipelineConfig};

extern crate pretty_env_logger;
#[macro_use]
extern crate log;

#[derive(Debug, Parser)]
#[command(
    name = "linkstash",
    version,
    about = "Resolve social media links in a message into fetchable media",
    long_about = None
)]
struct Args {
    /// Directory for pre-downloaded media. Overrides LINKSTASH_CACHE_DIR.
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Route non-mandatory media through the cache as well.
    #[arg(long)]
    pre_download: bool,

    /// Upstream proxy (http, https or socks5).
    #[arg(long, value_name = "URL")]
    proxy: Option<String>,

    /// JSON file holding a shared card payload.
    #[arg(long, value_name = "FILE")]
    card: Option<PathBuf>,

    /// Include pipeline counters in the output.
    #[arg(long)]
    stats: bool,

    /// Message text.
    #[arg(required = true)]
    text: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    let _ = pretty_env_logger::try_init_timed();

    let args = Args::parse();

    let mut config = PipelineConfig::from_env().context("Failed to read configuration")?;
    if let Some(dir) = args.cache_dir {
        config.cache_directory = Some(dir);
    }
    if args.pre_download {
        config.pre_download_enabled = true;
    }
    if let Some(proxy) = args.proxy {
        config.proxy = Some(proxy);
    }

    let mut message = MessagePayload::text(args.text.join(" "));
    if let Some(path) = &args.card {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read card {}", path.display()))?;
        let card = serde_json::from_str(&raw).with_context(|| format!("Invalid card json in {}", path.display()))?;
        message = message.with_card(card);
    }

    info!("Initializing pipeline...");
    let pipeline = Pipeline::new(config).await.context("Failed to build pipeline")?;

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            canceller.cancel();
        }
    });

    let reply = pipeline.handle(&message, &token).await;
    if reply.is_none() {
        info!("Nothing to reply");
    }

    let output = if args.stats {
        json!({"reply": reply, "stats": pipeline.stats()})
    } else {
        json!({"reply": reply})
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
