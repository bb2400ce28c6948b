use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use pcm_recorder::storage::{hex_preview, preview};
use pcm_recorder::{record, Cli, Command, RecordArgs, RecorderConfig};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => RecorderConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => RecorderConfig::default(),
    };

    info!(
        "pcm-recorder {} (pcm-flow {})",
        env!("CARGO_PKG_VERSION"),
        pcm_flow::VERSION
    );

    match cli.command.unwrap_or(Command::Record(RecordArgs::default())) {
        Command::Record(args) => {
            config.apply(&args);
            let duration = Duration::from_secs(args.duration_secs());
            let summary = record(&config, duration, args.seed)
                .await
                .context("recording failed")?;

            info!(
                "recorded {} bytes to {}",
                summary.file_bytes,
                summary.path.display()
            );
            info!(
                "source: {} packets, {} dropped; flow: {} overflows, {} underflows, {} bytes lost at sink",
                summary.source.packets,
                summary.source.dropped_packets,
                summary.flow.overflows,
                summary.flow.underflows,
                summary.flow.lost_bytes
            );
        }
        Command::Preview(args) => {
            let path = args.path.unwrap_or(config.storage.path);
            let head = preview(&path, args.bytes)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            println!("{}", hex_preview(&head));
        }
    }

    Ok(())
}
