use anyhow::Context;
use clap::Parser;
use rs_leech::download::{Config, Downloader};
use rs_leech::torrent::TorrentMeta;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rslc", about = "A leeching BitTorrent client")]
struct Cli {
    #[clap(short, long, help = "path to the .torrent file")]
    file: PathBuf,

    #[clap(short, long, default_value = "6881", help = "listen port advertised to trackers")]
    port: u16,

    #[clap(short, long, default_value = ".", help = "directory where the downloaded file is placed")]
    out: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Cli::parse();

    let meta = TorrentMeta::from_file(&args.file)
        .with_context(|| format!("failed to load {}", args.file.display()))?;
    info!(
        name = %meta.file_name,
        bytes = meta.total_length,
        pieces = meta.num_pieces(),
        piece_length = meta.piece_length,
        trackers = meta.announce_list.len(),
        "loaded metainfo"
    );

    let config = Config {
        output_dir: args.out,
        port: args.port,
        ..Config::default()
    };
    Downloader::new(Arc::new(meta), config).await?.run().await
}
