use clap::Parser;
use log::info;
use server::catalog::FileCatalog;
use server::file_sender::FileSenderConfig;
use server::network::Server;
use shared::FileCategory;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Tick rate (updates per second)
    #[arg(short, long, default_value = "30")]
    tick_rate: u32,

    /// Maximum number of connected peers
    #[arg(long, default_value = "16")]
    max_peers: usize,

    /// Directory containing submarine files to offer
    #[arg(long)]
    submarine_dir: Option<PathBuf>,

    /// Directory containing mod archives to offer
    #[arg(long)]
    mod_dir: Option<PathBuf>,

    /// Current campaign save, pushed to peers when they connect
    #[arg(long)]
    campaign_save: Option<PathBuf>,

    /// Seconds before a stalled transfer is canceled
    #[arg(long, default_value = "120")]
    max_transfer_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mut catalog = FileCatalog::new();
    if let Some(dir) = &args.submarine_dir {
        catalog.scan_directory(FileCategory::Submarine, dir)?;
    }
    if let Some(dir) = &args.mod_dir {
        catalog.scan_directory(FileCategory::Mod, dir)?;
    }
    catalog.set_campaign_save(args.campaign_save.clone());

    let address = format!("{}:{}", args.host, args.port);
    let tick_duration = Duration::from_secs_f64(1.0 / args.tick_rate as f64);

    info!("Starting file distribution server on {}", address);

    let mut server = Server::new(
        &address,
        tick_duration,
        args.max_peers,
        catalog,
        FileSenderConfig::default(),
        Duration::from_secs(args.max_transfer_secs),
    )
    .await?;

    server.run().await
}
