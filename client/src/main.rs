use clap::Parser;
use client::network::Client;
use log::info;
use shared::{FileCategory, FileSelector};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Name announced to the server
    #[arg(short, long, default_value = "downloader")]
    name: String,

    /// File category to request: submarine, mod or save
    #[arg(short, long, default_value = "submarine")]
    category: String,

    /// Name of the file to request (without extension); not used for saves
    #[arg(short, long)]
    file: Option<String>,

    /// Content hash the file was advertised under; not used for saves
    #[arg(long)]
    hash: Option<String>,

    /// Directory downloads are written to
    #[arg(short, long, default_value = "downloads")]
    download_dir: PathBuf,

    /// Seconds to wait before giving up on the download
    #[arg(long, default_value = "120")]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let category = match args.category.as_str() {
        "submarine" => FileCategory::Submarine,
        "mod" => FileCategory::Mod,
        "save" => FileCategory::CampaignSave,
        other => return Err(format!("unknown category '{}'", other).into()),
    };

    let selector = if category.is_singleton() {
        FileSelector::Current
    } else {
        let name = args
            .file
            .clone()
            .ok_or("--file is required for submarine and mod requests")?;
        let hash = args
            .hash
            .clone()
            .ok_or("--hash is required for submarine and mod requests")?;
        FileSelector::Named { name, hash }
    };

    let mut client = Client::new(&args.server, args.download_dir.clone()).await?;
    client.connect(&args.name).await?;
    client.request_file(category, selector).await?;

    let completed = client
        .download(category, Duration::from_secs(args.timeout_secs))
        .await?;
    info!("saved to {}", completed.path.display());
    println!("{}", completed.path.display());

    client.disconnect().await?;
    Ok(())
}
