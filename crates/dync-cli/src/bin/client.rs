//! `dync-client`: uploads one local file to a running `dync-server`,
//! resuming automatically across transient disconnects.

use std::fs::File;
use std::path::PathBuf;

use clap::Parser;
use console::style;
use dync_cli::progress::{format_bytes, TransferProgress};
use dync_core::ClientSession;
use serde_json::Value;

/// Upload a file to a dync server.
#[derive(Parser)]
#[command(name = "dync-client", author, version, about)]
struct Cli {
    /// File to upload.
    file: PathBuf,

    /// Server address, e.g. `127.0.0.1:8889`.
    #[arg(short, long)]
    address: String,

    /// Bearer token presented during the connection handshake.
    #[arg(short, long)]
    token: String,

    /// Remote name to give the uploaded file. Defaults to the local file
    /// name.
    #[arg(short, long)]
    name: Option<String>,

    /// Routing metadata as a JSON object, e.g. `{"passthrough":"lab_a"}`.
    #[arg(short, long, default_value = "{}")]
    meta: String,

    /// Suppress the progress bar.
    #[arg(long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .init();

    let cli = Cli::parse();

    let addr = cli
        .address
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid address {}: {e}", cli.address))?;
    let meta: Value = serde_json::from_str(&cli.meta)
        .map_err(|e| anyhow::anyhow!("--meta is not valid JSON: {e}"))?;
    let name = cli
        .name
        .or_else(|| cli.file.file_name().and_then(|n| n.to_str()).map(String::from))
        .ok_or_else(|| anyhow::anyhow!("could not derive a remote file name from {:?}", cli.file))?;

    let file_size = std::fs::metadata(&cli.file)?.len();
    let source = File::open(&cli.file)?;

    let mut session = ClientSession::connect(addr, &cli.token, name.clone(), meta, source).await?;

    let progress = (!cli.quiet).then(|| TransferProgress::new(file_size, &name));
    if let Some(progress) = progress.clone() {
        let sent = std::sync::Arc::new(std::sync::Mutex::new(0u64));
        session.set_progress(move |n| {
            let mut sent = sent.lock().unwrap();
            *sent += n;
            progress.update(*sent);
        });
    }

    let result = tokio::select! {
        result = session.run() => result,
        _ = tokio::signal::ctrl_c() => {
            let _ = session.abort().await;
            eprintln!("upload of {} aborted by interrupt", cli.file.display());
            std::process::exit(130);
        }
    };

    match result {
        Ok(upload_id) => {
            if let Some(progress) = progress {
                progress.finish_with_message(format!("uploaded as {upload_id}"));
            }
            println!(
                "{} {} ({}) as {upload_id}",
                style("uploaded").green().bold(),
                cli.file.display(),
                format_bytes(file_size)
            );
            Ok(())
        }
        Err(e) => {
            if let Some(progress) = progress {
                progress.abandon();
            }
            eprintln!("{} {e}", style("dync-client: upload failed:").red().bold());
            std::process::exit(1);
        }
    }
}
