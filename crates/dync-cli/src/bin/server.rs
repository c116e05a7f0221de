//! `dync-server`: binds the upload coordinator to a TCP endpoint and serves
//! uploads until interrupted or the transport shuts down.
//!
//! Exit codes: `0` clean shutdown, `1` config load failure, `2` bad
//! invocation (handled by `clap` itself).

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dync_cli::config::ServerConfig;
use dync_core::{FlowConfig, Server};
use dync_storage::Storage;
use dync_transport::{Authenticator, CertificateDirectory, Router};
use tokio::sync::mpsc;

/// The dync upload coordinator server.
#[derive(Parser)]
#[command(name = "dync-server", author, version, about)]
struct Cli {
    /// Path to the server's YAML configuration file.
    #[arg(short, long)]
    config: PathBuf,
}

fn load_config(path: &std::path::Path) -> ServerConfig {
    match ServerConfig::load(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("dync-server: {e}");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = load_config(&cli.config);

    tracing_subscriber::fmt()
        .with_env_filter(config.logging.level.clone())
        .init();

    let bind_addr = match config.bind_addr() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("dync-server: {e}");
            std::process::exit(1);
        }
    };
    let dropbox_config = match config.dropbox_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("dync-server: {e}");
            std::process::exit(1);
        }
    };

    if let Some(umask) = config.options.umask {
        // SAFETY: umask() only mutates this process's file-mode creation
        // mask and cannot race other threads in a way that is memory-unsafe.
        unsafe {
            libc::umask(umask as libc::mode_t);
        }
    }
    if let Some(pidfile) = &config.options.pidfile {
        if let Err(e) = std::fs::write(pidfile, format!("{}\n", std::process::id())) {
            tracing::warn!(path = %pidfile.display(), error = %e, "failed writing pidfile");
        }
    }

    if let Err(e) = std::fs::create_dir_all(&config.tmp_dir) {
        eprintln!(
            "dync-server: failed to create tmp_dir {}: {e}",
            config.tmp_dir.display()
        );
        std::process::exit(1);
    }

    let certs = match &config.options.certs_dir {
        Some(dir) => match CertificateDirectory::load(dir) {
            Ok(certs) => certs,
            Err(e) => {
                eprintln!("dync-server: failed to load certificates: {e}");
                std::process::exit(1);
            }
        },
        None => {
            tracing::warn!("no options.certs_dir configured; no peer will be able to authenticate");
            CertificateDirectory::empty()
        }
    };
    let auth = Arc::new(Authenticator::spawn(certs));

    let storage = Storage::new(config.tmp_dir.clone(), dropbox_config);
    let router = Router::new();
    let (tx, rx) = mpsc::channel(1024);

    let accept_router = router.clone();
    let accept_task = tokio::spawn(async move {
        if let Err(e) = accept_router.serve(bind_addr, tx, auth).await {
            tracing::error!(error = %e, "router accept loop failed");
        }
    });

    tracing::info!(%bind_addr, "dync-server listening");
    let mut server = Server::new(router, storage, FlowConfig::default(), rx);

    tokio::select! {
        () = server.serve() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received interrupt, shutting down");
            server.shutdown().await;
            accept_task.abort();
        }
    }
}
