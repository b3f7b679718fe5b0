//! nisse — a static-file HTTP/1.1 server.
//!
//! Usage: `nisse <port> <documentRoot> [<tlsCertDir>]`
//!
//! With a certificate directory (containing `fullchain.pem` and
//! `privkey.pem`) the listening socket speaks TLS. Runs until SIGINT or
//! SIGTERM, then shuts down cooperatively.

use anyhow::Context as _;
use clap::Parser;
use nisse_server::{ServerConfig, TlsContext, WebServer};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use tracing_subscriber::EnvFilter;

const WORKER_COUNT: usize = 4;

#[derive(Parser)]
#[command(name = "nisse", about = "Static-file HTTP/1.1 server")]
struct Args {
    /// Port to listen on.
    port: u16,
    /// Directory whose files are served (read-only).
    document_root: PathBuf,
    /// Directory with fullchain.pem and privkey.pem; enables TLS.
    tls_cert_dir: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(1);
        }
    };

    match serve(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let chain = format!("{e:#}");
            tracing::error!(error = %chain, "fatal");
            ExitCode::from(1)
        }
    }
}

fn serve(args: Args) -> anyhow::Result<()> {
    let mut config = ServerConfig::new(args.port, args.document_root);
    config.worker_count = WORKER_COUNT;
    if let Some(dir) = args.tls_cert_dir {
        config.tls = Some(
            TlsContext::from_cert_dir(&dir)
                .with_context(|| format!("loading TLS certificates from {}", dir.display()))?,
        );
    }

    let server = WebServer::new(config).context("starting server")?;
    let handle = server.handle();

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("installing signal handler")?;
    thread::Builder::new()
        .name("nisse-signals".into())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                tracing::info!(signal, "shutdown requested");
                handle.stop();
            }
        })
        .context("spawning signal thread")?;

    server.run().context("running server")?;
    tracing::info!("bye");
    Ok(())
}
