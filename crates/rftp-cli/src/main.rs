//! RFTP command line: file server and download client over one binary.

mod progress;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use clap::Parser;
use tracing::info;

use rftp_client::{Client, FileRequest};
use rftp_server::{DirectorySource, Server};
use rftp_transport::{Carrier, MarkovLoss, UdpCarrier};

use progress::{format_bytes, transfer_bar, ProgressSink};

/// Reliable file transfer over UDP
#[derive(Parser)]
#[command(name = "rftp", version, about, long_about = None)]
struct Cli {
    /// Server mode: serve the files under the given directory. Operate in
    /// client mode if not specified.
    #[arg(short = 's', long = "server")]
    server: bool,

    /// Port number to use
    #[arg(short = 't', long = "port", default_value_t = 2020)]
    port: u16,

    /// Markov loss probability p in [0,1]; if only one of p/q is given,
    /// the other takes the same value
    #[arg(short = 'p', long = "p")]
    p: Option<f32>,

    /// Markov loss probability q in [0,1]
    #[arg(short = 'q', long = "q")]
    q: Option<f32>,

    /// Directory to store received files in, or '-' for stdout
    #[arg(short = 'o', long = "out", default_value = ".")]
    out: String,

    /// Print debug output
    #[arg(short = 'd', long = "d")]
    debug: bool,

    /// Host to request from (unused in server mode)
    host: String,

    /// Files to request, or the served directory in server mode
    #[arg(required = true)]
    files: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let loss = normalize_loss(cli.p, cli.q)?;

    if cli.server {
        run_server(&cli, loss).await
    } else {
        run_client(&cli, loss).await
    }
}

/// If only one of p/q is given, the other takes the same value.
fn normalize_loss(p: Option<f32>, q: Option<f32>) -> anyhow::Result<Option<(f32, f32)>> {
    let (p, q) = match (p, q) {
        (None, None) => return Ok(None),
        (Some(p), None) => (p, p),
        (None, Some(q)) => (q, q),
        (Some(p), Some(q)) => (p, q),
    };
    for value in [p, q] {
        if !(0.0..=1.0).contains(&value) {
            bail!("p and q must be values between 0 and 1");
        }
    }
    Ok(Some((p, q)))
}

fn apply_loss(carrier: &UdpCarrier, loss: Option<(f32, f32)>) -> anyhow::Result<()> {
    if let Some((p, q)) = loss {
        carrier.set_loss_model(Box::new(MarkovLoss::new(p, q)?));
    }
    Ok(())
}

async fn run_server(cli: &Cli, loss: Option<(f32, f32)>) -> anyhow::Result<()> {
    let dir = &cli.files[0];
    let source =
        DirectorySource::new(dir).with_context(|| format!("cannot serve directory {dir}"))?;
    info!(%dir, files = source.len(), port = cli.port, "starting file server");

    let addr: SocketAddr = format!("0.0.0.0:{}", cli.port).parse()?;
    let carrier = UdpCarrier::bind(addr)?;
    apply_loss(&carrier, loss)?;

    let server = Server::new(Arc::new(carrier), Arc::new(source));
    server.listen().await?;
    Ok(())
}

async fn run_client(cli: &Cli, loss: Option<(f32, f32)>) -> anyhow::Result<()> {
    let out = cli.out.as_str();
    if out != "-" && !Path::new(out).is_dir() {
        bail!("invalid out path {out}");
    }

    let host = format!("{}:{}", cli.host, cli.port);
    info!(%host, files = ?cli.files, "requesting files");

    let carrier = UdpCarrier::connect(&host).await?;
    apply_loss(&carrier, loss)?;
    let client = Client::new(Arc::new(carrier) as Arc<dyn Carrier>);

    let multi = indicatif::MultiProgress::new();
    let mut requests = Vec::with_capacity(cli.files.len());
    for name in &cli.files {
        let mut sink: rftp_client::FileSink = if out == "-" {
            Box::new(tokio::io::stdout())
        } else {
            let path = output_path(out, name);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.ok();
            }
            let file = tokio::fs::File::create(&path)
                .await
                .with_context(|| format!("cannot write file to {}", path.display()))?;
            Box::new(file)
        };
        if !cli.debug && out != "-" {
            let bar = multi.add(transfer_bar(name));
            sink = Box::new(ProgressSink::new(sink, bar));
        }
        requests.push(FileRequest::new(name.clone(), sink));
    }

    let outcomes = client.request(requests).await?;

    let mut failed = 0;
    for outcome in &outcomes {
        match &outcome.error {
            None => {
                let size = outcome.size.map(format_bytes).unwrap_or_else(|| "0 B".into());
                info!(name = %outcome.name, %size, "file received, checksum valid");
            }
            Some(error) => {
                failed += 1;
                eprintln!("{}: {error}", outcome.name);
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} files failed", outcomes.len());
    }
    // give detached protocol tasks a moment to log their teardown
    tokio::time::sleep(Duration::from_millis(1)).await;
    Ok(())
}

fn output_path(out: &str, name: &str) -> PathBuf {
    // requested names may carry path separators; keep the tree shape
    // but never escape the output directory
    let relative: PathBuf = Path::new(name)
        .components()
        .filter(|component| matches!(component, std::path::Component::Normal(_)))
        .collect();
    Path::new(out).join(relative)
}
