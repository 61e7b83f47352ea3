use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use trapsync::prelude::*;
use trapsync::{NodeEntry, logging};

// ---------------------------------------------------------------------------
// Command line
// ---------------------------------------------------------------------------

/// Runs one trapsync host with an in-memory client table.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// JSON config file. Flags below override it.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to accept peers on
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Address peers know this host by, when listening on a wildcard
    #[arg(long, value_name = "ADDR")]
    advertise: Option<SocketAddr>,

    /// Passphrase peers must present
    #[arg(short, long)]
    passphrase: Option<String>,

    /// Peer to dial, as `address=passphrase`. Repeatable.
    #[arg(short, long = "node", value_name = "ADDR=PASSPHRASE", value_parser = parse_node)]
    nodes: Vec<NodeEntry>,

    /// Client IP to mark once serving, as if a local trap caught it.
    #[arg(short, long = "mark", value_name = "IP")]
    marks: Vec<IpAddr>,

    /// Seconds between status snapshots
    #[arg(long, default_value_t = 30)]
    status_secs: u64,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

fn parse_node(s: &str) -> Result<NodeEntry, String> {
    let (address, passphrase) = s.split_once('=').unwrap_or((s, ""));
    let address = address
        .parse()
        .map_err(|e| format!("bad node address {address:?}: {e}"))?;
    Ok(NodeEntry {
        address,
        passphrase: passphrase.to_owned(),
    })
}

impl Args {
    fn sync_config(&self) -> Result<SyncConfig, TrapError> {
        let mut config = match &self.config {
            Some(path) => SyncConfig::from_path(path)?,
            None => SyncConfig::default(),
        };
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if self.advertise.is_some() {
            config.advertise = self.advertise;
        }
        if let Some(passphrase) = &self.passphrase {
            config.passphrase = passphrase.clone();
        }
        config.nodes.extend(self.nodes.iter().cloned());
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let args = Args::parse();
    logging::init(if args.verbose { "debug" } else { "info" });

    if let Err(e) = run(args).await {
        error!(error = %e, "trap-mesh failed");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), TrapError> {
    let sink = Arc::new(MemorySink::new());
    let sync = TrapSync::new(args.sync_config()?, sink.clone())?;
    let addr = sync.serve().await?;
    info!(listen = %addr, "trap-mesh up, ctrl-c to stop");

    if !args.marks.is_empty() {
        let records = args
            .marks
            .iter()
            .map(|ip| ClientRecord {
                client: *ip,
                server: addr,
                marked: true,
                kind: "tcp".into(),
            })
            .collect();
        let failed = sync.mark(records).await;
        info!(clients = args.marks.len(), failed, "marked clients");
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(args.status_secs.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let status = sync.status().await;
                match status.to_json() {
                    Ok(json) => info!(clients = sink.len(), "status\n{json}"),
                    Err(e) => error!(error = %e, "cannot render status"),
                }
            }
        }
    }

    info!("shutting down");
    sync.down().await;
    Ok(())
}
