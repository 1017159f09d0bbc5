//! usb-proxy server
//!
//! Serves local USB devices to remote proxy backends. Each accepted
//! connection gets its own dispatcher; all connections share one device
//! table and one native USB context.

use anyhow::{Context as _, Result};
use clap::Parser;
use common::{parse_addr_list, setup_logging, ProxyAddr, ProxyListener, UsbProxy, DEFAULT_PORT};
use server::{serve, EventPump, HostProxy};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// How long in-flight connections get to drain after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "usb-proxy-server")]
#[command(version, about = "Serve local USB devices to remote usb-proxy clients")]
struct Args {
    /// Bind address for listening; repeatable, entries may be joined with ';'
    /// (tcp://HOST[:PORT], local://PATH or HOST:PORT)
    #[arg(short = 'l', long = "listen", value_name = "ADDRESS")]
    listen: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level);

    info!("usb-proxy-server v{}", env!("CARGO_PKG_VERSION"));

    let addresses = listen_addresses(&args)?;

    let context = rusb::Context::new().context("failed to initialise the usb context")?;
    let pump = EventPump::spawn(context.clone());
    let proxy: Arc<dyn UsbProxy> = Arc::new(HostProxy::new(context));

    // Bind everything before accepting anything, so a bad address fails the
    // whole startup instead of silently serving a subset.
    let mut listeners = Vec::new();
    for address in &addresses {
        let listener = ProxyListener::bind(address)
            .await
            .with_context(|| format!("failed to bind {address}"))?;
        info!("[{address}] listening");
        listeners.push(listener);
    }

    let (conn_tx, mut conn_rx) = mpsc::channel(16);
    let mut acceptors = JoinSet::new();
    for (listener, address) in listeners.into_iter().zip(addresses) {
        let conn_tx = conn_tx.clone();
        acceptors.spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(stream) => {
                        if conn_tx.send(stream).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("[{address}] accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
    }
    drop(conn_tx);

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("shutdown signal received");
                break;
            }
            stream = conn_rx.recv() => {
                let Some(stream) = stream else { break };
                let proxy = proxy.clone();
                connections.spawn(async move {
                    if let Err(e) = serve(stream, proxy).await {
                        warn!("connection error: {e}");
                    }
                });
            }
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        error!("connection handler panicked");
                    }
                }
            }
        }
    }

    // Stop accepting; dropping the listeners also removes any local://
    // socket files.
    acceptors.shutdown().await;

    if !connections.is_empty() {
        info!("draining {} connection(s)", connections.len());
        let drain = async {
            while connections.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("connections did not drain in time, aborting");
        }
    }
    connections.shutdown().await;

    pump.stop();
    info!("server shutdown complete");
    Ok(())
}

fn listen_addresses(args: &Args) -> Result<Vec<ProxyAddr>> {
    if args.listen.is_empty() {
        return parse_addr_list(common::DEFAULT_ADDRESS, DEFAULT_PORT)
            .context("invalid default listen address");
    }

    let mut addresses = Vec::new();
    for entry in &args.listen {
        addresses.extend(
            parse_addr_list(entry, DEFAULT_PORT)
                .with_context(|| format!("invalid listen address {entry:?}"))?,
        );
    }
    Ok(addresses)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
