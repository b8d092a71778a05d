mod commands;
mod config;
mod server;
mod store;
mod sweeper;
mod wire;

use std::net::SocketAddr;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use commands::Shared;
use wire::FrameLimits;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = config::Config::from_env();

    let metrics_addr: SocketAddr = config
        .metrics_listen_addr()
        .parse()
        .expect("invalid metrics listen address");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("failed to install Prometheus exporter");

    metrics::describe_gauge!("kvlite_keys_total", "Number of live keys in the store");
    metrics::describe_counter!("kvlite_commands_total", "Commands processed, by command");
    metrics::describe_counter!("kvlite_expired_keys_total", "Keys removed because their TTL elapsed");
    metrics::describe_counter!("kvlite_connections_total", "Client connections accepted");
    metrics::describe_histogram!("kvlite_command_duration_seconds", "Command processing latency in seconds");

    let store: store::Store = Arc::new(RwLock::new(store::Db::new()));
    let limits = FrameLimits {
        max_line_len: config.max_line_len,
        max_args: config.max_args,
    };
    let shared = Arc::new(Shared::new(Arc::clone(&store), limits));

    tokio::spawn(sweeper::run_sweeper(
        Arc::clone(&store),
        config.sweep_interval_secs,
    ));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await.expect("failed to bind");
    info!(addr = %addr, "kvlite listening");

    #[cfg(unix)]
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    loop {
        #[cfg(unix)]
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        tokio::spawn(server::handle_connection(stream, Arc::clone(&shared)));
                    }
                    Err(e) => error!(?e, "accept error"),
                }
            }
            _ = signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
        }

        #[cfg(not(unix))]
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        tokio::spawn(server::handle_connection(stream, Arc::clone(&shared)));
                    }
                    Err(e) => error!(?e, "accept error"),
                }
            }
            _ = signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
                break;
            }
        }
    }
}
