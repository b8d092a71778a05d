use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::commands::{dispatch, Shared};
use crate::wire::{read_frame, Reply};

/// Drive one client connection: read a frame, dispatch it, write the reply,
/// until QUIT, EOF, or a socket error.
///
/// Malformed frames (oversized line, token flood) get an `ERR` reply and the
/// connection keeps going; only transport failures end the loop early.
pub(crate) async fn handle_connection(stream: TcpStream, shared: Arc<Shared>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    shared.connections_total.fetch_add(1, Ordering::Relaxed);
    metrics::counter!("kvlite_connections_total").increment(1);
    info!(%peer, "client connected");

    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "failed to set TCP_NODELAY");
    }

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let tokens = match read_frame(&mut reader, shared.limits).await {
            Ok(None) => break,
            Ok(Some(tokens)) => tokens,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                warn!(%peer, error = %e, "protocol error");
                let reply = Reply::Err(format!("protocol error: {e}"));
                if write_half.write_all(&reply.serialize()).await.is_err() {
                    break;
                }
                continue;
            }
            Err(e) => {
                debug!(%peer, error = %e, "read failed");
                break;
            }
        };

        // Blank lines are ignored, as in a telnet session.
        if tokens.is_empty() {
            continue;
        }

        let (reply, quit) = dispatch(&tokens, &shared).await;
        if let Err(e) = write_half.write_all(&reply.serialize()).await {
            debug!(%peer, error = %e, "write failed");
            break;
        }
        if quit {
            break;
        }
    }

    info!(%peer, "client disconnected");
}
