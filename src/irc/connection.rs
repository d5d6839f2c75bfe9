//! Socket plumbing: listener, peer dialer, per-connection task, ticker.
//!
//! Each socket gets one task running a `select!` over the framed stream and
//! the connection's outbound channel. Inbound lines are handed to
//! [`ServerState::dispatch`] under the write lock; nothing awaits while the
//! lock is held.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::codec::{CodecError, IrcCodec};
use super::config::ServerConfig;
use super::identity::LinkDirection;
use super::message::Message;
use super::server::{ServerState, SharedState};

/// How often expired nick-delay entries are swept.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(10);
/// Pause between attempts to (re)connect to a configured peer.
const RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Wall-clock epoch seconds, the unit of every claim timestamp.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Run the server: bind, dial configured peers, accept forever.
pub async fn run(config: ServerConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Arc::new(config);
    let state = ServerState::shared(Arc::clone(&config));

    // Bind first, so we fail fast on port conflicts.
    let listener = TcpListener::bind(config.bind).await?;
    info!(server = %config.server_name, sid = %config.sid, "listening on {}", config.bind);

    spawn_housekeeping(Arc::clone(&state));
    for peer in &config.peers {
        spawn_peer(peer.clone(), Arc::clone(&state));
    }

    serve(listener, state).await
}

/// Accept loop for a bound listener.
pub async fn serve(
    listener: TcpListener,
    state: SharedState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loop {
        let (socket, addr) = listener.accept().await?;
        info!(%addr, "new connection");
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, addr, LinkDirection::Inbound, state).await {
                warn!(%addr, "connection error: {e}");
            }
            info!(%addr, "disconnected");
        });
    }
}

/// Keep one outbound link to `peer` alive, reconnecting after a delay.
pub fn spawn_peer(peer: String, state: SharedState) {
    tokio::spawn(async move {
        loop {
            match TcpStream::connect(&peer).await {
                Ok(socket) => {
                    let addr = socket
                        .peer_addr()
                        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
                    info!(%peer, %addr, "connected to peer");
                    if let Err(e) =
                        handle_connection(socket, addr, LinkDirection::Outbound, Arc::clone(&state))
                            .await
                    {
                        warn!(%peer, "peer link error: {e}");
                    }
                }
                Err(e) => warn!(%peer, "failed to connect: {e}"),
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    });
}

/// Periodically sweep expired nick-delay entries.
pub fn spawn_housekeeping(state: SharedState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        loop {
            ticker.tick().await;
            state.write().await.tick(unix_now());
        }
    });
}

/// Drive one socket until it closes or we close it.
async fn handle_connection(
    socket: TcpStream,
    addr: SocketAddr,
    direction: LinkDirection,
    state: SharedState,
) -> Result<(), CodecError> {
    let mut framed = Framed::new(socket, IrcCodec);
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let conn = {
        let mut st = state.write().await;
        match direction {
            LinkDirection::Inbound => st.open_connection(addr, direction, tx),
            LinkDirection::Outbound => st.connect_link(addr, tx),
        }
    };

    let mut reason = String::from("Connection closed");
    let result = loop {
        tokio::select! {
            // Incoming line from the socket.
            frame = framed.next() => match frame {
                Some(Ok(msg)) => {
                    debug!(%conn, "← {msg}");
                    state.write().await.dispatch(conn, &msg, unix_now());
                }
                Some(Err(e)) => {
                    reason = format!("Read error: {e}");
                    break Err(e);
                }
                None => break Ok(()),
            },

            // Outgoing line queued by a handler.
            Some(msg) = rx.recv() => {
                // An ERROR line is always the last thing we say.
                let closing = msg.command == "ERROR";
                if let Err(e) = framed.send(msg).await {
                    reason = format!("Write error: {e}");
                    break Err(e);
                }
                if closing {
                    break Ok(());
                }
            }
        }
    };

    state
        .write()
        .await
        .close_connection(conn, &reason, unix_now());
    result
}
