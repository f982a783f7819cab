//! TCP accept loop and per-connection read/write tasks.
//!
//! Grounded on `socket::server::SocketServer::accept_loop` and
//! `socket::client_conn::SocketClientConn` (split read/write halves, each
//! its own task, frames queued to the writer over an `mpsc` channel) — here
//! generalized from Unix-domain PTY framing to TCP with the CoreMQ ASCII
//! codec, and with no central "Hub" channel: the read task calls
//! `Broker::dispatch` directly (see `broker.rs` module docs for why).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::broker::{Broker, DispatchOutcome};
use crate::connection::{Connection, ConnectionId};
use crate::error::CoreMqError;
use crate::message::MessageExt;
use crate::wire::{parse_payload, FrameCodec};

/// Bind `bind_addr` and run the accept loop until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the address cannot be bound.
pub async fn serve(
    bind_addr: &str,
    broker: Arc<Broker>,
    shutdown: tokio_util::sync::CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    log::info!("CoreMQ server listening on {bind_addr}");
    run(listener, broker, shutdown).await
}

/// Drive the accept loop over an already-bound listener. Split out from
/// [`serve`] so tests can bind to `127.0.0.1:0`, read back the ephemeral
/// port the OS assigned, and only then start accepting.
pub async fn run(
    listener: TcpListener,
    broker: Arc<Broker>,
    shutdown: tokio_util::sync::CancellationToken,
) -> std::io::Result<()> {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                log::info!("accept loop shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let broker = broker.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, addr, broker).await;
                        });
                    }
                    Err(e) => {
                        log::error!("accept error: {e}");
                    }
                }
            }
        }
    }
}

async fn resolve_hostname(addr: SocketAddr) -> Option<String> {
    tokio::task::spawn_blocking(move || {
        dns_lookup::lookup_addr(&addr.ip()).ok()
    })
    .await
    .ok()
    .flatten()
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, broker: Arc<Broker>) {
    let id = ConnectionId::new();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<bytes::Bytes>();

    let conn = Arc::new(Connection::new(id.clone(), addr, outbound_tx));
    broker.register(conn.clone());

    conn.reply(&serde_json::json!({
        "response": "OK: Welcome to CoreMQ server",
        "server": broker.name,
    }));

    // Reverse DNS is best-effort and must never stall the connection;
    // resolved after the welcome frame is already queued.
    if let Some(hostname) = resolve_hostname(addr).await {
        conn.set_hostname(hostname);
    }

    let (mut writer, mut reader) = Framed::new(stream, FrameCodec::new()).split();

    let write_task = tokio::spawn(async move {
        while let Some(bytes) = outbound_rx.recv().await {
            if let Err(e) = writer.send(bytes).await {
                log::warn!("write error: {e}");
                break;
            }
        }
    });

    loop {
        match reader.next().await {
            Some(Ok(frame)) => match parse_payload(&frame.payload) {
                Ok(parsed) => {
                    let mut message = parsed.message;
                    message.stamp_sender(id.as_ref());
                    message.stamp_sent(now_secs());

                    if broker.dispatch(&conn, parsed.queue, message) == DispatchOutcome::Close {
                        break;
                    }
                }
                Err(e) => {
                    conn.reply(&serde_json::json!({"response": format!("ERROR: {e}")}));
                }
            },
            Some(Err(e)) => {
                if !matches!(e, CoreMqError::ConnectionClosed) {
                    log::warn!("frame decode error for {id}: {e}");
                }
                break;
            }
            None => break,
        }
    }

    broker.deregister(&id);
    write_task.abort();
    log::debug!("closed connection: {id}");
}
