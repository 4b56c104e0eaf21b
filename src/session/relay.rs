use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use super::command::{self, Action};
use super::{DEFAULT_BLOCK_SIZE, IDENT, PROTO_VERSION, Session};
use crate::daemon::Daemon;
use crate::error::ProxyError;
use crate::notify;

/// Cap on the setup-phase line accumulator; a client that never sends a
/// newline is cut off here.
const MAX_SETUP_BUFFER: usize = 8192;

/// Drive one command-listener session to completion: greeting, setup
/// command loop, then (after CONN) the echo relay.
pub async fn run_command_session(daemon: Arc<Daemon>, session: Arc<Session>, mut client: TcpStream) {
    daemon.sessions.insert(Arc::clone(&session));
    debug!(session = %session.id, peer = %session.peer_addr, "session opened");
    let result = serve(&daemon, &session, &mut client).await;
    finish(&daemon, &session, &mut client, result).await;
}

/// Drive one direct-listener session: no greeting; the preconfigured CONN
/// line runs through the interpreter with its reply suppressed.
pub async fn run_direct_session(
    daemon: Arc<Daemon>,
    session: Arc<Session>,
    mut client: TcpStream,
    conn_line: String,
) {
    daemon.sessions.insert(Arc::clone(&session));
    debug!(session = %session.id, peer = %session.peer_addr, "direct session opened");
    let outcome = command::execute(&daemon, &session, conn_line.trim_end_matches(['\r', '\n'])).await;
    let result = match outcome.action {
        Action::Echo(remote) => echo(&daemon, &session, &mut client, remote, Vec::new()).await,
        _ => {
            error!(
                session = %session.id,
                reply = %outcome.reply.trim_end(),
                "implicit CONN failed on direct listener"
            );
            Ok(())
        }
    };
    finish(&daemon, &session, &mut client, result).await;
}

/// Shared teardown: log the result, shut the client leg down, unregister,
/// and queue the final notification so the controller observes the close.
async fn finish(
    daemon: &Daemon,
    session: &Arc<Session>,
    client: &mut TcpStream,
    result: Result<(), ProxyError>,
) {
    match &result {
        Ok(()) => debug!(session = %session.id, "session closed"),
        Err(e @ ProxyError::IdleTimeout { .. }) => info!(session = %session.id, "{e}"),
        Err(e) => warn!(session = %session.id, error = %e, "session failed"),
    }
    let _ = client.shutdown().await;
    daemon.sessions.remove(&session.id);
    enqueue_notification(daemon, session);
}

async fn serve(
    daemon: &Daemon,
    session: &Arc<Session>,
    client: &mut TcpStream,
) -> Result<(), ProxyError> {
    let greeting = format!("OK {IDENT} {PROTO_VERSION} {}\n", session.id);
    client
        .write_all(greeting.as_bytes())
        .await
        .map_err(ProxyError::PeerIo)?;

    match setup(daemon, session, client).await? {
        Some((remote, leftover)) => echo(daemon, session, client, remote, leftover).await,
        None => Ok(()),
    }
}

/// Setup loop: accumulate bytes until a `\n`, run each complete line
/// through the command interpreter, and write its reply. Returns the remote
/// socket plus any bytes that followed the CONN line, or `None` when the
/// session ended during setup.
async fn setup(
    daemon: &Daemon,
    session: &Arc<Session>,
    client: &mut TcpStream,
) -> Result<Option<(TcpStream, Vec<u8>)>, ProxyError> {
    let mut buffer: Vec<u8> = Vec::new();
    let mut read_buf = vec![0u8; DEFAULT_BLOCK_SIZE];
    loop {
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(&buffer[..pos]).into_owned();
            buffer.drain(..=pos);
            let outcome = command::execute(daemon, session, &line).await;
            if !outcome.reply.is_empty() {
                client
                    .write_all(outcome.reply.as_bytes())
                    .await
                    .map_err(ProxyError::PeerIo)?;
            }
            match outcome.action {
                Action::Continue => {}
                Action::Close => return Ok(None),
                Action::Stop => {
                    info!(session = %session.id, "STOP received, shutting the daemon down");
                    daemon.shutdown.cancel();
                    return Ok(None);
                }
                Action::Echo(remote) => return Ok(Some((remote, std::mem::take(&mut buffer)))),
            }
        }
        if buffer.len() > MAX_SETUP_BUFFER {
            let _ = client.write_all(b"ERR INVALID COMMAND\n").await;
            return Err(ProxyError::Protocol("setup line too long".to_string()));
        }

        let (window, last_peer, block) =
            session.with_state(|st| (st.peer_timeout, st.last_peer, st.block_size));
        if read_buf.len() != block {
            read_buf.resize(block, 0);
        }
        tokio::select! {
            read = client.read(&mut read_buf) => match read {
                Ok(0) => {
                    debug!(session = %session.id, "client closed during setup");
                    return Ok(None);
                }
                Ok(n) => {
                    session.with_state(|st| st.last_peer = Instant::now());
                    buffer.extend_from_slice(&read_buf[..n]);
                }
                Err(e) => return Err(ProxyError::PeerIo(e)),
            },
            _ = idle(window, last_peer) => {
                return Err(ProxyError::IdleTimeout { leg: "client", ms: window.as_millis() as u64 });
            }
            _ = daemon.shutdown.cancelled() => return Ok(None),
        }
    }
}

/// Echo relay: a transparent byte pipe between the two legs. Arrivals from
/// the remote queue a notification only after the bytes have been written
/// to the client socket.
async fn echo(
    daemon: &Daemon,
    session: &Arc<Session>,
    client: &mut TcpStream,
    mut remote: TcpStream,
    leftover: Vec<u8>,
) -> Result<(), ProxyError> {
    if !leftover.is_empty() {
        remote.write_all(&leftover).await.map_err(ProxyError::RemoteIo)?;
        session.with_state(|st| {
            st.sent_to_remote += leftover.len() as u64;
            st.last_peer = Instant::now();
        });
    }

    let block = session.with_state(|st| st.block_size);
    let mut peer_buf = vec![0u8; block];
    let mut remote_buf = vec![0u8; block];
    let (mut client_read, mut client_write) = client.split();
    let (mut remote_read, mut remote_write) = remote.split();

    loop {
        let (peer_window, remote_window, last_peer, last_remote) = session.with_state(|st| {
            (st.peer_timeout, st.remote_timeout, st.last_peer, st.last_remote)
        });
        tokio::select! {
            read = client_read.read(&mut peer_buf) => match read {
                Ok(0) => {
                    debug!(session = %session.id, "client closed");
                    return Ok(());
                }
                Ok(n) => {
                    remote_write.write_all(&peer_buf[..n]).await.map_err(ProxyError::RemoteIo)?;
                    session.with_state(|st| {
                        st.sent_to_remote += n as u64;
                        st.last_peer = Instant::now();
                    });
                }
                Err(e) => return Err(ProxyError::PeerIo(e)),
            },
            read = remote_read.read(&mut remote_buf) => match read {
                Ok(0) => {
                    debug!(session = %session.id, "remote closed");
                    return Ok(());
                }
                Ok(n) => {
                    client_write.write_all(&remote_buf[..n]).await.map_err(ProxyError::PeerIo)?;
                    session.with_state(|st| {
                        st.recv_from_remote += n as u64;
                        st.last_remote = Instant::now();
                    });
                    enqueue_notification(daemon, session);
                }
                Err(e) => return Err(ProxyError::RemoteIo(e)),
            },
            _ = idle(peer_window, last_peer) => {
                return Err(ProxyError::IdleTimeout { leg: "client", ms: peer_window.as_millis() as u64 });
            }
            _ = idle(remote_window, last_remote) => {
                return Err(ProxyError::IdleTimeout { leg: "remote", ms: remote_window.as_millis() as u64 });
            }
            _ = daemon.shutdown.cancelled() => return Ok(()),
        }
    }
    // `remote` drops on every return path, closing that leg; `finish` shuts
    // the client leg down.
}

/// Queue a notification if the session carries an enabled binding.
fn enqueue_notification(daemon: &Daemon, session: &Session) {
    let url = session.with_state(|st| {
        st.binding
            .as_ref()
            .filter(|b| b.device >= 0)
            .map(|b| notify::request_url(&daemon.settings.controller, b))
    });
    if let Some(url) = url {
        daemon.queue.push(&session.id, url);
    }
}

/// Resolve when an idle window starting at `last` has elapsed; a zero
/// window means the timeout is disabled and never resolves.
async fn idle(window: Duration, last: Instant) {
    if window.is_zero() {
        std::future::pending::<()>().await;
    } else {
        tokio::time::sleep_until(tokio::time::Instant::from_std(last + window)).await;
    }
}
