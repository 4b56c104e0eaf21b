use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::notify::NotifyQueue;
use crate::session::{Session, SessionRegistry, relay};
use crate::settings::Settings;

/// Shared daemon state: settings, the live-session map, the notification
/// queue, and the shutdown token that STOP and signals cancel. Main
/// constructs one, runs it, and discards it; tests construct their own.
pub struct Daemon {
    pub settings: Settings,
    pub sessions: SessionRegistry,
    pub queue: NotifyQueue,
    pub shutdown: CancellationToken,
}

/// Listeners bound before the accept loops start, so bind failures surface
/// as pre-flight errors rather than mid-run ones.
pub struct BoundListeners {
    pub command: TcpListener,
    /// Each direct listener paired with its implicit CONN line.
    pub direct: Vec<(TcpListener, String)>,
}

impl Daemon {
    pub fn new(settings: Settings) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            settings,
            sessions: SessionRegistry::new(),
            queue: NotifyQueue::new()?,
            shutdown: CancellationToken::new(),
        }))
    }

    /// Bind the command listener and every `[direct]` port.
    pub async fn bind(&self) -> Result<BoundListeners> {
        let host = if self.settings.bind_addr == "*" {
            "0.0.0.0"
        } else {
            &self.settings.bind_addr
        };

        let addr = format!("{host}:{}", self.settings.port);
        let command = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding command listener on {addr}"))?;
        info!(addr = %command.local_addr()?, "command listener bound");

        let mut direct = Vec::new();
        for d in &self.settings.direct {
            let addr = format!("{host}:{}", d.port);
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("binding direct listener on {addr}"))?;
            info!(addr = %listener.local_addr()?, conn = %d.conn_line, "direct listener bound");
            direct.push((listener, d.conn_line.clone()));
        }

        Ok(BoundListeners { command, direct })
    }

    /// Accept loop plus the notification worker; returns after an orderly
    /// shutdown (STOP command, SIGTERM, or SIGINT).
    pub async fn run(self: Arc<Self>, bound: BoundListeners) -> Result<()> {
        let BoundListeners { command, direct } = bound;
        let tracker = TaskTracker::new();

        let notifier = {
            let daemon = Arc::clone(&self);
            tokio::spawn(async move {
                let shutdown = daemon.shutdown.clone();
                daemon.queue.run(&daemon.sessions, shutdown).await;
            })
        };

        for (listener, conn_line) in direct {
            let daemon = Arc::clone(&self);
            let session_tasks = tracker.clone();
            tracker.spawn(async move { daemon.accept_direct(listener, conn_line, session_tasks).await });
        }

        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

        loop {
            tokio::select! {
                accept = command.accept() => match accept {
                    Ok((stream, peer)) => self.spawn_command_session(&tracker, stream, peer),
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                _ = sigterm.recv() => {
                    info!("received SIGTERM");
                    self.shutdown.cancel();
                }
                _ = sigint.recv() => {
                    info!("received SIGINT");
                    self.shutdown.cancel();
                }
                _ = self.shutdown.cancelled() => break,
            }
        }

        // Refuse new connections, then let every session tear down.
        drop(command);
        info!(sessions = self.sessions.len(), "shutting down");
        tracker.close();
        tracker.wait().await;

        // All remaining queue entries reference destroyed sessions now, so
        // the worker can flush them; a dead controller must not hold the
        // process open.
        if tokio::time::timeout(Duration::from_secs(10), notifier).await.is_err() {
            warn!("notification drain timed out");
        }

        info!("daemon stopped");
        Ok(())
    }

    fn spawn_command_session(self: &Arc<Self>, tracker: &TaskTracker, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let session = Arc::new(Session::new(self.sessions.next_id(), peer));
        info!(session = %session.id, peer = %peer, "connection accepted");
        tracker.spawn(relay::run_command_session(Arc::clone(self), session, stream));
    }

    async fn accept_direct(self: Arc<Self>, listener: TcpListener, conn_line: String, tracker: TaskTracker) {
        loop {
            tokio::select! {
                accept = listener.accept() => match accept {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let session = Arc::new(Session::new(format!("L{}", self.sessions.next_id()), peer));
                        info!(session = %session.id, peer = %peer, "direct connection accepted");
                        tracker.spawn(relay::run_direct_session(
                            Arc::clone(&self),
                            session,
                            stream,
                            conn_line.clone(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "direct accept failed"),
                },
                _ = self.shutdown.cancelled() => return,
            }
        }
    }
}
