//! End-to-end daemon tests.
//!
//! Each test stands up a real daemon on ephemeral ports, plus whatever
//! remote endpoints and mock controller it needs, and talks to it over
//! plain TCP exactly like a controller plugin would.

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use crate::daemon::Daemon;
    use crate::settings::{DirectPort, Settings};

    /// Spawn a daemon on ephemeral ports. Returns the command listener
    /// address, the direct listener addresses, the daemon, and the run
    /// handle.
    async fn spawn_test_daemon(
        mut settings: Settings,
    ) -> (
        SocketAddr,
        Vec<SocketAddr>,
        Arc<Daemon>,
        tokio::task::JoinHandle<anyhow::Result<()>>,
    ) {
        settings.bind_addr = "127.0.0.1".to_string();
        settings.port = 0;
        let daemon = Daemon::new(settings).unwrap();
        let bound = daemon.bind().await.unwrap();
        let addr = bound.command.local_addr().unwrap();
        let direct_addrs = bound
            .direct
            .iter()
            .map(|(l, _)| l.local_addr().unwrap())
            .collect();
        let handle = tokio::spawn(Arc::clone(&daemon).run(bound));
        (addr, direct_addrs, daemon, handle)
    }

    /// Minimal HTTP endpoint standing in for the controller: records the
    /// request path of every GET and answers 200 with an empty body.
    async fn spawn_controller() -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                request.extend_from_slice(&buf[..n]);
                                if request.windows(4).any(|w| w == b"\r\n\r\n") {
                                    break;
                                }
                            }
                        }
                    }
                    let text = String::from_utf8_lossy(&request);
                    if let Some(path) = text.lines().next().and_then(|l| l.split(' ').nth(1)) {
                        let _ = tx.send(path.to_string());
                    }
                    let _ = stream
                        .write_all(
                            b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                        )
                        .await;
                });
            }
        });
        (base, rx)
    }

    /// Remote endpoint that echoes everything back.
    async fn spawn_echo_remote() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    /// Remote endpoint that sends `chunks` small writes `gap` apart, then
    /// holds the connection open until the peer closes.
    async fn spawn_burst_remote(chunks: usize, gap: Duration) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            for i in 0..chunks {
                if stream.write_all(format!("chunk{i}\n").as_bytes()).await.is_err() {
                    return;
                }
                tokio::time::sleep(gap).await;
            }
            let mut buf = [0u8; 256];
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });
        addr
    }

    /// Remote endpoint that accepts, never sends, and holds the socket open.
    async fn spawn_silent_remote() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let mut buf = [0u8; 256];
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });
        addr
    }

    /// Remote endpoint that accepts and closes after `delay`.
    async fn spawn_closing_remote(delay: Duration) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::time::sleep(delay).await;
            drop(stream);
        });
        addr
    }

    async fn connect(addr: SocketAddr) -> BufReader<TcpStream> {
        BufReader::new(TcpStream::connect(addr).await.unwrap())
    }

    async fn read_line(client: &mut BufReader<TcpStream>) -> String {
        let mut line = String::new();
        timeout(Duration::from_secs(2), client.read_line(&mut line))
            .await
            .expect("timed out waiting for a line")
            .unwrap();
        line
    }

    /// Read the greeting and return the session id.
    async fn read_greeting(client: &mut BufReader<TcpStream>) -> String {
        let line = read_line(client).await;
        let parts: Vec<&str> = line.trim_end().split(' ').collect();
        assert_eq!(parts.len(), 4, "greeting {line:?}");
        assert_eq!(parts[0], "OK");
        assert_eq!(parts[1], "TOGGLEDBITS-SOCKPROXY");
        assert_eq!(parts[2], "1");
        parts[3].to_string()
    }

    async fn send(client: &mut BufReader<TcpStream>, line: &str) {
        client.write_all(line.as_bytes()).await.unwrap();
    }

    /// Collect notification paths arriving within `window`.
    async fn drain_for(rx: &mut mpsc::UnboundedReceiver<String>, window: Duration) -> Vec<String> {
        let mut got = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(path)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            got.push(path);
        }
        got
    }

    #[tokio::test]
    async fn greeting_identifies_protocol_and_session() {
        let (addr, _, daemon, _handle) = spawn_test_daemon(Settings::default()).await;
        let mut client = connect(addr).await;
        let id = read_greeting(&mut client).await;
        let hex = id.strip_prefix('L').unwrap_or(&id);
        assert!(!hex.is_empty());
        assert!(hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)));
        daemon.shutdown.cancel();
    }

    #[tokio::test]
    async fn capa_lists_supported_options() {
        let (addr, _, daemon, _handle) = spawn_test_daemon(Settings::default()).await;
        let mut client = connect(addr).await;
        read_greeting(&mut client).await;
        send(&mut client, "CAPA\n").await;
        assert_eq!(read_line(&mut client).await, "OK CAPA BLKS RTIM NTFY CONN\n");
        daemon.shutdown.cancel();
    }

    #[tokio::test]
    async fn setup_bytes_are_buffered_until_newline() {
        let (addr, _, daemon, _handle) = spawn_test_daemon(Settings::default()).await;
        let mut client = connect(addr).await;
        read_greeting(&mut client).await;
        send(&mut client, "CA").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        send(&mut client, "PA\n").await;
        assert_eq!(read_line(&mut client).await, "OK CAPA BLKS RTIM NTFY CONN\n");
        daemon.shutdown.cancel();
    }

    #[tokio::test]
    async fn invalid_command_replies_then_closes() {
        let (addr, _, daemon, _handle) = spawn_test_daemon(Settings::default()).await;
        let mut client = connect(addr).await;
        read_greeting(&mut client).await;
        send(&mut client, "BOGUS\n").await;
        assert_eq!(read_line(&mut client).await, "ERR INVALID COMMAND\n");
        assert_eq!(read_line(&mut client).await, "");
        daemon.shutdown.cancel();
    }

    #[tokio::test]
    async fn conn_relays_bytes_and_notifies_controller() {
        let (base, mut notifications) = spawn_controller().await;
        let remote = spawn_echo_remote().await;
        let settings = Settings {
            controller: base,
            ..Settings::default()
        };
        let (addr, _, daemon, _handle) = spawn_test_daemon(settings).await;

        let mut client = connect(addr).await;
        let id = read_greeting(&mut client).await;
        send(
            &mut client,
            &format!("CONN {remote} NTFY=42/urn:x:serviceId:X1/Handle\n"),
        )
        .await;
        let reply = read_line(&mut client).await;
        let pid = reply
            .trim_end()
            .strip_prefix("OK CONN ")
            .expect("CONN reply")
            .to_string();
        assert_eq!(pid, id);

        send(&mut client, "hello\n").await;
        assert_eq!(read_line(&mut client).await, "hello\n");

        let paths = drain_for(&mut notifications, Duration::from_secs(2)).await;
        assert_eq!(paths.len(), 1, "paths {paths:?}");
        assert_eq!(
            paths[0],
            format!(
                "/data_request?id=action&output_format=json&DeviceNum=42\
                 &serviceId=urn%3ax%3aserviceId%3aX1&action=Handle&Pid={pid}"
            )
        );
        daemon.shutdown.cancel();
    }

    #[tokio::test]
    async fn pace_coalesces_rapid_arrivals() {
        let (base, mut notifications) = spawn_controller().await;
        let remote = spawn_burst_remote(3, Duration::from_millis(100)).await;
        let settings = Settings {
            controller: base,
            ..Settings::default()
        };
        let (addr, _, daemon, _handle) = spawn_test_daemon(settings).await;

        let mut client = connect(addr).await;
        read_greeting(&mut client).await;
        send(&mut client, "NTFY 7 urn:svc Chunked\n").await;
        assert_eq!(read_line(&mut client).await, "OK NTFY\n");
        send(&mut client, "PACE 2\n").await;
        assert_eq!(read_line(&mut client).await, "OK PACE\n");
        send(&mut client, &format!("CONN {remote}\n")).await;
        assert!(read_line(&mut client).await.starts_with("OK CONN "));

        // The first arrival notifies immediately; the rest coalesce until
        // the pacing window has elapsed.
        let first = drain_for(&mut notifications, Duration::from_millis(1000)).await;
        assert_eq!(first.len(), 1, "first window {first:?}");
        let rest = drain_for(&mut notifications, Duration::from_millis(2800)).await;
        assert_eq!(rest.len(), 1, "second window {rest:?}");
        daemon.shutdown.cancel();
    }

    #[tokio::test]
    async fn remote_close_propagates_and_emits_final_notification() {
        let (base, mut notifications) = spawn_controller().await;
        let remote = spawn_closing_remote(Duration::from_millis(200)).await;
        let settings = Settings {
            controller: base,
            ..Settings::default()
        };
        let (addr, _, daemon, _handle) = spawn_test_daemon(settings).await;

        let mut client = connect(addr).await;
        read_greeting(&mut client).await;
        send(&mut client, &format!("CONN {remote} NTFY=3/urn:s/Done\n")).await;
        assert!(read_line(&mut client).await.starts_with("OK CONN "));

        // Remote closes; the client leg reads EOF within a tick.
        assert_eq!(read_line(&mut client).await, "");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(daemon.sessions.is_empty());

        // Exactly one notification: the final one for the teardown.
        let paths = drain_for(&mut notifications, Duration::from_millis(1500)).await;
        assert_eq!(paths.len(), 1, "paths {paths:?}");
        assert!(paths[0].contains("DeviceNum=3"));
        daemon.shutdown.cancel();
    }

    #[tokio::test]
    async fn ntfy_rebinding_uses_last_binding() {
        let (base, mut notifications) = spawn_controller().await;
        let remote = spawn_echo_remote().await;
        let settings = Settings {
            controller: base,
            ..Settings::default()
        };
        let (addr, _, daemon, _handle) = spawn_test_daemon(settings).await;

        let mut client = connect(addr).await;
        read_greeting(&mut client).await;
        send(&mut client, "NTFY 5 urn:a One pid-a\n").await;
        assert_eq!(read_line(&mut client).await, "OK NTFY\n");
        send(&mut client, "NTFY 6 urn:b Two pid-b\n").await;
        assert_eq!(read_line(&mut client).await, "OK NTFY\n");
        send(&mut client, &format!("CONN {remote}\n")).await;
        assert_eq!(read_line(&mut client).await, "OK CONN pid-b\n");

        send(&mut client, "x\n").await;
        assert_eq!(read_line(&mut client).await, "x\n");
        let paths = drain_for(&mut notifications, Duration::from_secs(2)).await;
        assert_eq!(paths.len(), 1);
        assert!(paths[0].contains("DeviceNum=6"));
        assert!(paths[0].contains("Pid=pid-b"));
        daemon.shutdown.cancel();
    }

    #[tokio::test]
    async fn conn_error_leaves_session_usable() {
        let (addr, _, daemon, _handle) = spawn_test_daemon(Settings::default()).await;
        let mut client = connect(addr).await;
        read_greeting(&mut client).await;
        send(&mut client, "CONN 127.0.0.1:1 FOO=1\n").await;
        assert_eq!(read_line(&mut client).await, "ERR CONN Invalid option FOO=1\n");
        // Still in setup: commands keep working.
        send(&mut client, "CAPA\n").await;
        assert_eq!(read_line(&mut client).await, "OK CAPA BLKS RTIM NTFY CONN\n");
        daemon.shutdown.cancel();
    }

    #[tokio::test]
    async fn idle_timeout_tears_session_down() {
        let remote = spawn_silent_remote().await;
        let (addr, _, daemon, _handle) = spawn_test_daemon(Settings::default()).await;
        let mut client = connect(addr).await;
        read_greeting(&mut client).await;
        send(&mut client, "RTIM 300\n").await;
        assert_eq!(read_line(&mut client).await, "OK RTIM\n");
        send(&mut client, &format!("CONN {remote}\n")).await;
        assert!(read_line(&mut client).await.starts_with("OK CONN "));
        // No traffic on either leg: the session is torn down and the client
        // leg reads EOF.
        assert_eq!(read_line(&mut client).await, "");
        daemon.shutdown.cancel();
    }

    #[tokio::test]
    async fn rtim_zero_disables_idle_timeout() {
        let remote = spawn_silent_remote().await;
        let (addr, _, daemon, _handle) = spawn_test_daemon(Settings::default()).await;
        let mut client = connect(addr).await;
        read_greeting(&mut client).await;
        send(&mut client, "RTIM 300\n").await;
        assert_eq!(read_line(&mut client).await, "OK RTIM\n");
        send(&mut client, "RTIM 0\n").await;
        assert_eq!(read_line(&mut client).await, "OK RTIM\n");
        send(&mut client, &format!("CONN {remote}\n")).await;
        assert!(read_line(&mut client).await.starts_with("OK CONN "));
        // With the timeout cleared the session stays up well past 300ms.
        let mut line = String::new();
        let idle = timeout(Duration::from_millis(700), client.read_line(&mut line)).await;
        assert!(idle.is_err(), "session closed unexpectedly: {line:?}");
        daemon.shutdown.cancel();
    }

    #[tokio::test]
    async fn stat_reports_all_sessions_with_caller_starred() {
        let (addr, _, daemon, _handle) = spawn_test_daemon(Settings::default()).await;
        let mut first = connect(addr).await;
        read_greeting(&mut first).await;
        let mut second = connect(addr).await;
        read_greeting(&mut second).await;

        let mut caller = connect(addr).await;
        read_greeting(&mut caller).await;
        send(&mut caller, "STAT\n").await;

        let header = read_line(&mut caller).await;
        assert!(header.starts_with(" ID"), "header {header:?}");
        let mut starred = 0;
        for _ in 0..3 {
            let line = read_line(&mut caller).await;
            if line.starts_with('*') {
                starred += 1;
            }
        }
        assert_eq!(starred, 1);
        daemon.shutdown.cancel();
    }

    #[tokio::test]
    async fn stop_closes_sessions_and_exits() {
        let (addr, _, _daemon, handle) = spawn_test_daemon(Settings::default()).await;
        let mut bystander = connect(addr).await;
        read_greeting(&mut bystander).await;

        let mut stopper = connect(addr).await;
        read_greeting(&mut stopper).await;
        send(&mut stopper, "STOP\n").await;
        assert_eq!(read_line(&mut stopper).await, "OK STOP\n");

        // The bystander is torn down and the daemon exits cleanly.
        assert_eq!(read_line(&mut bystander).await, "");
        let result = timeout(Duration::from_secs(5), handle).await.unwrap();
        result.unwrap().unwrap();
    }

    #[tokio::test]
    async fn quit_closes_only_this_session() {
        let (addr, _, daemon, _handle) = spawn_test_daemon(Settings::default()).await;
        let mut staying = connect(addr).await;
        read_greeting(&mut staying).await;
        let mut leaving = connect(addr).await;
        read_greeting(&mut leaving).await;
        send(&mut leaving, "QUIT\n").await;
        assert_eq!(read_line(&mut leaving).await, "OK QUIT\n");
        assert_eq!(read_line(&mut leaving).await, "");
        // The other session is unaffected.
        send(&mut staying, "CAPA\n").await;
        assert_eq!(read_line(&mut staying).await, "OK CAPA BLKS RTIM NTFY CONN\n");
        daemon.shutdown.cancel();
    }

    #[tokio::test]
    async fn direct_listener_skips_setup_and_relays() {
        let remote = spawn_echo_remote().await;
        let settings = Settings {
            direct: vec![DirectPort {
                port: 0,
                conn_line: format!("CONN {remote}"),
            }],
            ..Settings::default()
        };
        let (_, direct_addrs, daemon, _handle) = spawn_test_daemon(settings).await;
        assert_eq!(direct_addrs.len(), 1);

        let mut client = connect(direct_addrs[0]).await;
        // No greeting, no setup: the very first line back is relayed data.
        send(&mut client, "ping\n").await;
        assert_eq!(read_line(&mut client).await, "ping\n");

        // The session shows up with an L-prefixed id.
        let ids: Vec<String> = daemon.sessions.snapshot().iter().map(|s| s.id.clone()).collect();
        assert!(ids.iter().any(|id| id.starts_with('L')), "ids {ids:?}");
        daemon.shutdown.cancel();
    }
}
