use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tracing::info;

use super::{Binding, Phase, STAT_PEER_TIMEOUT, Session, stat};
use crate::daemon::Daemon;
use crate::error::ProxyError;

/// Bound on a CONN dial so a dead endpoint cannot wedge the session task.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// What the relay loop does after a command has been handled. The reply, if
/// any, is written before the action is taken.
pub enum Action {
    /// Keep reading setup lines.
    Continue,
    /// CONN succeeded: relay everything through this remote socket from now
    /// on. Command parsing stops permanently.
    Echo(TcpStream),
    /// Close the session.
    Close,
    /// Daemon-wide shutdown.
    Stop,
}

pub struct Outcome {
    pub reply: String,
    pub action: Action,
}

impl Outcome {
    fn ok(cmd: &str, extra: Option<&str>) -> Self {
        let reply = match extra {
            Some(extra) => format!("OK {cmd} {extra}\n"),
            None => format!("OK {cmd}\n"),
        };
        Outcome {
            reply,
            action: Action::Continue,
        }
    }

    /// ERR reply for a malformed command; the session is closed afterwards.
    fn err_close(cmd: &str, detail: &str) -> Self {
        Outcome {
            reply: format!("ERR {cmd} {detail}\n"),
            action: Action::Close,
        }
    }

    /// ERR reply for a failed CONN; the session stays in setup.
    fn err_conn(detail: &str) -> Self {
        Outcome {
            reply: format!("ERR CONN {detail}\n"),
            action: Action::Continue,
        }
    }
}

/// Parse and execute one setup-mode command line. Lines are case-sensitive
/// and tokens are separated by spaces or tabs; `\r` is an ordinary byte,
/// never a terminator.
pub async fn execute(daemon: &Daemon, session: &Arc<Session>, line: &str) -> Outcome {
    let mut tokens = line.split([' ', '\t']).filter(|t| !t.is_empty());
    let Some(cmd) = tokens.next() else {
        // Blank line; nothing to do.
        return Outcome {
            reply: String::new(),
            action: Action::Continue,
        };
    };
    let args: Vec<&str> = tokens.collect();

    match cmd {
        "CONN" => conn(session, &args).await,
        "NTFY" => ntfy(session, &args),
        "RTIM" => rtim(session, &args),
        "BLKS" => blks(session, &args),
        "PACE" => pace(session, &args),
        "STAT" => stat_cmd(daemon, session),
        "CAPA" => Outcome::ok("CAPA", Some("BLKS RTIM NTFY CONN")),
        "HELP" => help(),
        "QUIT" => Outcome {
            reply: "OK QUIT\n".to_string(),
            action: Action::Close,
        },
        "STOP" => Outcome {
            reply: "OK STOP\n".to_string(),
            action: Action::Stop,
        },
        _ => Outcome {
            reply: "ERR INVALID COMMAND\n".to_string(),
            action: Action::Close,
        },
    }
}

/// Options staged while a CONN line is parsed; applied only once the dial
/// has succeeded, so a failed CONN leaves the session untouched.
#[derive(Default)]
struct ConnOpts {
    rtim: Option<Duration>,
    blks: Option<usize>,
    pace: Option<Duration>,
    ntfy: Option<Binding>,
}

async fn conn(session: &Arc<Session>, args: &[&str]) -> Outcome {
    let Some((endpoint, opt_tokens)) = args.split_first() else {
        return Outcome::err_conn("Invalid address");
    };
    let Some(addr) = parse_endpoint(endpoint) else {
        return Outcome::err_conn("Invalid address");
    };
    let opts = match parse_options(session, opt_tokens) {
        Ok(opts) => opts,
        Err(tok) => return Outcome::err_conn(&format!("Invalid option {tok}")),
    };

    let remote = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            let err = ProxyError::Dial {
                addr,
                detail: e.to_string(),
            };
            info!(session = %session.id, "{err}");
            return Outcome::err_conn(&e.to_string());
        }
        Err(_) => {
            let err = ProxyError::Dial {
                addr,
                detail: "timeout".to_string(),
            };
            info!(session = %session.id, "{err}");
            return Outcome::err_conn("timeout");
        }
    };
    let _ = remote.set_nodelay(true);

    session.with_state(|st| {
        st.phase = Phase::Echo;
        st.remote_addr = addr;
        if let Some(d) = opts.rtim {
            st.remote_timeout = d;
        }
        if let Some(n) = opts.blks {
            st.block_size = n;
        }
        if let Some(p) = opts.pace {
            st.notify_pace = p;
        }
        if let Some(b) = opts.ntfy {
            st.binding = Some(b);
        }
        // Entering echo replaces the setup window with the remote window on
        // both legs.
        st.peer_timeout = st.remote_timeout;
        st.last_remote = Instant::now();
    });

    let pid = session.pid();
    Outcome {
        reply: format!("OK CONN {pid}\n"),
        action: Action::Echo(remote),
    }
}

/// `host:port`: host is any non-`:` sequence, port is decimal digits.
fn parse_endpoint(token: &str) -> Option<String> {
    let (host, port) = token.split_once(':')?;
    if host.is_empty() {
        return None;
    }
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    Some(format!("{host}:{port}"))
}

fn parse_options<'a>(session: &Session, tokens: &[&'a str]) -> Result<ConnOpts, &'a str> {
    let mut opts = ConnOpts::default();
    for &tok in tokens {
        let Some((key, value)) = tok.split_once('=') else {
            return Err(tok);
        };
        match key {
            "RTIM" => {
                let ms: u64 = value.parse().map_err(|_| tok)?;
                opts.rtim = Some(Duration::from_millis(ms));
            }
            "BLKS" => {
                let n: usize = value.parse().map_err(|_| tok)?;
                if n == 0 {
                    return Err(tok);
                }
                opts.blks = Some(n);
            }
            "PACE" => {
                let secs: f64 = value.parse().map_err(|_| tok)?;
                if !secs.is_finite() || secs < 0.0 {
                    return Err(tok);
                }
                opts.pace = Some(Duration::from_secs_f64(secs));
            }
            "NTFY" => {
                let parts: Vec<&str> = value.split('/').collect();
                if parts.len() < 3 || parts.len() > 4 {
                    return Err(tok);
                }
                opts.ntfy = Some(Binding {
                    device: parts[0].parse().unwrap_or(-1),
                    service: parts[1].to_string(),
                    action: parts[2].to_string(),
                    pid: parts
                        .get(3)
                        .map_or_else(|| session.id.clone(), |p| p.to_string()),
                });
            }
            _ => return Err(tok),
        }
    }
    Ok(opts)
}

fn ntfy(session: &Arc<Session>, args: &[&str]) -> Outcome {
    if args.len() < 3 || args.len() > 4 {
        return Outcome::err_close("NTFY", "Invalid arguments");
    }
    let device = args[0].parse::<i64>().unwrap_or(-1);
    session.with_state(|st| {
        let pid = match args.get(3) {
            Some(p) => p.to_string(),
            // Absent pid leaves a previous override in place.
            None => st
                .binding
                .as_ref()
                .map_or_else(|| session.id.clone(), |b| b.pid.clone()),
        };
        st.binding = Some(Binding {
            device,
            service: args[1].to_string(),
            action: args[2].to_string(),
            pid,
        });
    });
    Outcome::ok("NTFY", None)
}

fn rtim(session: &Arc<Session>, args: &[&str]) -> Outcome {
    match args {
        [ms] => match ms.parse::<u64>() {
            Ok(ms) => {
                session.with_state(|st| st.remote_timeout = Duration::from_millis(ms));
                Outcome::ok("RTIM", None)
            }
            Err(_) => Outcome::err_close("RTIM", "Invalid timeout"),
        },
        _ => Outcome::err_close("RTIM", "Invalid timeout"),
    }
}

fn blks(session: &Arc<Session>, args: &[&str]) -> Outcome {
    match args {
        [n] => match n.parse::<usize>() {
            Ok(n) if n > 0 => {
                session.with_state(|st| st.block_size = n);
                Outcome::ok("BLKS", None)
            }
            _ => Outcome::err_close("BLKS", "Invalid block size"),
        },
        _ => Outcome::err_close("BLKS", "Invalid block size"),
    }
}

fn pace(session: &Arc<Session>, args: &[&str]) -> Outcome {
    match args {
        [secs] => match secs.parse::<f64>() {
            Ok(secs) if secs.is_finite() && secs >= 0.0 => {
                session.with_state(|st| st.notify_pace = Duration::from_secs_f64(secs));
                Outcome::ok("PACE", None)
            }
            _ => Outcome::err_close("PACE", "Invalid pace"),
        },
        _ => Outcome::err_close("PACE", "Invalid pace"),
    }
}

fn stat_cmd(daemon: &Daemon, caller: &Arc<Session>) -> Outcome {
    // Give a human caller time to read the table without being idled out.
    caller.with_state(|st| st.peer_timeout = STAT_PEER_TIMEOUT);
    Outcome {
        reply: stat::render(&daemon.sessions, &caller.id),
        action: Action::Continue,
    }
}

fn help() -> Outcome {
    let text = "\
CONN host:port [RTIM=ms] [BLKS=n] [PACE=secs] [NTFY=dev/sid/act[/pid]]
NTFY dev sid act [pid]
RTIM ms
BLKS nbytes
PACE seconds
STAT
CAPA
HELP
QUIT
STOP
";
    Outcome {
        reply: text.to_string(),
        action: Action::Continue,
    }
}
