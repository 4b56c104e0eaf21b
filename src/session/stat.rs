use std::fmt::Write as _;
use std::time::{Duration, Instant};

use super::SessionRegistry;

/// Render the STAT table: a header line, then one line per live session in
/// no particular order. The caller's line is marked with `*`.
pub fn render(sessions: &SessionRegistry, caller_id: &str) -> String {
    let now = Instant::now();
    let mut out = String::new();
    let _ = writeln!(
        out,
        " {:<10} {:<5} {:>6} {:>6} {:<21} {:<21} {:>10} {:>10} NOTIFY",
        "ID", "STATE", "IDLE", "UP", "PEER", "REMOTE", "RECV", "XMIT",
    );
    for session in sessions.snapshot() {
        let selector = if session.id == caller_id { '*' } else { ' ' };
        let (phase, idle, remote, recv, xmit, binding) = session.with_state(|st| {
            (
                st.phase.name(),
                now.saturating_duration_since(st.last_remote),
                st.remote_addr.clone(),
                st.recv_from_remote,
                st.sent_to_remote,
                st.binding
                    .as_ref()
                    .map(|b| format!("{}/{}/{}/{}", b.device, b.service, b.action, b.pid))
                    .unwrap_or_default(),
            )
        });
        let _ = writeln!(
            out,
            "{selector}{:<10} {:<5} {:>6} {:>6} {:<21} {:<21} {:>10} {:>10} {binding}",
            session.id,
            phase,
            fmt_interval(idle),
            fmt_interval(now.saturating_duration_since(session.created)),
            session.peer_addr,
            remote,
            recv,
            xmit,
        );
    }
    out
}

/// `MMmSS` up to 99 minutes, `HHhMM` beyond that.
pub fn fmt_interval(d: Duration) -> String {
    let secs = d.as_secs();
    let mins = secs / 60;
    if mins >= 100 {
        format!("{:02}h{:02}", mins / 60, mins % 60)
    } else {
        format!("{:02}m{:02}", mins, secs % 60)
    }
}
