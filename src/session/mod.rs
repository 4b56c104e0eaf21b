pub mod command;
pub mod relay;
pub mod stat;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

/// Protocol identity announced in the greeting.
pub const IDENT: &str = "TOGGLEDBITS-SOCKPROXY";
/// Protocol version, announced in the greeting and in the notification
/// user agent.
pub const PROTO_VERSION: u32 = 1;

/// Default per-read block size on each leg.
pub const DEFAULT_BLOCK_SIZE: usize = 2048;
/// Client-leg idle window while a session is still in setup.
pub const SETUP_PEER_TIMEOUT: Duration = Duration::from_secs(30);
/// What STAT raises the caller's idle window to, so a human reading the
/// table is not disconnected mid-read. Finite so a stuck caller still
/// yields its slot eventually.
pub const STAT_PEER_TIMEOUT: Duration = Duration::from_secs(3600);

/// Subtracted from the unix clock before deriving session ids, to keep them
/// short. Only monotonicity matters.
const EPOCH_OFFSET: u64 = 1_577_836_800;

/// Session phase. Commands are interpreted only in `Setup`; once `Echo` is
/// entered the client leg is a transparent byte pipe, permanently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    Echo,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::Setup => "SETUP",
            Phase::Echo => "ECHO",
        }
    }
}

/// Notification binding set by `NTFY` or the `NTFY=` option of `CONN`.
/// A negative device disables notifications without clearing the binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub device: i64,
    pub service: String,
    pub action: String,
    pub pid: String,
}

/// Mutable portion of a session. Held behind a short-lived mutex so STAT
/// and the notification worker can observe sessions owned by other tasks.
#[derive(Debug)]
pub struct SessionState {
    pub phase: Phase,
    /// `host:port` of the dialed endpoint; empty until CONN succeeds.
    pub remote_addr: String,
    pub block_size: usize,
    /// Idle window on the client leg; zero disables.
    pub peer_timeout: Duration,
    /// Idle window on the remote leg; zero disables.
    pub remote_timeout: Duration,
    /// Minimum interval between notifications; zero disables pacing.
    pub notify_pace: Duration,
    pub last_peer: Instant,
    pub last_remote: Instant,
    pub last_notify: Option<Instant>,
    pub recv_from_remote: u64,
    pub sent_to_remote: u64,
    pub binding: Option<Binding>,
}

/// One proxied session. The owning task holds both sockets exclusively;
/// everything the rest of the daemon needs to see lives here.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub peer_addr: SocketAddr,
    pub created: Instant,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(id: String, peer_addr: SocketAddr) -> Self {
        let now = Instant::now();
        Session {
            id,
            peer_addr,
            created: now,
            state: Mutex::new(SessionState {
                phase: Phase::Setup,
                remote_addr: String::new(),
                block_size: DEFAULT_BLOCK_SIZE,
                peer_timeout: SETUP_PEER_TIMEOUT,
                remote_timeout: Duration::ZERO,
                notify_pace: Duration::ZERO,
                last_peer: now,
                last_remote: now,
                last_notify: None,
                recv_from_remote: 0,
                sent_to_remote: 0,
                binding: None,
            }),
        }
    }

    /// Run `f` with the state locked. Poisoning is not propagated; a
    /// panicked session task has already been logged and torn down.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Pid reported to the controller: the NTFY override, or the session id.
    pub fn pid(&self) -> String {
        self.with_state(|st| st.binding.as_ref().map(|b| b.pid.clone()))
            .unwrap_or_else(|| self.id.clone())
    }
}

/// Live-session map plus the monotonic id source.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    last_id: Mutex<u64>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            last_id: Mutex::new(0),
        }
    }

    /// Strictly monotonic id: a clock-derived decasecond value, bumped past
    /// the previous one on collision, rendered as lowercase hex.
    pub fn next_id(&self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let candidate = now.saturating_sub(EPOCH_OFFSET) / 10;
        let mut last = self.last_id.lock().unwrap_or_else(|e| e.into_inner());
        let id = if candidate > *last { candidate } else { *last + 1 };
        *last = id;
        format!("{id:x}")
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|r| Arc::clone(r.value()))
    }

    /// All live sessions, in no particular order.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|r| Arc::clone(r.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_strictly_increase() {
        let registry = SessionRegistry::new();
        let mut prev = 0u64;
        for _ in 0..64 {
            let id = registry.next_id();
            let value = u64::from_str_radix(&id, 16).expect("id is lowercase hex");
            assert!(value > prev, "{value:#x} not greater than {prev:#x}");
            prev = value;
        }
    }

    #[test]
    fn ids_are_lowercase_hex() {
        let registry = SessionRegistry::new();
        let id = registry.next_id();
        assert!(!id.is_empty());
        assert!(id.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)));
    }

    #[test]
    fn pid_defaults_to_session_id() {
        let session = Session::new("cafe12".to_string(), "127.0.0.1:1000".parse().unwrap());
        assert_eq!(session.pid(), "cafe12");
        session.with_state(|st| {
            st.binding = Some(Binding {
                device: 4,
                service: "urn:svc".to_string(),
                action: "Go".to_string(),
                pid: "custom".to_string(),
            })
        });
        assert_eq!(session.pid(), "custom");
    }

    #[test]
    fn registry_insert_get_remove() {
        let registry = SessionRegistry::new();
        let session = Arc::new(Session::new("1".to_string(), "127.0.0.1:2".parse().unwrap()));
        registry.insert(Arc::clone(&session));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("1").is_some());
        assert!(registry.remove("1").is_some());
        assert!(registry.is_empty());
        assert!(registry.get("1").is_none());
    }
}
