use std::collections::{HashSet, VecDeque};
use std::fmt::Write as _;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::{Binding, PROTO_VERSION, SessionRegistry};

/// Total budget for one notification round trip.
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);
/// How often paced entries waiting in the queue are revisited.
const REVISIT: Duration = Duration::from_secs(1);

/// A queued notification. Entries reference sessions by id, never by
/// pointer, so they may outlive the session they were queued for; the
/// controller then observes the closed socket on its next read.
#[derive(Debug)]
struct Entry {
    session_id: String,
    url: String,
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<Entry>,
    /// Session ids with an entry in `queue`; enforces at most one queued
    /// notification per session.
    pending: HashSet<String>,
}

/// Per-session-coalesced queue of pending controller notifications, drained
/// by a single worker task so HTTP latency never blocks a relay.
pub struct NotifyQueue {
    inner: Mutex<Inner>,
    wakeup: Notify,
    client: reqwest::Client,
}

impl NotifyQueue {
    pub fn new() -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::CONNECTION,
            reqwest::header::HeaderValue::from_static("close"),
        );
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(HTTP_TIMEOUT)
            .user_agent(format!("sockproxyd-{PROTO_VERSION}"))
            .default_headers(headers)
            .build()?;
        Ok(Self {
            inner: Mutex::new(Inner::default()),
            wakeup: Notify::new(),
            client,
        })
    }

    /// Queue a notification for a session. No-op while one is already
    /// queued for that session; the coalesced arrivals are observed by the
    /// controller's read when it runs.
    pub fn push(&self, session_id: &str, url: String) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if !inner.pending.insert(session_id.to_string()) {
                return;
            }
            inner.queue.push_back(Entry {
                session_id: session_id.to_string(),
                url,
            });
        }
        self.wakeup.notify_one();
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).queue.is_empty()
    }

    #[cfg(test)]
    fn depth(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).queue.len()
    }

    /// Scan from the head for the first deliverable entry: its session is
    /// gone, or unpaced, or its pacing window has elapsed. Entries that are
    /// not yet eligible stay in place and are revisited.
    fn pop_eligible(&self, sessions: &SessionRegistry, now: Instant) -> Option<Entry> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let idx = inner.queue.iter().position(|e| match sessions.get(&e.session_id) {
            None => true,
            Some(s) => s.with_state(|st| {
                st.notify_pace.is_zero()
                    || st.last_notify.is_none_or(|t| t + st.notify_pace <= now)
            }),
        })?;
        let entry = inner.queue.remove(idx)?;
        inner.pending.remove(&entry.session_id);
        Some(entry)
    }

    /// Drain loop. One dispatch at a time; exits once shutdown is requested
    /// and nothing is left to deliver.
    pub async fn run(&self, sessions: &SessionRegistry, shutdown: CancellationToken) {
        loop {
            let now = Instant::now();
            if let Some(entry) = self.pop_eligible(sessions, now) {
                if let Some(session) = sessions.get(&entry.session_id) {
                    session.with_state(|st| st.last_notify = Some(now));
                }
                self.dispatch(&entry).await;
                continue;
            }
            if shutdown.is_cancelled() {
                if self.is_empty() {
                    return;
                }
                // Remaining entries become deliverable as their sessions
                // finish tearing down.
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
            tokio::select! {
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(REVISIT) => {}
                _ = shutdown.cancelled() => {}
            }
        }
    }

    /// Fire-and-forget GET; the response body is discarded. A 401 means the
    /// bound action or service is not defined on the controller.
    async fn dispatch(&self, entry: &Entry) {
        debug!(session = %entry.session_id, url = %entry.url, "notifying controller");
        match self.client.get(&entry.url).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) if resp.status() == reqwest::StatusCode::UNAUTHORIZED => {
                warn!(
                    session = %entry.session_id,
                    "controller rejected notification (401): action or service not defined"
                );
            }
            Ok(resp) => {
                info!(session = %entry.session_id, status = %resp.status(), "controller notification not accepted");
            }
            Err(e) => {
                info!(session = %entry.session_id, error = %e, "controller notification failed");
            }
        }
    }
}

/// Build the controller `data_request` URL for a binding.
pub fn request_url(base: &str, binding: &Binding) -> String {
    let base = base.trim_end_matches('/');
    format!(
        "{base}/data_request?id=action&output_format=json&DeviceNum={}&serviceId={}&action={}&Pid={}",
        binding.device,
        urlencode(&binding.service),
        urlencode(&binding.action),
        urlencode(&binding.pid),
    )
}

/// Percent-encode everything outside RFC 3986 unreserved characters, with
/// lowercase hex digits.
fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => {
                let _ = write!(out, "%{b:02x}");
            }
        }
    }
    out
}
