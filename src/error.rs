use std::io;

use thiserror::Error;

/// Why a session ended, beyond a normal close. None of these are fatal to
/// the daemon; the owning task logs them with the session id and tears the
/// session down symmetrically.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Malformed input from the client during setup.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// CONN could not reach the remote endpoint.
    #[error("dial {addr}: {detail}")]
    Dial { addr: String, detail: String },

    /// Non-timeout I/O error on the client leg.
    #[error("client leg: {0}")]
    PeerIo(#[source] io::Error),

    /// Non-timeout I/O error on the remote leg.
    #[error("remote leg: {0}")]
    RemoteIo(#[source] io::Error),

    /// An idle window elapsed with no traffic on one leg.
    #[error("{leg} leg idle for {ms}ms")]
    IdleTimeout { leg: &'static str, ms: u64 },
}
