//! Error kinds shared across the name server, the bus, and the chat server.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Unknown uri or user. Surfaced to callers as null/404 fields, never fatal.
    #[error("lookup miss: {0}")]
    LookupMiss(String),

    /// The name server rejected us or could not be reached at boot.
    /// Fatal for the server process.
    #[error("registration refused: {0}")]
    RegistrationRefused(String),

    /// Replica dial or emit failed. The link is dropped and the server
    /// continues unreplicated.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    /// No victim, victim timeout, or migration target unreachable.
    /// Retried on the next cycle.
    #[error("migration aborted: {0}")]
    MigrationAborted(String),

    /// Connect with a name already held by a live user.
    #[error("username {0} is invalid or already taken")]
    DuplicateName(String),

    /// Undecodable or oversized wire input. Dropped and logged.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// The server refused the connection (migrating, simulated down, or a
    /// refusal bubbled up from a middleware).
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// An emit-with-ack ran out of time.
    #[error("ack timeout for {0}")]
    AckTimeout(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl Error {
    /// True for failures a caller should swallow at the emit site to keep
    /// the local server live.
    pub fn is_peer_failure(&self) -> bool {
        matches!(
            self,
            Error::PeerUnreachable(_) | Error::AckTimeout(_) | Error::Io(_)
        )
    }
}
