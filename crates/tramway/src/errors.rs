use std::io;

/// Lifecycle status of a [`ServiceConnection`](crate::ServiceConnection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// No channel; the connection has never connected or has lost its socket.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// A channel is live and sessions may be created.
    Connected,
    /// No new sessions are accepted; existing sessions run to completion,
    /// after which the manager releases the connection.
    Draining,
}

/// The closed error taxonomy used throughout the framework.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The operation requires an established channel but none exists.
    NotConnected,
    /// The operation conflicts with an in-flight connect or drain.
    WaitForConnection,
    /// The locator advertises a different protocol version than requested.
    BadVersion { requested: u32, advertised: u32 },
    /// No configured locator endpoint could be reached.
    LocatorUnavailable,
    /// The locator did not answer within the configured deadline.
    ResolveTimeout,
    /// A frame decoded but does not match the expected shape.
    BadResponse(String),
    /// The connection's manager has been dropped.
    BrokenManager,
    /// OS-level socket failure, wrapping the underlying error kind.
    Transport(io::ErrorKind),
    /// The session was cancelled by its caller before completion.
    Cancelled,
}

impl Error {
    pub(crate) fn transport(err: &io::Error) -> Self {
        Error::Transport(err.kind())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NotConnected => write!(f, "not connected"),
            Error::WaitForConnection => write!(f, "connect or drain in flight"),
            Error::BadVersion {
                requested,
                advertised,
            } => write!(
                f,
                "service version mismatch: requested {requested}, locator advertises {advertised}"
            ),
            Error::LocatorUnavailable => write!(f, "no locator endpoint reachable"),
            Error::ResolveTimeout => write!(f, "locator did not answer in time"),
            Error::BadResponse(what) => write!(f, "malformed response: {what}"),
            Error::BrokenManager => write!(f, "service manager is gone"),
            Error::Transport(kind) => write!(f, "transport error: {kind}"),
            Error::Cancelled => write!(f, "session cancelled"),
        }
    }
}

impl std::error::Error for Error {}
