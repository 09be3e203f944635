use crate::address::peer_address::PeerAddress;
use crate::communication::point_to_point::Leg;
use std::io;
use std::time::Duration;
use thiserror::Error;

/**
 * Every failure the link subsystem can report. Each variant is a terminal
 * outcome of the operation that returned it; none of them is process-fatal and
 * a caller may retry after any of them.
 */
#[derive(Debug, Error)]
pub enum Error {
    ///The peer URL text could not be parsed.
    #[error("invalid peer url {input:?}: {reason}")]
    PeerUrlFormat { input: String, reason: &'static str },

    ///The host of a peer address did not resolve to any socket address.
    #[error("could not resolve {address}")]
    Resolve {
        address: PeerAddress,
        #[source]
        source: io::Error,
    },

    ///A leg reached the race deadline without producing a usable socket.
    #[error("{leg} leg timed out after {after:?}")]
    Timeout { leg: Leg, after: Duration },

    ///The outbound leg hit a dial error that retrying cannot fix.
    #[error("dialing {address} failed")]
    Dial {
        address: PeerAddress,
        #[source]
        source: io::Error,
    },

    ///The inbound leg could not bind its listening socket.
    #[error("could not bind {address}")]
    Bind {
        address: PeerAddress,
        #[source]
        source: io::Error,
    },

    ///The listening socket failed while accepting.
    #[error("accepting connections failed")]
    Accept(#[source] io::Error),

    ///A live socket was obtained but did not belong to the expected peer.
    #[error("handshake on the {leg} leg failed: {reason}")]
    Handshake { leg: Leg, reason: HandshakeFailure },

    ///The caller aborted the operation.
    #[error("connect was cancelled")]
    Cancelled,

    ///The operation is not allowed in the current state. No I/O was done.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    ///Both legs of a race failed.
    #[error("bilateral connect failed (outbound: {outbound}; inbound: {inbound})")]
    Bilateral {
        outbound: Box<Error>,
        inbound: Box<Error>,
    },

    ///The link could not be established.
    #[error("link failed: {0}")]
    LinkFailed(#[source] Box<Error>),

    ///The peer closed the connection with a disconnect frame.
    #[error("peer disconnected")]
    PeerDisconnected,

    ///The transport failed without a disconnect frame.
    #[error("connection lost")]
    ConnectionLost(#[source] FrameError),

    ///The connection was already closed.
    #[error("connection is closed")]
    Closed,

    ///A frame could not be written or read outside of an established connection.
    #[error(transparent)]
    Frame(#[from] FrameError),

    ///Local or external address discovery failed.
    #[error("address discovery failed: {0}")]
    Discovery(String),

    ///The configuration file could not be loaded.
    #[error("configuration error: {0}")]
    Configuration(String),

    ///A race worker thread could not be started.
    #[error("could not spawn a connector worker thread")]
    Spawn(#[source] io::Error),

    ///A race worker thread panicked.
    #[error("a connector worker thread panicked")]
    WorkerPanicked,
}

/**
 * Flat taxonomy of the error variants, for callers that only need to branch
 * on the category of a failure.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Format,
    Resolve,
    Timeout,
    Dial,
    Bind,
    Accept,
    Handshake,
    Cancelled,
    IllegalState,
    Bilateral,
    PeerDisconnected,
    ConnectionLost,
    Closed,
    Frame,
    Discovery,
    Configuration,
    Internal,
}

impl Error {
    /**
     * Returns the category of this error. An aggregate of two timeouts is a
     * timeout, and a link failure has the kind of its cause.
     */
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PeerUrlFormat { .. } => ErrorKind::Format,
            Error::Resolve { .. } => ErrorKind::Resolve,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Dial { .. } => ErrorKind::Dial,
            Error::Bind { .. } => ErrorKind::Bind,
            Error::Accept(_) => ErrorKind::Accept,
            Error::Handshake { .. } => ErrorKind::Handshake,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::IllegalState(_) => ErrorKind::IllegalState,
            Error::Bilateral { outbound, inbound } => {
                if outbound.kind() == ErrorKind::Timeout && inbound.kind() == ErrorKind::Timeout {
                    ErrorKind::Timeout
                } else {
                    ErrorKind::Bilateral
                }
            }
            Error::LinkFailed(cause) => cause.kind(),
            Error::PeerDisconnected => ErrorKind::PeerDisconnected,
            Error::ConnectionLost(_) => ErrorKind::ConnectionLost,
            Error::Closed => ErrorKind::Closed,
            Error::Frame(_) => ErrorKind::Frame,
            Error::Discovery(_) => ErrorKind::Discovery,
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::Spawn(_) | Error::WorkerPanicked => ErrorKind::Internal,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    /**
     * Terminal cause of the outbound leg, if this is (or wraps) a bilateral
     * failure.
     */
    pub fn outbound_cause(&self) -> Option<&Error> {
        match self {
            Error::Bilateral { outbound, .. } => Some(outbound),
            Error::LinkFailed(cause) => cause.outbound_cause(),
            _ => None,
        }
    }

    /**
     * Terminal cause of the inbound leg, if this is (or wraps) a bilateral
     * failure.
     */
    pub fn inbound_cause(&self) -> Option<&Error> {
        match self {
            Error::Bilateral { inbound, .. } => Some(inbound),
            Error::LinkFailed(cause) => cause.inbound_cause(),
            _ => None,
        }
    }
}

/**
 * Reasons a handshake rejects a socket.
 */
#[derive(Debug, Error)]
pub enum HandshakeFailure {
    #[error("peer does not speak the link protocol")]
    BadMagic,

    #[error("protocol version mismatch (local {local}, remote {remote})")]
    VersionMismatch { local: u16, remote: u16 },

    #[error("peer announced listen port {announced}, expected {expected}")]
    UnexpectedPort { expected: u16, announced: u16 },

    #[error("connected to ourselves")]
    SelfConnection,

    #[error("unexpected handshake message")]
    UnexpectedMessage,

    #[error("peer did not complete the handshake in time")]
    TimedOut,

    #[error("transport failed during the handshake")]
    Transport(#[source] FrameError),
}

/**
 * Failures of the length-delimited frame codec.
 */
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error")]
    Io(#[from] io::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },

    #[error("frame payload could not be encoded or decoded")]
    Codec(#[from] bincode::Error),
}

impl FrameError {
    /**
     * True when the stream ended or a read timed out before any byte of the
     * frame arrived.
     */
    pub fn is_timeout(&self) -> bool {
        match self {
            FrameError::Io(e) => {
                matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
            }
            _ => false,
        }
    }
}
