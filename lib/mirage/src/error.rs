use std::fmt;
use std::io;
use std::sync::Mutex;

pub type Result<T> = ::std::result::Result<T, Error>;

/// Tunnel-level error. Everything is `Clone + Eq` so a latched close cause can
/// be handed back verbatim to every later caller; `io::Error` is folded down
/// to its kind for the same reason.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// Underlying raw, capture or socket I/O failed. Fatal to the owning object.
    Io(io::ErrorKind),
    /// The handshake failed; the connection never opened.
    Handshake(HandshakeError),
    /// A received segment broke the fake-TCP contract. Tolerated up to the
    /// receive-error budget.
    Frame(FrameError),
    /// AEAD open failed. Tolerated up to the receive-error budget.
    Crypto,
    /// A session operation failed. Fatal to the session, not the connection.
    Session(SessionError),
    /// The object was already closed; the stored cause has been returned before.
    Closed,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum HandshakeError {
    /// The peer's scripted packet at this index did not match ours.
    PrevPacketInvalid(usize),
    /// The key-exchange material did not validate.
    BadSign,
    /// The server refused the token with this message.
    Rejected(String),
    Timeout,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FrameError {
    /// SYN, FIN or RST set, or ACK missing.
    Flags,
    /// Ports did not match the connection's 4-tuple.
    Tuple,
    /// Segment too short to carry a frame.
    Short,
    /// Zero-length payload.
    Empty,
    /// Frame would not fit in one segment at the current MTU.
    Oversize,
    /// Frame content did not decode.
    Malformed,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SessionError {
    /// A live session already has this descriptor.
    DuplicateDescriptor,
    UnknownId(u16),
    /// No traffic for two keepalive periods.
    KeepaliveExceeded,
    /// The descriptor matches the tunnel's own control 4-tuple.
    ProxySelf,
    /// All 65535 session ids are live.
    Exhausted,
    /// The peer refused the session with this message.
    Remote(String),
}

impl Error {
    /// True for per-packet errors the downlink loop absorbs (up to its budget)
    /// instead of poisoning the connection.
    #[inline]
    pub fn tolerated(&self) -> bool {
        match self {
            Error::Frame(_) | Error::Crypto => true,
            Error::Session(SessionError::UnknownId(_)) => true,
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        Error::Io(io_error.kind())
    }
}

impl From<HandshakeError> for Error {
    #[inline]
    fn from(err: HandshakeError) -> Self {
        Error::Handshake(err)
    }
}

impl From<FrameError> for Error {
    #[inline]
    fn from(err: FrameError) -> Self {
        Error::Frame(err)
    }
}

impl From<SessionError> for Error {
    #[inline]
    fn from(err: SessionError) -> Self {
        Error::Session(err)
    }
}

impl From<vapor::shared::WireError> for Error {
    #[inline]
    fn from(err: vapor::shared::WireError) -> Self {
        match err {
            vapor::shared::WireError::Truncated => Error::Frame(FrameError::Short),
            vapor::shared::WireError::Malformed => Error::Frame(FrameError::Malformed),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(kind) => write!(f, "i/o error: {:?}", kind),
            Error::Handshake(err) => write!(f, "handshake failed: {}", err),
            Error::Frame(err) => write!(f, "bad segment: {:?}", err),
            Error::Crypto => write!(f, "decryption failed"),
            Error::Session(err) => write!(f, "session error: {}", err),
            Error::Closed => write!(f, "already closed"),
        }
    }
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HandshakeError::PrevPacketInvalid(index) => {
                write!(f, "previous packet {} is invalid", index)
            }
            HandshakeError::BadSign => write!(f, "key material did not validate"),
            HandshakeError::Rejected(msg) => write!(f, "rejected by peer: {}", msg),
            HandshakeError::Timeout => write!(f, "timed out"),
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionError::DuplicateDescriptor => write!(f, "descriptor already proxied"),
            SessionError::UnknownId(id) => write!(f, "unknown session id {}", id),
            SessionError::KeepaliveExceeded => write!(f, "keepalive exceeded"),
            SessionError::ProxySelf => write!(f, "refusing to proxy the tunnel itself"),
            SessionError::Exhausted => write!(f, "session ids exhausted"),
            SessionError::Remote(msg) => write!(f, "peer refused session: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

/// A write-once error slot. The first `set` wins and every later reader sees
/// that first cause, which gives `close` its idempotent, cause-latching
/// behavior.
pub struct CloseSlot {
    cause: Mutex<Option<Error>>,
}

impl CloseSlot {
    #[inline]
    pub fn new() -> CloseSlot {
        CloseSlot {
            cause: Mutex::new(None),
        }
    }

    /// Stores the cause if the slot is empty. Returns true when this call won
    /// the race and the caller should run the actual teardown.
    #[inline]
    pub fn set(&self, cause: Error) -> bool {
        let mut slot = self.cause.lock().expect("Close slot poisoned");
        match *slot {
            Some(_) => false,
            None => {
                *slot = Some(cause);
                true
            }
        }
    }

    /// The latched cause, if any.
    #[inline]
    pub fn get(&self) -> Option<Error> {
        self.cause.lock().expect("Close slot poisoned").clone()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.cause.lock().expect("Close slot poisoned").is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_slot_first_cause_wins() {
        let slot = CloseSlot::new();

        assert!(slot.set(Error::Crypto));
        assert!(!slot.set(Error::Io(io::ErrorKind::BrokenPipe)));

        assert_eq!(slot.get(), Some(Error::Crypto));
        assert!(slot.is_closed());
    }

    #[test]
    fn test_io_error_folds_to_kind() {
        let err: Error = io::Error::new(io::ErrorKind::TimedOut, "whatever").into();
        assert_eq!(err, Error::Io(io::ErrorKind::TimedOut));
    }

    #[test]
    fn test_tolerated_classification() {
        assert!(Error::Crypto.tolerated());
        assert!(Error::Frame(FrameError::Flags).tolerated());
        assert!(Error::Session(SessionError::UnknownId(9)).tolerated());
        assert!(!Error::Io(io::ErrorKind::BrokenPipe).tolerated());
        assert!(!Error::Closed.tolerated());
        assert!(!Error::Session(SessionError::KeepaliveExceeded).tolerated());
    }
}
