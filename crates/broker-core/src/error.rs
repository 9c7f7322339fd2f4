use std::fmt;
use std::io;
use std::net;

/// Fatal, startup-time error. Anything that reaches the CLI boundary is one of these.
#[derive(Debug)]
pub enum BrokerError {
    Io(io::Error),
    AddrParse(net::AddrParseError),
    Config(String),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Io(err) => write!(f, "I/O error: {}", err),
            BrokerError::AddrParse(err) => write!(f, "invalid address: {}", err),
            BrokerError::Config(msg) => write!(f, "configuration error: {}", msg),
        }
    }
}

impl std::error::Error for BrokerError {}

impl From<io::Error> for BrokerError {
    fn from(err: io::Error) -> Self {
        BrokerError::Io(err)
    }
}

impl From<net::AddrParseError> for BrokerError {
    fn from(err: net::AddrParseError) -> Self {
        BrokerError::AddrParse(err)
    }
}

/// Reason a connection or ledger was fatally terminated.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum FatalReason {
    PeerClosed,
    OversizeTransfer,
    UnknownOp,
    BaseAheadOfLedger,
    BadHandshake,
    BufferSaturated,
    LedgerCorrupt,
    LedgerIo,
    RxTimeout,
    InvalidKey,
    ServerShutdown,
    Io(io::ErrorKind),
}

impl fmt::Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalReason::PeerClosed => write!(f, "peer closed the connection"),
            FatalReason::OversizeTransfer => write!(f, "oversize transfer payload"),
            FatalReason::UnknownOp => write!(f, "unknown op"),
            FatalReason::BaseAheadOfLedger => write!(f, "ledgerBase ahead of ledger"),
            FatalReason::BadHandshake => write!(f, "invalid handshake"),
            FatalReason::BufferSaturated => write!(f, "buffer saturated"),
            FatalReason::LedgerCorrupt => write!(f, "ledger file corrupt"),
            FatalReason::LedgerIo => write!(f, "ledger I/O failure"),
            FatalReason::RxTimeout => write!(f, "receive timeout"),
            FatalReason::InvalidKey => write!(f, "entry key 0 is reserved"),
            FatalReason::ServerShutdown => write!(f, "server shutting down"),
            FatalReason::Io(kind) => write!(f, "I/O error: {:?}", kind),
        }
    }
}

/// Two-variant result used throughout the connection and ledger hot paths: `Wait` is not
/// an error (EAGAIN/EWOULDBLOCK, or "not enough data yet") and must never be logged or
/// treated as a disconnect reason; `Fatal` always invalidates the affected slot.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum NetError {
    Wait,
    Fatal(FatalReason),
}

pub type NetResult<T> = Result<T, NetError>;

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            kind => NetError::Fatal(FatalReason::Io(kind)),
        }
    }
}

/// Mirrors `neutronium::net::shared::ErrorUtils`, letting call sites written as
/// `result.has_failed()` treat `Wait` as success rather than matching on the variant by hand.
pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetResult<T> {
    fn has_failed(&self) -> bool {
        !matches!(self, Ok(_) | Err(NetError::Wait))
    }
}
