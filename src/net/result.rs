use std::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
    /// Received bytes do not conform to the native protocol.
    Protocol(String),
    /// Structurally valid but not supported by this client.
    Unimplemented(String),
    /// A well-formed exception packet from the server; carries the outermost
    /// display text.
    ServerException(String),
    /// Syscall failure other than would-block, labelled with the phase it
    /// interrupted.
    Io { phase: &'static str, source: io::Error },
}

impl Error {
    #[inline]
    pub(crate) fn io(phase: &'static str, source: io::Error) -> Error {
        Error::Io { phase, source }
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        Error::Io {
            phase: "io",
            source: io_error,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Error::Unimplemented(msg) => write!(f, "unimplemented: {}", msg),
            Error::ServerException(msg) => write!(f, "server exception: {}", msg),
            Error::Io { phase, source } => write!(f, "{} failed: {}", phase, source),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
