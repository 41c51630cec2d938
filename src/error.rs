use std::io;

/// Errors produced by reactor operations.
///
/// Setup-time violations (bad arguments, duplicate tags) are returned
/// synchronously from the call that detected them. Operation-time failures
/// (refused connects, timeouts, TLS or proxy rejection) are delivered
/// through the registered callback, exactly once.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Native socket or event-loop error, passed through verbatim.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// An operation exceeded its deadline.
    #[error("operation timed out")]
    Timeout,
    /// The caller supplied an argument the operation cannot act on.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// TLS handshake, encryption, or decryption failure.
    #[error("tls error: {0}")]
    Tls(String),
    /// The SOCKS5 proxy rejected the offered authentication methods.
    #[error("proxy rejected authentication")]
    ProxyAuth,
    /// The SOCKS5 proxy answered CONNECT with a non-success reply code.
    #[error("proxy connect rejected: reply code {0:#04x}")]
    ProxyReply(u8),
    /// Operation attempted on an object with no live native handle.
    #[error("not connected")]
    NotConnected,
}

impl Error {
    pub(crate) fn tls(e: impl std::fmt::Display) -> Self {
        Error::Tls(e.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Error::Timeout.to_string(), "operation timed out");
        assert_eq!(
            Error::ProxyReply(0x05).to_string(),
            "proxy connect rejected: reply code 0x05"
        );
        assert_eq!(
            Error::InvalidArgument("duplicate tag").to_string(),
            "invalid argument: duplicate tag"
        );
    }

    #[test]
    fn test_io_conversion() {
        let e: Error = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert!(matches!(e, Error::Io(_)));
    }
}
