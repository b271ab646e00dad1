use std::io;
use std::net;

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Two-level error spine used across the toolkit. `Incomplete` is the
/// recoverable "not enough bytes yet" signal; everything else is fatal to
/// the operation (and usually to the channel).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NetworkError {
    Incomplete,
    Fatal(ErrorType),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorType {
    Protocol(ProtocolError),
    Io(io::ErrorKind),
    Tls,
    Aborted,
    Unhandled,
    Disposed,
    InvalidArgument,
    OutOfRange,
    AddrParse,
}

/// Malformed wire data. These map one-to-one onto the failure points of the
/// protocol codecs.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProtocolError {
    HuffmanDecode,
    InvalidIndex,
    FrameSize,
    BadOpcode,
    TruncatedBlock,
    IllegalSizeUpdate,
    HeaderTooLarge,
    Handshake,
    Malformed,
}

impl NetworkError {
    /// Shorthand for a fatal protocol error.
    #[inline]
    pub fn protocol(kind: ProtocolError) -> NetworkError {
        NetworkError::Fatal(ErrorType::Protocol(kind))
    }
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Incomplete,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorType::AddrParse)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Incomplete) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_folds_to_incomplete() {
        let error: NetworkError = io::Error::from(io::ErrorKind::WouldBlock).into();

        assert_eq!(error, NetworkError::Incomplete);
    }

    #[test]
    fn test_io_error_folds_to_fatal() {
        let error: NetworkError = io::Error::from(io::ErrorKind::BrokenPipe).into();

        assert_eq!(error, NetworkError::Fatal(ErrorType::Io(io::ErrorKind::BrokenPipe)));
    }

    #[test]
    fn test_has_failed() {
        assert!(!Ok::<(), NetworkError>(()).has_failed());
        assert!(!Err::<(), _>(NetworkError::Incomplete).has_failed());
        assert!(Err::<(), _>(NetworkError::Fatal(ErrorType::Aborted)).has_failed());
    }
}
