//! Error types for the GDS store
//!
//! Not-found and exists-outside-scope are ordinary lookup outcomes that
//! callers branch on; type mismatches, out-of-memory and bad parameters
//! abort the operation that raised them.

use thiserror::Error;

/// Common result type for GDS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for GDS operations
#[derive(Debug, Error)]
pub enum Error {
    // Lookup outcomes
    #[error("not found: {0}")]
    NotFound(String),

    #[error("key {key} exists only outside scope {scope}")]
    ExistsOutsideScope { key: String, scope: String },

    /// Optional data is missing; callers move on to the next source
    #[error("data value not found")]
    DataValueNotFound,

    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),

    // Structural failures
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("bad parameter: {0}")]
    BadParam(String),

    #[error("out of memory: requested {requested} bytes, available {available} bytes")]
    OutOfMemory { requested: usize, available: usize },

    #[error("not supported: {0}")]
    NotSupported(String),

    // Shared memory
    #[error("segment error: {0}")]
    Segment(String),

    #[error("segment mapped at {actual:#x} instead of requested {requested:#x}")]
    AddressMismatch { requested: usize, actual: usize },

    // Wire and transport
    #[error("unpack read past end of buffer")]
    EndOfBuffer,

    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a type mismatch error
    pub fn type_mismatch(msg: impl Into<String>) -> Self {
        Self::TypeMismatch(msg.into())
    }

    /// Create a bad parameter error
    pub fn bad_param(msg: impl Into<String>) -> Self {
        Self::BadParam(msg.into())
    }

    /// Create a not supported error
    pub fn not_supported(feature: impl Into<String>) -> Self {
        Self::NotSupported(feature.into())
    }

    /// Create a segment error
    pub fn segment(msg: impl Into<String>) -> Self {
        Self::Segment(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::DataValueNotFound | Self::InvalidNamespace(_)
        )
    }

    /// Check if this is an ordinary lookup outcome rather than a failure
    #[must_use]
    pub const fn is_expected(&self) -> bool {
        self.is_not_found() || matches!(self, Self::ExistsOutsideScope { .. })
    }

    #[must_use]
    pub const fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported(_))
    }

    /// Canonical status name reported across the module boundary
    #[must_use]
    pub const fn status_str(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT-FOUND",
            Self::ExistsOutsideScope { .. } => "EXISTS-OUTSIDE-SCOPE",
            Self::DataValueNotFound => "DATA-VALUE-NOT-FOUND",
            Self::InvalidNamespace(_) => "INVALID-NAMESPACE",
            Self::TypeMismatch(_) => "TYPE-MISMATCH",
            Self::BadParam(_) => "BAD-PARAM",
            Self::OutOfMemory { .. } => "OUT-OF-RESOURCE",
            Self::NotSupported(_) => "NOT-SUPPORTED",
            Self::EndOfBuffer => "UNPACK-READ-PAST-END-OF-BUFFER",
            Self::Unreachable(_) => "UNREACHABLE",
            Self::Segment(_) | Self::AddressMismatch { .. } | Self::Io(_) => "ERROR",
            Self::Serialization(_) => "PACK-FAILURE",
            Self::Deserialization(_) => "UNPACK-FAILURE",
            Self::Compression(_) | Self::Configuration(_) | Self::Internal(_) => "ERROR",
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        match *e {
            bincode::ErrorKind::Io(ref io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                Self::EndOfBuffer
            }
            _ => Self::Deserialization(e.to_string()),
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Self::Configuration(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_not_found() {
        assert!(Error::not_found("ns1").is_not_found());
        assert!(Error::DataValueNotFound.is_not_found());
        assert!(!Error::bad_param("x").is_not_found());
    }

    #[test]
    fn test_error_expected() {
        let outside = Error::ExistsOutsideScope {
            key: "k".into(),
            scope: "LOCAL".into(),
        };
        assert!(outside.is_expected());
        assert!(!outside.is_not_found());
        assert!(!Error::type_mismatch("bad").is_expected());
        assert!(!Error::OutOfMemory {
            requested: 10,
            available: 1
        }
        .is_expected());
    }

    #[test]
    fn test_error_status() {
        assert_eq!(Error::not_found("x").status_str(), "NOT-FOUND");
        assert_eq!(Error::not_supported("x").status_str(), "NOT-SUPPORTED");
        assert_eq!(Error::EndOfBuffer.status_str(), "UNPACK-READ-PAST-END-OF-BUFFER");
    }

    #[test]
    fn test_bincode_eof_maps_to_end_of_buffer() {
        let empty: &[u8] = &[];
        let err: Error = bincode::deserialize::<u64>(empty).unwrap_err().into();
        assert!(matches!(err, Error::EndOfBuffer));
    }
}
