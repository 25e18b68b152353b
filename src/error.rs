use thiserror::Error;

/// Errors raised by the persistent tile store and its backends.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Another process holds the store root lock
    #[error("Tile store at {root} is locked by another process")]
    Locked { root: String },

    /// Namespace name cannot be mapped to a directory
    #[error("Invalid store name: {0:?}")]
    InvalidName(String),

    /// Namespace could not be opened or its schema created
    #[error("Failed to open store {namespace}: {message}")]
    Open { namespace: String, message: String },

    /// Read, write or transaction failure inside an open namespace
    #[error("Store {namespace} backend error: {message}")]
    Backend { namespace: String, message: String },

    /// Persisted record could not be decoded
    #[error("Store {namespace} contains a corrupt record: {message}")]
    Corrupt { namespace: String, message: String },

    /// Filesystem error outside a backend (layout, lock file, size scan)
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl StoreError {
    /// Whether the namespace handle that produced this error should be discarded.
    pub fn poisons_namespace(&self) -> bool {
        matches!(
            self,
            StoreError::Backend { .. } | StoreError::Corrupt { .. } | StoreError::Io(_)
        )
    }
}

/// Content or protocol violations reported by an origin response.
///
/// These are never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    /// Origin answered with a non-success status
    #[error("download failed with HTTP status {0}")]
    HttpStatus(u16),

    /// Response media type is not an image
    #[error("content type {0:?} is not an image type")]
    ContentType(String),

    /// Declared Content-Length differs from the bytes received
    #[error("content length mismatch: declared {expected} bytes, received {actual}")]
    ContentLength { expected: u64, actual: u64 },

    /// Payload does not start with a known image signature
    #[error("payload is not a recognised image format")]
    UnknownImageFormat,

    /// Body exceeded the size cap for a single tile
    #[error("response body exceeds {0} bytes")]
    BodyTooLarge(u64),

    /// Origin has no connection for this address
    #[error("origin has no source for this tile")]
    NoSource,
}

impl ProtocolViolation {
    /// Stable machine-readable reason code.
    pub const fn code(&self) -> &'static str {
        match self {
            ProtocolViolation::HttpStatus(_) => "http_status",
            ProtocolViolation::ContentType(_) => "content_type",
            ProtocolViolation::ContentLength { .. } => "content_length",
            ProtocolViolation::UnknownImageFormat => "unknown_image_format",
            ProtocolViolation::BodyTooLarge(_) => "body_too_large",
            ProtocolViolation::NoSource => "no_source",
        }
    }
}

/// Coarse failure classes used by callers to decide what to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Protocol,
    Storage,
    Interrupted,
}

/// Errors produced by the download/update engine.
///
/// Every failure is classified before it leaves the engine; the tile load job
/// only maps the class to a tile state.
#[derive(Debug, Clone, Error)]
pub enum DownloadError {
    /// Connection refused, timeout or temporary I/O failure
    #[error("transient failure: {0}")]
    Transient(String),

    /// Origin response violated the tile contract
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// Persistent store failure
    #[error("storage fault: {0}")]
    Storage(#[from] StoreError),

    /// Cooperative cancellation was requested
    #[error("interrupted")]
    Interrupted,
}

impl DownloadError {
    pub fn class(&self) -> FailureClass {
        match self {
            DownloadError::Transient(_) => FailureClass::Transient,
            DownloadError::Protocol(_) => FailureClass::Protocol,
            DownloadError::Storage(_) => FailureClass::Storage,
            DownloadError::Interrupted => FailureClass::Interrupted,
        }
    }

    /// Transient failures may be retried by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DownloadError::Transient(_))
    }

    /// Machine-readable reason code for logs and summaries.
    pub fn reason_code(&self) -> &'static str {
        match self {
            DownloadError::Transient(_) => "transient",
            DownloadError::Protocol(violation) => violation.code(),
            DownloadError::Storage(_) => "storage",
            DownloadError::Interrupted => "interrupted",
        }
    }
}

/// Errors raised when handing work to the job dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The dispatcher no longer accepts jobs
    #[error("job dispatcher is shut down")]
    ShutDown,
}
