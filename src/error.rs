use std::path::PathBuf;

use thiserror::Error;

/// The closed set of fatal error kinds the core can raise.
///
/// Every one of these is fatal to the process: there is no local recovery
/// path except the single quarterly-branch retry baked into
/// `protocol::resolve_want`.
#[derive(Debug, Error)]
pub enum GitupError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("http error: server responded with status {0}")]
    HttpError(u16),

    #[error("unsupported protocol: server did not advertise git protocol version 2")]
    UnsupportedProtocol,

    #[error("ref not found: {0}")]
    RefNotFound(String),

    #[error("malformed chunked transfer encoding: {0}")]
    MalformedChunking(String),

    #[error("pack checksum mismatch: expected {expected}, computed {computed}")]
    PackChecksumMismatch { expected: String, computed: String },

    #[error("unsupported pack version {0}")]
    UnsupportedPackVersion(u32),

    #[error("zlib inflate failed: {0}")]
    ZlibFailure(String),

    #[error("orphan ofs-delta at pack offset {0}: no object found at the referenced base offset")]
    OrphanOfsDelta(u64),

    #[error("missing delta base: {0}")]
    MissingDeltaBase(String),

    #[error("missing object: {0}")]
    MissingObject(String),

    #[error("delta overflow: instruction stream wrote past the declared target size")]
    DeltaOverflow,

    #[error("refusing to operate on {0}: a .git directory is present")]
    CoexistenceRefused(PathBuf),

    #[error("path escape: {0} lies outside the target directory")]
    PathEscape(PathBuf),

    #[error("too many repairs: want block for the repair fetch exceeds 3200 KiB")]
    TooManyRepairs,

    #[error("io error on {path}: {source}")]
    IoFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl GitupError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        GitupError::IoFailure {
            path: path.into(),
            source,
        }
    }

    /// Exit code grouped by failure class, so wrapper scripts can branch on
    /// it without scraping stderr.
    pub fn exit_code(&self) -> i32 {
        match self {
            GitupError::ConfigInvalid(_) => 20,
            GitupError::TransportFailure(_)
            | GitupError::HttpError(_)
            | GitupError::UnsupportedProtocol
            | GitupError::RefNotFound(_)
            | GitupError::MalformedChunking(_)
            | GitupError::TooManyRepairs => 30,
            GitupError::PackChecksumMismatch { .. }
            | GitupError::UnsupportedPackVersion(_)
            | GitupError::ZlibFailure(_)
            | GitupError::OrphanOfsDelta(_)
            | GitupError::MissingDeltaBase(_)
            | GitupError::MissingObject(_)
            | GitupError::DeltaOverflow => 40,
            GitupError::CoexistenceRefused(_) | GitupError::PathEscape(_) => 50,
            GitupError::IoFailure { .. } => 51,
        }
    }
}

pub type Result<T> = std::result::Result<T, GitupError>;
