//! Error types for machsign operations.
//!
//! Every fallible function in this crate returns [`crate::Result<T>`]. The
//! [`enum@Error`] variants carry a human readable message; callers that need a
//! stable reason code should match on [`Error::kind`] instead.

use thiserror::Error;

/// Error type for machsign operations.
///
/// # Examples
///
/// ```no_run
/// use machsign::{Engine, CodeSigningEngine, Error};
///
/// let engine = Engine::new();
/// match engine.change_dylib_path("Payload/App", "@rpath/Old.dylib", "@rpath/New.dylib") {
///     Ok(()) => println!("rewritten"),
///     Err(Error::NotFound(path)) => eprintln!("no load command for {path}"),
///     Err(e) => eprintln!("failed: {e}"),
/// }
/// ```
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed.
    ///
    /// Raised while reading inputs, staging bundles, or replacing files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed Mach-O, provisioning profile, or key container.
    ///
    /// The input is inconsistent with its own header (bad magic, offsets
    /// outside the file, truncated structures).
    #[error("Invalid format: {0}")]
    Format(String),

    /// The load command area cannot hold the requested edit.
    ///
    /// `needed` is the size the command area would grow to and `available`
    /// is the space before the first section or segment content.
    #[error("No space for load commands: need {needed} bytes, have {available}")]
    NoSpace { needed: usize, available: usize },

    /// No load command matched the requested path.
    #[error("Load command not found: {0}")]
    NotFound(String),

    /// Certificate signing was requested without an identity.
    #[error("Missing signing identity")]
    MissingIdentity,

    /// The identity is not authorized by the provisioning profile.
    #[error("Identity does not match provisioning profile: {0}")]
    ProfileMismatch(String),

    /// The PKCS#12 integrity check failed for the supplied password.
    #[error("Invalid password for PKCS#12 container")]
    BadPassword,

    /// A certificate or key could not be used for signing.
    #[error("Invalid certificate: {0}")]
    Certificate(String),

    /// Signature construction failed.
    #[error("Signing failed: {0}")]
    Signing(String),

    /// Property list parsing or serialization failed.
    #[error("Plist error: {0}")]
    Plist(#[from] plist::Error),

    /// Invalid settings or request.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The operation was cancelled before it completed.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Stable classification of an [`enum@Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Io,
    Format,
    NoSpace,
    NotFound,
    MissingIdentity,
    ProfileMismatch,
    BadPassword,
    Certificate,
    Signing,
    Config,
    Cancelled,
}

impl Error {
    /// Returns the reason code for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::Format(_) | Error::Plist(_) => ErrorKind::Format,
            Error::NoSpace { .. } => ErrorKind::NoSpace,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::MissingIdentity => ErrorKind::MissingIdentity,
            Error::ProfileMismatch(_) => ErrorKind::ProfileMismatch,
            Error::BadPassword => ErrorKind::BadPassword,
            Error::Certificate(_) => ErrorKind::Certificate,
            Error::Signing(_) => ErrorKind::Signing,
            Error::Config(_) => ErrorKind::Config,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl From<scroll::Error> for Error {
    fn from(e: scroll::Error) -> Self {
        Error::Format(e.to_string())
    }
}
