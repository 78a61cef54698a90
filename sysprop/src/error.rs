use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by the property store
#[derive(Debug, Error)]
pub enum PropertyError {
    /// The property area could not be allocated
    #[error("failed to allocate the property area")]
    InitFailure,

    /// Name is empty, too long, or contains a NUL byte
    #[error("invalid property name {0:?}")]
    InvalidName(String),

    /// Value is too long or contains a NUL byte
    #[error("invalid value for property {name:?} ({len} bytes)")]
    InvalidValue { name: String, len: usize },

    /// Append of a name the area already holds
    #[error("property {0:?} is already defined")]
    AlreadyDefined(String),

    /// Write to a `ro.` property that already has a value
    #[error("property {0:?} is read-only")]
    Immutable(String),

    /// All records of the area are in use
    #[error("property area is full, cannot add {0:?}")]
    CapacityExceeded(String),

    /// Backing store read or write failed
    #[error("persistent property I/O failed for {}: {source}", path.display())]
    PersistIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A binary area image failed validation
    #[error("malformed property area image: {0}")]
    MalformedImage(String),
}
