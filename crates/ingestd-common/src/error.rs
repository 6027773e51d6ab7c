//! Common error types used throughout ingestd.
//!
//! Failures fall into two groups. Errors local to one artifact (a missing
//! row, a failed query, an I/O problem) are logged and the artifact is
//! retried on a later tick. Errors that threaten mutual exclusion are
//! *fatal*: the process must stop rather than keep running with leases it
//! can no longer vouch for. [`Error::is_fatal`] draws that line.

/// Common error type for ingestd.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested row or file was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A catalog operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// The catalog rejected a write because another writer holds the lock.
    #[error("Write conflict: {0}")]
    WriteConflict(String),

    /// An I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input was provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The lease store could not acquire or renew a heartbeat.
    #[error("Lease store failure: {0}")]
    LeaseStore(String),

    /// Lease bookkeeping was used in a way the protocol forbids.
    #[error("Lease invariant violated: {0}")]
    LeaseInvariant(String),

    /// The local environment (directories, disks) is unusable.
    #[error("Environment error: {0}")]
    Environment(String),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new NotFound error.
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new Database error.
    pub fn database<S: Into<String>>(msg: S) -> Self {
        Self::Database(msg.into())
    }

    /// Create a new WriteConflict error.
    pub fn write_conflict<S: Into<String>>(msg: S) -> Self {
        Self::WriteConflict(msg.into())
    }

    /// Create a new InvalidInput error.
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a new LeaseStore error.
    pub fn lease_store<S: Into<String>>(msg: S) -> Self {
        Self::LeaseStore(msg.into())
    }

    /// Create a new LeaseInvariant error.
    pub fn lease_invariant<S: Into<String>>(msg: S) -> Self {
        Self::LeaseInvariant(msg.into())
    }

    /// Create a new Environment error.
    pub fn environment<S: Into<String>>(msg: S) -> Self {
        Self::Environment(msg.into())
    }

    /// Create a new Internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the process must stop after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::LeaseStore(_) | Self::LeaseInvariant(_) | Self::Environment(_)
        )
    }

    /// Whether the error came from a contended catalog write.
    pub fn is_write_conflict(&self) -> bool {
        matches!(self, Self::WriteConflict(_))
    }
}

/// Result type alias using the common Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::not_found("artifact 7");
        assert_eq!(err.to_string(), "Not found: artifact 7");

        let err = Error::database("connection failed");
        assert_eq!(err.to_string(), "Database error: connection failed");

        let err = Error::write_conflict("database is locked");
        assert_eq!(err.to_string(), "Write conflict: database is locked");

        let err = Error::lease_store("commit failed");
        assert_eq!(err.to_string(), "Lease store failure: commit failed");

        let err = Error::lease_invariant("owner mismatch");
        assert_eq!(err.to_string(), "Lease invariant violated: owner mismatch");

        let err = Error::environment("cannot create working dir");
        assert_eq!(err.to_string(), "Environment error: cannot create working dir");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::lease_store("x").is_fatal());
        assert!(Error::lease_invariant("x").is_fatal());
        assert!(Error::environment("x").is_fatal());

        assert!(!Error::database("x").is_fatal());
        assert!(!Error::write_conflict("x").is_fatal());
        assert!(!Error::not_found("x").is_fatal());
        assert!(!Error::internal("x").is_fatal());
    }

    #[test]
    fn test_write_conflict_classification() {
        assert!(Error::write_conflict("busy").is_write_conflict());
        assert!(!Error::database("busy").is_write_conflict());
    }
}
