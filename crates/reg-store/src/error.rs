use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors from the registration store.
///
/// CAS contention is not an error: it is a normal outcome surfaced through
/// [`crate::store::SetOutcome`] so callers retry their read-modify-write.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// The underlying key-value layer could not be reached.
    #[error("store connection failure: {0}")]
    Connection(String),

    /// A stored record could not be encoded or decoded.
    #[error("record serialization failure: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
