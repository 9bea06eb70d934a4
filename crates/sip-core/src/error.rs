use thiserror::Error;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in SIP message handling
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A header failed to parse.  `offset` is the byte position within the
    /// header value at which parsing stopped.
    #[error("Malformed {header} header at offset {offset}")]
    MalformedHeader {
        /// Header name
        header: String,
        /// Byte offset of the failure within the header value
        offset: usize,
    },

    /// Invalid SIP URI
    #[error("Invalid SIP URI: {0}")]
    InvalidUri(String),

    /// Invalid SIP method
    #[error("Invalid SIP method: {0}")]
    InvalidMethod(String),

    /// Invalid status code
    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u16),

    /// Invalid message framing (start line, header block, body)
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),
}

impl Error {
    /// Shorthand for a `MalformedHeader` error.
    pub fn malformed(header: &str, offset: usize) -> Self {
        Error::MalformedHeader {
            header: header.to_string(),
            offset,
        }
    }
}
