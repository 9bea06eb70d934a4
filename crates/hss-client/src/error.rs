use thiserror::Error;

pub type Result<T> = std::result::Result<T, HssError>;

/// Errors from the subscriber-profile store.
#[derive(Error, Debug)]
pub enum HssError {
    /// The public identity is unknown.  The SIP layer maps this to 403.
    #[error("public identity not found")]
    NotFound,

    /// Any other non-success answer.  The SIP layer maps this to 504.
    #[error("HSS returned HTTP {0}")]
    Http(u16),

    /// The request never completed.
    #[error("HSS transport failure: {0}")]
    Transport(String),

    /// The response document could not be understood.
    #[error("HSS response parse failure: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for HssError {
    fn from(e: reqwest::Error) -> Self {
        HssError::Transport(e.to_string())
    }
}
