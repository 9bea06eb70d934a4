use thiserror::Error;

/// Errors from the transport seam.  Everything above it converts failures
/// into SIP responses; these never cross the sproutlet boundary.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("send failure: {0}")]
    Send(String),

    #[error("destination could not be resolved: {0}")]
    Resolution(String),

    #[error("request timed out")]
    Timeout,
}
