use thiserror::Error;

/// Crate-wide error type.
///
/// The variants split into two families: caller-actionable failures coming
/// out of the send pipeline and registry surface (bad recipient, missing
/// quoted message, instance still connected, ...) and operational failures
/// that the engine logs and absorbs. Only the former should ever reach an
/// embedding REST layer as a 4xx.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("instance \"{0}\" is not connected")]
    NotConnected(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// Whether the caller can act on this error (4xx territory) as opposed
    /// to an operational failure the embedder should report as a 5xx.
    pub fn is_caller_error(&self) -> bool {
        !matches!(self, GatewayError::Internal(_))
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
