use crate::transport::TransportError;

/// Errors reported synchronously to callers of [`crate::CommsService`].
#[derive(Debug, thiserror::Error)]
pub enum CommsError {
    #[error("service already started")]
    AlreadyStarted,
    #[error("service task has shut down")]
    ServiceStopped,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
