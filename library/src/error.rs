use crate::media::MediaError;

/// Alias for results returned by this crate's functions.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures surfaced to the application layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested operation is not valid in the current call state,
    /// e.g. placing a call while one is already in progress.
    #[error("operation not valid in the current call state: {0}")]
    InvalidState(&'static str),

    /// The host platform failed to acquire or drive local media.
    #[error(transparent)]
    Media(#[from] MediaError),

    /// The connection to the signaling server is gone.
    #[error("connection to the signaling server is closed")]
    SignalingClosed,

    /// Failed to establish the signaling connection.
    #[error("signaling transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
}
