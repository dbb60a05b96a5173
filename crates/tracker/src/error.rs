use tokio_tungstenite::tungstenite;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] shared::ProtocolError),
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("session is no longer running")]
    Closed,
    #[error("session task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
