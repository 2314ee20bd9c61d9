use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("another process is already servicing this inbox")]
    AddressConflict,
    #[error("failed to open connection: {0}")]
    ConnectionFailure(String),
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),
    #[error("inbox full")]
    QueueFull,
    #[error("message exceeds inbox capacity")]
    MessageTooLarge,
    #[error("shared memory region is not an inbox")]
    BadRegion,
    #[error("registry full")]
    RegistryFull,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wire error: {0}")]
    Wire(#[from] jaus_wire::WireError),
}
