use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("another node manager is already running at this address")]
    AddressConflict,
    #[error("connection failure: {0}")]
    ConnectionFailure(String),
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),
    #[error("invalid address")]
    InvalidAddress,
    #[error("no route to destination")]
    UnknownDestination,
    #[error("send failed")]
    SendFailed,
    #[error("wire error: {0}")]
    Wire(#[from] jaus_wire::WireError),
    #[error("transport error: {0}")]
    Transport(#[from] jaus_transport::TransportError),
    #[error("component error: {0}")]
    Component(#[from] jaus_component::ComponentError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
