use crate::domain::models::Characteristic;
use crate::infrastructure::transport::{GattStatus, LinkHandle};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("bluetooth adapter unavailable: {0}")]
    Unavailable(String),
    #[error("link request to {address} rejected")]
    LinkRejected { address: String },
    #[error("unknown link {0}")]
    UnknownLink(LinkHandle),
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Characteristic),
    #[error("operation failed with status {0}")]
    Gatt(GattStatus),
}

pub type Result<T> = std::result::Result<T, TransportError>;
