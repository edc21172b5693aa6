use thiserror::Error;

use crate::permissions::Permission;

/// Failures reported by the link manager. None of them are retried
/// automatically; the caller decides what to do next.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("bluetooth capability unavailable")]
    CapabilityUnavailable,
    #[error("permission denied: {0}")]
    PermissionDenied(Permission),
    #[error("link busy ({0:?})")]
    Busy(crate::messages::LinkState),
    #[error("radio did not power on within {0:?}")]
    PoweredOnTimeout(std::time::Duration),
    #[error("unknown device {0}")]
    UnknownDevice(String),
    #[error("characteristic {characteristic} not found in service {service}")]
    CharacteristicNotFound {
        service: uuid::Uuid,
        characteristic: uuid::Uuid,
    },
    #[error("no notification-capable characteristic on device")]
    NoNotifiableCharacteristic,
    #[error("bluetooth error: {0}")]
    Radio(#[from] btleplug::Error),
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("no emergency contacts configured")]
    NoRecipients,
    #[error("no delivery channel available")]
    ChannelUnavailable,
    #[error("{channel} failed: {reason}")]
    Channel { channel: String, reason: String },
    #[error("could not load contacts: {0}")]
    Contacts(String),
    #[error("delivery identity not ready: {0}")]
    Registration(String),
    #[error("relay store error: {0}")]
    Relay(#[from] RelayError),
    #[error("alert dispatch panicked")]
    Panicked,
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("broker did not acknowledge within {0:?}")]
    AckTimeout(std::time::Duration),
    #[error("could not encode record: {0}")]
    Encode(#[from] serde_json::Error),
}
