use std::fmt;

use serde_derive::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// No usable radio on this host. Terminal.
    Unavailable,
    Idle,
    Scanning,
    Connecting,
    Connected,
    Error,
}

/// A panic button seen during a scan session. Not persisted.
#[derive(Clone, Debug, PartialEq)]
pub struct PeripheralDevice {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

impl fmt::Display for PeripheralDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id, self.name.as_deref().unwrap_or("<unnamed>"))?;
        if let Some(rssi) = self.rssi {
            write!(f, " ({rssi} dBm)")?;
        }
        Ok(())
    }
}

/// Raised by the link manager for every notification classified as SOS.
#[derive(Clone, Debug)]
pub struct SosSignal {
    pub device_id: String,
    pub text: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchPhase {
    Initializing,
    AcquiringLocation,
    Sending,
}

impl fmt::Display for DispatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DispatchPhase::Initializing => "initializing",
            DispatchPhase::AcquiringLocation => "acquiring location",
            DispatchPhase::Sending => "sending",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub success: bool,
    pub message: String,
}

impl DeliveryOutcome {
    pub fn sent(message: impl Into<String>) -> Self {
        DeliveryOutcome {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        DeliveryOutcome {
            success: false,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_display() {
        let device = PeripheralDevice {
            id: "A4:C1:38:00:11:22".to_string(),
            name: Some("HM-10".to_string()),
            rssi: Some(-60),
        };
        assert_eq!(device.to_string(), "A4:C1:38:00:11:22 HM-10 (-60 dBm)");

        let opaque = PeripheralDevice {
            id: "5f1c2a9e".to_string(),
            name: None,
            rssi: None,
        };
        assert_eq!(opaque.to_string(), "5f1c2a9e <unnamed>");
    }
}
