//! The seam between the link manager and a BLE central implementation.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::error::LinkError;

/// Panic button firmware service.
pub const SOS_SERVICE: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);
/// Notify characteristic carrying button events.
pub const SOS_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/// Raw advertisement as reported by the central. The link manager does its
/// own filtering and de-duplication.
#[derive(Clone, Debug)]
pub struct Advertisement {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

#[derive(Clone, Copy, Debug)]
pub struct ConnectOptions {
    pub mtu: u16,
    pub auto_reconnect: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            mtu: 512,
            auto_reconnect: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub notifiable: bool,
}

#[derive(Clone, Debug)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

/// A value pushed by a subscribed characteristic, in base64 wire form.
#[derive(Clone, Debug)]
pub struct Notification {
    pub characteristic: Uuid,
    pub payload: String,
}

#[async_trait]
pub trait Radio: Send + Sync {
    /// Resolves once the adapter reports powered on. Unbounded; callers
    /// apply their own timeout.
    async fn wait_powered_on(&self) -> Result<(), LinkError>;

    async fn start_scan(&self) -> Result<BoxStream<'static, Advertisement>, LinkError>;

    async fn stop_scan(&self) -> Result<(), LinkError>;

    async fn connect(
        &self,
        device_id: &str,
        options: ConnectOptions,
    ) -> Result<Arc<dyn RadioLink>, LinkError>;
}

#[async_trait]
pub trait RadioLink: Send + Sync {
    async fn discover_services(&self) -> Result<Vec<ServiceInfo>, LinkError>;

    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<(), LinkError>;

    /// Notifications from every subscribed characteristic. The stream ends
    /// when the link drops.
    async fn notifications(&self) -> Result<BoxStream<'static, Notification>, LinkError>;

    async fn disconnect(&self) -> Result<(), LinkError>;
}
