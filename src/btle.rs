use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central as _, CentralEvent, CentralState, CharPropFlags, Manager as _, Peripheral as _,
    ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt as _;
use futures::future;
use futures::stream::BoxStream;
use log::debug;
use uuid::Uuid;

use crate::codec;
use crate::error::LinkError;
use crate::radio::{
    Advertisement, CharacteristicInfo, ConnectOptions, Notification, Radio, RadioLink, ServiceInfo,
};

/// BLE central backed by the first adapter btleplug finds.
pub struct BtleRadio {
    adapter: Adapter,
}

impl BtleRadio {
    pub async fn new() -> Result<Self, LinkError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(LinkError::CapabilityUnavailable)?;
        debug!("Using bluetooth adapter {}", adapter.adapter_info().await?);
        Ok(BtleRadio { adapter })
    }

    async fn find(&self, device_id: &str) -> Result<Peripheral, LinkError> {
        self.adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.address().to_string() == device_id)
            .ok_or_else(|| LinkError::UnknownDevice(device_id.to_string()))
    }
}

async fn advertisement(adapter: &Adapter, id: &PeripheralId) -> Option<Advertisement> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok().flatten()?;
    Some(Advertisement {
        id: peripheral.address().to_string(),
        name: properties.local_name,
        rssi: properties.rssi,
    })
}

#[async_trait]
impl Radio for BtleRadio {
    async fn wait_powered_on(&self) -> Result<(), LinkError> {
        // Subscribe before reading the state so an update in between is not lost
        let mut events = self.adapter.events().await?;
        if matches!(self.adapter.adapter_state().await?, CentralState::PoweredOn) {
            return Ok(());
        }
        debug!("Waiting for bluetooth adapter to power on");
        while let Some(event) = events.next().await {
            if let CentralEvent::StateUpdate(CentralState::PoweredOn) = event {
                return Ok(());
            }
        }
        Err(LinkError::CapabilityUnavailable)
    }

    async fn start_scan(&self) -> Result<BoxStream<'static, Advertisement>, LinkError> {
        let events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        let adapter = self.adapter.clone();
        Ok(events
            .filter_map(move |event| {
                let adapter = adapter.clone();
                async move {
                    match event {
                        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                            advertisement(&adapter, &id).await
                        }
                        _ => None,
                    }
                }
            })
            .boxed())
    }

    async fn stop_scan(&self) -> Result<(), LinkError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(
        &self,
        device_id: &str,
        options: ConnectOptions,
    ) -> Result<Arc<dyn RadioLink>, LinkError> {
        let peripheral = self.find(device_id).await?;
        // MTU exchange and reconnection are left to the host stack; btleplug
        // exposes neither.
        debug!(
            "Connecting to {} (mtu {}, auto reconnect {})",
            device_id, options.mtu, options.auto_reconnect
        );
        peripheral.connect().await?;
        Ok(Arc::new(BtleLink {
            adapter: self.adapter.clone(),
            peripheral,
        }))
    }
}

struct BtleLink {
    adapter: Adapter,
    peripheral: Peripheral,
}

#[async_trait]
impl RadioLink for BtleLink {
    async fn discover_services(&self) -> Result<Vec<ServiceInfo>, LinkError> {
        self.peripheral.discover_services().await?;
        Ok(self
            .peripheral
            .services()
            .into_iter()
            .map(|service| ServiceInfo {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| CharacteristicInfo {
                        uuid: c.uuid,
                        notifiable: c
                            .properties
                            .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
                    })
                    .collect(),
            })
            .collect())
    }

    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<(), LinkError> {
        let target = self
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == characteristic)
            .ok_or(LinkError::CharacteristicNotFound {
                service,
                characteristic,
            })?;
        self.peripheral.subscribe(&target).await?;
        Ok(())
    }

    async fn notifications(&self) -> Result<BoxStream<'static, Notification>, LinkError> {
        let id = self.peripheral.id();
        let dropped = self
            .adapter
            .events()
            .await?
            .filter(move |event| {
                future::ready(matches!(event, CentralEvent::DeviceDisconnected(d) if *d == id))
            })
            .into_future();

        Ok(self
            .peripheral
            .notifications()
            .await?
            .map(|n| Notification {
                characteristic: n.uuid,
                payload: codec::encode(&n.value),
            })
            .take_until(dropped)
            .boxed())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
