//! Test doubles for the radio, delivery and location seams.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt as _;
use futures::stream::{self, BoxStream};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::channels::{AlertRequest, Composer, DeliveryChannel};
use crate::codec;
use crate::error::{DispatchError, LinkError};
use crate::location::{Coordinates, LocationProvider};
use crate::messages::DeliveryOutcome;
use crate::radio::{
    Advertisement, CharacteristicInfo, ConnectOptions, Notification, Radio, RadioLink,
    SOS_CHARACTERISTIC, SOS_SERVICE, ServiceInfo,
};

pub fn notification(characteristic: Uuid, bytes: &[u8]) -> Notification {
    Notification {
        characteristic,
        payload: codec::encode(bytes),
    }
}

pub struct FakeRadio {
    pub powered: bool,
    pub connect_fails: bool,
    advertisements: Mutex<Vec<Advertisement>>,
    link: Arc<FakeLink>,
    scans_stopped: AtomicUsize,
}

impl FakeRadio {
    pub fn new(link: Arc<FakeLink>) -> Self {
        FakeRadio {
            powered: true,
            connect_fails: false,
            advertisements: Mutex::new(Vec::new()),
            link,
            scans_stopped: AtomicUsize::new(0),
        }
    }

    pub fn advertise(&self, advertisements: Vec<Advertisement>) {
        *self.advertisements.lock().unwrap() = advertisements;
    }

    pub fn scans_stopped(&self) -> usize {
        self.scans_stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Radio for FakeRadio {
    async fn wait_powered_on(&self) -> Result<(), LinkError> {
        if !self.powered {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn start_scan(&self) -> Result<BoxStream<'static, Advertisement>, LinkError> {
        let advertisements = self.advertisements.lock().unwrap().clone();
        // A real scan never ends on its own
        Ok(stream::iter(advertisements).chain(stream::pending()).boxed())
    }

    async fn stop_scan(&self) -> Result<(), LinkError> {
        self.scans_stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(
        &self,
        device_id: &str,
        _options: ConnectOptions,
    ) -> Result<Arc<dyn RadioLink>, LinkError> {
        if self.connect_fails {
            return Err(LinkError::UnknownDevice(device_id.to_string()));
        }
        Ok(self.link.clone())
    }
}

pub struct FakeLink {
    services: Vec<ServiceInfo>,
    subscriptions: Mutex<Vec<Uuid>>,
    sender: Mutex<Option<mpsc::UnboundedSender<Notification>>>,
    disconnects: AtomicUsize,
}

impl FakeLink {
    pub fn new(services: Vec<ServiceInfo>) -> Arc<Self> {
        Arc::new(FakeLink {
            services,
            subscriptions: Mutex::new(Vec::new()),
            sender: Mutex::new(None),
            disconnects: AtomicUsize::new(0),
        })
    }

    /// A device exposing the firmware's SOS service.
    pub fn sos() -> Arc<Self> {
        FakeLink::new(vec![ServiceInfo {
            uuid: SOS_SERVICE,
            characteristics: vec![CharacteristicInfo {
                uuid: SOS_CHARACTERISTIC,
                notifiable: true,
            }],
        }])
    }

    pub fn push(&self, notification: Notification) {
        if let Some(sender) = self.sender.lock().unwrap().as_ref() {
            let _ = sender.send(notification);
        }
    }

    /// Simulate the peripheral going out of range.
    pub fn drop_link(&self) {
        self.sender.lock().unwrap().take();
    }

    pub fn subscriptions(&self) -> Vec<Uuid> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RadioLink for FakeLink {
    async fn discover_services(&self) -> Result<Vec<ServiceInfo>, LinkError> {
        Ok(self.services.clone())
    }

    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<(), LinkError> {
        let found = self
            .services
            .iter()
            .filter(|s| s.uuid == service)
            .flat_map(|s| s.characteristics.iter())
            .any(|c| c.uuid == characteristic && c.notifiable);
        if !found {
            return Err(LinkError::CharacteristicNotFound {
                service,
                characteristic,
            });
        }
        self.subscriptions.lock().unwrap().push(characteristic);
        Ok(())
    }

    async fn notifications(&self) -> Result<BoxStream<'static, Notification>, LinkError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock().unwrap() = Some(tx);
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|n| (n, rx))
        })
        .boxed())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.drop_link();
        Ok(())
    }
}

/// Channel double recording every attempt it receives.
pub struct FakeChannel {
    name: String,
    available: bool,
    outcome: Result<DeliveryOutcome, String>,
    attempts: Mutex<Vec<AlertRequest>>,
}

impl FakeChannel {
    pub fn new(name: &str, available: bool, outcome: Result<DeliveryOutcome, String>) -> Arc<Self> {
        Arc::new(FakeChannel {
            name: name.to_string(),
            available,
            outcome,
            attempts: Mutex::new(Vec::new()),
        })
    }

    pub fn succeeding(name: &str) -> Arc<Self> {
        FakeChannel::new(name, true, Ok(DeliveryOutcome::sent(format!("sent via {name}"))))
    }

    pub fn attempts(&self) -> Vec<AlertRequest> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryChannel for FakeChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn attempt(&self, alert: &AlertRequest) -> Result<DeliveryOutcome, DispatchError> {
        self.attempts.lock().unwrap().push(alert.clone());
        self.outcome.clone().map_err(|reason| DispatchError::Channel {
            channel: self.name.clone(),
            reason,
        })
    }
}

/// Location double. `None` for the live fix means the request never
/// resolves.
pub struct FakeLocation {
    pub granted: bool,
    pub live: Option<Coordinates>,
    pub last_known: Option<Coordinates>,
}

#[async_trait]
impl LocationProvider for FakeLocation {
    async fn has_permission(&self) -> bool {
        self.granted
    }

    async fn request_permission(&self) -> bool {
        self.granted
    }

    async fn current_position(&self) -> Option<Coordinates> {
        match self.live {
            Some(fix) => Some(fix),
            None => futures::future::pending().await,
        }
    }

    async fn last_known_position(&self) -> Option<Coordinates> {
        self.last_known
    }
}

pub struct FakeComposer {
    openable: bool,
    opened: Mutex<Vec<String>>,
}

impl FakeComposer {
    pub fn new(openable: bool) -> Arc<Self> {
        Arc::new(FakeComposer {
            openable,
            opened: Mutex::new(Vec::new()),
        })
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl Composer for FakeComposer {
    async fn can_open(&self, _uri: &str) -> bool {
        self.openable
    }

    async fn open(&self, uri: &str) -> std::io::Result<()> {
        self.opened.lock().unwrap().push(uri.to_string());
        Ok(())
    }
}
