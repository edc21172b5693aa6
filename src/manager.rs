//! Lifecycle of the single panic-button link: permissions, power-on wait,
//! scanning, connection, subscription and signal dispatch.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt as _;
use futures::stream::BoxStream;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::codec;
use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::messages::{LinkState, PeripheralDevice, SosSignal};
use crate::permissions::{Permission, Permissions};
use crate::radio::{
    ConnectOptions, Notification, Radio, RadioLink, SOS_CHARACTERISTIC, SOS_SERVICE,
};
use crate::scanner::Scanner;

pub type SignalCallback = Arc<dyn Fn(SosSignal) + Send + Sync>;

#[derive(Clone, Copy, Debug)]
pub struct LinkSettings {
    pub power_on_timeout: Duration,
    pub connect: ConnectOptions,
}

impl Default for LinkSettings {
    fn default() -> Self {
        LinkSettings {
            power_on_timeout: Duration::from_secs(10),
            connect: ConnectOptions::default(),
        }
    }
}

impl From<&LinkConfig> for LinkSettings {
    fn from(config: &LinkConfig) -> Self {
        let defaults = LinkSettings::default();
        LinkSettings {
            power_on_timeout: config
                .power_on_timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.power_on_timeout),
            connect: ConnectOptions {
                mtu: config.mtu.unwrap_or(defaults.connect.mtu),
                auto_reconnect: config
                    .auto_reconnect
                    .unwrap_or(defaults.connect.auto_reconnect),
            },
        }
    }
}

struct ScanSession {
    task: JoinHandle<()>,
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Connection {
    generation: u64,
    device_id: String,
    link: Arc<dyn RadioLink>,
    pump: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Shared with the notification pump so a lost link can tear itself down.
type ConnectionSlot = Arc<Mutex<Option<Connection>>>;

fn lock_slot(slot: &Mutex<Option<Connection>>) -> MutexGuard<'_, Option<Connection>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct LinkManager {
    radio: Option<Arc<dyn Radio>>,
    permissions: Arc<dyn Permissions>,
    settings: LinkSettings,
    state: Arc<watch::Sender<LinkState>>,
    scan: Option<ScanSession>,
    connection: ConnectionSlot,
    generation: u64,
    on_signal: Option<SignalCallback>,
}

impl Drop for LinkManager {
    fn drop(&mut self) {
        // The pump holds the slot too; emptying it aborts the pump
        lock_slot(&self.connection).take();
    }
}

impl LinkManager {
    pub fn new(
        radio: Arc<dyn Radio>,
        permissions: Arc<dyn Permissions>,
        settings: LinkSettings,
    ) -> Self {
        LinkManager {
            radio: Some(radio),
            permissions,
            settings,
            state: Arc::new(watch::channel(LinkState::Idle).0),
            scan: None,
            connection: Arc::new(Mutex::new(None)),
            generation: 0,
            on_signal: None,
        }
    }

    /// A manager for a host without a usable radio. Every operation fails
    /// with [`LinkError::CapabilityUnavailable`].
    pub fn unavailable(permissions: Arc<dyn Permissions>) -> Self {
        LinkManager {
            radio: None,
            permissions,
            settings: LinkSettings::default(),
            state: Arc::new(watch::channel(LinkState::Unavailable).0),
            scan: None,
            connection: Arc::new(Mutex::new(None)),
            generation: 0,
            on_signal: None,
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    pub fn connected_device(&self) -> Option<String> {
        lock_slot(&self.connection)
            .as_ref()
            .map(|c| c.device_id.clone())
    }

    /// Register the handler invoked for every SOS notification. Applies to
    /// connections made after the call.
    pub fn on_signal(&mut self, callback: SignalCallback) {
        self.on_signal = Some(callback);
    }

    fn radio(&self) -> Result<Arc<dyn Radio>, LinkError> {
        self.radio.clone().ok_or(LinkError::CapabilityUnavailable)
    }

    fn set_state(&self, state: LinkState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Link state {:?} -> {:?}", previous, state);
        }
    }

    pub async fn request_radio_permission(&self) -> Result<(), LinkError> {
        self.request(Permission::Radio).await
    }

    pub async fn request_send_permission(&self) -> Result<(), LinkError> {
        self.request(Permission::SendMessage).await
    }

    async fn request(&self, permission: Permission) -> Result<(), LinkError> {
        if self.permissions.request(permission).await {
            Ok(())
        } else {
            Err(LinkError::PermissionDenied(permission))
        }
    }

    /// Start a scan session, sending each newly seen panic button to `sink`.
    /// Runs until [`LinkManager::stop_scan`] or a connect attempt.
    pub async fn start_scan(
        &mut self,
        sink: mpsc::UnboundedSender<PeripheralDevice>,
    ) -> Result<(), LinkError> {
        let radio = self.radio()?;
        if lock_slot(&self.connection).is_some() {
            return Err(LinkError::Busy(self.state()));
        }
        self.stop_scan().await?;

        self.request_radio_permission().await?;
        match tokio::time::timeout(self.settings.power_on_timeout, radio.wait_powered_on()).await
        {
            Ok(result) => result?,
            Err(_) => return Err(LinkError::PoweredOnTimeout(self.settings.power_on_timeout)),
        }

        let advertisements = radio.start_scan().await?;
        let task = tokio::spawn(Scanner::new().run(advertisements, sink));
        self.scan = Some(ScanSession { task });
        self.set_state(LinkState::Scanning);
        info!("Scanning for panic buttons");
        Ok(())
    }

    /// No-op when no scan is running.
    pub async fn stop_scan(&mut self) -> Result<(), LinkError> {
        let Some(scan) = self.scan.take() else {
            return Ok(());
        };
        drop(scan);
        if self.state() == LinkState::Scanning {
            self.set_state(LinkState::Idle);
        }
        info!("Scan stopped");
        self.radio()?.stop_scan().await
    }

    pub async fn connect(&mut self, device_id: &str) -> Result<(), LinkError> {
        let radio = self.radio()?;
        self.disconnect().await?;
        if let Err(err) = self.stop_scan().await {
            warn!("Could not stop scan before connecting: {}", err);
        }
        self.request_radio_permission().await?;

        self.set_state(LinkState::Connecting);
        info!("Connecting to {}", device_id);
        let (link, notifications) = match self.establish(radio.as_ref(), device_id).await {
            Ok(established) => established,
            Err(err) => {
                warn!("Connection to {} failed: {}", device_id, err);
                self.set_state(LinkState::Idle);
                return Err(err);
            }
        };

        self.generation += 1;
        self.set_state(LinkState::Connected);
        // Held until the connection is stored so the pump never sees an
        // empty slot for its own generation
        let mut slot = lock_slot(&self.connection);
        let watch = LinkWatch {
            device_id: device_id.to_string(),
            generation: self.generation,
            link: link.clone(),
            slot: self.connection.clone(),
            state: self.state.clone(),
        };
        let pump = tokio::spawn(pump(notifications, self.on_signal.clone(), watch));
        *slot = Some(Connection {
            generation: self.generation,
            device_id: device_id.to_string(),
            link,
            pump,
        });
        drop(slot);
        info!("Connected to {}", device_id);
        Ok(())
    }

    async fn establish(
        &self,
        radio: &dyn Radio,
        device_id: &str,
    ) -> Result<(Arc<dyn RadioLink>, BoxStream<'static, Notification>), LinkError> {
        let link = radio.connect(device_id, self.settings.connect).await?;
        let subscribed = match subscribe(link.as_ref()).await {
            Ok(()) => link.notifications().await,
            Err(err) => Err(err),
        };
        match subscribed {
            Ok(notifications) => Ok((link, notifications)),
            Err(err) => {
                if let Err(disconnect_err) = link.disconnect().await {
                    debug!("Disconnect after failed setup: {}", disconnect_err);
                }
                Err(err)
            }
        }
    }

    /// Tear down the connection, if any.
    pub async fn disconnect(&mut self) -> Result<(), LinkError> {
        let taken = lock_slot(&self.connection).take();
        let Some(connection) = taken else {
            if self.state() == LinkState::Error {
                self.set_state(LinkState::Idle);
            }
            return Ok(());
        };
        connection.pump.abort();
        let result = connection.link.disconnect().await;
        self.set_state(LinkState::Idle);
        info!("Disconnected from {}", connection.device_id);
        result
    }

    /// Release the connection and the radio. Safe to call repeatedly; the
    /// manager is unusable afterwards.
    pub async fn destroy(&mut self) {
        if self.radio.is_none() {
            return;
        }
        if let Err(err) = self.stop_scan().await {
            warn!("Error stopping scan: {}", err);
        }
        if let Err(err) = self.disconnect().await {
            warn!("Error disconnecting: {}", err);
        }
        self.radio = None;
        self.set_state(LinkState::Unavailable);
        debug!("Link manager destroyed");
    }
}

/// Subscribe to the firmware's notify characteristic, or failing that to
/// the first notification-capable characteristic on the device.
async fn subscribe(link: &dyn RadioLink) -> Result<(), LinkError> {
    let services = link.discover_services().await?;
    match link.subscribe(SOS_SERVICE, SOS_CHARACTERISTIC).await {
        Ok(()) => return Ok(()),
        Err(err) => warn!("SOS characteristic unavailable ({}), trying others", err),
    }

    for service in &services {
        for characteristic in service.characteristics.iter().filter(|c| c.notifiable) {
            match link.subscribe(service.uuid, characteristic.uuid).await {
                Ok(()) => {
                    info!(
                        "Subscribed to {} on service {}",
                        characteristic.uuid, service.uuid
                    );
                    return Ok(());
                }
                Err(err) => debug!("Subscribe to {} failed: {}", characteristic.uuid, err),
            }
        }
    }
    Err(LinkError::NoNotifiableCharacteristic)
}

fn classify(device_id: &str, notification: &Notification) -> Option<SosSignal> {
    let text = codec::decode_text(&notification.payload);
    debug!(
        "Notification from {} on {}: {:?}",
        device_id, notification.characteristic, text
    );
    codec::is_sos(&text).then(|| SosSignal {
        device_id: device_id.to_string(),
        text,
    })
}

/// What the notification pump needs to tear its connection down when the
/// peripheral goes away.
struct LinkWatch {
    device_id: String,
    generation: u64,
    link: Arc<dyn RadioLink>,
    slot: ConnectionSlot,
    state: Arc<watch::Sender<LinkState>>,
}

impl LinkWatch {
    async fn lost(self) {
        warn!("Link to {} lost", self.device_id);
        if let Err(err) = self.link.disconnect().await {
            debug!("Disconnect after link loss: {}", err);
        }
        let lost = {
            let mut slot = lock_slot(&self.slot);
            match slot.as_ref() {
                Some(connection) if connection.generation == self.generation => slot.take(),
                _ => None,
            }
        };
        // A newer connection or an explicit disconnect owns the state
        if lost.is_some() {
            self.state.send_replace(LinkState::Error);
        }
        // Dropping the connection aborts this task; nothing is awaited after it
        drop(lost);
    }
}

async fn pump(
    mut notifications: BoxStream<'static, Notification>,
    on_signal: Option<SignalCallback>,
    watch: LinkWatch,
) {
    while let Some(notification) = notifications.next().await {
        let Some(signal) = classify(&watch.device_id, &notification) else {
            continue;
        };
        info!("SOS signal from {}", watch.device_id);
        match &on_signal {
            Some(callback) => callback(signal),
            None => warn!("SOS signal dropped, no handler registered"),
        }
    }
    // Explicit disconnects abort this task, so reaching here means link loss
    watch.lost().await;
}
