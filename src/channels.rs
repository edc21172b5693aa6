//! Interchangeable ways of getting an alert out.
//!
//! Direct-to-recipients mode tries [`DirectSendChannel`] then
//! [`ComposeChannel`]; relay mode uses [`RelayChannel`] alone.

use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde_derive::Serialize;

use crate::config::{ComposeConfig, DirectSendConfig};
use crate::contacts::Recipient;
use crate::error::{DispatchError, RelayError};
use crate::location::{Coordinates, LocationFix};
use crate::messages::DeliveryOutcome;
use crate::permissions::{Permission, Permissions};

#[derive(Clone, Debug)]
pub struct AlertRequest {
    pub recipients: Vec<Recipient>,
    pub message: String,
    pub location: LocationFix,
}

impl AlertRequest {
    fn phone_numbers(&self) -> Vec<String> {
        self.recipients
            .iter()
            .filter_map(|r| r.phone().map(str::to_string))
            .collect()
    }
}

#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this channel's preconditions hold right now.
    async fn is_available(&self) -> bool;

    async fn attempt(&self, alert: &AlertRequest) -> Result<DeliveryOutcome, DispatchError>;
}

fn channel_error(channel: &str, reason: impl ToString) -> DispatchError {
    DispatchError::Channel {
        channel: channel.to_string(),
        reason: reason.to_string(),
    }
}

/// True if `program` is a path to an existing file or resolves on `PATH`.
fn program_exists(program: &str) -> bool {
    if program.contains('/') {
        return Path::new(program).is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

/// Platform primitive that sends a text without user interaction.
#[async_trait]
pub trait TextSender: Send + Sync {
    fn is_present(&self) -> bool;

    async fn send(&self, numbers: &[String], body: &str) -> io::Result<()>;
}

/// Sends through an external program, once per recipient.
pub struct CommandTextSender {
    config: Option<DirectSendConfig>,
}

impl CommandTextSender {
    pub fn new(config: Option<DirectSendConfig>) -> Self {
        CommandTextSender { config }
    }
}

#[async_trait]
impl TextSender for CommandTextSender {
    fn is_present(&self) -> bool {
        self.config
            .as_ref()
            .is_some_and(|c| program_exists(&c.program))
    }

    async fn send(&self, numbers: &[String], body: &str) -> io::Result<()> {
        let Some(config) = &self.config else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no send program configured"));
        };
        let template = config
            .args
            .clone()
            .unwrap_or_else(|| vec!["{to}".to_string(), "{body}".to_string()]);
        for number in numbers {
            let args: Vec<String> = template
                .iter()
                .map(|arg| arg.replace("{to}", number).replace("{body}", body))
                .collect();
            let status = tokio::process::Command::new(&config.program)
                .args(&args)
                .status()
                .await?;
            if !status.success() {
                return Err(io::Error::other(format!(
                    "{} exited with {} for {}",
                    config.program, status, number
                )));
            }
            debug!("Sent alert text to {}", number);
        }
        Ok(())
    }
}

pub struct DirectSendChannel {
    sender: Arc<dyn TextSender>,
    permissions: Arc<dyn Permissions>,
}

impl DirectSendChannel {
    pub fn new(sender: Arc<dyn TextSender>, permissions: Arc<dyn Permissions>) -> Self {
        DirectSendChannel {
            sender,
            permissions,
        }
    }
}

#[async_trait]
impl DeliveryChannel for DirectSendChannel {
    fn name(&self) -> &str {
        "direct send"
    }

    async fn is_available(&self) -> bool {
        self.sender.is_present() && self.permissions.request(Permission::SendMessage).await
    }

    async fn attempt(&self, alert: &AlertRequest) -> Result<DeliveryOutcome, DispatchError> {
        let numbers = alert.phone_numbers();
        if numbers.is_empty() {
            return Err(channel_error(self.name(), "no contact has a phone number"));
        }
        self.sender
            .send(&numbers, &alert.message)
            .await
            .map_err(|err| channel_error(self.name(), err))?;
        info!("Alert texted to {} contact(s)", numbers.len());
        Ok(DeliveryOutcome::sent(format!(
            "Alert sent to {} contact(s)",
            numbers.len()
        )))
    }
}

/// Hands a pre-filled message to the device's messaging app.
#[async_trait]
pub trait Composer: Send + Sync {
    async fn can_open(&self, uri: &str) -> bool;

    async fn open(&self, uri: &str) -> io::Result<()>;
}

pub struct CommandComposer {
    opener: String,
}

impl CommandComposer {
    pub fn new(config: &ComposeConfig) -> Self {
        CommandComposer {
            opener: config
                .opener
                .clone()
                .unwrap_or_else(|| "xdg-open".to_string()),
        }
    }
}

#[async_trait]
impl Composer for CommandComposer {
    async fn can_open(&self, _uri: &str) -> bool {
        program_exists(&self.opener)
    }

    async fn open(&self, uri: &str) -> io::Result<()> {
        // The opener is not waited on
        tokio::process::Command::new(&self.opener).arg(uri).spawn()?;
        Ok(())
    }
}

/// Everything but RFC 3986 unreserved characters is escaped in the body.
const SMS_BODY: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub fn sms_uri(numbers: &[String], body: &str) -> String {
    format!(
        "sms:{}?body={}",
        numbers.join(","),
        utf8_percent_encode(body, SMS_BODY)
    )
}

/// Success means the composer opened. Whether the user actually sends the
/// message is never observed.
pub struct ComposeChannel {
    composer: Arc<dyn Composer>,
}

impl ComposeChannel {
    pub fn new(composer: Arc<dyn Composer>) -> Self {
        ComposeChannel { composer }
    }
}

#[async_trait]
impl DeliveryChannel for ComposeChannel {
    fn name(&self) -> &str {
        "compose"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn attempt(&self, alert: &AlertRequest) -> Result<DeliveryOutcome, DispatchError> {
        let numbers = alert.phone_numbers();
        if numbers.is_empty() {
            return Err(channel_error(self.name(), "no contact has a phone number"));
        }
        let uri = sms_uri(&numbers, &alert.message);
        if !self.composer.can_open(&uri).await {
            return Err(channel_error(self.name(), "messaging app cannot be opened"));
        }
        self.composer
            .open(&uri)
            .await
            .map_err(|err| channel_error(self.name(), err))?;
        info!("Messaging app opened for {} contact(s)", numbers.len());
        Ok(DeliveryOutcome::sent(format!(
            "Messaging app opened for {} contact(s); confirm send manually (delivery unconfirmed)",
            numbers.len()
        )))
    }
}

pub const STATUS_ACTIVE: &str = "active";

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRecord {
    pub sender_id: String,
    pub location: Coordinates,
    pub location_url: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl AlertRecord {
    /// Without a fix the record carries `(0, 0)` and a note saying so.
    pub fn new(sender_id: &str, fix: &LocationFix, timestamp: DateTime<Utc>) -> Self {
        let (location, note) = match fix.coordinates {
            Some(coordinates) => (coordinates, None),
            None => (
                Coordinates { lat: 0.0, lng: 0.0 },
                Some("Location unavailable: no position fix was obtained".to_string()),
            ),
        };
        AlertRecord {
            sender_id: sender_id.to_string(),
            location,
            location_url: fix.link.clone(),
            timestamp,
            status: STATUS_ACTIVE.to_string(),
            note,
        }
    }
}

/// External document store whose writes fan out to contacts on its side.
#[async_trait]
pub trait RelayStore: Send + Sync {
    /// Durably create the record and return its key.
    async fn create_alert(&self, record: &AlertRecord) -> Result<String, RelayError>;
}

/// Success means the record exists, not that anyone was notified.
pub struct RelayChannel {
    store: Arc<dyn RelayStore>,
    sender_id: String,
}

impl RelayChannel {
    pub fn new(store: Arc<dyn RelayStore>, sender_id: impl Into<String>) -> Self {
        RelayChannel {
            store,
            sender_id: sender_id.into(),
        }
    }
}

#[async_trait]
impl DeliveryChannel for RelayChannel {
    fn name(&self) -> &str {
        "relay"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn attempt(&self, alert: &AlertRequest) -> Result<DeliveryOutcome, DispatchError> {
        let record = AlertRecord::new(&self.sender_id, &alert.location, Utc::now());
        let key = self.store.create_alert(&record).await?;
        info!("Alert record created at {}", key);
        Ok(DeliveryOutcome::sent("Alert broadcast to your emergency contacts"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::PermissionConfig;
    use crate::contacts::Address;
    use crate::fakes::FakeComposer;
    use crate::permissions::ConfiguredPermissions;

    fn alert(recipients: Vec<Recipient>, location: LocationFix) -> AlertRequest {
        AlertRequest {
            recipients,
            message: "SOS & help".to_string(),
            location,
        }
    }

    fn phone(number: &str) -> Recipient {
        Recipient {
            name: "Sam".to_string(),
            address: Address::Phone(number.to_string()),
        }
    }

    fn permissions(send_message: bool) -> Arc<dyn Permissions> {
        Arc::new(ConfiguredPermissions::new(PermissionConfig {
            radio: None,
            send_message: Some(send_message),
            location: None,
        }))
    }

    #[derive(Default)]
    struct RecordingSender {
        present: bool,
        sent: Mutex<Vec<(Vec<String>, String)>>,
    }

    #[async_trait]
    impl TextSender for RecordingSender {
        fn is_present(&self) -> bool {
            self.present
        }

        async fn send(&self, numbers: &[String], body: &str) -> io::Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((numbers.to_vec(), body.to_string()));
            Ok(())
        }
    }

    #[test]
    fn test_sms_uri() {
        let uri = sms_uri(
            &["+15551234567".to_string(), "+15557654321".to_string()],
            "SOS! q=37,-122",
        );
        assert_eq!(
            uri,
            "sms:+15551234567,+15557654321?body=SOS%21%20q%3D37%2C-122"
        );
        assert_eq!(sms_uri(&[], "Hilfe ü"), "sms:?body=Hilfe%20%C3%BC");
    }

    #[tokio::test]
    async fn test_direct_send_needs_capability_and_permission() {
        let absent =
            DirectSendChannel::new(Arc::new(RecordingSender::default()), permissions(true));
        assert!(!absent.is_available().await);

        let present = Arc::new(RecordingSender {
            present: true,
            ..Default::default()
        });
        let denied = DirectSendChannel::new(present.clone(), permissions(false));
        assert!(!denied.is_available().await);

        let channel = DirectSendChannel::new(present.clone(), permissions(true));
        assert!(channel.is_available().await);
    }

    #[tokio::test]
    async fn test_direct_send_texts_phone_numbers() {
        let sender = Arc::new(RecordingSender {
            present: true,
            ..Default::default()
        });
        let channel = DirectSendChannel::new(sender.clone(), permissions(true));
        let recipients = vec![
            phone("+15551234567"),
            Recipient {
                name: "Ops".to_string(),
                address: Address::Account("ops-7".to_string()),
            },
        ];

        let outcome = channel
            .attempt(&alert(recipients, LocationFix::default()))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.message, "Alert sent to 1 contact(s)");
        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent[0].0, vec!["+15551234567".to_string()]);
        assert_eq!(sent[0].1, "SOS & help");
    }

    #[tokio::test]
    async fn test_compose_success_is_unconfirmed() {
        let composer = FakeComposer::new(true);
        let channel = ComposeChannel::new(composer.clone());

        let outcome = channel
            .attempt(&alert(vec![phone("+15551234567")], LocationFix::default()))
            .await
            .unwrap();
        assert!(outcome.success);
        assert!(outcome.message.contains("confirm send manually"));
        assert_eq!(
            composer.opened(),
            vec!["sms:+15551234567?body=SOS%20%26%20help".to_string()]
        );
    }

    #[tokio::test]
    async fn test_compose_fails_when_not_openable() {
        let channel = ComposeChannel::new(FakeComposer::new(false));
        let result = channel
            .attempt(&alert(vec![phone("+15551234567")], LocationFix::default()))
            .await;
        assert!(matches!(result, Err(DispatchError::Channel { .. })));
    }

    #[test]
    fn test_alert_record_without_fix() {
        let timestamp = DateTime::parse_from_rfc3339("2026-10-16T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let record = AlertRecord::new("user-42", &LocationFix::default(), timestamp);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["senderId"], "user-42");
        assert_eq!(json["location"]["lat"], 0.0);
        assert_eq!(json["location"]["lng"], 0.0);
        assert!(json["locationUrl"].is_null());
        assert_eq!(json["status"], "active");
        assert!(json["note"].as_str().unwrap().contains("unavailable"));
    }

    #[test]
    fn test_alert_record_with_fix() {
        let fix = LocationFix::from(Some(Coordinates {
            lat: 37.0,
            lng: -122.0,
        }));
        let record = AlertRecord::new("user-42", &fix, Utc::now());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["locationUrl"], "https://maps.google.com/?q=37,-122");
        assert!(json.get("note").is_none());
    }

    struct MemoryStore {
        records: Mutex<Vec<AlertRecord>>,
    }

    #[async_trait]
    impl RelayStore for MemoryStore {
        async fn create_alert(&self, record: &AlertRecord) -> Result<String, RelayError> {
            let mut records = self.records.lock().unwrap();
            records.push(record.clone());
            Ok(format!("alerts/{}", records.len()))
        }
    }

    #[tokio::test]
    async fn test_relay_creates_active_record() {
        let store = Arc::new(MemoryStore {
            records: Mutex::new(Vec::new()),
        });
        let channel = RelayChannel::new(store.clone(), "user-42");

        let outcome = channel
            .attempt(&alert(Vec::new(), LocationFix::default()))
            .await
            .unwrap();
        assert!(outcome.success);
        let records = store.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, STATUS_ACTIVE);
        assert_eq!(records[0].sender_id, "user-42");
    }
}
