//! Turns a trigger into one delivered (or failed) alert.
//!
//! At most one alert is in flight at a time. A trigger arriving while one
//! runs is rejected without side effects. Every completed trigger, whatever
//! its outcome, lands in the history log.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt as _;
use log::{error, info, warn};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::channels::{AlertRequest, DeliveryChannel};
use crate::contacts::ContactStore;
use crate::error::DispatchError;
use crate::history::{HistoryEntry, HistoryLog};
use crate::location::{LocationAcquirer, LocationFix};
use crate::messages::{DeliveryOutcome, DispatchPhase};

pub const ALREADY_IN_PROGRESS: &str = "already in progress";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HapticCue {
    Triggered,
    Finished,
}

pub trait Haptics: Send + Sync {
    fn cue(&self, cue: HapticCue);
}

/// For hosts without a vibration motor.
pub struct LogHaptics;

impl Haptics for LogHaptics {
    fn cue(&self, cue: HapticCue) {
        log::debug!("Haptic cue {:?}", cue);
    }
}

/// Makes sure the sender identity is usable by the delivery side before
/// anything is sent.
#[async_trait]
pub trait Registration: Send + Sync {
    async fn ensure_ready(&self) -> Result<(), DispatchError>;
}

pub struct NoRegistration;

#[async_trait]
impl Registration for NoRegistration {
    async fn ensure_ready(&self) -> Result<(), DispatchError> {
        Ok(())
    }
}

pub enum Delivery {
    /// Channels tried in priority order; the first available one is used.
    Direct(Vec<Arc<dyn DeliveryChannel>>),
    /// Fan-out to contacts happens on the relay side.
    Relay(Arc<dyn DeliveryChannel>),
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct DispatchPipeline {
    in_flight: AtomicBool,
    started: StdMutex<Option<Instant>>,
    sender_name: String,
    location: LocationAcquirer,
    contacts: Arc<dyn ContactStore>,
    delivery: Delivery,
    registration: Arc<dyn Registration>,
    haptics: Arc<dyn Haptics>,
    history: Mutex<HistoryLog>,
}

impl DispatchPipeline {
    pub fn new(
        location: LocationAcquirer,
        contacts: Arc<dyn ContactStore>,
        delivery: Delivery,
        history: HistoryLog,
    ) -> Self {
        DispatchPipeline {
            in_flight: AtomicBool::new(false),
            started: StdMutex::new(None),
            sender_name: "a contact".to_string(),
            location,
            contacts,
            delivery,
            registration: Arc::new(NoRegistration),
            haptics: Arc::new(LogHaptics),
            history: Mutex::new(history),
        }
    }

    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_name = name.into();
        self
    }

    pub fn with_registration(mut self, registration: Arc<dyn Registration>) -> Self {
        self.registration = registration;
        self
    }

    #[cfg(test)]
    pub fn with_haptics(mut self, haptics: Arc<dyn Haptics>) -> Self {
        self.haptics = haptics;
        self
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Clear a stuck in-flight guard.
    ///
    /// An alert still running when this is called keeps going and will
    /// record its history entry and clear the guard when it finishes, which
    /// may also release the guard of a trigger started after the reset.
    pub fn reset_guard(&self) {
        warn!("Resetting alert guard; an alert still running will clear it again when it ends");
        self.in_flight.store(false, Ordering::Release);
    }

    /// Reset the guard if the alert holding it has run for at least `limit`.
    /// Returns whether a reset happened.
    pub fn reset_if_stuck(&self, limit: Duration) -> bool {
        if !self.is_in_flight() {
            return false;
        }
        let started = *self.started.lock().unwrap_or_else(PoisonError::into_inner);
        match started {
            Some(at) if at.elapsed() >= limit => {
                warn!("Alert in flight for {:?}", at.elapsed());
                self.reset_guard();
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub async fn history(&self) -> Vec<HistoryEntry> {
        self.history.lock().await.entries().cloned().collect()
    }

    /// Send an alert. Failures come back as an unsuccessful outcome, never
    /// as an error.
    pub async fn trigger_alert(
        &self,
        progress: &(dyn Fn(DispatchPhase) + Send + Sync),
    ) -> DeliveryOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Alert already in progress, trigger ignored");
            return DeliveryOutcome::failed(ALREADY_IN_PROGRESS);
        }
        let _in_flight = InFlight(&self.in_flight);
        *self.started.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        self.haptics.cue(HapticCue::Triggered);

        let mut link = None;
        let outcome = match AssertUnwindSafe(self.run(progress, &mut link))
            .catch_unwind()
            .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => DeliveryOutcome::failed(err.to_string()),
            Err(_) => DeliveryOutcome::failed(DispatchError::Panicked.to_string()),
        };
        let outcome = match &link {
            Some(link) if outcome.success => DeliveryOutcome::sent(format!(
                "{}. Location: {}",
                outcome.message, link
            )),
            _ => outcome,
        };

        if outcome.success {
            info!("Alert delivered: {}", outcome.message);
        } else {
            error!("Alert failed: {}", outcome.message);
        }
        self.history
            .lock()
            .await
            .append(HistoryEntry {
                timestamp: Utc::now(),
                location_link: link,
                success: outcome.success,
                message: outcome.message.clone(),
            })
            .await;

        self.haptics.cue(HapticCue::Finished);
        outcome
    }

    async fn run(
        &self,
        progress: &(dyn Fn(DispatchPhase) + Send + Sync),
        link: &mut Option<String>,
    ) -> Result<DeliveryOutcome, DispatchError> {
        progress(DispatchPhase::Initializing);
        if let Err(err) = self.registration.ensure_ready().await {
            warn!("{}, continuing", err);
        }

        progress(DispatchPhase::AcquiringLocation);
        let fix = self.location.acquire().await;
        link.clone_from(&fix.link);
        let message = alert_message(&self.sender_name, &fix);

        progress(DispatchPhase::Sending);
        match &self.delivery {
            Delivery::Direct(channels) => {
                let recipients = self.contacts.recipients().await?;
                if recipients.is_empty() {
                    return Err(DispatchError::NoRecipients);
                }
                let channel = first_available(channels)
                    .await
                    .ok_or(DispatchError::ChannelUnavailable)?;
                info!(
                    "Sending alert to {} contact(s) via {}",
                    recipients.len(),
                    channel.name()
                );
                channel
                    .attempt(&AlertRequest {
                        recipients,
                        message,
                        location: fix,
                    })
                    .await
            }
            Delivery::Relay(channel) => {
                info!("Sending alert via {}", channel.name());
                channel
                    .attempt(&AlertRequest {
                        recipients: Vec::new(),
                        message,
                        location: fix,
                    })
                    .await
            }
        }
    }
}

async fn first_available(
    channels: &[Arc<dyn DeliveryChannel>],
) -> Option<&Arc<dyn DeliveryChannel>> {
    for channel in channels {
        if channel.is_available().await {
            return Some(channel);
        }
        warn!("Channel {} unavailable", channel.name());
    }
    None
}

fn alert_message(sender_name: &str, fix: &LocationFix) -> String {
    match &fix.link {
        Some(link) => format!("EMERGENCY SOS from {sender_name}! I need help. My location: {link}"),
        None => format!(
            "EMERGENCY SOS from {sender_name}! I need help. My location could not be determined."
        ),
    }
}
