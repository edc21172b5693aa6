//! Best-effort, time-bounded position lookup.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde_derive::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::LocationConfig;
use crate::permissions::{Permission, Permissions};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn map_link(&self) -> String {
        format!("https://maps.google.com/?q={},{}", self.lat, self.lng)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocationFix {
    pub coordinates: Option<Coordinates>,
    pub link: Option<String>,
}

impl From<Option<Coordinates>> for LocationFix {
    fn from(coordinates: Option<Coordinates>) -> Self {
        LocationFix {
            coordinates,
            link: coordinates.map(|c| c.map_link()),
        }
    }
}

#[async_trait]
pub trait LocationProvider: Send + Sync + 'static {
    async fn has_permission(&self) -> bool;

    async fn request_permission(&self) -> bool;

    async fn current_position(&self) -> Option<Coordinates>;

    async fn last_known_position(&self) -> Option<Coordinates>;
}

/// Runs `op` on its own task and waits at most `limit` for it. When the
/// timer wins the task is left running and its result is discarded.
async fn race<T, F>(limit: Duration, op: F) -> Option<T>
where
    T: Send + 'static,
    F: Future<Output = T> + Send + 'static,
{
    let handle = tokio::spawn(op);
    match tokio::time::timeout(limit, handle).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            warn!("Location request failed: {}", err);
            None
        }
        Err(_) => None,
    }
}

pub struct LocationAcquirer {
    provider: Arc<dyn LocationProvider>,
    permission_timeout: Duration,
    fix_timeout: Duration,
}

impl LocationAcquirer {
    pub fn new(provider: Arc<dyn LocationProvider>) -> Self {
        LocationAcquirer {
            provider,
            permission_timeout: Duration::from_secs(2),
            fix_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_config(provider: Arc<dyn LocationProvider>, config: &LocationConfig) -> Self {
        let mut acquirer = LocationAcquirer::new(provider);
        if let Some(ms) = config.permission_timeout_ms {
            acquirer.permission_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = config.fix_timeout_ms {
            acquirer.fix_timeout = Duration::from_millis(ms);
        }
        acquirer
    }

    /// Never fails; a missing position is reported as an empty fix.
    pub async fn acquire(&self) -> LocationFix {
        if !self.ensure_permission().await {
            warn!("Location permission unavailable, sending without position");
            return LocationFix::default();
        }

        let provider = self.provider.clone();
        let live = race(self.fix_timeout, async move { provider.current_position().await })
            .await
            .flatten();
        let coordinates = match live {
            Some(coordinates) => Some(coordinates),
            None => {
                warn!("No live position within {:?}, using last known", self.fix_timeout);
                self.provider.last_known_position().await
            }
        };
        debug!("Location fix: {:?}", coordinates);
        LocationFix::from(coordinates)
    }

    async fn ensure_permission(&self) -> bool {
        if self.provider.has_permission().await {
            return true;
        }
        let provider = self.provider.clone();
        race(self.permission_timeout, async move {
            provider.request_permission().await
        })
        .await
        .unwrap_or(false)
    }
}

fn parse_fix(text: &str) -> Option<Coordinates> {
    let (lat, lng) = text.trim().split_once(',')?;
    let lat: f64 = lat.trim().parse().ok()?;
    let lng: f64 = lng.trim().parse().ok()?;
    ((-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng))
        .then_some(Coordinates { lat, lng })
}

/// Reads the position from an external program printing `lat,lng`. The
/// last successful reading serves as the cached position.
pub struct CommandLocationProvider {
    command: Option<Vec<String>>,
    permissions: Arc<dyn Permissions>,
    last_known: Mutex<Option<Coordinates>>,
}

impl CommandLocationProvider {
    pub fn new(config: &LocationConfig, permissions: Arc<dyn Permissions>) -> Self {
        let seed = match (config.last_known_latitude, config.last_known_longitude) {
            (Some(lat), Some(lng)) => Some(Coordinates { lat, lng }),
            _ => None,
        };
        CommandLocationProvider {
            command: config.command.clone(),
            permissions,
            last_known: Mutex::new(seed),
        }
    }
}

#[async_trait]
impl LocationProvider for CommandLocationProvider {
    async fn has_permission(&self) -> bool {
        self.permissions.check(Permission::Location).await
    }

    async fn request_permission(&self) -> bool {
        self.permissions.request(Permission::Location).await
    }

    async fn current_position(&self) -> Option<Coordinates> {
        let (program, args) = self.command.as_deref()?.split_first()?;
        let output = match tokio::process::Command::new(program).args(args).output().await {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                warn!("Location command exited with {}", output.status);
                return None;
            }
            Err(err) => {
                warn!("Could not run location command {}: {}", program, err);
                return None;
            }
        };
        let fix = parse_fix(&String::from_utf8_lossy(&output.stdout))?;
        *self.last_known.lock().await = Some(fix);
        Some(fix)
    }

    async fn last_known_position(&self) -> Option<Coordinates> {
        *self.last_known.lock().await
    }
}
