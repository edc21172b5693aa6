use std::collections::HashSet;

use futures::StreamExt as _;
use futures::stream::BoxStream;
use log::{debug, info};
use tokio::sync::mpsc;

use crate::messages::PeripheralDevice;
use crate::radio::Advertisement;

/// Name fragments used by the panic button firmwares seen in the field.
/// Matching is case-sensitive.
pub const NAME_PATTERNS: &[&str] = &["HM", "BT", "SOS", "MLT", "BLE"];

pub fn name_matches(name: &str) -> bool {
    NAME_PATTERNS.iter().any(|pattern| name.contains(pattern))
}

/// Filter and de-duplication state for one scan session.
#[derive(Default)]
pub struct Scanner {
    seen: HashSet<String>,
}

impl Scanner {
    pub fn new() -> Self {
        Scanner::default()
    }

    /// Returns the device the first time a matching advertiser is seen in
    /// this session, `None` otherwise.
    pub fn accept(&mut self, advertisement: Advertisement) -> Option<PeripheralDevice> {
        let name = advertisement.name.as_deref()?;
        if !name_matches(name) || !self.seen.insert(advertisement.id.clone()) {
            return None;
        }
        Some(PeripheralDevice {
            id: advertisement.id,
            name: advertisement.name,
            rssi: advertisement.rssi,
        })
    }

    /// Forward matching advertisements to `sink` until the stream ends or
    /// the receiving side is dropped.
    pub async fn run(
        mut self,
        mut advertisements: BoxStream<'static, Advertisement>,
        sink: mpsc::UnboundedSender<PeripheralDevice>,
    ) {
        while let Some(advertisement) = advertisements.next().await {
            let Some(device) = self.accept(advertisement) else {
                continue;
            };
            info!("Discovered {}", device);
            if sink.send(device).is_err() {
                debug!("Scan sink closed");
                break;
            }
        }
        debug!("Scan stream ended after {} device(s)", self.seen.len());
    }
}
