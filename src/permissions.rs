use std::fmt;

use async_trait::async_trait;

use crate::config::PermissionConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permission {
    /// Scan and connect rights for the link radio.
    Radio,
    /// Sending text messages without user interaction.
    SendMessage,
    Location,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Permission::Radio => "bluetooth",
            Permission::SendMessage => "send message",
            Permission::Location => "location",
        })
    }
}

/// Platform permission prompts. Each permission is requested on its own and
/// a denial is reported back, never retried here.
#[async_trait]
pub trait Permissions: Send + Sync {
    async fn check(&self, permission: Permission) -> bool;

    async fn request(&self, permission: Permission) -> bool;
}

/// Hosts without an interactive prompt answer from configuration.
#[derive(Debug, Clone)]
pub struct ConfiguredPermissions {
    config: PermissionConfig,
}

impl ConfiguredPermissions {
    pub fn new(config: PermissionConfig) -> Self {
        ConfiguredPermissions { config }
    }

    fn granted(&self, permission: Permission) -> bool {
        match permission {
            Permission::Radio => self.config.radio.unwrap_or(true),
            Permission::SendMessage => self.config.send_message.unwrap_or(true),
            Permission::Location => self.config.location.unwrap_or(true),
        }
    }
}

#[async_trait]
impl Permissions for ConfiguredPermissions {
    async fn check(&self, permission: Permission) -> bool {
        self.granted(permission)
    }

    async fn request(&self, permission: Permission) -> bool {
        let granted = self.granted(permission);
        if !granted {
            log::warn!("Permission {} denied by configuration", permission);
        }
        granted
    }
}
