use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};

use crate::error::DispatchError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Address {
    Phone(String),
    /// Linked account on the relay side.
    Account(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub name: String,
    #[serde(flatten)]
    pub address: Address,
}

impl Recipient {
    pub fn phone(&self) -> Option<&str> {
        match &self.address {
            Address::Phone(number) => Some(number),
            Address::Account(_) => None,
        }
    }
}

/// Emergency contacts, owned by whoever edits them. Read-only here.
#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn recipients(&self) -> Result<Vec<Recipient>, DispatchError>;
}

/// Keeps the first occurrence of each address, in order.
pub fn dedup(recipients: Vec<Recipient>) -> Vec<Recipient> {
    let mut seen = HashSet::new();
    recipients
        .into_iter()
        .filter(|r| seen.insert(r.address.clone()))
        .collect()
}

pub struct StaticContacts {
    recipients: Vec<Recipient>,
}

impl StaticContacts {
    pub fn new(recipients: Vec<Recipient>) -> Self {
        StaticContacts {
            recipients: dedup(recipients),
        }
    }
}

#[async_trait]
impl ContactStore for StaticContacts {
    async fn recipients(&self) -> Result<Vec<Recipient>, DispatchError> {
        Ok(self.recipients.clone())
    }
}

/// Contacts stored as a JSON array, re-read on every alert so edits made
/// elsewhere are picked up.
pub struct FileContactStore {
    path: PathBuf,
}

impl FileContactStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileContactStore { path: path.into() }
    }
}

#[async_trait]
impl ContactStore for FileContactStore {
    async fn recipients(&self) -> Result<Vec<Recipient>, DispatchError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No contacts file at {}", self.path.display());
                return Ok(Vec::new());
            }
            Err(err) => return Err(DispatchError::Contacts(err.to_string())),
        };
        let recipients: Vec<Recipient> = serde_json::from_str(&contents)
            .map_err(|err| DispatchError::Contacts(err.to_string()))?;
        Ok(dedup(recipients))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phone(name: &str, number: &str) -> Recipient {
        Recipient {
            name: name.to_string(),
            address: Address::Phone(number.to_string()),
        }
    }

    #[tokio::test]
    async fn test_static_contacts_dedup_by_address() {
        let store = StaticContacts::new(vec![
            phone("Sam", "+15551234567"),
            phone("Sam again", "+15551234567"),
            phone("Alex", "+15557654321"),
        ]);
        let recipients = store.recipients().await.unwrap();
        assert_eq!(recipients.len(), 2);
        assert_eq!(recipients[0].name, "Sam");
        assert_eq!(recipients[1].name, "Alex");
    }

    #[tokio::test]
    async fn test_file_contacts() {
        let path =
            std::env::temp_dir().join(format!("sosband-contacts-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"[{"name":"Sam","phone":"+15551234567"},{"name":"Ops","account":"ops-7"}]"#,
        )
        .unwrap();

        let recipients = FileContactStore::new(&path).recipients().await.unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(recipients.len(), 2);
        assert_eq!(recipients[0].phone(), Some("+15551234567"));
        assert_eq!(recipients[1].address, Address::Account("ops-7".to_string()));
    }

    #[tokio::test]
    async fn test_missing_contacts_file_is_empty() {
        let store = FileContactStore::new("/nonexistent/sosband/contacts.json");
        assert!(store.recipients().await.unwrap().is_empty());
    }
}
