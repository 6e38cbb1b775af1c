//! Status change notifications to the other parties of a bill.
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::info;

use crate::bol::{BillOfLading, Party};
use crate::status::BolStatus;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("notification channel unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub role: &'static str,
    pub contact_id: String,
    pub name: String,
    pub email: Option<String>,
}

impl Recipient {
    fn from_party(role: &'static str, party: &Party) -> Self {
        Self {
            role,
            contact_id: party.contact_id.clone(),
            name: party.name.clone(),
            email: party.email.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub bol_number: String,
    pub status: BolStatus,
    pub actor: String,
    pub note: Option<String>,
    pub recipients: Vec<Recipient>,
}

impl Notification {
    pub fn subject(&self) -> String {
        format!("{} is now {}", self.bol_number, self.status)
    }
}

/// Who hears about a move into `status`. The actor never notifies themselves
/// and a missing broker is simply skipped.
pub fn recipients_for(bol: &BillOfLading, status: BolStatus, actor: &str) -> Vec<Recipient> {
    let roles: &[&'static str] = match status {
        BolStatus::Pending => &[],
        BolStatus::Approved => &["carrier", "broker"],
        BolStatus::Assigned => &["carrier"],
        BolStatus::Accepted => &["shipper", "broker"],
        BolStatus::PickedUp => &["shipper", "consignee"],
        BolStatus::EnRoute => &["consignee"],
        BolStatus::Delivered => &["shipper", "consignee", "broker"],
        BolStatus::Unpaid => &["shipper", "broker"],
        BolStatus::Paid => &["carrier", "broker"],
    };

    roles
        .iter()
        .filter_map(|role| {
            let party = match *role {
                "shipper" => Some(&bol.shipper),
                "consignee" => Some(&bol.consignee),
                "carrier" => Some(&bol.carrier),
                _ => bol.broker.as_ref(),
            }?;
            (party.contact_id != actor).then(|| Recipient::from_party(*role, party))
        })
        .collect()
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log instead of sending them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        for recipient in &notification.recipients {
            info!(
                bol_number = %notification.bol_number,
                status = %notification.status,
                role = recipient.role,
                contact_id = %recipient.contact_id,
                "{}",
                notification.subject()
            );
        }
        Ok(())
    }
}

/// Keeps every delivered notification, can be switched off to fail deliveries.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: AtomicBool,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(NotifyError::Unavailable("mail relay down".into()));
        }
        self.sent
            .lock()
            .map_err(|_| NotifyError::Unavailable("notifier poisoned".into()))?
            .push(notification.clone());
        Ok(())
    }
}
