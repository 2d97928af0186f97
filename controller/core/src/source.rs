use crate::Nic;
use anyhow::Result;

/// Queries the virtualization platform for NIC state.
#[async_trait::async_trait]
pub trait NicSource: Send + Sync {
    /// Fetches a single NIC, returning `None` if it doesn't exist.
    async fn get_nic(&self, id: &str) -> Result<Option<Nic>>;

    /// Lists every NIC known to the platform.
    async fn list_nics(&self) -> Result<Vec<Nic>>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

/// A change notification from the platform's push feed.
///
/// Notifications only identify the NIC; its state must be fetched through a
/// [`NicSource`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NicChange {
    pub action: ChangeAction,
    pub id: String,
}
