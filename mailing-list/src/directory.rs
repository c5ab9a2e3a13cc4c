//! The remote list directory: the mailing list provider's view of lists and members.
use crate::types::{ListAddress, Membership, Subscriber};
use async_trait::async_trait;
use http::StatusCode;
use std::collections::hash_map::Entry;

#[derive(thiserror::Error, Debug)]
pub enum DirectoryError {
    #[error("{operation} returned unexpected status {status}")]
    UnexpectedStatus {
        operation: &'static str,
        status: StatusCode,
    },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid response from {operation}: {reason}")]
    InvalidResponse {
        operation: &'static str,
        reason: String,
    },
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl DirectoryError {
    /// Protocol, transport and malformed-response faults may succeed when the
    /// whole call is repeated. A bad URL never will.
    pub fn is_retryable(&self) -> bool {
        match self {
            DirectoryError::UnexpectedStatus { .. }
            | DirectoryError::Transport(_)
            | DirectoryError::InvalidResponse { .. } => true,
            DirectoryError::InvalidUrl(_) => false,
        }
    }
}

/// Metadata and membership of a list that exists on the provider.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteList {
    pub name: String,
    pub members: Membership,
    /// Members whose id is already taken by an entry of `members`.
    pub duplicates: Vec<Subscriber>,
}

impl RemoteList {
    /// Keys members by id. The first member seen for an id wins, later ones end up
    /// in `duplicates`.
    pub fn from_members(
        name: impl Into<String>,
        members: impl IntoIterator<Item = Subscriber>,
    ) -> Self {
        let mut keyed = Membership::new();
        let mut duplicates = Vec::new();
        for member in members {
            match keyed.entry(member.id.clone()) {
                Entry::Occupied(_) => duplicates.push(member),
                Entry::Vacant(slot) => {
                    slot.insert(member);
                }
            }
        }
        RemoteList {
            name: name.into(),
            members: keyed,
            duplicates,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub text: String,
}

#[async_trait]
pub trait ListDirectory: Send + Sync {
    /// Fetches list metadata together with its members. A missing list is `Ok(None)`.
    async fn fetch_list(&self, address: &ListAddress) -> Result<Option<RemoteList>, DirectoryError>;

    async fn create_list(&self, address: &ListAddress, name: &str) -> Result<(), DirectoryError>;

    async fn rename_list(&self, address: &ListAddress, name: &str) -> Result<(), DirectoryError>;

    async fn delete_list(&self, address: &ListAddress) -> Result<(), DirectoryError>;

    async fn add_member(
        &self,
        address: &ListAddress,
        member: &Subscriber,
        unsubscribe_url: &str,
    ) -> Result<(), DirectoryError>;

    /// Updates the member currently known by `old_email` in place.
    async fn update_member(
        &self,
        address: &ListAddress,
        old_email: &str,
        member: &Subscriber,
    ) -> Result<(), DirectoryError>;

    async fn remove_member(&self, address: &ListAddress, email: &str) -> Result<(), DirectoryError>;

    async fn send_message(&self, message: &Message) -> Result<(), DirectoryError>;
}
