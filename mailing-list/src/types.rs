use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub type SubscriberId = String;

/// Mapping of subscriber id to subscriber. Used both for the desired membership
/// supplied by the caller and for the membership observed on the provider.
pub type Membership = HashMap<SubscriberId, Subscriber>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: SubscriberId,
    pub email: String,
    pub name: String,
    pub subscribed: bool,
}

impl Subscriber {
    pub fn new<I, E, N>(id: I, email: E, name: N, subscribed: bool) -> Self
    where
        I: Into<String>,
        E: Into<String>,
        N: Into<String>,
    {
        Subscriber {
            id: id.into(),
            email: email.into(),
            name: name.into(),
            subscribed,
        }
    }

    /// Whether the provider-visible fields differ. The id is the key and is not compared.
    pub fn differs_from(&self, other: &Subscriber) -> bool {
        self.email != other.email || self.name != other.name || self.subscribed != other.subscribed
    }
}

/// Subscriber record without its id, as carried in member files keyed by id.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct SubscriberEntry {
    pub email: String,
    pub name: String,
    #[serde(default = "default_subscribed")]
    pub subscribed: bool,
}

fn default_subscribed() -> bool {
    true
}

/// Builds a membership from entries keyed by subscriber id.
pub fn membership_from_entries(entries: HashMap<SubscriberId, SubscriberEntry>) -> Membership {
    entries
        .into_iter()
        .map(|(id, entry)| {
            let subscriber = Subscriber::new(id.clone(), entry.email, entry.name, entry.subscribed);
            (id, subscriber)
        })
        .collect()
}

/// The address of a mailing list on the provider. Always derived from the list id
/// and the configured mail domain, never stored.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ListAddress(String);

impl ListAddress {
    pub fn new(list_id: &str, domain: &str) -> Self {
        ListAddress(format!("{list_id}@{domain}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ListAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Display name of the provider list for a list title.
pub fn list_name(list_title: &str) -> String {
    format!("{list_title} Mailing List")
}
