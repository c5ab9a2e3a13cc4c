//! Reconciles a mailing list on the provider with the desired membership.
//!
//! Every call fetches the current remote state and converges from there, so a call
//! that aborted halfway can simply be repeated.
use crate::directory::{DirectoryError, ListDirectory, RemoteList};
use crate::metrics_defs::{
    LISTS_CREATED, LISTS_DELETED, LISTS_RENAMED, MEMBERS_ADDED, MEMBERS_REMOVED, MEMBERS_UPDATED,
    RECONCILE_DURATION,
};
use crate::notifier::Notifier;
use crate::types::{ListAddress, Membership, Subscriber, list_name};
use shared::{counter, histogram};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;
use url::Url;

#[derive(Debug, Default, PartialEq)]
struct Changes {
    created: bool,
    deleted: bool,
    renamed: bool,
    added: usize,
    removed: usize,
    updated: usize,
}

pub struct Reconciler {
    directory: Arc<dyn ListDirectory>,
    notifier: Notifier,
    domain: String,
    site_url: Url,
}

impl Reconciler {
    pub fn new(directory: Arc<dyn ListDirectory>, domain: impl Into<String>, site_url: Url) -> Self {
        let domain = domain.into();
        Reconciler {
            notifier: Notifier::new(directory.clone(), domain.clone()),
            directory,
            domain,
            site_url,
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn address(&self, list_id: &str) -> ListAddress {
        ListAddress::new(list_id, &self.domain)
    }

    // Points back at the list's settings page on the owning site.
    fn unsubscribe_url(&self, list_id: &str) -> String {
        format!(
            "{}/{}/settings/#configureMailingListAnchor",
            self.site_url.as_str().trim_end_matches('/'),
            list_id
        )
    }

    /// Brings the remote list in line with `should_exist` and `desired`.
    ///
    /// The first failing remote call aborts the reconciliation and is returned as is.
    /// The creation announcement is only sent by the call that created the list: when
    /// a member add fails right after creation, the repeated call finds the list and
    /// adds the remaining members without announcing.
    pub async fn reconcile(
        &self,
        list_id: &str,
        list_title: &str,
        should_exist: bool,
        desired: &Membership,
    ) -> Result<(), DirectoryError> {
        let started = Instant::now();
        let address = self.address(list_id);

        let remote = self.directory.fetch_list(&address).await?;
        let changes = match (should_exist, remote) {
            (true, None) => self.create(list_id, list_title, &address, desired).await?,
            (true, Some(remote)) => {
                self.synchronize(list_id, list_title, &address, remote, desired)
                    .await?
            }
            (false, Some(_)) => {
                self.directory.delete_list(&address).await?;
                counter!(LISTS_DELETED).increment(1);
                Changes {
                    deleted: true,
                    ..Changes::default()
                }
            }
            (false, None) => Changes::default(),
        };

        histogram!(RECONCILE_DURATION).record(started.elapsed().as_secs_f64());
        tracing::info!(
            list = %address,
            created = changes.created,
            deleted = changes.deleted,
            renamed = changes.renamed,
            added = changes.added,
            removed = changes.removed,
            updated = changes.updated,
            "Reconciled mailing list"
        );
        Ok(())
    }

    async fn create(
        &self,
        list_id: &str,
        list_title: &str,
        address: &ListAddress,
        desired: &Membership,
    ) -> Result<Changes, DirectoryError> {
        self.directory
            .create_list(address, &list_name(list_title))
            .await?;
        counter!(LISTS_CREATED).increment(1);

        let unsubscribe_url = self.unsubscribe_url(list_id);
        for member in desired.values() {
            self.directory
                .add_member(address, member, &unsubscribe_url)
                .await?;
            counter!(MEMBERS_ADDED).increment(1);
        }

        let mut recipients: Vec<String> = desired.values().map(|m| m.email.clone()).collect();
        recipients.sort();
        self.notifier
            .announce_creation(list_id, list_title, &recipients)
            .await?;

        Ok(Changes {
            created: true,
            added: desired.len(),
            ..Changes::default()
        })
    }

    /// Brings an existing list in line with `desired`.
    ///
    /// Calls are ordered so that no call needs an address still held by another
    /// member: removals first, then in-place updates, then additions.
    async fn synchronize(
        &self,
        list_id: &str,
        list_title: &str,
        address: &ListAddress,
        remote: RemoteList,
        desired: &Membership,
    ) -> Result<Changes, DirectoryError> {
        let RemoteList {
            name,
            members: mut observed,
            duplicates,
        } = remote;
        let mut changes = Changes::default();

        let expected_name = list_name(list_title);
        if name != expected_name {
            self.directory.rename_list(address, &expected_name).await?;
            counter!(LISTS_RENAMED).increment(1);
            changes.renamed = true;
        }

        let mut stale: Vec<Subscriber> = duplicates;
        stale.extend(
            observed
                .iter()
                .filter(|(id, _)| !desired.contains_key(*id))
                .map(|(_, member)| member.clone()),
        );
        observed.retain(|id, _| desired.contains_key(id));
        stale.sort_by(|a, b| a.email.cmp(&b.email));
        for member in &stale {
            self.directory.remove_member(address, &member.email).await?;
            counter!(MEMBERS_REMOVED).increment(1);
            changes.removed += 1;
        }

        let unsubscribe_url = self.unsubscribe_url(list_id);
        let mut pending: Vec<(String, &Subscriber)> = observed
            .iter()
            .filter_map(|(id, current)| {
                let wanted = desired.get(id)?;
                current
                    .differs_from(wanted)
                    .then(|| (current.email.clone(), wanted))
            })
            .collect();
        pending.sort_by(|a, b| a.1.id.cmp(&b.1.id));
        let mut occupied: HashSet<String> =
            observed.values().map(|m| m.email.clone()).collect();
        let mut readd = Vec::new();

        // Members are addressed by their previous email so the provider keeps their history.
        while !pending.is_empty() {
            let ready = pending.iter().position(|(old_email, wanted)| {
                wanted.email == *old_email || !occupied.contains(&wanted.email)
            });
            match ready {
                Some(index) => {
                    let (old_email, wanted) = pending.remove(index);
                    self.directory
                        .update_member(address, &old_email, wanted)
                        .await?;
                    occupied.remove(&old_email);
                    occupied.insert(wanted.email.clone());
                    counter!(MEMBERS_UPDATED).increment(1);
                    changes.updated += 1;
                }
                // Every remaining target address is held by another pending member,
                // e.g. two members swapping addresses. Break the cycle by re-adding one.
                None => {
                    let (old_email, wanted) = pending.remove(0);
                    self.directory.remove_member(address, &old_email).await?;
                    occupied.remove(&old_email);
                    readd.push(wanted);
                }
            }
        }

        for member in readd {
            self.directory
                .add_member(address, member, &unsubscribe_url)
                .await?;
            counter!(MEMBERS_UPDATED).increment(1);
            changes.updated += 1;
        }

        let mut additions: Vec<&Subscriber> = desired
            .iter()
            .filter(|(id, _)| !observed.contains_key(*id))
            .map(|(_, member)| member)
            .collect();
        additions.sort_by(|a, b| a.id.cmp(&b.id));
        for member in additions {
            self.directory
                .add_member(address, member, &unsubscribe_url)
                .await?;
            counter!(MEMBERS_ADDED).increment(1);
            changes.added += 1;
        }

        Ok(changes)
    }
}
