//! Mailgun-compatible implementation of the list directory.
use crate::config::MailgunConfig;
use crate::directory::{DirectoryError, ListDirectory, Message, RemoteList};
use crate::metrics_defs::MAILGUN_REQUESTS;
use crate::types::{ListAddress, Subscriber};
use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use shared::counter;
use std::time::Duration;
use url::Url;

const API_USER: &str = "api";
// Largest page the members endpoint serves
const MEMBERS_PAGE_SIZE: usize = 100;

#[derive(Deserialize)]
struct ListResponse {
    list: ListInfo,
}

#[derive(Deserialize)]
struct ListInfo {
    name: String,
}

#[derive(Deserialize)]
struct MembersResponse {
    items: Vec<MemberItem>,
}

#[derive(Deserialize)]
struct MemberItem {
    address: String,
    name: Option<String>,
    subscribed: bool,
    vars: Option<MemberVars>,
}

#[derive(Deserialize)]
struct MemberVars {
    id: Option<String>,
}

impl MemberItem {
    // Members added outside of this system carry no id. They are keyed by address so
    // that reconciliation treats them as foreign.
    fn into_subscriber(self) -> Subscriber {
        let id = self
            .vars
            .and_then(|vars| vars.id)
            .unwrap_or_else(|| self.address.clone());
        Subscriber {
            id,
            email: self.address,
            name: self.name.unwrap_or_default(),
            subscribed: self.subscribed,
        }
    }
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

pub struct MailgunDirectory {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
    domain: String,
}

impl MailgunDirectory {
    pub fn new(config: &MailgunConfig) -> Result<Self, DirectoryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(MailgunDirectory {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            domain: config.domain.clone(),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, DirectoryError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DirectoryError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<Response, DirectoryError> {
        let response = request
            .basic_auth(API_USER, Some(&self.api_key))
            .send()
            .await?;

        counter!(
            MAILGUN_REQUESTS,
            "operation" => operation,
            "status" => response.status().as_str().to_owned()
        )
        .increment(1);

        Ok(response)
    }

    /// Sends a request where only 200 counts as success.
    async fn execute(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<(), DirectoryError> {
        let response = self.send(operation, request).await?;
        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(DirectoryError::UnexpectedStatus { operation, status }),
        }
    }

    /// Sends a read request. 404 is a regular outcome and maps to `None`.
    async fn read<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<Option<T>, DirectoryError> {
        let response = self.send(operation, request).await?;
        match response.status() {
            StatusCode::OK => {
                let body = response.json::<T>().await.map_err(|e| {
                    DirectoryError::InvalidResponse {
                        operation,
                        reason: e.to_string(),
                    }
                })?;
                Ok(Some(body))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(DirectoryError::UnexpectedStatus { operation, status }),
        }
    }
}

impl MailgunDirectory {
    /// Reads every member page of a list. A page shorter than the page size is the last one.
    async fn fetch_members(&self, address: &ListAddress) -> Result<Vec<Subscriber>, DirectoryError> {
        let url = self.url(&["lists", address.as_str(), "members"])?;
        let limit = MEMBERS_PAGE_SIZE.to_string();
        let mut members = Vec::new();

        loop {
            let skip = members.len().to_string();
            let request = self
                .client
                .get(url.clone())
                .query(&[("limit", limit.as_str()), ("skip", skip.as_str())]);
            let Some(page) = self.read::<MembersResponse>("fetch_members", request).await? else {
                break;
            };

            let count = page.items.len();
            members.extend(page.items.into_iter().map(MemberItem::into_subscriber));
            if count < MEMBERS_PAGE_SIZE {
                break;
            }
        }

        Ok(members)
    }
}

#[async_trait]
impl ListDirectory for MailgunDirectory {
    async fn fetch_list(&self, address: &ListAddress) -> Result<Option<RemoteList>, DirectoryError> {
        let url = self.url(&["lists", address.as_str()])?;
        let Some(info) = self
            .read::<ListResponse>("fetch_list", self.client.get(url))
            .await?
        else {
            return Ok(None);
        };

        let members = self.fetch_members(address).await?;
        Ok(Some(RemoteList::from_members(info.list.name, members)))
    }

    async fn create_list(&self, address: &ListAddress, name: &str) -> Result<(), DirectoryError> {
        tracing::debug!(list = %address, name, "Creating list");
        let url = self.url(&["lists"])?;
        let form = [
            ("address", address.as_str()),
            ("name", name),
            ("access_level", "members"),
        ];
        self.execute("create_list", self.client.post(url).form(&form))
            .await
    }

    async fn rename_list(&self, address: &ListAddress, name: &str) -> Result<(), DirectoryError> {
        tracing::debug!(list = %address, name, "Renaming list");
        let url = self.url(&["lists", address.as_str()])?;
        self.execute("rename_list", self.client.put(url).form(&[("name", name)]))
            .await
    }

    async fn delete_list(&self, address: &ListAddress) -> Result<(), DirectoryError> {
        tracing::debug!(list = %address, "Deleting list");
        let url = self.url(&["lists", address.as_str()])?;
        self.execute("delete_list", self.client.delete(url)).await
    }

    async fn add_member(
        &self,
        address: &ListAddress,
        member: &Subscriber,
        unsubscribe_url: &str,
    ) -> Result<(), DirectoryError> {
        tracing::debug!(list = %address, id = %member.id, "Adding member");
        let url = self.url(&["lists", address.as_str(), "members"])?;
        let vars = serde_json::json!({
            "id": member.id,
            "list_unsubscribe": unsubscribe_url,
        })
        .to_string();
        let form = [
            ("subscribed", yes_no(member.subscribed)),
            ("address", member.email.as_str()),
            ("name", member.name.as_str()),
            ("vars", vars.as_str()),
        ];
        self.execute("add_member", self.client.post(url).form(&form))
            .await
    }

    async fn update_member(
        &self,
        address: &ListAddress,
        old_email: &str,
        member: &Subscriber,
    ) -> Result<(), DirectoryError> {
        tracing::debug!(list = %address, id = %member.id, "Updating member");
        let url = self.url(&["lists", address.as_str(), "members", old_email])?;
        let form = [
            ("subscribed", yes_no(member.subscribed)),
            ("address", member.email.as_str()),
            ("name", member.name.as_str()),
        ];
        self.execute("update_member", self.client.put(url).form(&form))
            .await
    }

    async fn remove_member(&self, address: &ListAddress, email: &str) -> Result<(), DirectoryError> {
        tracing::debug!(list = %address, "Removing member");
        let url = self.url(&["lists", address.as_str(), "members", email])?;
        self.execute("remove_member", self.client.delete(url)).await
    }

    async fn send_message(&self, message: &Message) -> Result<(), DirectoryError> {
        tracing::debug!(from = %message.from, recipients = message.to.len(), "Sending message");
        let url = self.url(&[self.domain.as_str(), "messages"])?;
        let mut form: Vec<(&str, &str)> = vec![("from", message.from.as_str())];
        form.extend(message.to.iter().map(|to| ("to", to.as_str())));
        form.push(("subject", message.subject.as_str()));
        form.push(("text", message.text.as_str()));
        self.execute("send_message", self.client.post(url).form(&form))
            .await
    }
}
