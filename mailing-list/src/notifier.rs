use crate::directory::{DirectoryError, ListDirectory, Message};
use crate::metrics_defs::MESSAGES_SENT;
use crate::types::{ListAddress, list_name};
use shared::counter;
use std::sync::Arc;

/// Sends messages through the provider on behalf of a mailing list.
#[derive(Clone)]
pub struct Notifier {
    directory: Arc<dyn ListDirectory>,
    domain: String,
}

impl Notifier {
    pub fn new(directory: Arc<dyn ListDirectory>, domain: impl Into<String>) -> Self {
        Notifier {
            directory,
            domain: domain.into(),
        }
    }

    /// Posts a message from the list address to an explicit set of recipients.
    /// Nothing is sent when there are no recipients.
    pub async fn send_message(
        &self,
        list_id: &str,
        list_title: &str,
        recipients: &[String],
        subject: &str,
        body: &str,
    ) -> Result<(), DirectoryError> {
        if recipients.is_empty() {
            tracing::debug!(list_id, "No recipients, skipping message");
            return Ok(());
        }

        let address = ListAddress::new(list_id, &self.domain);
        let message = Message {
            from: format!("\"{}\" <{}>", list_name(list_title), address),
            to: recipients.to_vec(),
            subject: subject.to_string(),
            text: body.to_string(),
        };

        self.directory.send_message(&message).await?;
        counter!(MESSAGES_SENT).increment(1);
        tracing::info!(list_id, recipients = recipients.len(), "Sent message");
        Ok(())
    }

    pub(crate) async fn announce_creation(
        &self,
        list_id: &str,
        list_title: &str,
        recipients: &[String],
    ) -> Result<(), DirectoryError> {
        let address = ListAddress::new(list_id, &self.domain);
        let name = list_name(list_title);
        let subject = format!("{name} has been created");
        let body = format!(
            "A mailing list has been created for {list_title}.\n\n\
             Messages sent to {address} are delivered to every subscribed member. \
             You can change your subscription from the project settings page.",
        );
        self.send_message(list_id, list_title, recipients, &subject, &body)
            .await
    }
}
