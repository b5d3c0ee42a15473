use crate::models::{EmailMessage, ProviderLabel};
use anyhow::{Context, Result};
use async_trait::async_trait;
use google_gmail1::Gmail;
use hyper::client::HttpConnector;
use hyper_rustls::HttpsConnector;

/// Mailbox operations the sorting engine needs. Kept narrow so runs
/// and reconciliation can be exercised against an in-memory fake.
#[async_trait]
pub trait MailProvider: Send + Sync {
    async fn profile_email(&self) -> Result<String>;
    async fn list_labels(&self) -> Result<Vec<ProviderLabel>>;
    async fn create_label(&self, name: &str) -> Result<ProviderLabel>;
    async fn rename_label(&self, label_id: &str, new_name: &str) -> Result<()>;
    async fn list_message_ids(&self, query: &str, max_results: u32) -> Result<Vec<String>>;
    async fn fetch_message(&self, id: &str) -> Result<EmailMessage>;
    async fn add_label(&self, message_id: &str, label_id: &str) -> Result<()>;
    async fn remove_label(&self, message_id: &str, label_id: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct GmailClient {
    hub: Gmail<HttpsConnector<HttpConnector>>,
}

impl GmailClient {
    pub fn new(hub: Gmail<HttpsConnector<HttpConnector>>) -> Self {
        Self { hub }
    }

    async fn modify_message(
        &self,
        message_id: &str,
        add: Option<Vec<String>>,
        remove: Option<Vec<String>>,
    ) -> Result<()> {
        let req = google_gmail1::api::ModifyMessageRequest {
            add_label_ids: add,
            remove_label_ids: remove,
        };
        self.hub
            .users()
            .messages_modify(req, "me", message_id)
            .doit()
            .await
            .context(format!("Failed to modify labels on message {}", message_id))?;
        Ok(())
    }
}

#[async_trait]
impl MailProvider for GmailClient {
    async fn profile_email(&self) -> Result<String> {
        let (_, profile) = self
            .hub
            .users()
            .get_profile("me")
            .doit()
            .await
            .context("Failed to fetch Gmail profile")?;
        Ok(profile.email_address.unwrap_or_default())
    }

    async fn list_labels(&self) -> Result<Vec<ProviderLabel>> {
        let (_, label_list) = self
            .hub
            .users()
            .labels_list("me")
            .doit()
            .await
            .context("Failed to list labels")?;

        let labels = label_list
            .labels
            .unwrap_or_default()
            .into_iter()
            .map(|l| ProviderLabel {
                id: l.id.unwrap_or_default(),
                name: l.name.unwrap_or_default(),
            })
            .collect();

        Ok(labels)
    }

    async fn create_label(&self, name: &str) -> Result<ProviderLabel> {
        let label = google_gmail1::api::Label {
            name: Some(name.to_string()),
            label_list_visibility: Some("labelShow".to_string()),
            message_list_visibility: Some("show".to_string()),
            ..Default::default()
        };
        let (_, created) = self
            .hub
            .users()
            .labels_create(label, "me")
            .doit()
            .await
            .context(format!("Failed to create label '{}'", name))?;

        Ok(ProviderLabel {
            id: created.id.unwrap_or_default(),
            name: created.name.unwrap_or_else(|| name.to_string()),
        })
    }

    async fn rename_label(&self, label_id: &str, new_name: &str) -> Result<()> {
        let label = google_gmail1::api::Label {
            name: Some(new_name.to_string()),
            ..Default::default()
        };
        self.hub
            .users()
            .labels_patch(label, "me", label_id)
            .doit()
            .await
            .context(format!("Failed to rename label {}", label_id))?;
        Ok(())
    }

    async fn list_message_ids(&self, query: &str, max_results: u32) -> Result<Vec<String>> {
        let mut ids: Vec<String> = Vec::new();
        let mut page_token: Option<String> = None;

        while (ids.len() as u32) < max_results {
            let remaining = max_results - ids.len() as u32;
            let mut req = self
                .hub
                .users()
                .messages_list("me")
                .q(query)
                .max_results(remaining.min(100));
            if let Some(token) = &page_token {
                req = req.page_token(token);
            }

            let (_, message_list) = req.doit().await.context("Failed to list messages")?;

            ids.extend(
                message_list
                    .messages
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|m| m.id),
            );

            page_token = message_list.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        ids.truncate(max_results as usize);
        Ok(ids)
    }

    async fn fetch_message(&self, id: &str) -> Result<EmailMessage> {
        let (_, msg) = self
            .hub
            .users()
            .messages_get("me", id)
            .format("full")
            .doit()
            .await
            .context(format!("Failed to get message {}", id))?;

        let mut from = None;
        let mut subject = None;

        if let Some(payload) = &msg.payload {
            if let Some(headers) = &payload.headers {
                for header in headers {
                    match header.name.as_deref() {
                        Some("From") => from = header.value.clone(),
                        Some("Subject") => subject = header.value.clone(),
                        _ => {}
                    }
                }
            }
        }

        let mut body_plain = None;
        if let Some(payload) = &msg.payload {
            body_plain = extract_text_body(payload, "text/plain");
        }

        Ok(EmailMessage {
            id: msg.id.unwrap_or_default(),
            thread_id: msg.thread_id.unwrap_or_default(),
            subject,
            from_address: from,
            snippet: msg.snippet,
            body_plain,
        })
    }

    async fn add_label(&self, message_id: &str, label_id: &str) -> Result<()> {
        self.modify_message(message_id, Some(vec![label_id.to_string()]), None)
            .await
    }

    async fn remove_label(&self, message_id: &str, label_id: &str) -> Result<()> {
        self.modify_message(message_id, None, Some(vec![label_id.to_string()]))
            .await
    }
}

fn extract_text_body(part: &google_gmail1::api::MessagePart, mime_type: &str) -> Option<String> {
    if let Some(mime) = &part.mime_type {
        if mime == mime_type {
            if let Some(body) = &part.body {
                if let Some(data) = &body.data {
                    use base64::{Engine as _, engine::general_purpose};
                    let data_str = String::from_utf8_lossy(data);

                    // Try decoding as base64url (Gmail's default)
                    let decoded = general_purpose::URL_SAFE_NO_PAD
                        .decode(data_str.trim().replace('-', "+").replace('_', "/"))
                        .or_else(|_| {
                            general_purpose::URL_SAFE
                                .decode(data_str.trim().replace('-', "+").replace('_', "/"))
                        })
                        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(data_str.trim()))
                        .or_else(|_| general_purpose::STANDARD.decode(data_str.trim()));

                    match decoded {
                        Ok(bytes) => return String::from_utf8(bytes).ok(),
                        Err(_) => {
                            // If base64 decoding fails, it might already be raw content
                            return String::from_utf8(data.clone()).ok();
                        }
                    }
                }
            }
        }
    }

    if let Some(parts) = &part.parts {
        let mut full_body = String::new();
        for p in parts {
            if let Some(body) = extract_text_body(p, mime_type) {
                full_body.push_str(&body);
            }
        }
        if !full_body.is_empty() {
            return Some(full_body);
        }
    }

    None
}
