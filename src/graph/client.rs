use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::json;
use thiserror::Error;

use super::models::{FolderPage, MessageDetail, MessagePage};

const LIST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const SEND_MAIL_TIMEOUT: Duration = Duration::from_secs(30);
const DELTA_TIMEOUT: Duration = Duration::from_secs(30);

/// Fields requested on every message listing; keeps pages small and stable.
const MESSAGE_SELECT: &str = "id,subject,from,toRecipients,ccRecipients,receivedDateTime,\
sentDateTime,isRead,hasAttachments,bodyPreview,internetMessageId,parentFolderId,flag";

/// Errors that occur while talking to the mail provider.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("provider HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider rate limited, retry after {retry_after:?}s")]
    RateLimited { retry_after: Option<u64> },
    #[error("provider returned status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("failed to decode provider response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl GraphError {
    /// True for failures worth retrying inside a pagination loop.
    pub fn is_transient(&self) -> bool {
        match self {
            GraphError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            GraphError::Status { status, .. } => status.is_server_error(),
            GraphError::RateLimited { .. } => false,
            GraphError::Decode(_) => false,
        }
    }
}

/// Parameters for a folder-scoped message listing.
#[derive(Debug, Clone, Default)]
pub struct ListMessagesRequest {
    pub folder_id: Option<String>,
    pub top: u32,
    pub filter: Option<String>,
    pub orderby: Option<String>,
    pub skip_token: Option<String>,
}

/// An outgoing message for the send-mail endpoint.
#[derive(Debug, Clone)]
pub struct OutgoingMail {
    pub subject: String,
    pub body: String,
    pub body_type: String,
    pub to_recipients: Vec<String>,
    pub cc_recipients: Vec<String>,
}

#[derive(Clone)]
pub struct GraphClient {
    http: reqwest::Client,
    base_url: String,
}

impl GraphClient {
    pub fn new(base_url: String) -> Result<Self, GraphError> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .connect_timeout(Duration::from_secs(10))
            .user_agent("mailhub/0.1")
            .build()
            .map_err(GraphError::Http)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http") {
            endpoint.to_string()
        } else {
            format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        access_token: &str,
        endpoint: &str,
        params: &[(&str, String)],
        timeout: Duration,
    ) -> Result<T, GraphError> {
        let response = self
            .http
            .get(self.url(endpoint))
            .bearer_auth(access_token)
            .query(params)
            .timeout(timeout)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(GraphError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GraphError::Status { status, body });
        }

        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// List the root mail folders. Hidden folders are not returned by the
    /// provider's default view.
    pub async fn list_mail_folders(
        &self,
        access_token: &str,
        top: u32,
    ) -> Result<FolderPage, GraphError> {
        self.get_json(
            access_token,
            "me/mailFolders",
            &[("$top", top.to_string())],
            LIST_TIMEOUT,
        )
        .await
    }

    /// List the child folders of one folder.
    pub async fn list_child_folders(
        &self,
        access_token: &str,
        folder_id: &str,
        top: u32,
    ) -> Result<FolderPage, GraphError> {
        self.get_json(
            access_token,
            &format!("me/mailFolders/{}/childFolders", folder_id),
            &[("$top", top.to_string())],
            LIST_TIMEOUT,
        )
        .await
    }

    /// List messages, folder-scoped when a folder id is given.
    pub async fn list_messages(
        &self,
        access_token: &str,
        request: &ListMessagesRequest,
    ) -> Result<MessagePage, GraphError> {
        let endpoint = match &request.folder_id {
            Some(folder_id) => format!("me/mailFolders/{}/messages", folder_id),
            None => "me/messages".to_string(),
        };

        let mut params: Vec<(&str, String)> = vec![
            ("$top", request.top.max(1).to_string()),
            ("$select", MESSAGE_SELECT.to_string()),
        ];
        if let Some(filter) = &request.filter {
            params.push(("$filter", filter.clone()));
        }
        if let Some(orderby) = &request.orderby {
            params.push(("$orderby", orderby.clone()));
        }
        if let Some(token) = &request.skip_token {
            params.push(("$skiptoken", token.clone()));
        }

        self.get_json(access_token, &endpoint, &params, LIST_TIMEOUT)
            .await
    }

    /// Walk one step of a delta chain. With a link, the link is the complete
    /// URL from the previous response; without one, a fresh chain is opened
    /// for the folder.
    pub async fn get_messages_delta(
        &self,
        access_token: &str,
        folder_id: &str,
        link: Option<&str>,
    ) -> Result<MessagePage, GraphError> {
        match link {
            Some(link) => {
                self.get_json(access_token, link, &[], DELTA_TIMEOUT).await
            }
            None => {
                self.get_json(
                    access_token,
                    &format!("me/mailFolders/{}/messages/delta", folder_id),
                    &[("$select", MESSAGE_SELECT.to_string())],
                    DELTA_TIMEOUT,
                )
                .await
            }
        }
    }

    /// Fetch one message with headers, body and attachment metadata.
    pub async fn get_message(
        &self,
        access_token: &str,
        msg_uid: &str,
    ) -> Result<MessageDetail, GraphError> {
        self.get_json(
            access_token,
            &format!("me/messages/{}", msg_uid),
            &[
                (
                    "$select",
                    "id,subject,internetMessageHeaders,body".to_string(),
                ),
                ("$expand", "attachments".to_string()),
            ],
            DEFAULT_TIMEOUT,
        )
        .await
    }

    /// Send a message. The provider answers 202/204 with no content.
    pub async fn send_mail(
        &self,
        access_token: &str,
        mail: &OutgoingMail,
    ) -> Result<(), GraphError> {
        let recipients = |addrs: &[String]| {
            addrs
                .iter()
                .map(|addr| json!({"emailAddress": {"address": addr}}))
                .collect::<Vec<_>>()
        };

        let mut message = json!({
            "subject": mail.subject,
            "body": {"contentType": mail.body_type, "content": mail.body},
            "toRecipients": recipients(&mail.to_recipients),
        });
        if !mail.cc_recipients.is_empty() {
            message["ccRecipients"] = json!(recipients(&mail.cc_recipients));
        }

        let payload = json!({"message": message, "saveToSentItems": "true"});

        let response = self
            .http
            .post(self.url("me/sendMail"))
            .bearer_auth(access_token)
            .json(&payload)
            .timeout(SEND_MAIL_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        // 202 Accepted or 204 No Content both mean the mail was taken.
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(GraphError::RateLimited { retry_after });
        }
        let body = response.text().await.unwrap_or_default();
        Err(GraphError::Status { status, body })
    }
}

/// Extract the opaque pagination token from a provider `nextLink`.
pub fn extract_skip_token(next_link: &str) -> Option<String> {
    static SKIP_TOKEN: OnceLock<Regex> = OnceLock::new();
    let re = SKIP_TOKEN
        .get_or_init(|| Regex::new(r"(?i)\$skiptoken=([^&]+)").expect("valid skiptoken regex"));
    re.captures(next_link)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_skip_token_from_next_link() {
        let link = "https://graph.microsoft.com/v1.0/me/mailFolders/AAA/messages?%24top=50&%24skiptoken=abc123&x=1"
            .replace("%24", "$");
        assert_eq!(extract_skip_token(&link), Some("abc123".to_string()));
    }

    #[test]
    fn extracts_mixed_case_skip_token() {
        let link = "https://example.test/me/messages?$skipToken=Xy-9_z";
        assert_eq!(extract_skip_token(link), Some("Xy-9_z".to_string()));
    }

    #[test]
    fn missing_skip_token_is_none() {
        assert_eq!(extract_skip_token("https://example.test/me/messages?$top=50"), None);
    }
}
