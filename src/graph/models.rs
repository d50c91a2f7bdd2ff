//! Wire shapes for provider responses.
//!
//! Only the fields the core reads are modeled; unknown fields are ignored on
//! deserialization.

use serde::{Deserialize, Serialize};

/// One page of a folder listing.
#[derive(Debug, Clone, Deserialize)]
pub struct FolderPage {
    #[serde(default)]
    pub value: Vec<RemoteFolder>,
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFolder {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    pub parent_folder_id: Option<String>,
    pub well_known_name: Option<String>,
    #[serde(default)]
    pub child_folder_count: i64,
    #[serde(default)]
    pub total_item_count: i64,
    #[serde(default)]
    pub unread_item_count: i64,
    #[serde(default)]
    pub is_hidden: bool,
}

/// One page of a message listing or delta walk. A delta walk terminates when
/// `delta_link` is present instead of `next_link`.
#[derive(Debug, Clone, Deserialize)]
pub struct MessagePage {
    #[serde(default)]
    pub value: Vec<RemoteMessage>,
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    pub delta_link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMessage {
    pub id: String,
    pub internet_message_id: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    pub from: Option<Recipient>,
    #[serde(default)]
    pub to_recipients: Vec<Recipient>,
    pub received_date_time: Option<String>,
    pub sent_date_time: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub has_attachments: bool,
    #[serde(default)]
    pub body_preview: Option<String>,
    pub parent_folder_id: Option<String>,
    pub flag: Option<FollowupFlag>,
    pub size: Option<i64>,
    /// Set on delta responses when the item was removed.
    #[serde(rename = "@removed")]
    pub removed: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowupFlag {
    pub flag_status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub email_address: Option<EmailAddress>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailAddress {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

impl Recipient {
    pub fn address(&self) -> &str {
        self.email_address
            .as_ref()
            .and_then(|e| e.address.as_deref())
            .unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.email_address
            .as_ref()
            .and_then(|e| e.name.as_deref())
            .unwrap_or("")
    }
}

/// Full message fetched for download: headers, body and attachment metadata.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDetail {
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: Option<ItemBody>,
    #[serde(default)]
    pub internet_message_headers: Vec<NameValue>,
    #[serde(default)]
    pub attachments: Vec<RemoteAttachment>,
}

impl MessageDetail {
    /// Headers flattened to `Name: value` lines in wire order.
    pub fn headers_text(&self) -> String {
        self.internet_message_headers
            .iter()
            .map(|h| format!("{}: {}", h.name, h.value))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemBody {
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NameValue {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAttachment {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub content_type: Option<String>,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub is_inline: bool,
    pub content_id: Option<String>,
}
