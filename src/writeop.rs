//! Write-behind queue protocol.
//!
//! Producers serialize one of these per row and push it to the write queue;
//! the writer daemon groups popped items by variant and issues one bulk
//! statement per table. The wire shape is `{"table": ..., "data": {...}}`,
//! so adding a variant is a wire-format change for every producer.

use serde::{Deserialize, Serialize};

/// One pending store write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "table", content = "data")]
pub enum WriteOp {
    /// Message summary row; duplicates on `(group_id, msg_uid)` are ignored.
    #[serde(rename = "mail_message")]
    InsertMessage(MessageRecord),
    /// Message body; replaces any existing row for the message.
    #[serde(rename = "mail_body")]
    UpsertBody(BodyRecord),
    #[serde(rename = "mail_attachment")]
    InsertAttachment(AttachmentRecord),
    #[serde(rename = "mail_folders")]
    InsertFolder(FolderRecord),
}

impl WriteOp {
    pub fn table(&self) -> &'static str {
        match self {
            WriteOp::InsertMessage(_) => "mail_message",
            WriteOp::UpsertBody(_) => "mail_body",
            WriteOp::InsertAttachment(_) => "mail_attachment",
            WriteOp::InsertFolder(_) => "mail_folders",
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub group_id: String,
    pub account_id: Option<i64>,
    pub msg_uid: String,
    pub msg_id: Option<String>,
    pub subject: String,
    pub from_addr: String,
    pub from_name: String,
    pub to_joined: String,
    pub folder_id: Option<String>,
    pub sent_at: Option<String>,
    pub received_at: Option<String>,
    pub size_bytes: i64,
    pub has_attachments: i64,
    pub flags: String,
    pub snippet: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BodyRecord {
    pub message_id: i64,
    pub headers: Option<String>,
    pub body_plain: Option<String>,
    pub body_html: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub message_id: i64,
    pub attachment_id: String,
    pub filename: String,
    pub content_type: Option<String>,
    pub size: i64,
    pub is_inline: i64,
    pub content_id: Option<String>,
    pub download_status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderRecord {
    pub folder_id: String,
    pub group_id: String,
    pub display_name: String,
    pub well_known_name: Option<String>,
    pub parent_folder_id: Option<String>,
    pub total_count: i64,
    pub unread_count: i64,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_is_table_plus_data() {
        let op = WriteOp::UpsertBody(BodyRecord {
            message_id: 7,
            headers: Some("Subject: hi".to_string()),
            body_plain: None,
            body_html: Some("<p>hi</p>".to_string()),
        });

        let encoded = op.encode().expect("encode");
        let value: serde_json::Value = serde_json::from_str(&encoded).expect("json");
        assert_eq!(value["table"], "mail_body");
        assert_eq!(value["data"]["message_id"], 7);

        match WriteOp::decode(&encoded).expect("decode") {
            WriteOp::UpsertBody(body) => assert_eq!(body.message_id, 7),
            other => panic!("unexpected variant {:?}", other),
        }
    }

    #[test]
    fn unknown_table_fails_to_decode() {
        let raw = r#"{"table":"mail_unknown","data":{}}"#;
        assert!(WriteOp::decode(raw).is_err());
    }
}
