//! Normalization of provider message payloads into store rows.

use chrono::{DateTime, Utc};

use crate::graph::RemoteMessage;
use crate::writeop::MessageRecord;

/// Flag value for a message with neither Read nor Flagged set.
const UNREAD: &str = "UNREAD";

/// Map one provider message onto the `mail_message` insert shape.
pub fn normalize_message(
    group_id: &str,
    account_id: Option<i64>,
    message: &RemoteMessage,
    now: DateTime<Utc>,
) -> MessageRecord {
    let mut flags: Vec<&str> = Vec::new();
    if message.is_read {
        flags.push("Read");
    }
    if message
        .flag
        .as_ref()
        .and_then(|f| f.flag_status.as_deref())
        .map(|status| status.eq_ignore_ascii_case("flagged"))
        .unwrap_or(false)
    {
        flags.push("Flagged");
    }
    let flags = if flags.is_empty() {
        UNREAD.to_string()
    } else {
        flags.join(";")
    };

    let to_joined = message
        .to_recipients
        .iter()
        .map(|r| r.address())
        .filter(|addr| !addr.is_empty())
        .collect::<Vec<_>>()
        .join(",");

    let stamp = now.to_rfc3339();

    MessageRecord {
        group_id: group_id.to_string(),
        account_id,
        msg_uid: message.id.clone(),
        msg_id: message.internet_message_id.clone(),
        subject: message.subject.clone().unwrap_or_default(),
        from_addr: message
            .from
            .as_ref()
            .map(|r| r.address().to_string())
            .unwrap_or_default(),
        from_name: message
            .from
            .as_ref()
            .map(|r| r.name().to_string())
            .unwrap_or_default(),
        to_joined,
        folder_id: message.parent_folder_id.clone(),
        sent_at: message.sent_date_time.clone(),
        received_at: message.received_date_time.clone(),
        size_bytes: message.size.unwrap_or(0),
        has_attachments: if message.has_attachments { 1 } else { 0 },
        flags,
        snippet: message.body_preview.clone().unwrap_or_default(),
        created_at: stamp.clone(),
        updated_at: stamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{EmailAddress, Recipient};
    use crate::graph::RemoteMessage;

    fn recipient(name: &str, address: &str) -> Recipient {
        Recipient {
            email_address: Some(EmailAddress {
                name: Some(name.to_string()),
                address: Some(address.to_string()),
            }),
        }
    }

    fn base_message() -> RemoteMessage {
        serde_json::from_value(serde_json::json!({
            "id": "uid-1",
            "internetMessageId": "<m1@example.com>",
            "subject": "quarterly report",
            "from": {"emailAddress": {"name": "Alice", "address": "alice@example.com"}},
            "toRecipients": [],
            "receivedDateTime": "2026-01-02T03:04:05Z",
            "sentDateTime": "2026-01-02T03:00:00Z",
            "isRead": false,
            "hasAttachments": true,
            "bodyPreview": "see attached",
            "parentFolderId": "folder-1"
        }))
        .expect("valid message")
    }

    #[test]
    fn unread_unflagged_maps_to_sentinel() {
        let record = normalize_message("g1", Some(3), &base_message(), Utc::now());
        assert_eq!(record.flags, "UNREAD");
        assert_eq!(record.msg_uid, "uid-1");
        assert_eq!(record.from_addr, "alice@example.com");
        assert_eq!(record.from_name, "Alice");
        assert_eq!(record.has_attachments, 1);
        assert_eq!(record.folder_id.as_deref(), Some("folder-1"));
    }

    #[test]
    fn read_and_flagged_are_joined() {
        let mut message = base_message();
        message.is_read = true;
        message.flag = serde_json::from_value(serde_json::json!({"flagStatus": "flagged"})).ok();

        let record = normalize_message("g1", None, &message, Utc::now());
        assert_eq!(record.flags, "Read;Flagged");
    }

    #[test]
    fn recipients_join_comma_separated_skipping_empty() {
        let mut message = base_message();
        message.to_recipients = vec![
            recipient("Bob", "bob@example.com"),
            Recipient { email_address: None },
            recipient("Carol", "carol@example.com"),
        ];

        let record = normalize_message("g1", None, &message, Utc::now());
        assert_eq!(record.to_joined, "bob@example.com,carol@example.com");
    }
}
