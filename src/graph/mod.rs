//! Provider API client.
//!
//! The mail provider is a black-box JSON-over-HTTPS endpoint with Bearer
//! auth. This module owns the HTTP plumbing: folder and message listings,
//! delta change tracking, message detail fetches and send-mail, plus the
//! pagination-token extraction the sync engine relies on.

mod client;
mod models;

pub use client::{extract_skip_token, GraphClient, GraphError, ListMessagesRequest, OutgoingMail};
pub use models::{
    EmailAddress, FolderPage, ItemBody, MessageDetail, MessagePage, NameValue, Recipient,
    RemoteAttachment, RemoteFolder, RemoteMessage,
};
