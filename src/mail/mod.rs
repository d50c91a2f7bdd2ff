//! Mail read-side operations: search, detail, flags, deletion.

mod service;

pub use service::{
    CurrentUser, FlagAction, MailDetail, MailSearchRequest, MailService,
};
