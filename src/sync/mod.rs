//! Mailbox synchronization engine.
//!
//! Synchronizes one account group per invocation against the provider API.
//!
//! # Strategies
//!
//! - **auto**: per folder, delta when a cursor exists, else incremental when
//!   a previous sync time exists, else recent.
//! - **delta**: walk the provider's change-tracking chain from the stored
//!   cursor; the new cursor is persisted only after the chain completed.
//! - **incremental**: time-window query since the folder's last sync.
//! - **recent**: time-window query over the last 30 days, then probe a fresh
//!   delta cursor so future rounds can use delta.
//! - **full**: paginate the entire folder, same post-probe as recent.
//! - **check**: liveness probe only, one page, nothing persisted.
//!
//! # Data flow
//!
//! Fetched pages are normalized and pushed to the write-behind queue; the
//! engine never writes message rows itself. Folder cursor state advances
//! only after a page's records were successfully queued, so a crash can only
//! re-deliver, never skip. Within a folder messages land newest-first; there
//! is no cross-folder ordering.

mod engine;
mod folders;
mod normalize;

pub use engine::{SyncEngine, SyncError, SyncReport, SyncStrategy};
pub use folders::{load_group_folders, update_folder_state, upsert_folder_tree, FolderStateUpdate};
pub use normalize::normalize_message;
