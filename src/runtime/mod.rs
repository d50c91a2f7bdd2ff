//! Asynchronous task runtime.
//!
//! Two long-lived pieces compose here:
//!
//! - the **worker pool** ([`TaskRuntime`]): task-key deduplication, per-user
//!   concurrency caps backed by broker counters, the
//!   `pending → running → success | failure | cancelled` status machine, and
//!   dispatch over the four task types (login, sync, sync_folders,
//!   download);
//! - the **writer daemon** ([`WriterDaemon`]): drains the write-behind queue
//!   into the store in ordered, transactional batches.
//!
//! Status is written to the broker at every phase transition; the admin
//! surface polls those keys and nothing else.

pub mod download;
pub mod maintenance;
pub mod pool;
pub mod status;
pub mod task;
pub mod writer;

pub use download::{BatchDownloader, DownloadReport};
pub use maintenance::MaintenanceWatchdog;
pub use pool::TaskRuntime;
pub use status::StatusStore;
pub use task::{TaskPayload, TaskSpec, TaskState, TaskStatus, TaskType, UserRole};
pub use writer::WriterDaemon;
