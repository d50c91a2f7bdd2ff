//! Account-group bookkeeping: version snapshots and restore.

mod snapshot;

pub use snapshot::{
    insert_version_snapshot, list_versions, restore_version, SnapshotError,
};
