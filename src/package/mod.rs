//! Project persistence: manifest, lock state and install records.

mod lock;
mod manifest;
mod record;

pub use lock::{LOCK_FILE, LockState, LockedPackage};
pub use manifest::{DependencyEntry, MANIFEST_FILE, Manifest, is_valid_package_name};
pub use record::{DependencyKind, InstalledPackageRecord, RECORDS_FILE, RecordStore};

#[cfg(test)]
pub(crate) use record::test_util;
