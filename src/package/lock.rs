//! Lock state (`box-lock.json`).
//!
//! The lock pins every placed package: version, source, artifact, digest
//! and install path. It also records the digest of the manifest's
//! dependency sections it was resolved from, so an unchanged manifest can
//! skip resolution.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::endpoint::{ArtifactReference, Hooks, SourceKind};
use crate::error::PackageError;
use crate::runtime::Runtime;
use crate::version::PackageVersion;

pub const LOCK_FILE: &str = "box-lock.json";
const LOCKFILE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedPackage {
    pub name: String,
    pub resolved_version: PackageVersion,
    pub source: SourceKind,
    /// Manifest value the package was requested with.
    #[serde(default)]
    pub spec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Relative to the project root.
    pub path: PathBuf,
    pub artifact: ArtifactReference,
    pub direct: bool,
    pub dev: bool,
    #[serde(default, skip_serializing_if = "Hooks::is_empty")]
    pub hooks: Hooks,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockState {
    #[serde(default = "default_lockfile_version")]
    pub lockfile_version: u32,
    pub manifest_digest: String,
    /// devDependencies were part of the resolution.
    #[serde(default)]
    pub include_dev: bool,
    #[serde(default)]
    pub packages: Vec<LockedPackage>,
}

fn default_lockfile_version() -> u32 {
    LOCKFILE_VERSION
}

impl LockState {
    pub fn new(manifest_digest: impl Into<String>, include_dev: bool) -> Self {
        Self {
            lockfile_version: LOCKFILE_VERSION,
            manifest_digest: manifest_digest.into(),
            include_dev,
            packages: Vec::new(),
        }
    }

    /// Load the lock at `path`, `None` if there is none. A lock that cannot
    /// be parsed is ignored and the project is resolved from scratch.
    #[tracing::instrument(skip(runtime))]
    pub fn load<R: Runtime + ?Sized>(runtime: &R, path: &Path) -> Option<Self> {
        if !runtime.exists(path) {
            return None;
        }
        let content = match runtime.read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                log::warn!("Ignoring unreadable lock {:?}: {:#}", path, e);
                return None;
            }
        };
        match serde_json::from_str::<LockState>(&content) {
            Ok(lock) if lock.lockfile_version <= LOCKFILE_VERSION => Some(lock),
            Ok(lock) => {
                log::warn!(
                    "Ignoring lock {:?} with unsupported version {}",
                    path,
                    lock.lockfile_version
                );
                None
            }
            Err(e) => {
                log::warn!("Ignoring malformed lock {:?}: {}", path, e);
                None
            }
        }
    }

    /// Atomically write the lock. Called once, after a fully successful run.
    #[tracing::instrument(skip(self, runtime))]
    pub fn commit<R: Runtime + ?Sized>(&self, runtime: &R, path: &Path) -> Result<(), PackageError> {
        let mut json =
            serde_json::to_string_pretty(self).map_err(|e| PackageError::persistence(path, e))?;
        json.push('\n');
        runtime
            .write_atomic(path, json.as_bytes())
            .map_err(|e| PackageError::persistence(path, e))
    }

    /// Whether the lock was resolved from this manifest digest and dev selection.
    pub fn is_current(&self, manifest_digest: &str, include_dev: bool) -> bool {
        self.manifest_digest == manifest_digest && self.include_dev == include_dev
    }

    /// Versions pinned for each package name, in lock order.
    pub fn pinned_versions(&self) -> HashMap<String, Vec<PackageVersion>> {
        let mut pinned: HashMap<String, Vec<PackageVersion>> = HashMap::new();
        for package in &self.packages {
            let versions = pinned.entry(package.name.clone()).or_default();
            if !versions.contains(&package.resolved_version) {
                versions.push(package.resolved_version.clone());
            }
        }
        pinned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MockRuntime, RealRuntime};
    use tempfile::tempdir;

    fn locked(name: &str, version: &str, path: &str) -> LockedPackage {
        LockedPackage {
            name: name.to_string(),
            resolved_version: PackageVersion::parse_lenient(version),
            source: SourceKind::Registry,
            spec: "^1.0.0".to_string(),
            integrity_digest: Some("sha256-ab".to_string()),
            size: None,
            path: PathBuf::from(path),
            artifact: ArtifactReference::Remote {
                url: format!("http://registry/{}-{}.tgz", name, version),
            },
            direct: !path.contains("/modules/"),
            dev: false,
            hooks: Hooks::default(),
            dependencies: BTreeMap::new(),
        }
    }

    #[test]
    fn test_commit_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE);

        let mut lock = LockState::new("sha256-digest", false);
        lock.packages.push(locked("foo", "1.2.0", "modules/foo"));
        lock.packages.push(locked("bar", "1.0.0", "modules/foo/modules/bar"));
        lock.commit(&RealRuntime, &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"manifestDigest\": \"sha256-digest\""));
        assert!(content.contains("\"resolvedVersion\": \"1.2.0\""));
        assert!(content.contains("\"integrityDigest\": \"sha256-ab\""));
        assert!(content.ends_with('\n'));

        let loaded = LockState::load(&RealRuntime, &path).unwrap();
        assert_eq!(loaded, lock);
        assert!(loaded.is_current("sha256-digest", false));
        assert!(!loaded.is_current("sha256-digest", true));
        assert!(!loaded.is_current("sha256-other", false));
    }

    #[test]
    fn test_load_missing_or_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE);
        assert!(LockState::load(&RealRuntime, &path).is_none());

        std::fs::write(&path, "[]").unwrap();
        assert!(LockState::load(&RealRuntime, &path).is_none());

        std::fs::write(&path, r#"{"lockfileVersion": 99, "manifestDigest": "x"}"#).unwrap();
        assert!(LockState::load(&RealRuntime, &path).is_none());
    }

    #[test]
    fn test_commit_failure_is_persistence_failure() {
        let mut runtime = MockRuntime::new();
        runtime
            .expect_write_atomic()
            .returning(|_, _| Err(anyhow::anyhow!("disk full")));

        let err = LockState::new("d", false)
            .commit(&runtime, Path::new("/p/box-lock.json"))
            .unwrap_err();
        assert!(matches!(err, PackageError::PersistenceFailure { .. }));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_pinned_versions() {
        let mut lock = LockState::new("d", false);
        lock.packages.push(locked("bar", "1.0.0", "modules/bar"));
        lock.packages.push(locked("bar", "2.0.0", "modules/foo/modules/bar"));
        lock.packages.push(locked("bar", "1.0.0", "modules/baz/modules/bar"));

        let pinned = lock.pinned_versions();
        assert_eq!(
            pinned["bar"],
            vec![
                PackageVersion::parse_lenient("1.0.0"),
                PackageVersion::parse_lenient("2.0.0")
            ]
        );
    }
}
