//! Install records: what is actually on disk under `modules/`.
//!
//! Records are kept in one file, `modules/.boxpm-records.json`, keyed by
//! install path relative to the project root. Only the installation engine
//! writes it, after each successful operation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::endpoint::{ArtifactReference, SourceKind};
use crate::runtime::Runtime;
use crate::version::PackageVersion;

pub const RECORDS_FILE: &str = ".boxpm-records.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    Direct,
    Transitive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledPackageRecord {
    pub name: String,
    pub installed_version: PackageVersion,
    /// Relative to the project root, e.g. `modules/foo/modules/bar`.
    pub install_path: PathBuf,
    pub kind: DependencyKind,
    #[serde(default)]
    pub is_dev: bool,
    pub source: SourceKind,
    pub artifact: ArtifactReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    /// Installed as a symlink to a local directory.
    #[serde(default)]
    pub linked: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RecordsFile {
    #[serde(default)]
    packages: Vec<InstalledPackageRecord>,
}

/// In-memory view of the records file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordStore {
    records: BTreeMap<PathBuf, InstalledPackageRecord>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_path(modules_dir: &Path) -> PathBuf {
        modules_dir.join(RECORDS_FILE)
    }

    /// Load the records of `modules_dir`. A missing file is an empty store;
    /// an unreadable one is treated as empty too, so the next run reinstalls.
    #[tracing::instrument(skip(runtime))]
    pub fn load<R: Runtime + ?Sized>(runtime: &R, modules_dir: &Path) -> Result<Self> {
        let path = Self::file_path(modules_dir);
        if !runtime.exists(&path) {
            return Ok(Self::default());
        }
        let content = runtime
            .read_to_string(&path)
            .with_context(|| format!("Failed to read install records {:?}", path))?;
        let file: RecordsFile = match serde_json::from_str(&content) {
            Ok(file) => file,
            Err(e) => {
                warn!("Ignoring unreadable install records {:?}: {}", path, e);
                return Ok(Self::default());
            }
        };
        debug!("Loaded {} install record(s)", file.packages.len());
        Ok(Self {
            records: file
                .packages
                .into_iter()
                .map(|r| (r.install_path.clone(), r))
                .collect(),
        })
    }

    /// Atomically replace the records file.
    pub fn save<R: Runtime + ?Sized>(&self, runtime: &R, modules_dir: &Path) -> Result<()> {
        let path = Self::file_path(modules_dir);
        if self.records.is_empty() && !runtime.exists(modules_dir) {
            return Ok(());
        }
        runtime.create_dir_all(modules_dir)?;
        let file = RecordsFile {
            packages: self.records.values().cloned().collect(),
        };
        let mut json = serde_json::to_string_pretty(&file)?;
        json.push('\n');
        runtime
            .write_atomic(&path, json.as_bytes())
            .with_context(|| format!("Failed to save install records to {:?}", path))
    }

    pub fn get(&self, install_path: &Path) -> Option<&InstalledPackageRecord> {
        self.records.get(install_path)
    }

    pub fn insert(&mut self, record: InstalledPackageRecord) {
        self.records.insert(record.install_path.clone(), record);
    }

    pub fn remove(&mut self, install_path: &Path) -> Option<InstalledPackageRecord> {
        self.records.remove(install_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstalledPackageRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
