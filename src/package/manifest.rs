//! Project and package manifest (`box.json`).

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PackageError;
use crate::runtime::Runtime;

pub const MANIFEST_FILE: &str = "box.json";

/// A `box.json` document. Fields this crate does not know about are kept
/// and written back unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dev_dependencies: BTreeMap<String, String>,
    /// Host runtime name to version constraint.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub engines: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scripts: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One entry of `dependencies` or `devDependencies`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEntry {
    pub name: String,
    pub spec: String,
    pub dev: bool,
}

/// Package names become directory names under `modules/`.
pub fn is_valid_package_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl Manifest {
    pub fn parse(content: &str, path: &Path) -> Result<Self, PackageError> {
        let manifest: Manifest =
            serde_json::from_str(content).map_err(|e| PackageError::InvalidManifest {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        for name in manifest
            .dependencies
            .keys()
            .chain(manifest.dev_dependencies.keys())
        {
            if !is_valid_package_name(name) {
                return Err(PackageError::InvalidManifest {
                    path: path.to_path_buf(),
                    reason: format!("invalid package name '{}'", name),
                });
            }
        }
        Ok(manifest)
    }

    #[tracing::instrument(skip(runtime))]
    pub fn load<R: Runtime + ?Sized>(runtime: &R, path: &Path) -> Result<Self, PackageError> {
        if !runtime.exists(path) {
            return Err(PackageError::InvalidManifest {
                path: path.to_path_buf(),
                reason: "file not found".to_string(),
            });
        }
        let content = runtime
            .read_to_string(path)
            .map_err(|e| PackageError::InvalidManifest {
                path: path.to_path_buf(),
                reason: format!("{:#}", e),
            })?;
        Self::parse(&content, path)
    }

    /// Write atomically as pretty-printed JSON.
    #[tracing::instrument(skip(self, runtime))]
    pub fn save<R: Runtime + ?Sized>(&self, runtime: &R, path: &Path) -> Result<(), PackageError> {
        let mut json =
            serde_json::to_string_pretty(self).map_err(|e| PackageError::persistence(path, e))?;
        json.push('\n');
        runtime
            .write_atomic(path, json.as_bytes())
            .map_err(|e| PackageError::persistence(path, e))
    }

    /// Add or update one dependency. A package lives in exactly one of
    /// `dependencies` and `devDependencies`.
    pub fn save_dependency(&mut self, name: &str, spec: &str, dev: bool) {
        let (target, other) = if dev {
            (&mut self.dev_dependencies, &mut self.dependencies)
        } else {
            (&mut self.dependencies, &mut self.dev_dependencies)
        };
        other.remove(name);
        target.insert(name.to_string(), spec.to_string());
    }

    /// Returns whether the dependency was declared.
    pub fn remove_dependency(&mut self, name: &str) -> bool {
        let prod = self.dependencies.remove(name).is_some();
        let dev = self.dev_dependencies.remove(name).is_some();
        prod || dev
    }

    pub fn declares(&self, name: &str) -> bool {
        self.dependencies.contains_key(name) || self.dev_dependencies.contains_key(name)
    }

    /// Direct dependencies in name order. devDependencies are included only
    /// when `include_dev` is set; a name declared in both is a production dependency.
    pub fn entries(&self, include_dev: bool) -> Vec<DependencyEntry> {
        let mut entries: Vec<DependencyEntry> = self
            .dependencies
            .iter()
            .map(|(name, spec)| DependencyEntry {
                name: name.clone(),
                spec: spec.clone(),
                dev: false,
            })
            .collect();
        if include_dev {
            entries.extend(
                self.dev_dependencies
                    .iter()
                    .filter(|(name, _)| !self.dependencies.contains_key(*name))
                    .map(|(name, spec)| DependencyEntry {
                        name: name.clone(),
                        spec: spec.clone(),
                        dev: true,
                    }),
            );
            entries.sort_by(|a, b| a.name.cmp(&b.name));
        }
        entries
    }

    /// Digest over everything that affects resolution. Recorded in the lock
    /// to detect an unchanged manifest.
    pub fn dependency_digest(&self) -> String {
        let canonical = serde_json::json!({
            "dependencies": self.dependencies,
            "devDependencies": self.dev_dependencies,
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        format!("sha256-{}", hex::encode(hasher.finalize()))
    }

    pub fn script(&self, name: &str) -> Option<&str> {
        self.scripts.get(name).map(String::as_str)
    }
}
