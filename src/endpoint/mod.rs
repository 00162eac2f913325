//! Package sources.
//!
//! An [`Endpoint`] lists candidate versions of a package and fetches the
//! artifact of a chosen one. There is one endpoint per [`SourceKind`]:
//!
//! | Kind | Manifest value | Endpoint |
//! |---|---|---|
//! | registry | `^1.2.0`, `registry:1.x` | [`RegistryEndpoint`] |
//! | git | `git+https://…/foo.git#v1.0.0`, `github:owner/repo` | [`VersionControlEndpoint`] |
//! | url | `https://…/foo-1.0.0.tgz` | [`DirectUrlEndpoint`] |
//! | path | `file:../foo`, `./libs/foo`, `/abs/foo.zip` | [`LocalPathEndpoint`] |

mod git;
mod index;
mod path;
mod registry;
mod url;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{EndpointError, PackageError};
use crate::package::Manifest;
use crate::version::{PackageVersion, VersionConstraint};

pub use git::{CommandGitClient, GitClient, GitSource, VersionControlEndpoint};
pub use index::RegistryEndpoint;
pub use path::LocalPathEndpoint;
pub use registry::EndpointRegistry;
pub use url::DirectUrlEndpoint;

#[cfg(test)]
pub use git::MockGitClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Registry,
    Git,
    Url,
    Path,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Registry => write!(f, "registry"),
            SourceKind::Git => write!(f, "git"),
            SourceKind::Url => write!(f, "url"),
            SourceKind::Path => write!(f, "path"),
        }
    }
}

impl SourceKind {
    /// Infer the source of a manifest value.
    pub fn infer(value: &str) -> SourceKind {
        let value = value.trim();
        let location = value.split('#').next().unwrap_or(value);
        if value.starts_with("registry:") {
            SourceKind::Registry
        } else if value.starts_with("git+")
            || value.starts_with("git://")
            || value.starts_with("github:")
            || location.ends_with(".git")
        {
            SourceKind::Git
        } else if value.starts_with("http://") || value.starts_with("https://") {
            SourceKind::Url
        } else if value.starts_with("file:")
            || value.starts_with("./")
            || value.starts_with("../")
            || value.starts_with('/')
            || value.starts_with("~/")
            || value == "."
            || value == ".."
        {
            SourceKind::Path
        } else {
            SourceKind::Registry
        }
    }
}

/// What a manifest entry or a command-line argument asks for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageIdentifier {
    pub name: String,
    pub kind: SourceKind,
    /// Constraint for registry packages, location for everything else.
    pub spec: String,
}

impl PackageIdentifier {
    /// From a `dependencies` entry: `"foo": "^1.2.0"`.
    pub fn from_entry(name: &str, value: &str) -> Self {
        let value = value.trim();
        let kind = SourceKind::infer(value);
        let spec = match kind {
            SourceKind::Registry => value.strip_prefix("registry:").unwrap_or(value).trim(),
            _ => value,
        };
        Self {
            name: name.to_string(),
            kind,
            spec: spec.to_string(),
        }
    }

    /// The registry constraint. Other kinds are pinned by their location,
    /// so any version they produce is acceptable.
    pub fn constraint(&self) -> Result<VersionConstraint, PackageError> {
        match self.kind {
            SourceKind::Registry => VersionConstraint::parse(&self.spec),
            _ => Ok(VersionConstraint::any()),
        }
    }

    /// Key under which candidate lists are cached.
    pub fn cache_key(&self) -> String {
        match self.kind {
            SourceKind::Registry => format!("registry:{}", self.name),
            kind => format!("{}:{}", kind, self.spec),
        }
    }
}

impl fmt::Display for PackageIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.spec.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}@{}", self.name, self.spec)
        }
    }
}

/// Command-line form: `foo`, `foo@^1.2`, `util@file:../util`,
/// `https://host/foo-1.0.0.tgz`, `./libs/util`, `github:owner/repo#main`.
impl FromStr for PackageIdentifier {
    type Err = PackageError;

    fn from_str(arg: &str) -> Result<Self, Self::Err> {
        let arg = arg.trim();
        let malformed = |reason: &str| PackageError::MalformedConstraint {
            constraint: arg.to_string(),
            reason: reason.to_string(),
        };

        let kind = SourceKind::infer(arg);
        let (name, value) = if kind != SourceKind::Registry {
            let name = derive_name(arg).ok_or_else(|| malformed("cannot derive a package name"))?;
            (name, arg.to_string())
        } else {
            match arg.split_once('@') {
                Some((name, value)) => (name.to_string(), value.to_string()),
                None => (arg.to_string(), String::new()),
            }
        };

        if !crate::package::is_valid_package_name(&name) {
            return Err(malformed("invalid package name"));
        }
        let id = PackageIdentifier::from_entry(&name, &value);
        id.constraint()?;
        Ok(id)
    }
}

/// Last path segment without ref, `.git` or archive extension.
fn derive_name(location: &str) -> Option<String> {
    let location = location.split('#').next().unwrap_or(location);
    let location = location.split('?').next().unwrap_or(location);
    let segment = location
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()?
        .to_string();
    let mut name = segment.as_str();
    for suffix in [".git", ".tar.gz", ".tgz", ".zip"] {
        if let Some(stripped) = name.strip_suffix(suffix) {
            name = stripped;
            break;
        }
    }
    (!name.is_empty()).then(|| name.to_string())
}

/// Where a package's files come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ArtifactReference {
    /// Archive downloaded over HTTP.
    Remote { url: String },
    /// Repository checkout at a ref.
    GitCheckout { url: String, reference: String },
    /// Local directory, copied or linked.
    Directory { path: PathBuf },
    /// Local archive file.
    Archive { path: PathBuf },
}

impl fmt::Display for ArtifactReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactReference::Remote { url } => write!(f, "{}", url),
            ArtifactReference::GitCheckout { url, reference } => {
                write!(f, "{}#{}", url, reference)
            }
            ArtifactReference::Directory { path } | ArtifactReference::Archive { path } => {
                write!(f, "{}", path.display())
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preinstall: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postinstall: Option<String>,
}

impl Hooks {
    pub fn is_empty(&self) -> bool {
        self.preinstall.is_none() && self.postinstall.is_none()
    }
}

/// Metadata of one version of a package. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageMetadata {
    pub name: String,
    pub version: PackageVersion,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub dev_dependencies: BTreeMap<String, String>,
    pub artifact: ArtifactReference,
    #[serde(default)]
    pub engines: BTreeMap<String, String>,
    #[serde(default)]
    pub hooks: Hooks,
    /// `sha256-<hex>` of the artifact.
    #[serde(default)]
    pub integrity: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl PackageMetadata {
    /// Metadata taken from a package's own `box.json`.
    pub fn from_manifest(
        manifest: &Manifest,
        fallback_name: &str,
        version: PackageVersion,
        artifact: ArtifactReference,
    ) -> Self {
        Self {
            name: manifest
                .name
                .clone()
                .unwrap_or_else(|| fallback_name.to_string()),
            version,
            dependencies: manifest.dependencies.clone(),
            dev_dependencies: manifest.dev_dependencies.clone(),
            artifact,
            engines: manifest.engines.clone(),
            hooks: Hooks {
                preinstall: manifest.script("preinstall").map(str::to_string),
                postinstall: manifest.script("postinstall").map(str::to_string),
            },
            integrity: None,
            size: None,
        }
    }

    /// Metadata for an artifact that carries no manifest.
    pub fn bare(name: &str, version: PackageVersion, artifact: ArtifactReference) -> Self {
        Self {
            name: name.to_string(),
            version,
            dependencies: BTreeMap::new(),
            dev_dependencies: BTreeMap::new(),
            artifact,
            engines: BTreeMap::new(),
            hooks: Hooks::default(),
            integrity: None,
            size: None,
        }
    }

    /// Whether the package declares support for the host runtime.
    /// Packages that say nothing about `engine` are compatible.
    pub fn supports_engine(&self, engine: &str, version: &semver::Version) -> bool {
        match self.engines.get(engine) {
            None => true,
            Some(raw) => match VersionConstraint::parse(raw) {
                Ok(constraint) => {
                    constraint.satisfies_with(&PackageVersion::Semver(version.clone()), true)
                }
                // An unparseable engines entry is not a reason to reject the package.
                Err(_) => true,
            },
        }
    }
}

/// A fetched artifact, ready to be placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchedArtifact {
    /// Archive file in the scratch directory.
    Archive(PathBuf),
    /// Directory in the scratch directory, owned by the run.
    Directory(PathBuf),
    /// The user's own directory. Copied or linked, never moved or deleted.
    Local(PathBuf),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Endpoint: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Every version the source can offer for `id`.
    async fn candidates(
        &self,
        id: &PackageIdentifier,
    ) -> Result<Vec<PackageMetadata>, EndpointError>;

    /// Make the artifact available under `scratch`.
    async fn fetch(
        &self,
        artifact: &ArtifactReference,
        scratch: &Path,
    ) -> Result<FetchedArtifact, EndpointError>;
}

/// Highest candidate of `endpoint` satisfying `constraint`.
pub async fn resolve(
    endpoint: &dyn Endpoint,
    id: &PackageIdentifier,
    constraint: &VersionConstraint,
    include_prerelease: bool,
) -> Result<(PackageMetadata, ArtifactReference), EndpointError> {
    let candidates = endpoint.candidates(id).await?;
    let best = constraint
        .select(&candidates, |m| &m.version, include_prerelease)
        .ok_or_else(|| {
            EndpointError::NotFound(format!("no version of {} matches {}", id.name, constraint))
        })?;
    Ok((best.clone(), best.artifact.clone()))
}
