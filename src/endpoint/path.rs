//! Local directories and archive files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use log::debug;

use super::{
    ArtifactReference, Endpoint, FetchedArtifact, PackageIdentifier, PackageMetadata, SourceKind,
};
use crate::archive::{ArchiveExtractor, ArchiveExtractorImpl};
use crate::error::EndpointError;
use crate::package::{MANIFEST_FILE, Manifest};
use crate::runtime::{Runtime, normalize_path};
use crate::version::PackageVersion;

pub struct LocalPathEndpoint<R: Runtime> {
    runtime: Arc<R>,
    /// Relative paths are resolved against the project directory.
    base_dir: PathBuf,
    extractor: ArchiveExtractorImpl,
    scratch_root: PathBuf,
    counter: AtomicU64,
}

impl<R: Runtime + 'static> LocalPathEndpoint<R> {
    pub fn new(
        runtime: Arc<R>,
        base_dir: impl Into<PathBuf>,
        scratch_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runtime,
            base_dir: base_dir.into(),
            extractor: ArchiveExtractorImpl::new(),
            scratch_root: scratch_root.into(),
            counter: AtomicU64::new(0),
        }
    }

    /// Absolute location of a `file:`, `~/`, relative or absolute spec.
    pub fn locate(&self, spec: &str) -> Result<PathBuf, EndpointError> {
        let spec = spec.trim();
        let raw = spec.strip_prefix("file:").unwrap_or(spec);
        let path = if let Some(rest) = raw.strip_prefix("~/") {
            let home = self.runtime.home_dir().ok_or_else(|| {
                EndpointError::NotFound(format!("cannot expand {}: no home directory", spec))
            })?;
            home.join(rest)
        } else {
            let path = Path::new(raw);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                self.base_dir.join(path)
            }
        };
        Ok(normalize_path(&path))
    }

    fn read_manifest(&self, dir: &Path) -> Result<Option<Manifest>, EndpointError> {
        let manifest_path = dir.join(MANIFEST_FILE);
        if !self.runtime.exists(&manifest_path) {
            return Ok(None);
        }
        Manifest::load(self.runtime.as_ref(), &manifest_path)
            .map(Some)
            .map_err(EndpointError::corrupt)
    }

    fn next_dir(&self, prefix: &str) -> PathBuf {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        self.scratch_root.join(format!("{}-{}", prefix, n))
    }

    fn archive_manifest(&self, archive: &Path) -> Result<Option<Manifest>, EndpointError> {
        let peek = self.next_dir("peek");
        self.extractor
            .extract(self.runtime.as_ref(), archive, &peek)
            .map_err(EndpointError::corrupt)?;
        let manifest = self.read_manifest(&peek);
        if let Err(e) = self.runtime.remove_dir_all(&peek) {
            debug!("Failed to remove {:?}: {}", peek, e);
        }
        manifest
    }
}

#[async_trait]
impl<R: Runtime + 'static> Endpoint for LocalPathEndpoint<R> {
    fn kind(&self) -> SourceKind {
        SourceKind::Path
    }

    #[tracing::instrument(skip(self))]
    async fn candidates(
        &self,
        id: &PackageIdentifier,
    ) -> Result<Vec<PackageMetadata>, EndpointError> {
        let path = self.locate(&id.spec)?;
        if !self.runtime.exists(&path) {
            return Err(EndpointError::NotFound(path.display().to_string()));
        }

        let (manifest, artifact) = if self.runtime.is_dir(&path) {
            (
                self.read_manifest(&path)?,
                ArtifactReference::Directory { path: path.clone() },
            )
        } else {
            (
                self.archive_manifest(&path)?,
                ArtifactReference::Archive { path: path.clone() },
            )
        };

        let fallback = || PackageVersion::Ref(id.spec.clone());
        let metadata = match manifest {
            Some(manifest) => {
                let version = manifest
                    .version
                    .as_deref()
                    .map(PackageVersion::parse_lenient)
                    .unwrap_or_else(fallback);
                PackageMetadata::from_manifest(&manifest, &id.name, version, artifact)
            }
            None => PackageMetadata::bare(&id.name, fallback(), artifact),
        };
        Ok(vec![metadata])
    }

    #[tracing::instrument(skip(self))]
    async fn fetch(
        &self,
        artifact: &ArtifactReference,
        scratch: &Path,
    ) -> Result<FetchedArtifact, EndpointError> {
        match artifact {
            ArtifactReference::Directory { path } => {
                if !self.runtime.is_dir(path) {
                    return Err(EndpointError::NotFound(path.display().to_string()));
                }
                Ok(FetchedArtifact::Local(path.clone()))
            }
            ArtifactReference::Archive { path } => {
                // Work on a copy; the user's archive is never consumed.
                let file_name = path
                    .file_name()
                    .ok_or_else(|| EndpointError::NotFound(path.display().to_string()))?;
                self.runtime
                    .create_dir_all(scratch)
                    .map_err(EndpointError::corrupt)?;
                let target = scratch.join(file_name);
                self.runtime.copy(path, &target).map_err(|e| {
                    if self.runtime.exists(path) {
                        EndpointError::corrupt(e)
                    } else {
                        EndpointError::NotFound(path.display().to_string())
                    }
                })?;
                Ok(FetchedArtifact::Archive(target))
            }
            other => Err(EndpointError::NetworkPermanent(format!(
                "path endpoint cannot fetch {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_util::tar_gz;
    use crate::runtime::{MockRuntime, RealRuntime};
    use tempfile::tempdir;

    #[test]
    fn test_locate() {
        let mut runtime = MockRuntime::new();
        runtime
            .expect_home_dir()
            .returning(|| Some(PathBuf::from("/home/user")));
        let endpoint = LocalPathEndpoint::new(Arc::new(runtime), "/work/app", "/tmp/scratch");

        assert_eq!(
            endpoint.locate("file:../util").unwrap(),
            PathBuf::from("/work/util")
        );
        assert_eq!(
            endpoint.locate("./libs/a").unwrap(),
            PathBuf::from("/work/app/libs/a")
        );
        assert_eq!(
            endpoint.locate("~/src/b").unwrap(),
            PathBuf::from("/home/user/src/b")
        );
        assert_eq!(
            endpoint.locate("file:/opt/c.zip").unwrap(),
            PathBuf::from("/opt/c.zip")
        );
    }

    #[tokio::test]
    async fn test_candidates_from_directory() {
        let project = tempdir().unwrap();
        let util = project.path().join("util");
        std::fs::create_dir_all(&util).unwrap();
        std::fs::write(
            util.join("box.json"),
            r#"{"name": "util", "version": "0.3.0", "dependencies": {"a": "^1.0.0"}}"#,
        )
        .unwrap();

        let endpoint = LocalPathEndpoint::new(
            Arc::new(RealRuntime),
            project.path(),
            project.path().join(".scratch"),
        );
        let id = PackageIdentifier::from_entry("util", "file:./util");
        let candidates = endpoint.candidates(&id).await.unwrap();

        assert_eq!(candidates[0].version.to_string(), "0.3.0");
        assert_eq!(candidates[0].dependencies["a"], "^1.0.0");
        assert_eq!(
            candidates[0].artifact,
            ArtifactReference::Directory { path: util.clone() }
        );

        let fetched = endpoint
            .fetch(&candidates[0].artifact, &project.path().join(".scratch/op"))
            .await
            .unwrap();
        assert_eq!(fetched, FetchedArtifact::Local(util));
    }

    #[tokio::test]
    async fn test_candidates_directory_without_manifest() {
        let project = tempdir().unwrap();
        std::fs::create_dir_all(project.path().join("plain")).unwrap();

        let endpoint = LocalPathEndpoint::new(
            Arc::new(RealRuntime),
            project.path(),
            project.path().join(".scratch"),
        );
        let id = PackageIdentifier::from_entry("plain", "./plain");
        let candidates = endpoint.candidates(&id).await.unwrap();
        assert_eq!(candidates[0].version, PackageVersion::Ref("./plain".into()));
        assert!(candidates[0].dependencies.is_empty());
    }

    #[tokio::test]
    async fn test_candidates_from_archive() {
        let project = tempdir().unwrap();
        let archive = project.path().join("pkg.tgz");
        std::fs::write(
            &archive,
            tar_gz(&[("pkg/box.json", r#"{"name": "pkg", "version": "2.0.0"}"#)]),
        )
        .unwrap();

        let endpoint = LocalPathEndpoint::new(
            Arc::new(RealRuntime),
            project.path(),
            project.path().join(".scratch"),
        );
        let id = PackageIdentifier::from_entry("pkg", "./pkg.tgz");
        let candidates = endpoint.candidates(&id).await.unwrap();
        assert_eq!(candidates[0].version.to_string(), "2.0.0");

        let scratch = project.path().join(".scratch/op");
        let fetched = endpoint.fetch(&candidates[0].artifact, &scratch).await.unwrap();
        assert_eq!(fetched, FetchedArtifact::Archive(scratch.join("pkg.tgz")));
        assert!(archive.exists());
    }

    #[tokio::test]
    async fn test_candidates_missing_path() {
        let project = tempdir().unwrap();
        let endpoint = LocalPathEndpoint::new(
            Arc::new(RealRuntime),
            project.path(),
            project.path().join(".scratch"),
        );
        let id = PackageIdentifier::from_entry("gone", "../gone");
        let err = endpoint.candidates(&id).await.unwrap_err();
        assert!(matches!(err, EndpointError::NotFound(_)));
    }
}
