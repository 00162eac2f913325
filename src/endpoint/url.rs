//! Direct archive URLs.
//!
//! The archive is downloaded once per run. If it embeds a `box.json`
//! (at the root or inside a single top-level directory) that manifest
//! provides the version and dependencies; otherwise the package has no
//! dependencies and its version is the URL itself.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use log::debug;
use tokio::sync::Mutex;

use super::{
    ArtifactReference, Endpoint, FetchedArtifact, PackageIdentifier, PackageMetadata, SourceKind,
};
use crate::archive::{ArchiveExtractor, ArchiveExtractorImpl};
use crate::error::EndpointError;
use crate::http::HttpClient;
use crate::integrity;
use crate::package::{MANIFEST_FILE, Manifest};
use crate::runtime::Runtime;
use crate::version::PackageVersion;

/// File name for a download, taken from the last URL path segment.
fn file_name_for(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty() && !s.contains(':'))
        .unwrap_or("download")
        .to_string()
}

/// Download `url` into `scratch`, returning the file path.
pub(super) async fn download_archive<R: Runtime + ?Sized>(
    runtime: &R,
    http: &HttpClient,
    url: &str,
    bearer: Option<&str>,
    scratch: &Path,
) -> Result<PathBuf, EndpointError> {
    runtime
        .create_dir_all(scratch)
        .map_err(EndpointError::corrupt)?;
    let path = scratch.join(file_name_for(url));
    http.download_file(url, bearer, || runtime.create_file(&path))
        .await?;
    Ok(path)
}

pub struct DirectUrlEndpoint<R: Runtime> {
    runtime: Arc<R>,
    http: HttpClient,
    extractor: ArchiveExtractorImpl,
    scratch_root: PathBuf,
    /// url -> downloaded file
    downloads: Mutex<HashMap<String, PathBuf>>,
    counter: AtomicU64,
}

impl<R: Runtime + 'static> DirectUrlEndpoint<R> {
    pub fn new(runtime: Arc<R>, http: HttpClient, scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            http,
            extractor: ArchiveExtractorImpl::new(),
            scratch_root: scratch_root.into(),
            downloads: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
        }
    }

    fn next_dir(&self, prefix: &str) -> PathBuf {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        self.scratch_root.join(format!("{}-{}", prefix, n))
    }

    /// Download once per run; later calls reuse the file.
    async fn download_once(&self, url: &str) -> Result<PathBuf, EndpointError> {
        let mut downloads = self.downloads.lock().await;
        if let Some(path) = downloads.get(url) {
            return Ok(path.clone());
        }
        let dir = self.next_dir("url");
        let path = self
            .http
            .retry_policy()
            .run("download", EndpointError::is_retryable, || {
                download_archive(self.runtime.as_ref(), &self.http, url, None, &dir)
            })
            .await?;
        downloads.insert(url.to_string(), path.clone());
        Ok(path)
    }

    /// Manifest embedded in the archive, if any.
    fn embedded_manifest(&self, archive: &Path) -> Result<Option<Manifest>, EndpointError> {
        let peek = self.next_dir("peek");
        self.extractor
            .extract(self.runtime.as_ref(), archive, &peek)
            .map_err(EndpointError::corrupt)?;
        let manifest_path = peek.join(MANIFEST_FILE);
        let manifest = if self.runtime.exists(&manifest_path) {
            Some(Manifest::load(self.runtime.as_ref(), &manifest_path).map_err(EndpointError::corrupt)?)
        } else {
            None
        };
        if let Err(e) = self.runtime.remove_dir_all(&peek) {
            debug!("Failed to remove {:?}: {}", peek, e);
        }
        Ok(manifest)
    }
}

#[async_trait]
impl<R: Runtime + 'static> Endpoint for DirectUrlEndpoint<R> {
    fn kind(&self) -> SourceKind {
        SourceKind::Url
    }

    #[tracing::instrument(skip(self))]
    async fn candidates(
        &self,
        id: &PackageIdentifier,
    ) -> Result<Vec<PackageMetadata>, EndpointError> {
        let url = id.spec.as_str();
        let archive = self.download_once(url).await?;
        let artifact = ArtifactReference::Remote {
            url: url.to_string(),
        };

        let mut metadata = match self.embedded_manifest(&archive)? {
            Some(manifest) => {
                let version = manifest
                    .version
                    .as_deref()
                    .map(PackageVersion::parse_lenient)
                    .unwrap_or_else(|| PackageVersion::Ref(url.to_string()));
                PackageMetadata::from_manifest(&manifest, &id.name, version, artifact)
            }
            None => {
                debug!("{} has no embedded {}", url, MANIFEST_FILE);
                PackageMetadata::bare(&id.name, PackageVersion::Ref(url.to_string()), artifact)
            }
        };

        // Pin what was seen at resolution so a changed upstream file is caught.
        let (digest, size) =
            integrity::compute(self.runtime.as_ref(), &archive).map_err(EndpointError::corrupt)?;
        metadata.integrity = Some(digest);
        metadata.size = Some(size);
        Ok(vec![metadata])
    }

    #[tracing::instrument(skip(self))]
    async fn fetch(
        &self,
        artifact: &ArtifactReference,
        scratch: &Path,
    ) -> Result<FetchedArtifact, EndpointError> {
        let ArtifactReference::Remote { url } = artifact else {
            return Err(EndpointError::NetworkPermanent(format!(
                "url endpoint cannot fetch {}",
                artifact
            )));
        };

        let cached = self.downloads.lock().await.get(url).cloned();
        match cached {
            Some(source) if self.runtime.exists(&source) => {
                self.runtime
                    .create_dir_all(scratch)
                    .map_err(EndpointError::corrupt)?;
                let target = scratch.join(file_name_for(url));
                self.runtime
                    .copy(&source, &target)
                    .map_err(EndpointError::corrupt)?;
                Ok(FetchedArtifact::Archive(target))
            }
            _ => {
                let path =
                    download_archive(self.runtime.as_ref(), &self.http, url, None, scratch).await?;
                Ok(FetchedArtifact::Archive(path))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_util::tar_gz;
    use crate::runtime::RealRuntime;
    use tempfile::tempdir;

    #[test]
    fn test_file_name_for() {
        assert_eq!(file_name_for("https://h/dl/foo-1.0.0.tgz"), "foo-1.0.0.tgz");
        assert_eq!(file_name_for("https://h/dl/foo.zip?token=1#x"), "foo.zip");
        assert_eq!(file_name_for("https://h/"), "download");
    }

    #[tokio::test]
    async fn test_candidates_reads_embedded_manifest_and_downloads_once() {
        let mut server = mockito::Server::new_async().await;
        let body = tar_gz(&[(
            "foo/box.json",
            r#"{"name": "foo", "version": "1.4.0", "dependencies": {"bar": "^1.0.0"}}"#,
        )]);
        let mock = server
            .mock("GET", "/dl/foo.tgz")
            .with_status(200)
            .with_body(body)
            .expect(1)
            .create_async()
            .await;

        let scratch = tempdir().unwrap();
        let endpoint = DirectUrlEndpoint::new(
            Arc::new(RealRuntime),
            HttpClient::new(reqwest::Client::new()),
            scratch.path(),
        );
        let url = format!("{}/dl/foo.tgz", server.url());
        let id = PackageIdentifier::from_entry("foo", &url);

        let candidates = endpoint.candidates(&id).await.unwrap();
        assert_eq!(candidates.len(), 1);
        let m = &candidates[0];
        assert_eq!(m.version.to_string(), "1.4.0");
        assert_eq!(m.dependencies["bar"], "^1.0.0");
        assert!(m.integrity.as_deref().unwrap().starts_with("sha256-"));

        // The artifact is served from the run's download, not fetched again
        let target = scratch.path().join("op-1");
        let fetched = endpoint.fetch(&m.artifact, &target).await.unwrap();
        assert_eq!(fetched, FetchedArtifact::Archive(target.join("foo.tgz")));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_candidates_without_manifest_uses_url_as_version() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/dl/plain.tgz")
            .with_status(200)
            .with_body(tar_gz(&[("lib/a.bx", "a")]))
            .create_async()
            .await;

        let scratch = tempdir().unwrap();
        let endpoint = DirectUrlEndpoint::new(
            Arc::new(RealRuntime),
            HttpClient::new(reqwest::Client::new()),
            scratch.path(),
        );
        let url = format!("{}/dl/plain.tgz", server.url());
        let id = PackageIdentifier::from_entry("plain", &url);

        let candidates = endpoint.candidates(&id).await.unwrap();
        assert_eq!(candidates[0].version, PackageVersion::Ref(url));
        assert!(candidates[0].dependencies.is_empty());
    }

    #[tokio::test]
    async fn test_candidates_not_found() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/dl/missing.tgz")
            .with_status(404)
            .create_async()
            .await;

        let scratch = tempdir().unwrap();
        let endpoint = DirectUrlEndpoint::new(
            Arc::new(RealRuntime),
            HttpClient::new(reqwest::Client::new()),
            scratch.path(),
        );
        let id = PackageIdentifier::from_entry("missing", &format!("{}/dl/missing.tgz", server.url()));
        let err = endpoint.candidates(&id).await.unwrap_err();
        assert!(matches!(err, EndpointError::NotFound(_)));
    }
}
