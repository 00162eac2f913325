//! Version-control sources.
//!
//! `git+https://host/foo.git#v1.2.0`, `https://host/foo.git`, `git://…`
//! and `github:owner/repo#ref` are shallow-fetched at the ref (default
//! `HEAD`) and the package's `box.json` is read from the checkout.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use log::debug;
use tokio::process::Command;
use tokio::sync::Mutex;

use super::{
    ArtifactReference, Endpoint, FetchedArtifact, PackageIdentifier, PackageMetadata, SourceKind,
};
use crate::error::EndpointError;
use crate::package::{MANIFEST_FILE, Manifest};
use crate::runtime::Runtime;
use crate::version::PackageVersion;

pub const DEFAULT_REF: &str = "HEAD";

/// Repository location and ref of a git dependency.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GitSource {
    pub url: String,
    pub reference: String,
}

impl GitSource {
    pub fn parse(spec: &str) -> Self {
        let spec = spec.trim();
        let spec = spec.strip_prefix("git+").unwrap_or(spec);
        let (location, reference) = match spec.split_once('#') {
            Some((location, reference)) if !reference.is_empty() => (location, reference),
            Some((location, _)) => (location, DEFAULT_REF),
            None => (spec, DEFAULT_REF),
        };
        let url = match location.strip_prefix("github:") {
            Some(repo) => format!(
                "https://github.com/{}.git",
                repo.trim_end_matches(".git")
            ),
            None => location.to_string(),
        };
        Self {
            url,
            reference: reference.to_string(),
        }
    }

    /// Semantic version named by the ref itself (`v1.2.0`, `1.2.0`).
    pub fn semver_ref(&self) -> Option<semver::Version> {
        semver::Version::parse(self.reference.trim_start_matches('v')).ok()
    }
}

/// Access to git repositories.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GitClient: Send + Sync {
    /// Shallow checkout of `reference` from `url` into `dest`. Returns the commit id.
    async fn checkout(
        &self,
        url: &str,
        reference: &str,
        dest: &Path,
    ) -> Result<String, EndpointError>;

    /// Whether `reference` names a tag of the remote repository.
    async fn is_tag(&self, url: &str, reference: &str) -> Result<bool, EndpointError>;
}

/// [`GitClient`] running the `git` executable.
#[derive(Debug, Default, Clone)]
pub struct CommandGitClient;

impl CommandGitClient {
    async fn git(&self, args: &[&str], cwd: Option<&Path>) -> Result<String, EndpointError> {
        debug!("Running git {:?} (cwd: {:?})", args, cwd);

        let mut cmd = Command::new("git");
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await.map_err(|e| {
            EndpointError::NetworkPermanent(format!("failed to run git: {}", e))
        })?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        debug!("git {:?} failed with {}: {}", args, output.status, stderr);
        Err(classify_git_failure(&stderr))
    }
}

/// Map git's stderr to an endpoint failure.
fn classify_git_failure(stderr: &str) -> EndpointError {
    let lower = stderr.to_lowercase();
    if lower.contains("authentication failed")
        || lower.contains("could not read username")
        || lower.contains("permission denied")
    {
        EndpointError::AuthRequired(stderr.to_string())
    } else if lower.contains("couldn't find remote ref")
        || lower.contains("not found")
        || lower.contains("does not exist")
    {
        EndpointError::NotFound(stderr.to_string())
    } else if lower.contains("could not resolve host")
        || lower.contains("timed out")
        || lower.contains("connection")
        || lower.contains("early eof")
    {
        EndpointError::NetworkTransient(stderr.to_string())
    } else {
        EndpointError::NetworkPermanent(stderr.to_string())
    }
}

#[async_trait]
impl GitClient for CommandGitClient {
    #[tracing::instrument(skip(self))]
    async fn checkout(
        &self,
        url: &str,
        reference: &str,
        dest: &Path,
    ) -> Result<String, EndpointError> {
        tokio::fs::create_dir_all(dest)
            .await
            .map_err(EndpointError::corrupt)?;
        self.git(&["init", "--quiet"], Some(dest)).await?;
        self.git(&["fetch", "--quiet", "--depth", "1", url, reference], Some(dest))
            .await?;
        self.git(&["checkout", "--quiet", "FETCH_HEAD"], Some(dest))
            .await?;
        self.git(&["rev-parse", "HEAD"], Some(dest)).await
    }

    #[tracing::instrument(skip(self))]
    async fn is_tag(&self, url: &str, reference: &str) -> Result<bool, EndpointError> {
        let tag = format!("refs/tags/{}", reference);
        let out = self.git(&["ls-remote", "--tags", url, &tag], None).await?;
        Ok(!out.is_empty())
    }
}

pub struct VersionControlEndpoint<R: Runtime> {
    runtime: Arc<R>,
    git: Arc<dyn GitClient>,
    scratch_root: PathBuf,
    /// (url, ref) -> checkout made while resolving
    checkouts: Mutex<HashMap<GitSource, PathBuf>>,
    counter: AtomicU64,
}

impl<R: Runtime + 'static> VersionControlEndpoint<R> {
    pub fn new(runtime: Arc<R>, git: Arc<dyn GitClient>, scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            git,
            scratch_root: scratch_root.into(),
            checkouts: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
        }
    }

    async fn checkout_into(&self, source: &GitSource, dest: &Path) -> Result<(), EndpointError> {
        let commit = self
            .git
            .checkout(&source.url, &source.reference, dest)
            .await?;
        debug!("Checked out {}#{} at {}", source.url, source.reference, commit);

        let git_dir = dest.join(".git");
        if self.runtime.exists(&git_dir) {
            self.runtime
                .remove_dir_all(&git_dir)
                .map_err(EndpointError::corrupt)?;
        }
        Ok(())
    }

    async fn version_for(
        &self,
        source: &GitSource,
        manifest: Option<&Manifest>,
    ) -> Result<PackageVersion, EndpointError> {
        if let Some(v) = source.semver_ref() {
            return Ok(PackageVersion::Semver(v));
        }
        let manifest_version = manifest
            .and_then(|m| m.version.as_deref())
            .and_then(|v| semver::Version::parse(v.trim_start_matches('v')).ok());
        if let Some(v) = manifest_version
            && source.reference != DEFAULT_REF
            && self.git.is_tag(&source.url, &source.reference).await?
        {
            return Ok(PackageVersion::Semver(v));
        }
        Ok(PackageVersion::Ref(source.reference.clone()))
    }
}

#[async_trait]
impl<R: Runtime + 'static> Endpoint for VersionControlEndpoint<R> {
    fn kind(&self) -> SourceKind {
        SourceKind::Git
    }

    #[tracing::instrument(skip(self))]
    async fn candidates(
        &self,
        id: &PackageIdentifier,
    ) -> Result<Vec<PackageMetadata>, EndpointError> {
        let source = GitSource::parse(&id.spec);

        let checkout = {
            let mut checkouts = self.checkouts.lock().await;
            match checkouts.get(&source) {
                Some(path) => path.clone(),
                None => {
                    let n = self.counter.fetch_add(1, Ordering::SeqCst);
                    let dest = self.scratch_root.join(format!("git-{}", n));
                    self.checkout_into(&source, &dest).await?;
                    checkouts.insert(source.clone(), dest.clone());
                    dest
                }
            }
        };

        let manifest_path = checkout.join(MANIFEST_FILE);
        let manifest = if self.runtime.exists(&manifest_path) {
            Some(Manifest::load(self.runtime.as_ref(), &manifest_path).map_err(EndpointError::corrupt)?)
        } else {
            None
        };
        let version = self.version_for(&source, manifest.as_ref()).await?;
        let artifact = ArtifactReference::GitCheckout {
            url: source.url.clone(),
            reference: source.reference.clone(),
        };

        let metadata = match manifest {
            Some(manifest) => PackageMetadata::from_manifest(&manifest, &id.name, version, artifact),
            None => PackageMetadata::bare(&id.name, version, artifact),
        };
        Ok(vec![metadata])
    }

    #[tracing::instrument(skip(self))]
    async fn fetch(
        &self,
        artifact: &ArtifactReference,
        scratch: &Path,
    ) -> Result<FetchedArtifact, EndpointError> {
        let ArtifactReference::GitCheckout { url, reference } = artifact else {
            return Err(EndpointError::NetworkPermanent(format!(
                "git endpoint cannot fetch {}",
                artifact
            )));
        };
        let source = GitSource {
            url: url.clone(),
            reference: reference.clone(),
        };
        let dest = scratch.join("checkout");

        let cached = self.checkouts.lock().await.get(&source).cloned();
        match cached {
            Some(path) if self.runtime.is_dir(&path) => {
                self.runtime
                    .copy_dir_all(&path, &dest)
                    .map_err(EndpointError::corrupt)?;
            }
            _ => self.checkout_into(&source, &dest).await?,
        }
        Ok(FetchedArtifact::Directory(dest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RealRuntime;
    use tempfile::tempdir;

    fn write_checkout(dest: &Path, manifest: &str) {
        std::fs::create_dir_all(dest.join(".git")).unwrap();
        std::fs::write(dest.join(MANIFEST_FILE), manifest).unwrap();
        std::fs::write(dest.join("index.bx"), "component {}").unwrap();
    }

    #[test]
    fn test_git_source_parse() {
        assert_eq!(
            GitSource::parse("git+https://example.com/foo.git#v1.2.0"),
            GitSource {
                url: "https://example.com/foo.git".into(),
                reference: "v1.2.0".into()
            }
        );
        assert_eq!(
            GitSource::parse("github:owner/repo"),
            GitSource {
                url: "https://github.com/owner/repo.git".into(),
                reference: "HEAD".into()
            }
        );
        assert_eq!(GitSource::parse("git://host/foo#").reference, "HEAD");
        assert_eq!(
            GitSource::parse("github:o/r#v2.0.0").semver_ref(),
            Some(semver::Version::new(2, 0, 0))
        );
        assert_eq!(GitSource::parse("github:o/r#main").semver_ref(), None);
    }

    #[test]
    fn test_classify_git_failure() {
        assert!(matches!(
            classify_git_failure("fatal: couldn't find remote ref v9"),
            EndpointError::NotFound(_)
        ));
        assert!(matches!(
            classify_git_failure("fatal: Authentication failed for 'https://host/'"),
            EndpointError::AuthRequired(_)
        ));
        assert!(classify_git_failure("fatal: unable to access: Could not resolve host: h").is_retryable());
        assert!(matches!(
            classify_git_failure("fatal: bad object"),
            EndpointError::NetworkPermanent(_)
        ));
    }

    #[tokio::test]
    async fn test_candidates_semver_tag() {
        let mut git = MockGitClient::new();
        git.expect_checkout()
            .times(1)
            .returning(|url, reference, dest| {
                assert_eq!(url, "https://example.com/foo.git");
                assert_eq!(reference, "v1.2.0");
                write_checkout(dest, r#"{"name": "foo", "dependencies": {"bar": "^1.0.0"}}"#);
                Ok("abc123".into())
            });
        git.expect_is_tag().never();

        let scratch = tempdir().unwrap();
        let endpoint =
            VersionControlEndpoint::new(Arc::new(RealRuntime), Arc::new(git), scratch.path());
        let id = PackageIdentifier::from_entry("foo", "git+https://example.com/foo.git#v1.2.0");

        let candidates = endpoint.candidates(&id).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].version.to_string(), "1.2.0");
        assert_eq!(candidates[0].dependencies["bar"], "^1.0.0");

        // Fetch reuses the checkout and leaves the git metadata behind
        let target = scratch.path().join("op-0");
        let fetched = endpoint.fetch(&candidates[0].artifact, &target).await.unwrap();
        let FetchedArtifact::Directory(dir) = fetched else {
            panic!("expected a directory");
        };
        assert!(dir.join("index.bx").exists());
        assert!(!dir.join(".git").exists());
    }

    #[tokio::test]
    async fn test_candidates_tag_uses_manifest_version() {
        let mut git = MockGitClient::new();
        git.expect_checkout().returning(|_, _, dest| {
            write_checkout(dest, r#"{"name": "foo", "version": "3.1.0"}"#);
            Ok("abc123".into())
        });
        git.expect_is_tag()
            .returning(|_, reference| Ok(reference == "stable"));

        let scratch = tempdir().unwrap();
        let endpoint =
            VersionControlEndpoint::new(Arc::new(RealRuntime), Arc::new(git), scratch.path());
        let id = PackageIdentifier::from_entry("foo", "https://example.com/foo.git#stable");

        let candidates = endpoint.candidates(&id).await.unwrap();
        assert_eq!(candidates[0].version.to_string(), "3.1.0");
    }

    #[tokio::test]
    async fn test_candidates_branch_is_a_ref() {
        let mut git = MockGitClient::new();
        git.expect_checkout().returning(|_, _, dest| {
            write_checkout(dest, r#"{"name": "foo", "version": "3.1.0"}"#);
            Ok("abc123".into())
        });
        git.expect_is_tag().returning(|_, _| Ok(false));

        let scratch = tempdir().unwrap();
        let endpoint =
            VersionControlEndpoint::new(Arc::new(RealRuntime), Arc::new(git), scratch.path());
        let id = PackageIdentifier::from_entry("foo", "github:owner/foo#main");

        let candidates = endpoint.candidates(&id).await.unwrap();
        assert_eq!(candidates[0].version, PackageVersion::Ref("main".into()));
    }

    #[tokio::test]
    async fn test_candidates_missing_ref() {
        let mut git = MockGitClient::new();
        git.expect_checkout()
            .returning(|_, _, _| Err(EndpointError::NotFound("couldn't find remote ref".into())));

        let scratch = tempdir().unwrap();
        let endpoint =
            VersionControlEndpoint::new(Arc::new(RealRuntime), Arc::new(git), scratch.path());
        let id = PackageIdentifier::from_entry("foo", "github:owner/foo#nope");
        let err = endpoint.candidates(&id).await.unwrap_err();
        assert!(matches!(err, EndpointError::NotFound(_)));
    }
}
