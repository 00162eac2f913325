//! Registry index endpoint.
//!
//! `GET {registry}/packages/{name}` returns every published version:
//!
//! ```json
//! {
//!   "name": "foo",
//!   "versions": {
//!     "1.2.0": {
//!       "dependencies": {"bar": "^2.0.0"},
//!       "devDependencies": {},
//!       "engines": {"boxlang": ">=1.0.0"},
//!       "scripts": {"postinstall": "..."},
//!       "dist": {"url": "https://…/foo-1.2.0.tgz", "integrity": "sha256-…", "size": 1234}
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use reqwest::Url;
use serde::Deserialize;

use super::url::download_archive;
use super::{
    ArtifactReference, Endpoint, FetchedArtifact, Hooks, PackageIdentifier, PackageMetadata,
    SourceKind,
};
use crate::error::EndpointError;
use crate::http::HttpClient;
use crate::runtime::Runtime;
use crate::version::PackageVersion;

#[derive(Debug, Deserialize)]
struct PackageDocument {
    #[serde(default)]
    versions: BTreeMap<String, VersionDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionDocument {
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
    #[serde(default)]
    dev_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    engines: BTreeMap<String, String>,
    #[serde(default)]
    scripts: BTreeMap<String, String>,
    dist: Dist,
}

#[derive(Debug, Deserialize)]
struct Dist {
    #[serde(alias = "tarball")]
    url: String,
    #[serde(default)]
    integrity: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

pub struct RegistryEndpoint<R: Runtime> {
    runtime: Arc<R>,
    http: HttpClient,
    base_url: String,
    token: Option<String>,
}

impl<R: Runtime + 'static> RegistryEndpoint<R> {
    pub fn new(
        runtime: Arc<R>,
        http: HttpClient,
        base_url: impl Into<String>,
        token: Option<String>,
    ) -> Self {
        Self {
            runtime,
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn package_url(&self, name: &str) -> String {
        format!("{}/packages/{}", self.base_url, name)
    }

    /// Dist URLs may be relative to the registry.
    fn absolute(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        }
    }

    /// The token is only ever sent to the registry's own origin.
    fn bearer_for(&self, url: &str) -> Option<&str> {
        let token = self.token.as_deref()?;
        let registry = Url::parse(&self.base_url).ok()?;
        let target = Url::parse(url).ok()?;
        let same_origin = registry.scheme() == target.scheme()
            && registry.host_str().is_some()
            && registry.host_str() == target.host_str()
            && registry.port_or_known_default() == target.port_or_known_default();
        same_origin.then_some(token)
    }

    fn to_metadata(&self, name: &str, version: PackageVersion, doc: VersionDocument) -> PackageMetadata {
        PackageMetadata {
            name: name.to_string(),
            version,
            dependencies: doc.dependencies,
            dev_dependencies: doc.dev_dependencies,
            artifact: ArtifactReference::Remote {
                url: self.absolute(&doc.dist.url),
            },
            engines: doc.engines,
            hooks: Hooks {
                preinstall: doc.scripts.get("preinstall").cloned(),
                postinstall: doc.scripts.get("postinstall").cloned(),
            },
            integrity: doc.dist.integrity,
            size: doc.dist.size,
        }
    }
}

#[async_trait]
impl<R: Runtime + 'static> Endpoint for RegistryEndpoint<R> {
    fn kind(&self) -> SourceKind {
        SourceKind::Registry
    }

    #[tracing::instrument(skip(self))]
    async fn candidates(
        &self,
        id: &PackageIdentifier,
    ) -> Result<Vec<PackageMetadata>, EndpointError> {
        let url = self.package_url(&id.name);
        let doc: PackageDocument = self.http.get_json(&url, self.bearer_for(&url)).await?;

        let mut candidates = Vec::with_capacity(doc.versions.len());
        for (raw, version_doc) in doc.versions {
            match semver::Version::parse(raw.trim_start_matches('v')) {
                Ok(v) => candidates.push(self.to_metadata(&id.name, v.into(), version_doc)),
                Err(e) => debug!("Skipping {} version '{}': {}", id.name, raw, e),
            }
        }
        debug!("{} has {} published version(s)", id.name, candidates.len());
        Ok(candidates)
    }

    #[tracing::instrument(skip(self))]
    async fn fetch(
        &self,
        artifact: &ArtifactReference,
        scratch: &Path,
    ) -> Result<FetchedArtifact, EndpointError> {
        match artifact {
            ArtifactReference::Remote { url } => {
                let path = download_archive(
                    self.runtime.as_ref(),
                    &self.http,
                    url,
                    self.bearer_for(url),
                    scratch,
                )
                .await?;
                Ok(FetchedArtifact::Archive(path))
            }
            other => Err(EndpointError::NetworkPermanent(format!(
                "registry cannot fetch {}",
                other
            ))),
        }
    }
}
