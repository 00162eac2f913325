//! Application layer - the operations behind each command.
//!
//! Every operation runs against one [`RunContext`]: the runtime, the
//! endpoints, the settings snapshot, the progress sink and the cancellation
//! token of a single run. The flow is always the same: resolve (or reuse
//! the lock), plan against the install records, execute, and commit the
//! manifest and lock only when every operation succeeded.

mod context;
mod install;
mod remove;
mod resolve;
mod update;

use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::error::{OperationFailure, PackageError, RunStatus};
use crate::install::Installer;
use crate::package::{LOCK_FILE, LockState, Manifest, RecordStore};
use crate::planner::{Plan, PlanSummary, Planner};
use crate::resolver::{ResolveOptions, Resolver, Strict};
use crate::runtime::Runtime;

pub use context::RunContext;
pub use install::{InstallOptions, install};
pub use remove::remove;
pub use resolve::resolve;
pub use update::update;

/// Outcome of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub status: RunStatus,
    pub summary: PlanSummary,
    pub failures: Vec<OperationFailure>,
}

impl RunReport {
    pub fn success(summary: PlanSummary) -> Self {
        Self {
            status: RunStatus::Success,
            summary,
            failures: Vec::new(),
        }
    }

    /// Report for a command that ended in `err`.
    pub fn failed(err: &PackageError) -> Self {
        let failures = match err {
            PackageError::PartialInstallFailure { failures, .. } => failures.clone(),
            _ => Vec::new(),
        };
        Self {
            status: err.status(),
            summary: PlanSummary::default(),
            failures,
        }
    }
}

/// Locations derived from the manifest path.
#[derive(Debug, Clone)]
pub(crate) struct Project {
    pub root: PathBuf,
    pub manifest_path: PathBuf,
    pub lock_path: PathBuf,
}

impl Project {
    pub fn at(manifest_path: &Path) -> Self {
        let root = match manifest_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Self {
            lock_path: root.join(LOCK_FILE),
            manifest_path: manifest_path.to_path_buf(),
            root,
        }
    }
}

/// How much of the previous lock to keep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Refresh {
    /// Use the lock as is when the manifest did not change.
    None,
    /// Re-resolve, keeping the locked versions of every other package.
    Packages(Vec<String>),
    /// Re-resolve everything to the newest matching versions.
    All,
}

#[derive(Debug, Clone)]
pub(crate) struct PipelineOptions {
    pub include_dev: bool,
    pub strict: bool,
    pub force: bool,
    pub refresh: Refresh,
}

/// The plan for `manifest` and the lock it would produce.
#[tracing::instrument(skip_all)]
pub(crate) async fn plan_project<R: Runtime + 'static>(
    ctx: &RunContext<R>,
    project: &Project,
    manifest: &Manifest,
    options: &PipelineOptions,
) -> Result<(Plan, LockState, RecordStore), PackageError> {
    let runtime = ctx.runtime.as_ref();
    let modules_root = project.root.join(&ctx.settings.modules_dir);
    let records = RecordStore::load(runtime, &modules_root)
        .map_err(|e| PackageError::persistence(RecordStore::file_path(&modules_root), e))?;

    let digest = manifest.dependency_digest();
    let previous = LockState::load(runtime, &project.lock_path);
    let planner = Planner::new(runtime, &project.root, &ctx.settings.modules_dir, &records);

    if let Some(lock) = &previous
        && options.refresh == Refresh::None
        && !options.force
        && lock.is_current(&digest, options.include_dev)
    {
        debug!("Lock is current, skipping resolution");
        let plan = planner.plan_from_lock(lock, options.include_dev);
        return Ok((plan, lock.clone(), records));
    }

    let mut preferred = previous
        .as_ref()
        .map(LockState::pinned_versions)
        .unwrap_or_default();
    match &options.refresh {
        Refresh::All => preferred.clear(),
        Refresh::Packages(names) => {
            for name in names {
                preferred.remove(name);
            }
        }
        Refresh::None => {}
    }

    let resolve_options = ResolveOptions {
        include_dev: options.include_dev,
        strict: options.strict,
        preferred,
    };
    let mut resolver = Resolver::new(
        &ctx.endpoints,
        &ctx.cache,
        &ctx.settings,
        ctx.progress.as_ref(),
    )
    .with_cancellation(ctx.cancel.clone());
    if options.strict {
        resolver = resolver.with_policy(Strict);
    }
    let graph = resolver.resolve(manifest, &resolve_options).await?;

    let plan = planner.plan(&graph);
    let lock = plan.to_lock(&digest, options.include_dev);
    Ok((plan, lock, records))
}

/// Plan and execute. Nothing is committed here.
pub(crate) async fn apply<R: Runtime + 'static>(
    ctx: &RunContext<R>,
    project: &Project,
    manifest: &Manifest,
    options: &PipelineOptions,
) -> Result<(Plan, LockState), PackageError> {
    let applied = plan_and_execute(ctx, project, manifest, options).await;
    ctx.discard_scratch();
    applied
}

async fn plan_and_execute<R: Runtime + 'static>(
    ctx: &RunContext<R>,
    project: &Project,
    manifest: &Manifest,
    options: &PipelineOptions,
) -> Result<(Plan, LockState), PackageError> {
    let (plan, lock, mut records) = plan_project(ctx, project, manifest, options).await?;
    info!("{}", plan.summary());

    let installer = Installer::new(
        ctx.runtime.clone(),
        ctx.endpoints.clone(),
        ctx.settings.clone(),
        ctx.progress.clone(),
        &project.root,
        ctx.scratch.join("fetch"),
    )
    .with_hooks(ctx.hooks.clone())
    .with_cleanup(ctx.cleanup.clone())
    .with_cancellation(ctx.cancel.clone());

    installer.execute(&plan, &mut records).await?;
    Ok((plan, lock))
}

/// Write the manifest if it differs from `original` and the lock if it
/// differs from the one on disk. Called once per run, after success.
pub(crate) fn commit<R: Runtime + ?Sized>(
    runtime: &R,
    project: &Project,
    original: &Manifest,
    manifest: &Manifest,
    mut lock: LockState,
) -> Result<(), PackageError> {
    lock.manifest_digest = manifest.dependency_digest();
    if manifest != original {
        manifest.save(runtime, &project.manifest_path)?;
    }
    if LockState::load(runtime, &project.lock_path).as_ref() != Some(&lock) {
        lock.commit(runtime, &project.lock_path)?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::collections::{HashMap, HashSet};
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use super::RunContext;
    use crate::archive::test_util::tar_gz;
    use crate::config::Settings;
    use crate::endpoint::{
        ArtifactReference, EndpointRegistry, FetchedArtifact, MockEndpoint, PackageMetadata,
        SourceKind,
    };
    use crate::error::EndpointError;
    use crate::http::RetryPolicy;
    use crate::progress::RecordingSink;
    use crate::runtime::RealRuntime;
    use crate::version::PackageVersion;

    /// In-memory registry: name to `(version, dependencies)`.
    #[derive(Clone, Default)]
    pub struct FakeRegistry {
        packages: Arc<Mutex<HashMap<String, Vec<PackageMetadata>>>>,
        broken: Arc<Mutex<HashSet<String>>>,
    }

    impl FakeRegistry {
        pub fn publish(&self, name: &str, version: &str, deps: &[(&str, &str)]) {
            let mut metadata = PackageMetadata::bare(
                name,
                PackageVersion::parse_lenient(version),
                ArtifactReference::Remote {
                    url: format!("http://registry/{}-{}.tgz", name, version),
                },
            );
            metadata.dependencies = deps
                .iter()
                .map(|(n, c)| (n.to_string(), c.to_string()))
                .collect();
            self.packages
                .lock()
                .unwrap()
                .entry(name.to_string())
                .or_default()
                .push(metadata);
        }

        /// Downloads of `name` fail with a permanent network error.
        pub fn break_downloads(&self, name: &str) {
            self.broken.lock().unwrap().insert(name.to_string());
        }

        pub fn endpoints(&self, artifacts: &Path) -> EndpointRegistry {
            let packages = self.packages.clone();
            let broken = self.broken.clone();
            let artifacts = artifacts.to_path_buf();
            let mut endpoint = MockEndpoint::new();
            endpoint.expect_kind().return_const(SourceKind::Registry);
            endpoint.expect_candidates().returning(move |id| {
                packages
                    .lock()
                    .unwrap()
                    .get(&id.name)
                    .cloned()
                    .ok_or_else(|| EndpointError::NotFound(id.name.clone()))
            });
            endpoint.expect_fetch().returning(move |artifact, _| {
                let ArtifactReference::Remote { url } = artifact else {
                    return Err(EndpointError::NotFound("unexpected artifact".into()));
                };
                let file = url.rsplit('/').next().unwrap_or_default();
                let (name, version) = file
                    .trim_end_matches(".tgz")
                    .rsplit_once('-')
                    .unwrap_or_default();
                if broken.lock().unwrap().contains(name) {
                    return Err(EndpointError::NetworkPermanent(format!("{} is gone", url)));
                }
                let path = artifacts.join(file);
                let manifest = format!(r#"{{"name": "{}", "version": "{}"}}"#, name, version);
                std::fs::write(&path, tar_gz(&[("package/box.json", &manifest)])).unwrap();
                Ok(FetchedArtifact::Archive(path))
            });
            EndpointRegistry::new().with(Arc::new(endpoint))
        }
    }

    pub fn context(
        registry: &FakeRegistry,
        scratch: &Path,
        sink: Arc<RecordingSink>,
    ) -> RunContext<RealRuntime> {
        let settings = Settings {
            retry: RetryPolicy::immediate(1),
            ..Settings::default()
        };
        RunContext::new(
            Arc::new(RealRuntime),
            registry.endpoints(scratch),
            settings,
            sink,
            scratch.join("run"),
        )
    }
}
