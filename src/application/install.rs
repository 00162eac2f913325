//! `install`: bring `modules/` in line with the manifest, optionally adding
//! new dependencies first.

use std::path::Path;

use log::info;

use super::{PipelineOptions, Project, Refresh, RunContext, RunReport, apply, commit};
use crate::endpoint::{PackageIdentifier, SourceKind};
use crate::error::PackageError;
use crate::package::Manifest;
use crate::planner::Plan;
use crate::runtime::Runtime;
use crate::version::PackageVersion;

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Include devDependencies.
    pub dev: bool,
    /// One version per package name; conflicts fail instead of nesting.
    pub strict: bool,
    /// Resolve again even when the lock matches the manifest.
    pub force: bool,
    /// Save added packages to devDependencies.
    pub save_dev: bool,
}

impl InstallOptions {
    pub(crate) fn pipeline(&self, refresh: Refresh) -> PipelineOptions {
        PipelineOptions {
            include_dev: self.dev,
            strict: self.strict,
            force: self.force,
            refresh,
        }
    }
}

/// Install the project's dependencies, adding `packages` to the manifest first.
#[tracing::instrument(skip(ctx, packages))]
pub async fn install<R: Runtime + 'static>(
    ctx: &RunContext<R>,
    manifest_path: &Path,
    packages: &[PackageIdentifier],
    options: &InstallOptions,
) -> Result<RunReport, PackageError> {
    let project = Project::at(manifest_path);
    let mut manifest = Manifest::load(ctx.runtime.as_ref(), &project.manifest_path)?;
    let original = manifest.clone();

    for package in packages {
        info!("Adding {}", package);
        manifest.save_dependency(&package.name, &manifest_value(package), options.save_dev);
    }

    // Newly added packages must be resolved even when a lock exists.
    let refresh = if packages.is_empty() {
        Refresh::None
    } else {
        Refresh::Packages(packages.iter().map(|p| p.name.clone()).collect())
    };
    let mut pipeline = options.pipeline(refresh);
    pipeline.include_dev |= options.save_dev && !packages.is_empty();

    let (plan, lock) = apply(ctx, &project, &manifest, &pipeline).await?;

    // Unconstrained additions are saved with the version that was installed.
    let manifest = pin_added(&manifest, packages, &plan);
    commit(ctx.runtime.as_ref(), &project, &original, &manifest, lock)?;
    Ok(RunReport::success(plan.summary()))
}

/// Manifest value for a package added from the command line.
fn manifest_value(package: &PackageIdentifier) -> String {
    match package.kind {
        SourceKind::Registry if package.spec.is_empty() => "*".to_string(),
        _ => package.spec.clone(),
    }
}

/// Replace the `*` of unconstrained added registry packages with
/// `^<installed version>`.
fn pin_added(manifest: &Manifest, packages: &[PackageIdentifier], plan: &Plan) -> Manifest {
    let mut pinned = manifest.clone();
    for package in packages {
        if package.kind != SourceKind::Registry || !package.spec.is_empty() {
            continue;
        }
        let resolved = plan
            .placements()
            .find(|p| p.direct && p.name == package.name)
            .and_then(|p| match &p.version {
                PackageVersion::Semver(v) => Some(format!("^{}", v)),
                PackageVersion::Ref(_) => None,
            });
        if let Some(constraint) = resolved {
            let dev = pinned.dev_dependencies.contains_key(&package.name);
            pinned.save_dependency(&package.name, &constraint, dev);
        }
    }
    pinned
}
