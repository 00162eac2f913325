//! `remove`: drop direct dependencies and uninstall whatever is no longer
//! reachable.

use std::path::Path;

use log::info;

use super::{InstallOptions, Project, Refresh, RunContext, RunReport, apply, commit};
use crate::error::PackageError;
use crate::package::Manifest;
use crate::progress::ProgressEvent;
use crate::runtime::Runtime;

/// Remove `names` from the manifest and bring `modules/` in line. A package
/// that is still required by another dependency keeps its files.
#[tracing::instrument(skip(ctx))]
pub async fn remove<R: Runtime + 'static>(
    ctx: &RunContext<R>,
    manifest_path: &Path,
    names: &[String],
    options: &InstallOptions,
) -> Result<RunReport, PackageError> {
    let project = Project::at(manifest_path);
    let original = Manifest::load(ctx.runtime.as_ref(), &project.manifest_path)?;
    let mut manifest = original.clone();

    for name in names {
        if manifest.remove_dependency(name) {
            info!("Removing {}", name);
        } else {
            ctx.progress.emit(ProgressEvent::Warning(format!(
                "{} is not a dependency of this project",
                name
            )));
        }
    }

    let (plan, lock) = apply(ctx, &project, &manifest, &options.pipeline(Refresh::None)).await?;
    commit(ctx.runtime.as_ref(), &project, &original, &manifest, lock)?;
    Ok(RunReport::success(plan.summary()))
}
