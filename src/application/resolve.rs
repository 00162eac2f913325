//! `resolve`: compute the plan without touching the disk.

use std::path::Path;

use super::{InstallOptions, Project, Refresh, RunContext, plan_project};
use crate::error::PackageError;
use crate::package::Manifest;
use crate::planner::Plan;
use crate::runtime::Runtime;

/// What `install` would do. Nothing is installed, and neither the manifest
/// nor the lock is written.
#[tracing::instrument(skip(ctx))]
pub async fn resolve<R: Runtime + 'static>(
    ctx: &RunContext<R>,
    manifest_path: &Path,
    options: &InstallOptions,
) -> Result<Plan, PackageError> {
    let project = Project::at(manifest_path);
    let manifest = Manifest::load(ctx.runtime.as_ref(), &project.manifest_path)?;
    let planned = plan_project(ctx, &project, &manifest, &options.pipeline(Refresh::None)).await;
    ctx.discard_scratch();
    let (plan, _, _) = planned?;
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::application::install;
    use crate::application::test_util::{FakeRegistry, context};
    use crate::package::LOCK_FILE;
    use crate::planner::Operation;
    use crate::progress::RecordingSink;

    #[tokio::test]
    async fn test_resolve_is_a_dry_run() {
        let dir = TempDir::new().unwrap();
        let manifest_path = dir.path().join("box.json");
        std::fs::write(&manifest_path, r#"{"dependencies": {"foo": "^1.0.0"}}"#).unwrap();
        let registry = FakeRegistry::default();
        registry.publish("foo", "1.0.0", &[("bar", "*")]);
        registry.publish("bar", "0.3.0", &[]);

        let ctx = context(&registry, dir.path(), Arc::new(RecordingSink::new()));
        let plan = resolve(&ctx, &manifest_path, &InstallOptions::default())
            .await
            .unwrap();

        let described: Vec<String> = plan.operations.iter().map(Operation::to_string).collect();
        assert_eq!(
            described,
            vec![
                "install foo@1.0.0 -> modules/foo",
                "install bar@0.3.0 -> modules/foo/modules/bar",
            ]
        );
        assert!(!dir.path().join("modules").exists());
        assert!(!dir.path().join(LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn test_resolve_after_install_is_noop() {
        let dir = TempDir::new().unwrap();
        let manifest_path = dir.path().join("box.json");
        std::fs::write(&manifest_path, r#"{"dependencies": {"foo": "^1.0.0"}}"#).unwrap();
        let registry = FakeRegistry::default();
        registry.publish("foo", "1.0.0", &[]);

        let ctx = context(&registry, dir.path(), Arc::new(RecordingSink::new()));
        install(&ctx, &manifest_path, &[], &InstallOptions::default())
            .await
            .unwrap();

        let ctx = context(&registry, dir.path(), Arc::new(RecordingSink::new()));
        let plan = resolve(&ctx, &manifest_path, &InstallOptions::default())
            .await
            .unwrap();
        assert!(plan.is_noop());
    }
}
