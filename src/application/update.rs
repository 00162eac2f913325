//! `update`: move packages to the newest versions their constraints allow.

use std::path::Path;

use log::info;

use super::{InstallOptions, Project, Refresh, RunContext, RunReport, apply, commit};
use crate::error::PackageError;
use crate::package::{LockState, Manifest};
use crate::progress::ProgressEvent;
use crate::runtime::Runtime;

/// Re-resolve `names` (every package when empty) ignoring their locked
/// versions. Everything else keeps its locked version where it still fits.
#[tracing::instrument(skip(ctx))]
pub async fn update<R: Runtime + 'static>(
    ctx: &RunContext<R>,
    manifest_path: &Path,
    names: &[String],
    options: &InstallOptions,
) -> Result<RunReport, PackageError> {
    let project = Project::at(manifest_path);
    let manifest = Manifest::load(ctx.runtime.as_ref(), &project.manifest_path)?;

    let refresh = if names.is_empty() {
        info!("Updating all packages");
        Refresh::All
    } else {
        let lock = LockState::load(ctx.runtime.as_ref(), &project.lock_path);
        for name in names {
            let locked = lock
                .as_ref()
                .is_some_and(|l| l.packages.iter().any(|p| &p.name == name));
            if !manifest.declares(name) && !locked {
                ctx.progress.emit(ProgressEvent::Warning(format!(
                    "{} is not a dependency of this project",
                    name
                )));
            }
        }
        Refresh::Packages(names.to_vec())
    };

    let (plan, lock) = apply(ctx, &project, &manifest, &options.pipeline(refresh)).await?;
    commit(ctx.runtime.as_ref(), &project, &manifest, &manifest, lock)?;
    Ok(RunReport::success(plan.summary()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::application::install;
    use crate::application::test_util::{FakeRegistry, context};
    use crate::package::LOCK_FILE;
    use crate::progress::RecordingSink;
    use crate::runtime::RealRuntime;

    fn locked_version(dir: &Path, name: &str) -> String {
        let lock = LockState::load(&RealRuntime, &dir.join(LOCK_FILE)).unwrap();
        lock.packages
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.resolved_version.to_string())
            .unwrap()
    }

    async fn installed(registry: &FakeRegistry) -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("box.json"),
            r#"{"dependencies": {"foo": "^1.0.0", "bar": "^2.0.0"}}"#,
        )
        .unwrap();
        let ctx = context(registry, dir.path(), Arc::new(RecordingSink::new()));
        install(&ctx, &dir.path().join("box.json"), &[], &InstallOptions::default())
            .await
            .unwrap();
        dir
    }

    #[tokio::test]
    async fn test_install_keeps_locked_versions_until_update() {
        let registry = FakeRegistry::default();
        registry.publish("foo", "1.0.0", &[]);
        registry.publish("bar", "2.0.0", &[]);
        let dir = installed(&registry).await;

        registry.publish("foo", "1.1.0", &[]);
        registry.publish("bar", "2.5.0", &[]);

        let ctx = context(&registry, dir.path(), Arc::new(RecordingSink::new()));
        let options = InstallOptions {
            force: true,
            ..InstallOptions::default()
        };
        install(&ctx, &dir.path().join("box.json"), &[], &options)
            .await
            .unwrap();
        assert_eq!(locked_version(dir.path(), "foo"), "1.0.0");

        let ctx = context(&registry, dir.path(), Arc::new(RecordingSink::new()));
        let report = update(
            &ctx,
            &dir.path().join("box.json"),
            &["foo".to_string()],
            &InstallOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(report.summary.upgrade, 1);
        assert_eq!(report.summary.unchanged, 1);
        assert_eq!(locked_version(dir.path(), "foo"), "1.1.0");
        assert_eq!(locked_version(dir.path(), "bar"), "2.0.0");
    }

    #[tokio::test]
    async fn test_update_all() {
        let registry = FakeRegistry::default();
        registry.publish("foo", "1.0.0", &[]);
        registry.publish("bar", "2.0.0", &[]);
        let dir = installed(&registry).await;
        let manifest_before = std::fs::read_to_string(dir.path().join("box.json")).unwrap();

        registry.publish("foo", "1.1.0", &[]);
        registry.publish("bar", "2.5.0", &[]);
        registry.publish("bar", "3.0.0", &[]);

        let ctx = context(&registry, dir.path(), Arc::new(RecordingSink::new()));
        let report = update(&ctx, &dir.path().join("box.json"), &[], &InstallOptions::default())
            .await
            .unwrap();

        assert_eq!(report.summary.upgrade, 2);
        assert_eq!(locked_version(dir.path(), "foo"), "1.1.0");
        assert_eq!(locked_version(dir.path(), "bar"), "2.5.0");
        let manifest_after = std::fs::read_to_string(dir.path().join("box.json")).unwrap();
        assert_eq!(manifest_before, manifest_after);
    }

    #[tokio::test]
    async fn test_update_unknown_name_warns() {
        let registry = FakeRegistry::default();
        registry.publish("foo", "1.0.0", &[]);
        registry.publish("bar", "2.0.0", &[]);
        let dir = installed(&registry).await;

        let sink = Arc::new(RecordingSink::new());
        let ctx = context(&registry, dir.path(), sink.clone());
        let report = update(
            &ctx,
            &dir.path().join("box.json"),
            &["ghost".to_string()],
            &InstallOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(report.summary.unchanged, 2);
        assert_eq!(sink.warnings(), vec!["ghost is not a dependency of this project"]);
    }
}
