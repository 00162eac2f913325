//! Installation engine.
//!
//! Executes a [`Plan`]: removals first, deepest first, then placements in
//! waves of equal nesting depth so that every parent directory is in place
//! before its children. Operations of one wave run concurrently up to
//! `install_concurrency`; operations that share a parent directory take
//! turns on that directory's lock for the staging and swap step.
//!
//! Each artifact is fetched at most once per run; placements that share it
//! stage from the same download, which stays in scratch until the run ends.

mod hooks;
mod place;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info, warn};
use tokio::sync::{Mutex, OnceCell, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::archive::ArchiveExtractorImpl;
use crate::cleanup::{self, SharedCleanupContext};
use crate::config::Settings;
use crate::endpoint::{ArtifactReference, EndpointRegistry, FetchedArtifact};
use crate::error::{EndpointError, OperationFailure, PackageError};
use crate::integrity;
use crate::package::{DependencyKind, InstalledPackageRecord, RecordStore};
use crate::planner::{Operation, Placement, Plan};
use crate::progress::{Action, ProgressEvent, ProgressSink};
use crate::runtime::Runtime;

pub use hooks::{HookRunner, ShellHookRunner};
pub use place::recover;

#[cfg(test)]
pub use hooks::MockHookRunner;

enum Outcome {
    Placed { linked: bool },
    /// Files are in place but a fatal hook failed afterwards.
    PlacedHookFailed { linked: bool, failure: OperationFailure },
    Failed(OperationFailure),
    Cancelled,
}

type DirLocks = Arc<std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>>;

/// One artifact's download, shared by every placement of it.
struct Download {
    dir: PathBuf,
    fetched: OnceCell<FetchedArtifact>,
}

type Downloads = Arc<std::sync::Mutex<HashMap<ArtifactReference, Arc<Download>>>>;

pub struct Installer<R: Runtime + 'static> {
    runtime: Arc<R>,
    endpoints: Arc<EndpointRegistry>,
    settings: Arc<Settings>,
    progress: Arc<dyn ProgressSink>,
    hooks: Arc<dyn HookRunner>,
    extractor: Arc<ArchiveExtractorImpl>,
    cleanup: SharedCleanupContext,
    cancel: CancellationToken,
    project_root: PathBuf,
    scratch: PathBuf,
    counter: Arc<AtomicU64>,
    dir_locks: DirLocks,
    downloads: Downloads,
}

impl<R: Runtime + 'static> Clone for Installer<R> {
    fn clone(&self) -> Self {
        Self {
            runtime: Arc::clone(&self.runtime),
            endpoints: Arc::clone(&self.endpoints),
            settings: Arc::clone(&self.settings),
            progress: Arc::clone(&self.progress),
            hooks: Arc::clone(&self.hooks),
            extractor: Arc::clone(&self.extractor),
            cleanup: Arc::clone(&self.cleanup),
            cancel: self.cancel.clone(),
            project_root: self.project_root.clone(),
            scratch: self.scratch.clone(),
            counter: Arc::clone(&self.counter),
            dir_locks: Arc::clone(&self.dir_locks),
            downloads: Arc::clone(&self.downloads),
        }
    }
}

impl<R: Runtime + 'static> Installer<R> {
    pub fn new(
        runtime: Arc<R>,
        endpoints: Arc<EndpointRegistry>,
        settings: Arc<Settings>,
        progress: Arc<dyn ProgressSink>,
        project_root: impl Into<PathBuf>,
        scratch: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runtime,
            endpoints,
            settings,
            progress,
            hooks: Arc::new(ShellHookRunner),
            extractor: Arc::new(ArchiveExtractorImpl::new()),
            cleanup: cleanup::new_shared(),
            cancel: CancellationToken::new(),
            project_root: project_root.into(),
            scratch: scratch.into(),
            counter: Arc::new(AtomicU64::new(0)),
            dir_locks: Arc::new(std::sync::Mutex::new(HashMap::new())),
            downloads: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn HookRunner>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_cleanup(mut self, cleanup: SharedCleanupContext) -> Self {
        self.cleanup = cleanup;
        self
    }

    fn modules_root(&self) -> PathBuf {
        self.project_root.join(&self.settings.modules_dir)
    }

    /// Write `records` unless they still match what was last written.
    fn save_records(&self, records: &RecordStore, saved: &mut RecordStore) -> Result<(), PackageError> {
        if records == saved {
            return Ok(());
        }
        let modules_root = self.modules_root();
        records
            .save(self.runtime.as_ref(), &modules_root)
            .map_err(|e| PackageError::persistence(RecordStore::file_path(&modules_root), e))?;
        *saved = records.clone();
        Ok(())
    }

    /// Execute `plan`, keeping `records` in step with the disk. `records`
    /// must be what the record file currently holds. Records are saved
    /// whenever they change, even when some operations fail.
    #[tracing::instrument(skip_all)]
    pub async fn execute(&self, plan: &Plan, records: &mut RecordStore) -> Result<(), PackageError> {
        let modules_root = self.modules_root();
        recover(self.runtime.as_ref(), &modules_root, &self.settings.modules_dir)
            .map_err(|e| PackageError::persistence(&modules_root, e))?;
        let mut saved = records.clone();

        let total = plan.operations.iter().filter(|op| op.is_mutating()).count();
        info!("Executing plan: {}", plan.summary());

        let mut failures: Vec<OperationFailure> = Vec::new();
        let mut completed: Vec<ProgressEvent> = Vec::new();

        for op in &plan.operations {
            let Operation::Remove(record) = op else {
                continue;
            };
            if self.cancel.is_cancelled() {
                break;
            }
            match self.remove(record, plan) {
                Ok(()) => {
                    records.remove(&record.install_path);
                    completed.push(ProgressEvent::Finished {
                        action: Action::Remove,
                        name: record.name.clone(),
                        version: record.installed_version.to_string(),
                        path: record.install_path.clone(),
                    });
                }
                Err(failure) => self.fail(&mut failures, failure),
            }
        }
        self.save_records(records, &mut saved)?;

        let mut waves: BTreeMap<usize, Vec<&Operation>> = BTreeMap::new();
        for op in &plan.operations {
            if let Some(placement) = op.placement() {
                waves.entry(placement.depth()).or_default().push(op);
            }
        }

        let mut failed_paths: Vec<PathBuf> = Vec::new();
        let semaphore = Arc::new(Semaphore::new(self.settings.install_concurrency.max(1)));

        for (depth, ops) in waves {
            if self.cancel.is_cancelled() {
                break;
            }
            debug!("Wave {}: {} operation(s)", depth, ops.len());

            let mut tasks = JoinSet::new();

            for op in ops {
                let (action, placement) = match op {
                    Operation::Install(p) => (Action::Install, p),
                    Operation::Upgrade { placement, .. } => (Action::Upgrade, placement),
                    Operation::Unchanged(p) => {
                        let linked = records.get(&p.path).is_some_and(|r| r.linked);
                        records.insert(record_for(p, linked));
                        continue;
                    }
                    Operation::Remove(_) => continue,
                };

                if let Some(parent) = failed_paths
                    .iter()
                    .find(|failed| placement.path.starts_with(failed))
                {
                    let failure = OperationFailure {
                        package: placement.name.clone(),
                        path: placement.path.clone(),
                        cause: format!("skipped because {} failed", parent.display()),
                        network: false,
                    };
                    failed_paths.push(placement.path.clone());
                    self.fail(&mut failures, failure);
                    continue;
                }

                let worker = self.clone();
                let semaphore = Arc::clone(&semaphore);
                let placement = placement.clone();
                tasks.spawn(async move {
                    let outcome = match semaphore.acquire_owned().await {
                        Ok(_permit) => worker.install_one(action, &placement).await,
                        Err(_) => Outcome::Cancelled,
                    };
                    (action, placement, outcome)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let (action, placement, outcome) = match joined {
                    Ok(result) => result,
                    Err(e) => {
                        warn!("Installation task failed: {}", e);
                        failures.push(OperationFailure {
                            package: "<unknown>".to_string(),
                            path: PathBuf::new(),
                            cause: format!("task failed: {}", e),
                            network: false,
                        });
                        continue;
                    }
                };
                match outcome {
                    Outcome::Placed { linked } => {
                        records.insert(record_for(&placement, linked));
                        completed.push(ProgressEvent::Finished {
                            action,
                            name: placement.name.clone(),
                            version: placement.version.to_string(),
                            path: placement.path.clone(),
                        });
                    }
                    Outcome::PlacedHookFailed { linked, failure } => {
                        records.insert(record_for(&placement, linked));
                        self.fail(&mut failures, failure);
                    }
                    Outcome::Failed(failure) => {
                        failed_paths.push(placement.path.clone());
                        self.fail(&mut failures, failure);
                    }
                    Outcome::Cancelled => failed_paths.push(placement.path.clone()),
                }
            }
            self.save_records(records, &mut saved)?;
        }
        self.release_downloads();

        // Nested packages complete before the package that contains them.
        completed.sort_by_key(|event| match event {
            ProgressEvent::Finished { path, .. } => {
                std::cmp::Reverse(crate::planner::install_depth(path))
            }
            _ => std::cmp::Reverse(0),
        });
        for event in completed {
            self.progress.emit(event);
        }

        if self.cancel.is_cancelled() {
            warn!("Installation interrupted, cleaning up");
            cleanup::lock(&self.cleanup).cleanup(self.runtime.as_ref());
            return Err(PackageError::Cancelled);
        }
        if !failures.is_empty() {
            return Err(PackageError::PartialInstallFailure { failures, total });
        }
        Ok(())
    }

    fn fail(&self, failures: &mut Vec<OperationFailure>, failure: OperationFailure) {
        self.progress.emit(ProgressEvent::Failed {
            name: failure.package.clone(),
            path: failure.path.clone(),
            cause: failure.cause.clone(),
        });
        failures.push(failure);
    }

    fn remove(&self, record: &InstalledPackageRecord, plan: &Plan) -> Result<(), OperationFailure> {
        if plan
            .placements()
            .any(|p| p.path.starts_with(&record.install_path))
        {
            debug!(
                "Keeping {:?}: still holds planned packages",
                record.install_path
            );
            return Ok(());
        }
        self.progress.emit(ProgressEvent::Started {
            action: Action::Remove,
            name: record.name.clone(),
            version: record.installed_version.to_string(),
        });
        let path = self.project_root.join(&record.install_path);
        place::remove_installed(self.runtime.as_ref(), &path).map_err(|e| OperationFailure {
            package: record.name.clone(),
            path: record.install_path.clone(),
            cause: format!("{:#}", e),
            network: false,
        })
    }

    #[tracing::instrument(skip(self, placement), fields(name = %placement.name, version = %placement.version))]
    async fn install_one(&self, action: Action, placement: &Placement) -> Outcome {
        if self.cancel.is_cancelled() {
            return Outcome::Cancelled;
        }
        let failure = |cause: String, network: bool| {
            Outcome::Failed(OperationFailure {
                package: placement.name.clone(),
                path: placement.path.clone(),
                cause,
                network,
            })
        };

        self.progress.emit(ProgressEvent::Started {
            action,
            name: placement.name.clone(),
            version: placement.version.to_string(),
        });

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let download = self.download(placement);

        let fetched = tokio::select! {
            _ = self.cancel.cancelled() => return Outcome::Cancelled,
            fetched = download.fetched.get_or_try_init(|| self.fetch(placement, &download.dir)) => fetched,
        };
        let fetched = match fetched {
            Ok(fetched) => fetched.clone(),
            Err(e) => {
                let network = matches!(
                    e,
                    EndpointError::NetworkTransient(_)
                        | EndpointError::NetworkPermanent(_)
                        | EndpointError::AuthRequired(_)
                );
                return failure(e.to_string(), network);
            }
        };
        if self.cancel.is_cancelled() {
            return Outcome::Cancelled;
        }

        let target = self.project_root.join(&placement.path);
        let placed = {
            let dir_lock = self.dir_lock(target.parent().unwrap_or(&self.project_root));
            let _held = dir_lock.lock().await;

            let runtime = Arc::clone(&self.runtime);
            let extractor = Arc::clone(&self.extractor);
            let cleanup = Arc::clone(&self.cleanup);
            let link_local = self.settings.link_local_paths;
            let modules_dir = self.settings.modules_dir.clone();
            let target = target.clone();
            tokio::task::spawn_blocking(move || {
                place::place(
                    runtime.as_ref(),
                    &extractor,
                    &fetched,
                    &target,
                    n,
                    link_local,
                    &modules_dir,
                    cleanup,
                )
            })
            .await
        };

        let linked = match placed {
            Ok(Ok(linked)) => linked,
            Ok(Err(e)) => return failure(format!("{:#}", e), false),
            Err(e) => return failure(format!("placement task failed: {}", e), false),
        };

        if let Err(cause) = self.run_hooks(placement, &target).await {
            return Outcome::PlacedHookFailed {
                linked,
                failure: OperationFailure {
                    package: placement.name.clone(),
                    path: placement.path.clone(),
                    cause,
                    network: false,
                },
            };
        }
        Outcome::Placed { linked }
    }

    /// The shared download slot for `placement`'s artifact. Its scratch
    /// directory is registered for cleanup until [`Self::release_downloads`].
    fn download(&self, placement: &Placement) -> Arc<Download> {
        let mut downloads = self
            .downloads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let index = downloads.len();
        let download = downloads.entry(placement.artifact.clone()).or_insert_with(|| {
            let dir = self.scratch.join(format!("{}-{}", placement.name, index));
            cleanup::lock(&self.cleanup).add(dir.clone());
            Arc::new(Download {
                dir,
                fetched: OnceCell::new(),
            })
        });
        Arc::clone(download)
    }

    /// Delete every download of this run from scratch.
    fn release_downloads(&self) {
        let drained: Vec<Arc<Download>> = self
            .downloads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain()
            .map(|(_, download)| download)
            .collect();
        for download in drained {
            if let Err(e) = place::remove_installed(self.runtime.as_ref(), &download.dir) {
                debug!("Failed to remove scratch {:?}: {:#}", download.dir, e);
            }
            cleanup::lock(&self.cleanup).remove(&download.dir);
        }
    }

    fn dir_lock(&self, dir: &Path) -> Arc<Mutex<()>> {
        let mut locks = self
            .dir_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(dir.to_path_buf()).or_default())
    }

    /// Fetch and verify, retrying transient and corrupt failures.
    async fn fetch(&self, placement: &Placement, scratch: &Path) -> Result<FetchedArtifact, EndpointError> {
        let endpoint = self.endpoints.get(placement.source).cloned().ok_or_else(|| {
            EndpointError::NotFound(format!(
                "no endpoint registered for {} sources",
                placement.source
            ))
        })?;
        let timeout = self.settings.request_timeout;

        self.settings
            .retry
            .run(
                &format!("fetch {}", placement.name),
                |e| e.is_retryable() || matches!(e, EndpointError::CorruptArtifact(_)),
                || {
                    let endpoint = Arc::clone(&endpoint);
                    async move {
                        let fetched =
                            tokio::time::timeout(timeout, endpoint.fetch(&placement.artifact, scratch))
                                .await
                                .map_err(|_| {
                                    EndpointError::NetworkTransient(format!(
                                        "fetching {} timed out after {}s",
                                        placement.artifact,
                                        timeout.as_secs()
                                    ))
                                })??;
                        if let FetchedArtifact::Archive(path) = &fetched {
                            integrity::verify(
                                self.runtime.as_ref(),
                                path,
                                placement.integrity.as_deref(),
                                placement.size,
                            )?;
                        }
                        Ok(fetched)
                    }
                },
            )
            .await
    }

    /// Run lifecycle hooks. Failures are warnings unless hooks are fatal.
    async fn run_hooks(&self, placement: &Placement, target: &Path) -> Result<(), String> {
        if self.settings.ignore_scripts {
            return Ok(());
        }
        let hooks = [
            ("preinstall", placement.hooks.preinstall.as_deref()),
            ("postinstall", placement.hooks.postinstall.as_deref()),
        ];
        for (hook, script) in hooks {
            let Some(script) = script else {
                continue;
            };
            if let Err(e) = self.hooks.run(hook, script, target).await {
                let message = format!("{} hook of {} failed: {:#}", hook, placement.name, e);
                if self.settings.hooks_fatal {
                    return Err(message);
                }
                self.progress.emit(ProgressEvent::Warning(message));
            }
        }
        Ok(())
    }
}

fn record_for(placement: &Placement, linked: bool) -> InstalledPackageRecord {
    InstalledPackageRecord {
        name: placement.name.clone(),
        installed_version: placement.version.clone(),
        install_path: placement.path.clone(),
        kind: if placement.direct {
            DependencyKind::Direct
        } else {
            DependencyKind::Transitive
        },
        is_dev: placement.dev,
        source: placement.source,
        artifact: placement.artifact.clone(),
        integrity: placement.integrity.clone(),
        linked,
    }
}
