//! Scratch paths to remove when a run is interrupted.
//!
//! Staging directories and downloaded archives are registered here before
//! they are written and unregistered once they have been swapped into place
//! or deleted. Whatever is still registered when a run is cancelled is removed.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;

use crate::runtime::Runtime;

/// Tracks paths that need cleanup on interruption
#[derive(Default)]
pub struct CleanupContext {
    paths: Vec<PathBuf>,
}

impl CleanupContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a path to be cleaned up on interruption
    pub fn add(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    /// Remove a path from cleanup list (e.g., when operation succeeds)
    pub fn remove(&mut self, path: &Path) {
        self.paths.retain(|p| p != path);
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Remove every registered path and forget it.
    pub fn cleanup<R: Runtime + ?Sized>(&mut self, runtime: &R) {
        for path in self.paths.drain(..) {
            debug!("Cleaning up: {:?}", path);
            let result = if runtime.is_dir(&path) {
                runtime.remove_dir_all(&path)
            } else if runtime.exists(&path) {
                runtime.remove_file(&path)
            } else {
                Ok(())
            };
            if let Err(e) = result {
                debug!("Failed to clean up {:?}: {}", path, e);
            }
        }
    }
}

/// Type alias for shared cleanup context
pub type SharedCleanupContext = Arc<Mutex<CleanupContext>>;

/// Create a new shared cleanup context
pub fn new_shared() -> SharedCleanupContext {
    Arc::new(Mutex::new(CleanupContext::new()))
}

/// Lock the context. A panic while holding the lock leaves the path list
/// intact, so poisoning is ignored.
pub fn lock(ctx: &SharedCleanupContext) -> MutexGuard<'_, CleanupContext> {
    ctx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Registers a path on creation. The path stays registered unless
/// [`CleanupGuard::success`] is called.
pub struct CleanupGuard {
    ctx: SharedCleanupContext,
    path: PathBuf,
}

impl CleanupGuard {
    pub fn new(ctx: SharedCleanupContext, path: PathBuf) -> Self {
        lock(&ctx).add(path.clone());
        Self { ctx, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mark the operation as successful, removing the path from cleanup
    pub fn success(self) {
        lock(&self.ctx).remove(&self.path);
    }
}
