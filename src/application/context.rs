//! Everything one run needs, passed explicitly.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::debug;
use tokio_util::sync::CancellationToken;

use crate::cleanup::{self, SharedCleanupContext};
use crate::config::Settings;
use crate::endpoint::{
    CommandGitClient, DirectUrlEndpoint, EndpointRegistry, LocalPathEndpoint, RegistryEndpoint,
    VersionControlEndpoint,
};
use crate::http::HttpClient;
use crate::install::{HookRunner, ShellHookRunner};
use crate::progress::ProgressSink;
use crate::resolver::MetadataCache;
use crate::runtime::Runtime;

pub struct RunContext<R: Runtime + 'static> {
    pub runtime: Arc<R>,
    pub endpoints: Arc<EndpointRegistry>,
    pub settings: Arc<Settings>,
    pub progress: Arc<dyn ProgressSink>,
    pub hooks: Arc<dyn HookRunner>,
    pub cancel: CancellationToken,
    pub cache: MetadataCache,
    pub cleanup: SharedCleanupContext,
    /// Downloads and checkouts of this run. Removed when the run ends.
    pub scratch: PathBuf,
}

impl<R: Runtime + 'static> RunContext<R> {
    pub fn new(
        runtime: Arc<R>,
        endpoints: EndpointRegistry,
        settings: Settings,
        progress: Arc<dyn ProgressSink>,
        scratch: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runtime,
            endpoints: Arc::new(endpoints),
            settings: Arc::new(settings),
            progress,
            hooks: Arc::new(ShellHookRunner),
            cancel: CancellationToken::new(),
            cache: MetadataCache::new(),
            cleanup: cleanup::new_shared(),
            scratch: scratch.into(),
        }
    }

    /// Context for the project in `project_dir`: settings from every
    /// configuration layer and one endpoint per source kind.
    #[tracing::instrument(skip(runtime, progress))]
    pub fn for_project(
        runtime: Arc<R>,
        project_dir: &Path,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<Self> {
        let settings = Settings::load(runtime.as_ref(), project_dir)?;
        let scratch = runtime
            .temp_dir()
            .join(format!("boxpm-{}", std::process::id()));
        debug!("Scratch directory: {:?}", scratch);

        let http = HttpClient::build(settings.request_timeout, settings.retry)
            .context("Failed to create HTTP client")?;
        let endpoints = EndpointRegistry::new()
            .with(Arc::new(RegistryEndpoint::new(
                runtime.clone(),
                http.clone(),
                settings.registry_url.clone(),
                settings.token.clone(),
            )))
            .with(Arc::new(VersionControlEndpoint::new(
                runtime.clone(),
                Arc::new(CommandGitClient),
                scratch.join("git"),
            )))
            .with(Arc::new(DirectUrlEndpoint::new(
                runtime.clone(),
                http,
                scratch.join("url"),
            )))
            .with(Arc::new(LocalPathEndpoint::new(
                runtime.clone(),
                project_dir,
                scratch.join("path"),
            )));

        Ok(Self::new(runtime, endpoints, settings, progress, scratch))
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn HookRunner>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Remove the scratch directory and anything an interrupted operation left behind.
    pub fn discard_scratch(&self) {
        cleanup::lock(&self.cleanup).cleanup(self.runtime.as_ref());
        let runtime = self.runtime.as_ref();
        if runtime.is_dir(&self.scratch)
            && let Err(e) = runtime.remove_dir_all(&self.scratch)
        {
            debug!("Failed to remove scratch {:?}: {:#}", self.scratch, e);
        }
    }
}
