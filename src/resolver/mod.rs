//! Dependency graph resolution.
//!
//! Resolution walks the dependency tree breadth-first. Each level's
//! requests have their candidates fetched concurrently through the
//! [`MetadataCache`]; the results are then merged into the graph one
//! request at a time, in manifest order, so the graph does not depend on
//! network timing.

mod cache;
mod conflict;
mod graph;

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::endpoint::{EndpointRegistry, PackageIdentifier, PackageMetadata, SourceKind};
use crate::error::{EndpointError, PackageError, Requirement};
use crate::package::{Manifest, is_valid_package_name};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::version::{PackageVersion, VersionConstraint};

pub use cache::{Candidates, MetadataCache};
pub use conflict::{Conflict, ConflictPolicy, NestedDuplicate, Strict};
pub use graph::{DependencyGraph, NodeId, ResolvedNode, RootEdge};

const ROOT: &str = "<root>";

#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    pub include_dev: bool,
    /// Fail on version conflicts and skip engine-incompatible candidates.
    pub strict: bool,
    /// Versions to keep when they still satisfy, usually from the lock.
    pub preferred: HashMap<String, Vec<PackageVersion>>,
}

/// One dependency edge waiting to be resolved.
#[derive(Debug, Clone)]
struct Request {
    requester: Option<NodeId>,
    identifier: PackageIdentifier,
    dev: bool,
}

pub struct Resolver<'a> {
    endpoints: &'a EndpointRegistry,
    cache: &'a MetadataCache,
    settings: &'a Settings,
    progress: &'a dyn ProgressSink,
    policy: Box<dyn ConflictPolicy + 'a>,
    cancel: CancellationToken,
}

impl<'a> Resolver<'a> {
    pub fn new(
        endpoints: &'a EndpointRegistry,
        cache: &'a MetadataCache,
        settings: &'a Settings,
        progress: &'a dyn ProgressSink,
    ) -> Self {
        Self {
            endpoints,
            cache,
            settings,
            progress,
            policy: Box::new(NestedDuplicate),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_policy(mut self, policy: impl ConflictPolicy + 'a) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Resolve the direct dependencies of `manifest` into a graph.
    #[tracing::instrument(skip_all)]
    pub async fn resolve(
        &self,
        manifest: &Manifest,
        options: &ResolveOptions,
    ) -> Result<DependencyGraph, PackageError> {
        let mut level = Vec::new();
        for entry in manifest.entries(options.include_dev) {
            let identifier = PackageIdentifier::from_entry(&entry.name, &entry.spec);
            // Malformed constraints abort before any network traffic.
            identifier.constraint()?;
            level.push(Request {
                requester: None,
                identifier,
                dev: entry.dev,
            });
        }

        let mut graph = DependencyGraph::new();
        let mut depth = 0;
        while !level.is_empty() {
            if self.cancel.is_cancelled() {
                return Err(PackageError::Cancelled);
            }
            depth += 1;
            debug!("Resolving level {} ({} request(s))", depth, level.len());

            let prefetched = tokio::select! {
                _ = self.cancel.cancelled() => return Err(PackageError::Cancelled),
                prefetched = self.prefetch_level(&graph, &level) => prefetched,
            };

            let mut next = Vec::new();
            for (request, fetched) in level.into_iter().zip(prefetched) {
                self.merge(&mut graph, request, fetched, options, &mut next)
                    .await?;
            }
            level = next;
        }

        graph.mark_dev();
        info!("Resolved {} package(s)", graph.len());
        Ok(graph)
    }

    /// Fetch candidates for every request that cannot reuse a visible node.
    async fn prefetch_level(
        &self,
        graph: &DependencyGraph,
        level: &[Request],
    ) -> Vec<Option<Result<Candidates, PackageError>>> {
        let concurrency = self.settings.fetch_concurrency.max(1);
        stream::iter(level)
            .map(|request| async move {
                let constraint = match request.identifier.constraint() {
                    Ok(constraint) => constraint,
                    Err(e) => return Some(Err(e)),
                };
                if let Some(existing) = graph.nearest_visible(request.requester, &request.identifier.name)
                    && accepts(graph.node(existing), &request.identifier, &constraint)
                {
                    return None;
                }
                Some(self.candidates(graph, request).await)
            })
            .buffered(concurrency)
            .collect()
            .await
    }

    async fn candidates(
        &self,
        graph: &DependencyGraph,
        request: &Request,
    ) -> Result<Candidates, PackageError> {
        let id = &request.identifier;
        let key = id.cache_key();
        if !self.cache.contains(&key) {
            self.progress.emit(ProgressEvent::Resolving {
                name: id.name.clone(),
            });
        }
        let timeout = self.settings.request_timeout;
        let result = self
            .cache
            .get_or_fetch(&key, || async {
                let endpoint = self.endpoints.resolve(id)?;
                match tokio::time::timeout(timeout, endpoint.candidates(id)).await {
                    Ok(result) => result,
                    Err(_) => Err(EndpointError::NetworkTransient(format!(
                        "metadata request for {} timed out after {}s",
                        id.name,
                        timeout.as_secs()
                    ))),
                }
            })
            .await;
        result.map_err(|e| {
            PackageError::from_endpoint(&id.name, &graph.requester_chain(request.requester), e)
        })
    }

    async fn merge(
        &self,
        graph: &mut DependencyGraph,
        request: Request,
        fetched: Option<Result<Candidates, PackageError>>,
        options: &ResolveOptions,
        next: &mut Vec<Request>,
    ) -> Result<(), PackageError> {
        let name = request.identifier.name.clone();
        let chain = graph.requester_chain(request.requester);

        if chain.contains(&name) {
            let mut path = chain;
            path.push(name);
            return Err(PackageError::CircularDependency { path });
        }

        let constraint = request.identifier.constraint()?;

        if self.policy.single_version()
            && let Some(node) = graph
                .nodes()
                .iter()
                .find(|n| n.name() == name && !accepts(n, &request.identifier, &constraint))
        {
            let conflict = Conflict {
                package: &name,
                existing: Requirement {
                    requester: requester_name(graph, node.parent),
                    constraint: node.requested.clone(),
                },
                incoming: Requirement {
                    requester: requester_name(graph, request.requester),
                    constraint: display_spec(&request.identifier),
                },
                same_scope: node.scope == request.requester,
            };
            self.policy.check(&conflict)?;
        }

        if let Some(existing) = graph.nearest_visible(request.requester, &name) {
            let node = graph.node(existing);
            if accepts(node, &request.identifier, &constraint) {
                if let Some(requester) = request.requester
                    && let Some(path) = graph.path_between(existing, requester)
                {
                    let mut names: Vec<String> =
                        path.iter().map(|&id| graph.node(id).name().to_string()).collect();
                    names.push(name);
                    return Err(PackageError::CircularDependency { path: names });
                }
                debug!("{} reuses {}@{}", requester_name(graph, request.requester), name, node.version);
                graph.add_edge(request.requester, existing, request.dev);
                return Ok(());
            }

            let conflict = Conflict {
                package: &name,
                existing: Requirement {
                    requester: requester_name(graph, node.parent),
                    constraint: node.requested.clone(),
                },
                incoming: Requirement {
                    requester: requester_name(graph, request.requester),
                    constraint: display_spec(&request.identifier),
                },
                same_scope: node.scope == request.requester,
            };
            self.policy.check(&conflict)?;
            debug!(
                "{} needs {} {} but {} is visible; nesting a second copy",
                conflict.incoming.requester, name, conflict.incoming.constraint, node.version
            );
        }

        let candidates = match fetched {
            Some(result) => result?,
            None => self.candidates(graph, &request).await?,
        };
        let metadata = self.select(&request, &constraint, &candidates, &chain, options)?;

        for dep in metadata.dependencies.keys() {
            if !is_valid_package_name(dep) {
                return Err(PackageError::InvalidManifest {
                    path: format!("{}@{}", name, metadata.version).into(),
                    reason: format!("invalid package name '{}'", dep),
                });
            }
        }

        let id = graph.add_node(
            request.identifier.clone(),
            Arc::new(metadata),
            request.requester,
            request.requester,
            &display_spec(&request.identifier),
        );
        graph.add_edge(request.requester, id, request.dev);

        for (dep, spec) in &graph.node(id).metadata.dependencies {
            next.push(Request {
                requester: Some(id),
                identifier: PackageIdentifier::from_entry(dep, spec),
                dev: request.dev,
            });
        }
        Ok(())
    }

    /// Choose the version to install for a new node.
    fn select(
        &self,
        request: &Request,
        constraint: &VersionConstraint,
        candidates: &[PackageMetadata],
        chain: &[String],
        options: &ResolveOptions,
    ) -> Result<PackageMetadata, PackageError> {
        let id = &request.identifier;
        // Non-registry sources are pinned by location; whatever they hold is wanted.
        let include_prerelease = id.kind != SourceKind::Registry;

        let engine = self
            .settings
            .engine_version
            .as_ref()
            .map(|v| (self.settings.engine_name.as_str(), v));
        let usable: Vec<&PackageMetadata> = candidates
            .iter()
            .filter(|m| match engine {
                Some((engine, version)) if options.strict => m.supports_engine(engine, version),
                _ => true,
            })
            .collect();

        let preferred = options.preferred.get(&id.name).and_then(|pins| {
            let pinned: Vec<&PackageMetadata> = usable
                .iter()
                .copied()
                .filter(|m| pins.contains(&m.version))
                .collect();
            constraint
                .select(&pinned, |m| &m.version, include_prerelease)
                .copied()
        });
        let chosen = preferred.or_else(|| {
            constraint
                .select(&usable, |m| &m.version, include_prerelease)
                .copied()
        });

        let Some(chosen) = chosen else {
            let detail = if usable.len() < candidates.len() {
                format!(
                    "no version matching {} supports {} {}",
                    constraint,
                    self.settings.engine_name,
                    engine.map(|(_, v)| v.to_string()).unwrap_or_default()
                )
            } else {
                format!("no version matches {}", constraint)
            };
            return Err(PackageError::NotFound {
                package: id.name.clone(),
                chain: chain.to_vec(),
                detail,
            });
        };

        if let Some((engine, version)) = engine
            && !chosen.supports_engine(engine, version)
        {
            self.progress.emit(ProgressEvent::Warning(format!(
                "{}@{} requires {} {} (running {})",
                id.name,
                chosen.version,
                engine,
                chosen.engines.get(engine).map(String::as_str).unwrap_or("?"),
                version
            )));
        }
        Ok(chosen.clone())
    }
}

/// Whether an existing node can serve a request.
fn accepts(
    node: &ResolvedNode,
    identifier: &PackageIdentifier,
    constraint: &VersionConstraint,
) -> bool {
    if node.identifier.kind != identifier.kind {
        return false;
    }
    match identifier.kind {
        SourceKind::Registry => constraint.satisfies(&node.version),
        _ => node.identifier.spec == identifier.spec,
    }
}

fn requester_name(graph: &DependencyGraph, requester: Option<NodeId>) -> String {
    match requester {
        Some(id) => graph.node(id).name().to_string(),
        None => ROOT.to_string(),
    }
}

fn display_spec(identifier: &PackageIdentifier) -> String {
    if identifier.spec.is_empty() {
        "*".to_string()
    } else {
        identifier.spec.clone()
    }
}
