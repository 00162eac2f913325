//! Installation planning.
//!
//! The planner maps every graph node to an install path and diffs those
//! placements against the install records. Direct dependencies live at
//! `modules/<name>`; a node scoped under another package lives in that
//! package's own `modules/` directory.
//!
//! A node whose natural location holds no record may instead keep an
//! existing install in a shallower `modules/` directory on its lookup path,
//! when that install has exactly the chosen version and source, nothing
//! else claims the location, and moving the node there changes what no
//! other package sees.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};

use log::debug;

use crate::endpoint::{ArtifactReference, Hooks, SourceKind};
use crate::package::{InstalledPackageRecord, LockState, LockedPackage, RecordStore};
use crate::resolver::{DependencyGraph, NodeId};
use crate::runtime::Runtime;
use crate::version::PackageVersion;

/// Where one package version goes.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub name: String,
    pub version: PackageVersion,
    pub source: SourceKind,
    pub spec: String,
    pub artifact: ArtifactReference,
    pub integrity: Option<String>,
    pub size: Option<u64>,
    pub hooks: Hooks,
    pub dependencies: BTreeMap<String, String>,
    /// Relative to the project root.
    pub path: PathBuf,
    pub direct: bool,
    pub dev: bool,
}

impl Placement {
    /// Nesting depth: 1 for `modules/<name>`.
    pub fn depth(&self) -> usize {
        install_depth(&self.path)
    }

    fn matches(&self, record: &InstalledPackageRecord) -> bool {
        record.installed_version == self.version
            && record.source == self.source
            && record.artifact == self.artifact
            && match (&record.integrity, &self.integrity) {
                (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                _ => true,
            }
    }

    pub fn to_locked(&self) -> LockedPackage {
        LockedPackage {
            name: self.name.clone(),
            resolved_version: self.version.clone(),
            source: self.source,
            spec: self.spec.clone(),
            integrity_digest: self.integrity.clone(),
            size: self.size,
            path: self.path.clone(),
            artifact: self.artifact.clone(),
            direct: self.direct,
            dev: self.dev,
            hooks: self.hooks.clone(),
            dependencies: self.dependencies.clone(),
        }
    }

    pub fn from_locked(locked: &LockedPackage) -> Self {
        Self {
            name: locked.name.clone(),
            version: locked.resolved_version.clone(),
            source: locked.source,
            spec: locked.spec.clone(),
            artifact: locked.artifact.clone(),
            integrity: locked.integrity_digest.clone(),
            size: locked.size,
            hooks: locked.hooks.clone(),
            dependencies: locked.dependencies.clone(),
            path: locked.path.clone(),
            direct: locked.direct,
            dev: locked.dev,
        }
    }
}

/// Number of `modules` directories in an install path.
pub fn install_depth(path: &Path) -> usize {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count()
        .div_ceil(2)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Install(Placement),
    Upgrade {
        placement: Placement,
        from: PackageVersion,
    },
    Unchanged(Placement),
    Remove(InstalledPackageRecord),
}

impl Operation {
    pub fn name(&self) -> &str {
        match self {
            Operation::Install(p) | Operation::Upgrade { placement: p, .. } | Operation::Unchanged(p) => {
                &p.name
            }
            Operation::Remove(r) => &r.name,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Operation::Install(p) | Operation::Upgrade { placement: p, .. } | Operation::Unchanged(p) => {
                &p.path
            }
            Operation::Remove(r) => &r.install_path,
        }
    }

    pub fn placement(&self) -> Option<&Placement> {
        match self {
            Operation::Install(p) | Operation::Upgrade { placement: p, .. } | Operation::Unchanged(p) => {
                Some(p)
            }
            Operation::Remove(_) => None,
        }
    }

    pub fn is_mutating(&self) -> bool {
        !matches!(self, Operation::Unchanged(_))
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Install(p) => write!(f, "install {}@{} -> {}", p.name, p.version, p.path.display()),
            Operation::Upgrade { placement: p, from } => write!(
                f,
                "upgrade {} {} -> {} at {}",
                p.name,
                from,
                p.version,
                p.path.display()
            ),
            Operation::Unchanged(p) => write!(f, "keep {}@{} at {}", p.name, p.version, p.path.display()),
            Operation::Remove(r) => write!(
                f,
                "remove {}@{} at {}",
                r.name,
                r.installed_version,
                r.install_path.display()
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub install: usize,
    pub upgrade: usize,
    pub unchanged: usize,
    pub remove: usize,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to install, {} to upgrade, {} to remove, {} unchanged",
            self.install, self.upgrade, self.remove, self.unchanged
        )
    }
}

/// Removals (deepest first) followed by placements (parents first).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub operations: Vec<Operation>,
}

impl Plan {
    pub fn is_noop(&self) -> bool {
        !self.operations.iter().any(Operation::is_mutating)
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for op in &self.operations {
            match op {
                Operation::Install(_) => summary.install += 1,
                Operation::Upgrade { .. } => summary.upgrade += 1,
                Operation::Unchanged(_) => summary.unchanged += 1,
                Operation::Remove(_) => summary.remove += 1,
            }
        }
        summary
    }

    pub fn placements(&self) -> impl Iterator<Item = &Placement> {
        self.operations.iter().filter_map(Operation::placement)
    }

    /// Lock state describing the tree this plan produces.
    pub fn to_lock(&self, manifest_digest: &str, include_dev: bool) -> LockState {
        let mut lock = LockState::new(manifest_digest, include_dev);
        let mut packages: Vec<LockedPackage> = self.placements().map(Placement::to_locked).collect();
        packages.sort_by(|a, b| a.path.cmp(&b.path));
        lock.packages = packages;
        lock
    }
}

pub struct Planner<'a, R: Runtime + ?Sized> {
    runtime: &'a R,
    project_root: &'a Path,
    modules_dir: &'a str,
    records: &'a RecordStore,
}

impl<'a, R: Runtime + ?Sized> Planner<'a, R> {
    pub fn new(
        runtime: &'a R,
        project_root: &'a Path,
        modules_dir: &'a str,
        records: &'a RecordStore,
    ) -> Self {
        Self {
            runtime,
            project_root,
            modules_dir,
            records,
        }
    }

    /// Plan the installation of a resolved graph.
    #[tracing::instrument(skip_all)]
    pub fn plan(&self, graph: &DependencyGraph) -> Plan {
        self.diff(self.place(graph))
    }

    /// Plan directly from a lock; no resolution involved.
    pub fn plan_from_lock(&self, lock: &LockState, include_dev: bool) -> Plan {
        let placements = lock
            .packages
            .iter()
            .filter(|p| include_dev || !p.dev)
            .map(Placement::from_locked)
            .collect();
        self.diff(placements)
    }

    /// Assign an install path to every node.
    pub fn place(&self, graph: &DependencyGraph) -> Vec<Placement> {
        let mut order: Vec<NodeId> = graph.nodes().iter().map(|n| n.id).collect();
        order.sort_by_key(|&id| (graph.depth(id), id));

        let direct: HashSet<NodeId> = graph.roots().iter().map(|r| r.node).collect();
        let mut paths: HashMap<NodeId, PathBuf> = HashMap::new();
        let mut claimed: HashSet<PathBuf> = HashSet::new();
        let mut hoisted: HashSet<NodeId> = HashSet::new();
        let mut placements = Vec::with_capacity(order.len());

        for id in order {
            let node = graph.node(id);
            let scope_dir = |scope: Option<NodeId>| match scope {
                Some(s) => paths.get(&s).cloned().unwrap_or_default(),
                None => PathBuf::new(),
            };
            let natural = scope_dir(node.scope).join(self.modules_dir).join(node.name());

            let mut path = natural.clone();
            if self.records.get(&natural).is_none() && !claimed.contains(&natural) {
                let chain = graph.lookup_chain(node.scope);
                let chain_is_natural = chain.iter().flatten().all(|s| !hoisted.contains(s));
                for &target in chain.iter().skip(1) {
                    if !chain_is_natural {
                        break;
                    }
                    let candidate = scope_dir(target).join(self.modules_dir).join(node.name());
                    let Some(record) = self.records.get(&candidate) else {
                        continue;
                    };
                    if claimed.contains(&candidate)
                        || record.installed_version != node.version
                        || record.source != node.identifier.kind
                    {
                        continue;
                    }
                    if can_hoist(graph, id, target) {
                        debug!("Keeping {} at {:?}", node.name(), candidate);
                        path = candidate;
                        hoisted.insert(id);
                        break;
                    }
                }
            }

            claimed.insert(path.clone());
            paths.insert(id, path.clone());
            placements.push(Placement {
                name: node.name().to_string(),
                version: node.version.clone(),
                source: node.identifier.kind,
                spec: node.identifier.spec.clone(),
                artifact: node.metadata.artifact.clone(),
                integrity: node.metadata.integrity.clone(),
                size: node.metadata.size,
                hooks: node.metadata.hooks.clone(),
                dependencies: node.metadata.dependencies.clone(),
                path,
                direct: direct.contains(&id),
                dev: node.dev,
            });
        }
        placements
    }

    /// Compare placements with the install records.
    pub fn diff(&self, mut placements: Vec<Placement>) -> Plan {
        placements.sort_by(|a, b| a.depth().cmp(&b.depth()).then_with(|| a.path.cmp(&b.path)));
        let claimed: HashSet<&Path> = placements.iter().map(|p| p.path.as_path()).collect();

        let mut removals: Vec<&InstalledPackageRecord> = self
            .records
            .iter()
            .filter(|r| !claimed.contains(r.install_path.as_path()))
            .collect();
        removals.sort_by(|a, b| {
            install_depth(&b.install_path)
                .cmp(&install_depth(&a.install_path))
                .then_with(|| a.install_path.cmp(&b.install_path))
        });

        let mut operations: Vec<Operation> =
            removals.into_iter().cloned().map(Operation::Remove).collect();

        for placement in placements {
            let on_disk = self.runtime.exists(&self.project_root.join(&placement.path));
            let op = match self.records.get(&placement.path) {
                Some(record) if placement.matches(record) && on_disk => {
                    Operation::Unchanged(placement)
                }
                Some(record) if record.installed_version != placement.version => Operation::Upgrade {
                    from: record.installed_version.clone(),
                    placement,
                },
                // Same version from another artifact, or files gone: reinstall.
                _ => Operation::Install(placement),
            };
            operations.push(op);
        }

        let plan = Plan { operations };
        debug!("Plan: {}", plan.summary());
        plan
    }
}

/// Whether node `id` can live in `target`'s `modules/` instead of its own scope's.
fn can_hoist(graph: &DependencyGraph, id: NodeId, target: Option<NodeId>) -> bool {
    let node = graph.node(id);
    let name = node.name();

    // Scopes the node would skip on the way up.
    let chain = graph.lookup_chain(node.scope);
    let Some(target_index) = chain.iter().position(|s| *s == target) else {
        return false;
    };
    let skipped = &chain[..target_index];
    let above = &chain[target_index + 1..];

    // Nothing between the natural scope and the target may shadow it.
    if skipped
        .iter()
        .any(|&scope| graph.find_in_scope(scope, name).is_some_and(|other| other != id))
    {
        return false;
    }
    if graph.find_in_scope(target, name).is_some() {
        return false;
    }

    // Everything installed beneath the node must still see its dependencies.
    for d in graph.nodes() {
        if !graph.lookup_chain(Some(d.id)).contains(&Some(id)) {
            continue;
        }
        if d.children
            .iter()
            .any(|&t| skipped.contains(&graph.node(t).scope))
        {
            return false;
        }
    }

    // Nobody that sees `target` may be served by a same-named package further up.
    for other in graph.nodes() {
        if other.id == id || other.name() != name || !above.contains(&other.scope) {
            continue;
        }
        let shadowed = graph.nodes().iter().any(|r| {
            r.children.contains(&other.id) && graph.lookup_chain(Some(r.id)).contains(&target)
        });
        if shadowed {
            return false;
        }
    }
    true
}
