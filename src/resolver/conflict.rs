//! What to do when the nearest visible copy of a package does not satisfy
//! a new requirement.

use crate::error::{PackageError, Requirement};

/// A requirement the visible copy of `package` cannot satisfy.
#[derive(Debug, Clone)]
pub struct Conflict<'a> {
    pub package: &'a str,
    pub existing: Requirement,
    pub incoming: Requirement,
    /// The visible copy already lives in the requester's own scope, so
    /// there is nowhere to nest another one.
    pub same_scope: bool,
}

pub trait ConflictPolicy: Send + Sync {
    /// `Ok` nests a second copy under the requester; `Err` aborts resolution.
    fn check(&self, conflict: &Conflict<'_>) -> Result<(), PackageError>;

    /// Check requests against every copy of a package in the graph, not
    /// only the one visible to the requester.
    fn single_version(&self) -> bool {
        false
    }
}

fn conflict_error(conflict: &Conflict<'_>) -> PackageError {
    PackageError::ResolutionConflict {
        package: conflict.package.to_string(),
        existing: conflict.existing.clone(),
        incoming: conflict.incoming.clone(),
    }
}

/// Nest a duplicate under the requester.
#[derive(Debug, Default, Clone, Copy)]
pub struct NestedDuplicate;

impl ConflictPolicy for NestedDuplicate {
    fn check(&self, conflict: &Conflict<'_>) -> Result<(), PackageError> {
        if conflict.same_scope {
            return Err(conflict_error(conflict));
        }
        Ok(())
    }
}

/// One version per package name, or fail.
#[derive(Debug, Default, Clone, Copy)]
pub struct Strict;

impl ConflictPolicy for Strict {
    fn check(&self, conflict: &Conflict<'_>) -> Result<(), PackageError> {
        Err(conflict_error(conflict))
    }

    fn single_version(&self) -> bool {
        true
    }
}
