//! Artifact digests in `sha256-<hex>` form.

use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use log::debug;
use sha2::{Digest, Sha256};

use crate::error::EndpointError;
use crate::runtime::Runtime;

const PREFIX: &str = "sha256-";

/// Digest and size of the file at `path`.
pub fn compute<R: Runtime + ?Sized>(runtime: &R, path: &Path) -> Result<(String, u64)> {
    let mut file = runtime
        .open(path)
        .with_context(|| format!("Failed to open {:?} for hashing", path))?;
    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher)
        .with_context(|| format!("Failed to read {:?} for hashing", path))?;
    Ok((format!("{}{}", PREFIX, hex::encode(hasher.finalize())), size))
}

/// Check size and digest when they are known. Either mismatch is a
/// corrupt artifact.
pub fn verify<R: Runtime + ?Sized>(
    runtime: &R,
    path: &Path,
    expected_digest: Option<&str>,
    expected_size: Option<u64>,
) -> Result<(), EndpointError> {
    if expected_digest.is_none() && expected_size.is_none() {
        return Ok(());
    }
    let (actual, size) = compute(runtime, path).map_err(EndpointError::corrupt)?;
    debug!("Calculated {} ({} bytes) for {:?}", actual, size, path);

    if let Some(expected) = expected_size
        && expected != size
    {
        return Err(EndpointError::CorruptArtifact(format!(
            "size mismatch for {}: expected {} bytes, got {}",
            path.display(),
            expected,
            size
        )));
    }
    if let Some(expected) = expected_digest {
        let expected_hex = expected.strip_prefix(PREFIX).unwrap_or(expected);
        let actual_hex = actual.strip_prefix(PREFIX).unwrap_or(&actual);
        if !actual_hex.eq_ignore_ascii_case(expected_hex) {
            return Err(EndpointError::CorruptArtifact(format!(
                "digest mismatch for {}: expected {}, got {}",
                path.display(),
                expected,
                actual
            )));
        }
    }
    Ok(())
}
