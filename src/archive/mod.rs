//! Package archive extraction.
//!
//! Archives are unpacked into a sibling scratch directory first. If the
//! archive holds a single top-level directory (`package/`, `foo-1.2.0/`)
//! its contents become the package root, otherwise the archive root is used.

mod tar_gz;
mod zip;

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use log::debug;

use crate::cleanup::{self, SharedCleanupContext};
use crate::runtime::Runtime;

pub use tar_gz::TarGzExtractor;
pub use zip::ZipExtractor;

/// Trait for format-specific archive extractors
#[cfg_attr(test, mockall::automock)]
pub trait ArchiveExtractor: Send + Sync {
    /// Check if this extractor can handle the given archive format
    fn can_handle(&self, archive_path: &Path) -> bool;

    /// Extract the archive to the specified directory
    fn extract<R: Runtime + 'static>(
        &self,
        runtime: &R,
        archive_path: &Path,
        extract_to: &Path,
    ) -> Result<()>;

    /// Extract the archive with cleanup context for interruption handling
    fn extract_with_cleanup<R: Runtime + 'static>(
        &self,
        runtime: &R,
        archive_path: &Path,
        extract_to: &Path,
        cleanup_ctx: SharedCleanupContext,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    TarGz,
    Zip,
}

/// Dispatcher that selects the appropriate extractor based on archive format.
///
/// The file name decides first; files without a known extension (downloads
/// from URLs such as `/download?id=3`) are sniffed by their magic bytes.
#[derive(Default)]
pub struct ArchiveExtractorImpl {
    tar_gz: TarGzExtractor,
    zip: ZipExtractor,
}

impl ArchiveExtractorImpl {
    pub fn new() -> Self {
        Self::default()
    }

    fn format_of<R: Runtime + 'static>(&self, runtime: &R, archive_path: &Path) -> Option<Format> {
        if self.tar_gz.can_handle(archive_path) {
            return Some(Format::TarGz);
        }
        if self.zip.can_handle(archive_path) {
            return Some(Format::Zip);
        }
        sniff(runtime, archive_path)
    }
}

fn sniff<R: Runtime + ?Sized>(runtime: &R, archive_path: &Path) -> Option<Format> {
    let mut magic = [0u8; 4];
    let mut reader = runtime.open(archive_path).ok()?;
    reader.read_exact(&mut magic).ok()?;
    match magic {
        [0x1f, 0x8b, _, _] => Some(Format::TarGz),
        [b'P', b'K', 0x03, 0x04] | [b'P', b'K', 0x05, 0x06] => Some(Format::Zip),
        _ => None,
    }
}

impl ArchiveExtractor for ArchiveExtractorImpl {
    fn can_handle(&self, archive_path: &Path) -> bool {
        self.tar_gz.can_handle(archive_path) || self.zip.can_handle(archive_path)
    }

    #[tracing::instrument(skip(self, runtime, archive_path, extract_to))]
    fn extract<R: Runtime + 'static>(
        &self,
        runtime: &R,
        archive_path: &Path,
        extract_to: &Path,
    ) -> Result<()> {
        match self.format_of(runtime, archive_path) {
            Some(Format::TarGz) => self.tar_gz.extract(runtime, archive_path, extract_to),
            Some(Format::Zip) => self.zip.extract(runtime, archive_path, extract_to),
            None => Err(anyhow!(
                "Unsupported archive format: {}",
                archive_path.display()
            )),
        }
    }

    #[tracing::instrument(skip(self, runtime, archive_path, extract_to, cleanup_ctx))]
    fn extract_with_cleanup<R: Runtime + 'static>(
        &self,
        runtime: &R,
        archive_path: &Path,
        extract_to: &Path,
        cleanup_ctx: SharedCleanupContext,
    ) -> Result<()> {
        match self.format_of(runtime, archive_path) {
            Some(Format::TarGz) => {
                self.tar_gz
                    .extract_with_cleanup(runtime, archive_path, extract_to, cleanup_ctx)
            }
            Some(Format::Zip) => {
                self.zip
                    .extract_with_cleanup(runtime, archive_path, extract_to, cleanup_ctx)
            }
            None => Err(anyhow!(
                "Unsupported archive format: {}",
                archive_path.display()
            )),
        }
    }
}

/// Scratch directory next to `extract_to` for the raw archive contents.
pub(crate) fn begin_extraction<R: Runtime + ?Sized>(
    runtime: &R,
    extract_to: &Path,
    cleanup_ctx: Option<&SharedCleanupContext>,
) -> Result<PathBuf> {
    let name = extract_to
        .file_name()
        .with_context(|| format!("Invalid extraction target {:?}", extract_to))?;
    let temp_extract_dir =
        extract_to.with_file_name(format!("{}_temp_extract", name.to_string_lossy()));
    if runtime.exists(&temp_extract_dir) {
        runtime.remove_dir_all(&temp_extract_dir)?;
    }
    runtime.create_dir_all(&temp_extract_dir)?;
    runtime.create_dir_all(extract_to)?;

    if let Some(ctx) = cleanup_ctx {
        cleanup::lock(ctx).add(temp_extract_dir.clone());
    }
    debug!("Unpacking to temp dir: {:?}", temp_extract_dir);
    Ok(temp_extract_dir)
}

/// Move unpacked contents into `extract_to`, stripping a single top-level
/// directory, and drop the scratch directory.
pub(crate) fn finish_extraction<R: Runtime + ?Sized>(
    runtime: &R,
    temp_extract_dir: &Path,
    extract_to: &Path,
    cleanup_ctx: Option<&SharedCleanupContext>,
) -> Result<()> {
    let entries = runtime
        .read_dir(temp_extract_dir)
        .context("Failed to read temp extraction directory")?;

    let Some(first) = entries.first() else {
        return Err(anyhow!("Archive appears to be empty."));
    };
    let source_dir = if entries.len() == 1 && runtime.is_dir(first) {
        first.clone()
    } else {
        temp_extract_dir.to_path_buf()
    };

    debug!("Moving contents from {:?} to {:?}", source_dir, extract_to);
    for item in runtime.read_dir(&source_dir)? {
        let Some(file_name) = item.file_name() else {
            continue;
        };
        runtime.rename(&item, &extract_to.join(file_name))?;
    }

    runtime.remove_dir_all(temp_extract_dir)?;
    if let Some(ctx) = cleanup_ctx {
        cleanup::lock(ctx).remove(temp_extract_dir);
    }
    Ok(())
}
