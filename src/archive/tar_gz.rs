use std::path::{Component, Path};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use log::{debug, info};
use tar::{Archive, EntryType};

use super::{ArchiveExtractor, begin_extraction, finish_extraction};
use crate::cleanup::SharedCleanupContext;
use crate::runtime::Runtime;

/// Extractor for .tar.gz and .tgz archives
#[derive(Default)]
pub struct TarGzExtractor;

impl ArchiveExtractor for TarGzExtractor {
    fn can_handle(&self, archive_path: &Path) -> bool {
        let name = archive_path.to_string_lossy().to_lowercase();
        name.ends_with(".tar.gz") || name.ends_with(".tgz")
    }

    fn extract<R: Runtime + 'static>(
        &self,
        runtime: &R,
        archive_path: &Path,
        extract_to: &Path,
    ) -> Result<()> {
        self.extract_impl(runtime, archive_path, extract_to, None)
    }

    fn extract_with_cleanup<R: Runtime + 'static>(
        &self,
        runtime: &R,
        archive_path: &Path,
        extract_to: &Path,
        cleanup_ctx: SharedCleanupContext,
    ) -> Result<()> {
        self.extract_impl(runtime, archive_path, extract_to, Some(cleanup_ctx))
    }
}

/// Entries with absolute paths or `..` components are never written.
fn is_safe(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

impl TarGzExtractor {
    fn extract_impl<R: Runtime + 'static>(
        &self,
        runtime: &R,
        archive_path: &Path,
        extract_to: &Path,
        cleanup_ctx: Option<SharedCleanupContext>,
    ) -> Result<()> {
        debug!("Extracting tar.gz archive to {:?}...", extract_to);
        let reader = runtime
            .open(archive_path)
            .with_context(|| format!("Failed to open archive at {:?}", archive_path))?;
        let mut archive = Archive::new(GzDecoder::new(reader));

        let temp_extract_dir = begin_extraction(runtime, extract_to, cleanup_ctx.as_ref())?;

        let entries = archive
            .entries()
            .with_context(|| format!("Failed to read archive {:?}", archive_path))?;
        for entry in entries {
            let mut entry = entry.context("Failed to read tar entry")?;
            let entry_path = entry.path().context("Invalid tar entry path")?.into_owned();
            if !is_safe(&entry_path) {
                debug!("Skipping entry with unsafe path {:?}", entry_path);
                continue;
            }
            let full_path = temp_extract_dir.join(&entry_path);

            match entry.header().entry_type() {
                EntryType::Directory => {
                    runtime.create_dir_all(&full_path)?;
                }
                EntryType::Regular | EntryType::Continuous => {
                    if let Some(parent) = full_path.parent() {
                        runtime.create_dir_all(parent)?;
                    }
                    let mut dest_file = runtime.create_file(&full_path)?;
                    std::io::copy(&mut entry, &mut dest_file)
                        .with_context(|| format!("Failed to extract file {:?}", full_path))?;
                    drop(dest_file);

                    #[cfg(unix)]
                    if let Ok(mode) = entry.header().mode()
                        && let Err(e) = runtime.set_permissions(&full_path, mode)
                    {
                        debug!("Failed to set permissions on {:?}: {}", full_path, e);
                    }
                }
                // npm-style tarballs carry pax headers and occasional links; packages never need them.
                other => debug!("Skipping {:?} entry {:?}", other, entry_path),
            }
        }

        finish_extraction(runtime, &temp_extract_dir, extract_to, cleanup_ctx.as_ref())?;
        info!("Extraction complete.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_util::tar_gz;
    use crate::runtime::RealRuntime;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_can_handle_tar_gz() {
        let extractor = TarGzExtractor;
        assert!(extractor.can_handle(Path::new("foo.tar.gz")));
        assert!(extractor.can_handle(Path::new("FOO.TGZ")));
        assert!(!extractor.can_handle(Path::new("foo.zip")));
    }

    #[test]
    fn test_extract_strips_package_dir() -> Result<()> {
        let dir = tempdir()?;
        let archive_path = dir.path().join("foo-1.0.0.tgz");
        let extract_path = dir.path().join("extracted");
        fs::write(
            &archive_path,
            tar_gz(&[
                ("package/box.json", r#"{"name":"foo"}"#),
                ("package/lib/main.bx", "main"),
            ]),
        )?;

        TarGzExtractor.extract(&RealRuntime, &archive_path, &extract_path)?;

        assert!(extract_path.join("box.json").exists());
        assert_eq!(fs::read_to_string(extract_path.join("lib/main.bx"))?, "main");
        Ok(())
    }

    #[test]
    fn test_extract_without_toplevel_dir() -> Result<()> {
        let dir = tempdir()?;
        let archive_path = dir.path().join("foo.tgz");
        let extract_path = dir.path().join("extracted");
        fs::write(&archive_path, tar_gz(&[("box.json", "{}"), ("a.bx", "a")]))?;

        TarGzExtractor.extract(&RealRuntime, &archive_path, &extract_path)?;

        assert!(extract_path.join("box.json").exists());
        assert!(extract_path.join("a.bx").exists());
        Ok(())
    }

    #[test]
    fn test_extract_corrupted_archive() {
        let dir = tempdir().unwrap();
        let archive_path = dir.path().join("foo.tgz");
        fs::write(&archive_path, "not gzip at all").unwrap();

        let result =
            TarGzExtractor.extract(&RealRuntime, &archive_path, &dir.path().join("extracted"));
        assert!(result.is_err());
    }

    #[test]
    fn test_is_safe() {
        assert!(is_safe(Path::new("package/box.json")));
        assert!(is_safe(Path::new("./box.json")));
        assert!(!is_safe(Path::new("../evil")));
        assert!(!is_safe(Path::new("/etc/passwd")));
        assert!(!is_safe(Path::new("package/../../evil")));
    }
}
