//! File system utils.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
};

use anyhow::Context;
use fs2::FileExt;

pub struct FsHandler;

impl FsHandler {
    pub fn set_writable(path: &Path) -> anyhow::Result<()> {
        let metadata = std::fs::metadata(path).context("Failed to get metadata for file")?;

        let mut perms = metadata.permissions();

        perms.set_readonly(false);

        std::fs::set_permissions(path, perms).context("Failed to set permissions")?;

        Ok(())
    }

    /// Create an output directory if it doesn't exist.
    pub fn create_output_directory(path: &Path) -> anyhow::Result<()> {
        if path.exists() {
            return Ok(());
        }

        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory {}", path.display()))?;
        tracing::debug!("Created output directory: {}", path.display());

        Self::set_writable(path).context("Failed to set permissions on output directory")?;

        Ok(())
    }

    /// Replace the content of `path` atomically.
    ///
    /// The content is written to a sibling temporary file which is then renamed over
    /// `path`, while an exclusive lock on `<path>.lock` keeps concurrent writers out.
    pub fn write_atomic(path: &Path, content: &[u8]) -> anyhow::Result<()> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Self::create_output_directory(parent)?;

        let lock_path = path.with_extension(lock_extension(path));
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file {}", lock_path.display()))?;
        lock.try_lock_exclusive().with_context(|| {
            format!(
                "{} is locked by another process, is a stage already running?",
                path.display()
            )
        })?;

        let tmp_path = path.with_extension("tmp");
        let result = (|| -> anyhow::Result<()> {
            let mut file = File::create(&tmp_path)
                .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
            file.write_all(content)
                .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
            file.sync_all()
                .with_context(|| format!("Failed to flush {}", tmp_path.display()))?;
            std::fs::rename(&tmp_path, path)
                .with_context(|| format!("Failed to move {} into place", tmp_path.display()))
        })();

        if result.is_err() {
            let _ = std::fs::remove_file(&tmp_path);
        }

        FileExt::unlock(&lock).context("Failed to release lock")?;
        result
    }
}

fn lock_extension(path: &Path) -> String {
    match path.extension() {
        Some(ext) => format!("{}.lock", ext.to_string_lossy()),
        None => "lock".to_string(),
    }
}
