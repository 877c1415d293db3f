use anyhow::Context;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

use crate::backup::FILESTORE_DIRNAME;
use crate::errors::{BackupError, Result};

/// Copies `source` into `<assembly_dir>/filestore`.
///
/// A missing source is a legitimate state (fresh database) and returns `Ok(false)`.
pub fn collect_filestore(source: &Path, assembly_dir: &Path) -> Result<bool> {
    if !source.is_dir() {
        tracing::info!(
            "No filestore at {}, continuing without it",
            source.display()
        );
        return Ok(false);
    }

    let target = assembly_dir.join(FILESTORE_DIRNAME);
    tracing::info!(
        "Copying filestore {} to {}",
        source.display(),
        target.display()
    );
    let files = copy_tree(source, &target).map_err(|e| BackupError::FilestoreCopyFailed {
        path: source.to_path_buf(),
        source: e,
    })?;
    tracing::info!("✓ Filestore copied ({} files)", files);
    Ok(true)
}

fn copy_tree(source: &Path, target: &Path) -> anyhow::Result<usize> {
    let mut files = 0;
    for entry in WalkDir::new(source) {
        let entry =
            entry.with_context(|| format!("Failed to walk directory: {}", source.display()))?;
        let path = entry.path();
        let rel = path.strip_prefix(source).with_context(|| {
            format!(
                "Failed to strip prefix {} from {}",
                source.display(),
                path.display()
            )
        })?;
        let dest = target.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)
                .with_context(|| format!("Failed to create directory {}", dest.display()))?;
        } else {
            fs::copy(path, &dest).with_context(|| {
                format!("Failed to copy {} to {}", path.display(), dest.display())
            })?;
            files += 1;
        }
    }
    Ok(files)
}
