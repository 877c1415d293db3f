use anyhow::{Context, Result};
use chrono::Utc;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::backup::{BackupRequest, StageError};

const KNOWN_EXTENSIONS: [&str; 4] = [".tar.gz", ".zip", ".dump", ".tgz"];

/// `<dest minus archive extension>_log.txt`, next to the destination.
pub fn report_path_for(dest: &Path) -> PathBuf {
    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "backup".to_string());
    let stem = KNOWN_EXTENSIONS
        .iter()
        .find_map(|ext| file_name.strip_suffix(ext))
        .unwrap_or(&file_name);
    dest.with_file_name(format!("{}_log.txt", stem))
}

/// Writes the full error chain of a failed run next to the destination.
pub fn write_failure_report(request: &BackupRequest, failure: &StageError) -> Result<PathBuf> {
    let path = report_path_for(request.dest());
    let mut report = String::new();
    writeln!(report, "======================================")?;
    writeln!(report, "Backup of database {} failed", request.db_name())?;
    writeln!(report, "Time (UTC): {}", Utc::now().format("%Y-%m-%d %H:%M:%S"))?;
    writeln!(report, "Format: {}", request.format())?;
    writeln!(report, "Destination: {}", request.dest().display())?;
    writeln!(report, "Stage: {}", failure.stage)?;
    writeln!(report, "Error: {}", failure.error)?;

    let mut source = std::error::Error::source(&failure.error);
    let mut depth = 0;
    while let Some(cause) = source {
        if depth == 0 {
            writeln!(report, "Caused by:")?;
        }
        writeln!(report, "    {}: {}", depth, cause)?;
        source = cause.source();
        depth += 1;
    }
    writeln!(report, "Debug: {:#?}", failure.error)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    fs::write(&path, report)
        .with_context(|| format!("Failed to write failure report {}", path.display()))?;
    Ok(path)
}
