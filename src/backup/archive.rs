// dbship/src/backup/archive.rs
use anyhow::Context;
use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::cmp::Ordering;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tar::Builder;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use walkdir::{DirEntry, WalkDir};

use crate::backup::MANIFEST_FILENAME;
use crate::config::CompressionConfig;
use crate::errors::{BackupError, Result};
use crate::utils::find_executable;

/// Compresses the contents of a directory into a single container file.
#[async_trait]
pub trait Archiver: Send + Sync {
    /// File extension of the produced container, without the leading dot.
    fn extension(&self) -> &'static str;

    async fn compress(&self, source_dir: &Path, archive_path: &Path) -> Result<()>;
}

/// Picks `7z` when allowed and installed, the in-process tar.gz writer otherwise.
pub fn select_archiver(config: &CompressionConfig) -> Box<dyn Archiver> {
    if config.use_external_7z {
        match find_executable("7z", None) {
            Ok(program) => {
                tracing::debug!("Using {} for compression", program.display());
                return Box::new(SevenZipArchiver::new(program, config.level));
            }
            Err(e) => tracing::info!("{:#}. Falling back to tar.gz compression.", e),
        }
    }
    Box::new(TarGzArchiver::new(config.level))
}

/// In-process tar + gzip.
pub struct TarGzArchiver {
    level: u32,
}

impl TarGzArchiver {
    pub fn new(level: u32) -> Self {
        TarGzArchiver { level }
    }

    fn write_archive(level: u32, source_dir: &Path, archive_path: &Path) -> anyhow::Result<()> {
        let archive_file = File::create(archive_path).with_context(|| {
            format!("Failed to create archive file: {}", archive_path.display())
        })?;
        let enc = GzEncoder::new(archive_file, Compression::new(level));
        let mut tar_builder = Builder::new(enc);

        // Paths inside the archive are relative to source_dir, manifest first.
        for entry in WalkDir::new(source_dir).sort_by(manifest_first) {
            let entry = entry
                .with_context(|| format!("Failed to walk directory: {}", source_dir.display()))?;
            let path = entry.path();
            let name = path.strip_prefix(source_dir).with_context(|| {
                format!(
                    "Failed to strip prefix {} from {}",
                    source_dir.display(),
                    path.display()
                )
            })?;

            if name.as_os_str().is_empty() {
                continue;
            }

            if entry.file_type().is_dir() {
                tar_builder.append_dir(name, path).with_context(|| {
                    format!("Failed to append directory {} to archive", path.display())
                })?;
            } else {
                tar_builder.append_path_with_name(path, name).with_context(|| {
                    format!(
                        "Failed to append file {} as {} to archive",
                        path.display(),
                        name.display()
                    )
                })?;
            }
        }

        let encoder = tar_builder
            .into_inner()
            .context("Failed to finish tar stream")?;
        let file = encoder
            .finish()
            .context("Failed to finish Gzip encoding")?;
        file.sync_all().context("Failed to flush archive to disk")?;
        Ok(())
    }
}

fn manifest_first(a: &DirEntry, b: &DirEntry) -> Ordering {
    let rank = |e: &DirEntry| !(e.depth() == 1 && e.file_name() == MANIFEST_FILENAME);
    rank(a)
        .cmp(&rank(b))
        .then_with(|| a.file_name().cmp(b.file_name()))
}

#[async_trait]
impl Archiver for TarGzArchiver {
    fn extension(&self) -> &'static str {
        "tar.gz"
    }

    async fn compress(&self, source_dir: &Path, archive_path: &Path) -> Result<()> {
        if !source_dir.is_dir() {
            return Err(BackupError::CompressionFailed(format!(
                "Source for archival is not a directory: {}",
                source_dir.display()
            )));
        }
        tracing::info!(
            "Creating tar.gz archive from {} to {}",
            source_dir.display(),
            archive_path.display()
        );
        let level = self.level;
        let (source, target) = (source_dir.to_path_buf(), archive_path.to_path_buf());
        tokio::task::spawn_blocking(move || Self::write_archive(level, &source, &target))
            .await
            .map_err(|e| BackupError::CompressionFailed(format!("Archive writer panicked: {}", e)))?
            .map_err(|e| BackupError::CompressionFailed(format!("{:#}", e)))?;
        tracing::info!("✓ Archive created at {}", archive_path.display());
        Ok(())
    }
}

/// External `7z`, zip container, multithreaded.
pub struct SevenZipArchiver {
    program: PathBuf,
    level: u32,
}

impl SevenZipArchiver {
    pub fn new(program: impl Into<PathBuf>, level: u32) -> Self {
        SevenZipArchiver {
            program: program.into(),
            level,
        }
    }

    pub fn command_args(&self, source_dir: &Path, archive_path: &Path) -> Vec<String> {
        vec![
            "a".to_string(),
            "-bt".to_string(),
            format!("-mx={}", self.level),
            "-mmt=on".to_string(),
            "-tzip".to_string(),
            archive_path.display().to_string(),
            // 7z expands the wildcard itself, so members land at the archive root.
            source_dir.join("*").display().to_string(),
        ]
    }
}

#[async_trait]
impl Archiver for SevenZipArchiver {
    fn extension(&self) -> &'static str {
        "zip"
    }

    async fn compress(&self, source_dir: &Path, archive_path: &Path) -> Result<()> {
        let args = self.command_args(source_dir, archive_path);
        tracing::info!("Compressing with {} {}", self.program.display(), args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BackupError::CompressionFailed(format!(
                    "Failed to execute {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        let stdout = child.stdout.take().context("7z stdout was not captured")?;
        let mut stderr = child.stderr.take().context("7z stderr was not captured")?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            stderr.read_to_string(&mut buf).await.map(|_| buf)
        });

        // Progress is relayed as it arrives, the transcript kept for the error message.
        let mut transcript = Vec::new();
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim().to_string();
            if !line.is_empty() {
                tracing::debug!("7z: {}", line);
                transcript.push(line);
            }
        }

        let status = child.wait().await.context("Failed to wait for 7z")?;
        let stderr_text = stderr_task
            .await
            .context("7z stderr reader panicked")?
            .context("Failed to read 7z stderr")?;

        if !status.success() {
            return Err(BackupError::CompressionFailed(format!(
                "7z exited with {}\nStdout: {}\nStderr: {}",
                status,
                transcript.join("\n"),
                stderr_text
            )));
        }
        tracing::info!("✓ Compression completed successfully");
        Ok(())
    }
}

/// Hidden scratch directory next to `dest`, so finished artifacts can be renamed into place.
pub fn staging_dir_for(dest: &Path) -> Result<TempDir> {
    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).with_context(|| {
        format!("Failed to create destination directory {}", parent.display())
    })?;
    let staging = tempfile::Builder::new()
        .prefix(".dbship-")
        .tempdir_in(&parent)
        .with_context(|| format!("Failed to create staging directory in {}", parent.display()))?;
    Ok(staging)
}

/// The assembled output before it is shipped or declared final.
#[derive(Debug)]
pub enum ArchiveArtifact {
    /// Single compressed container, still owned by its staging directory.
    Compressed { path: PathBuf, staging: TempDir },
    /// Directory tree already moved to the destination.
    Folder(PathBuf),
    /// Custom-format dump already moved to the destination.
    RawDump(PathBuf),
}

/// Moves a finished artifact (file or directory) to `dest`. Same filesystem by construction.
pub fn move_into_place(from: &Path, dest: &Path) -> Result<()> {
    fs::rename(from, dest).with_context(|| {
        format!("Failed to move {} to {}", from.display(), dest.display())
    })?;
    tracing::info!("✓ Output written to {}", dest.display());
    Ok(())
}

/// Removes a file or directory tree if present.
pub fn remove_path(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    /// Member names of a tar.gz archive, in archive order.
    pub(crate) fn tar_members(archive: &Path) -> anyhow::Result<Vec<String>> {
        let mut archive = tar::Archive::new(GzDecoder::new(File::open(archive)?));
        let mut names = Vec::new();
        for entry in archive.entries()? {
            let entry = entry?;
            names.push(
                entry
                    .path()?
                    .to_string_lossy()
                    .trim_end_matches('/')
                    .to_string(),
            );
        }
        Ok(names)
    }

    #[tokio::test]
    async fn test_tar_gz_puts_manifest_first() -> anyhow::Result<()> {
        let src = tempfile::tempdir()?;
        fs::write(src.path().join("dump.sql"), b"-- dump")?;
        fs::write(src.path().join(MANIFEST_FILENAME), b"{}")?;
        fs::create_dir_all(src.path().join("filestore/ab"))?;
        fs::write(src.path().join("filestore/ab/abcdef"), b"blob")?;

        let out = tempfile::tempdir()?;
        let archive = out.path().join("shop.tar.gz");
        TarGzArchiver::new(3).compress(src.path(), &archive).await?;

        let members = tar_members(&archive)?;
        assert_eq!(members[0], MANIFEST_FILENAME);
        assert_eq!(
            members,
            vec!["manifest.json", "dump.sql", "filestore", "filestore/ab", "filestore/ab/abcdef"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_tar_gz_contents_survive() -> anyhow::Result<()> {
        let src = tempfile::tempdir()?;
        fs::write(src.path().join("dump.sql"), b"CREATE TABLE t();")?;
        let out = tempfile::tempdir()?;
        let archive = out.path().join("a.tar.gz");
        TarGzArchiver::new(9).compress(src.path(), &archive).await?;

        let mut archive = tar::Archive::new(GzDecoder::new(File::open(&archive)?));
        let mut entry = archive.entries()?.next().unwrap()?;
        let mut body = String::new();
        entry.read_to_string(&mut body)?;
        assert_eq!(body, "CREATE TABLE t();");
        Ok(())
    }

    #[tokio::test]
    async fn test_tar_gz_rejects_missing_source() {
        let out = tempfile::tempdir().unwrap();
        let err = TarGzArchiver::new(3)
            .compress(&out.path().join("missing"), &out.path().join("x.tar.gz"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::CompressionFailed(_)));
    }

    #[test]
    fn test_seven_zip_args() {
        let zip = SevenZipArchiver::new("7z", 3);
        let args = zip.command_args(Path::new("/tmp/work"), Path::new("/tmp/out/shop.zip"));
        assert_eq!(
            args,
            vec!["a", "-bt", "-mx=3", "-mmt=on", "-tzip", "/tmp/out/shop.zip", "/tmp/work/*"]
        );
        assert_eq!(zip.extension(), "zip");
    }

    #[tokio::test]
    async fn test_seven_zip_failure_is_compression_failed() {
        let work = tempfile::tempdir().unwrap();
        let zip = SevenZipArchiver::new(work.path().join("no-7z-here"), 3);
        let err = zip
            .compress(work.path(), &work.path().join("x.zip"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::CompressionFailed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_seven_zip_output_is_streamed_and_failures_keep_it() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let work = tempfile::tempdir()?;
        let script = work.path().join("fake_7z.sh");
        fs::write(
            &script,
            "#!/bin/sh\necho 'Scanning the drive:'\necho '2 files, 10 bytes'\necho 'cannot open archive' >&2\nexit 2\n",
        )?;
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755))?;

        let err = SevenZipArchiver::new(&script, 3)
            .compress(work.path(), &work.path().join("x.zip"))
            .await
            .unwrap_err();
        match err {
            BackupError::CompressionFailed(msg) => {
                assert!(msg.contains("2 files, 10 bytes"));
                assert!(msg.contains("cannot open archive"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_staging_dir_is_hidden_sibling() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let dest = root.path().join("nested/shop.zip");
        let staging = staging_dir_for(&dest)?;

        assert_eq!(staging.path().parent(), Some(root.path().join("nested").as_path()));
        let name = staging.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(".dbship-"));
        Ok(())
    }

    #[test]
    fn test_remove_path_handles_files_dirs_and_absence() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let file = root.path().join("f");
        let dir = root.path().join("d");
        fs::write(&file, b"x")?;
        fs::create_dir_all(dir.join("sub"))?;

        remove_path(&file)?;
        remove_path(&dir)?;
        remove_path(&root.path().join("absent"))?;
        assert!(!file.exists());
        assert!(!dir.exists());
        Ok(())
    }
}
