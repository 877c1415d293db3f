use anyhow::Context;
use chrono::{DateTime, Utc};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::backup::archive::{
    Archiver, ArchiveArtifact, move_into_place, remove_path, staging_dir_for,
};
use crate::backup::db_dump::DumpProducer;
use crate::backup::filestore::collect_filestore;
use crate::backup::manifest::Manifest;
use crate::backup::s3_upload::{RemoteShipper, UploadRecord, object_name};
use crate::backup::{BackupFormat, BackupRequest, MANIFEST_FILENAME};
use crate::errors::BackupError;
use crate::utils::setting::{DatabaseAccess, Session};

/// Pipeline states, in order. Any of them can end in failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    SessionOpen,
    Assembling,
    Shipping,
    Cleanup,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A pipeline failure tagged with the state it happened in.
#[derive(Debug)]
pub struct StageError {
    pub stage: Stage,
    pub error: BackupError,
}

impl StageError {
    fn at(stage: Stage) -> impl FnOnce(BackupError) -> StageError {
        move |error| StageError { stage, error }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.stage, self.error)
    }
}

impl std::error::Error for StageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[derive(Debug)]
pub enum BackupOutcome {
    /// Source database missing and the caller asked to tolerate it.
    Skipped,
    /// Final output written at this local path.
    Written(PathBuf),
    /// Archive uploaded, confirmed and recorded.
    Shipped(UploadRecord),
}

/// Sequences validation, snapshot, assembly and shipping for one request.
pub struct BackupPipeline<'a> {
    pub database: &'a dyn DatabaseAccess,
    pub dumper: &'a dyn DumpProducer,
    pub archiver: &'a dyn Archiver,
    pub shipper: Option<&'a RemoteShipper>,
    pub filestore_root: &'a Path,
    pub app_version: &'a str,
}

type StageResult<T> = std::result::Result<T, StageError>;

fn enter(stage: Stage) {
    tracing::debug!("Entering stage {}", stage);
}

impl BackupPipeline<'_> {
    pub async fn run(&self, request: &BackupRequest) -> StageResult<BackupOutcome> {
        let now = Utc::now();
        let db_name = request.db_name();
        tracing::info!(
            "🚀 Backing up {} to {} (format: {}, filestore: {})",
            db_name,
            request.dest().display(),
            request.format(),
            request.include_filestore()
        );

        enter(Stage::Validating);
        if !self.validate(request).await.map_err(StageError::at(Stage::Validating))? {
            return Ok(BackupOutcome::Skipped);
        }

        // Removed on every exit path unless explicitly closed below.
        let staging = staging_dir_for(request.dest()).map_err(StageError::at(Stage::Assembling))?;
        let work_dir = staging.path().join("work");
        fs::create_dir(&work_dir)
            .map_err(|e| StageError::at(Stage::Assembling)(e.into()))?;

        enter(Stage::SessionOpen);
        let mut session = self
            .database
            .open_session(db_name)
            .await
            .map_err(|e| StageError::at(Stage::SessionOpen)(e.into()))?;
        enter(Stage::Assembling);
        let assembled = self.assemble(session.as_mut(), request, &work_dir).await;
        let closed = session.close().await;
        assembled.map_err(StageError::at(Stage::Assembling))?;
        closed.map_err(|e| StageError::at(Stage::SessionOpen)(e.into()))?;
        tracing::debug!("Session on {} released", db_name);

        let artifact = self
            .package(request, &work_dir, staging, now)
            .await
            .map_err(StageError::at(Stage::Assembling))?;

        let outcome = match artifact {
            ArchiveArtifact::Compressed { path, staging } => {
                let outcome = if request.format().ships_remote() {
                    enter(Stage::Shipping);
                    match self.ship(request, &path, now).await {
                        Ok(record) => BackupOutcome::Shipped(record),
                        Err(error) => {
                            // An unconfirmed archive that could not leave staging must outlive it.
                            if let BackupError::UploadUnconfirmed { kept, .. } = &error {
                                if kept.starts_with(staging.path()) {
                                    let left = staging.keep();
                                    tracing::warn!(
                                        "Staging directory {} left in place",
                                        left.display()
                                    );
                                }
                            }
                            return Err(StageError::at(Stage::Shipping)(error));
                        }
                    }
                } else {
                    move_into_place(&path, request.dest())
                        .map_err(StageError::at(Stage::Assembling))?;
                    BackupOutcome::Written(request.dest().to_path_buf())
                };
                enter(Stage::Cleanup);
                staging
                    .close()
                    .map_err(|e| StageError::at(Stage::Cleanup)(e.into()))?;
                outcome
            }
            ArchiveArtifact::Folder(path) | ArchiveArtifact::RawDump(path) => {
                BackupOutcome::Written(path)
            }
        };

        enter(Stage::Done);
        tracing::info!("🎉 Backup of {} completed", db_name);
        Ok(outcome)
    }

    /// Returns `false` for a tolerated missing source. No side effect other than
    /// removing a pre-existing destination under `force`.
    async fn validate(&self, request: &BackupRequest) -> crate::errors::Result<bool> {
        let db_name = request.db_name();
        if !self.database.exists(db_name).await? {
            if request.if_exists() {
                tracing::warn!("Database does not exist: {}", db_name);
                return Ok(false);
            }
            return Err(BackupError::SourceNotFound(db_name.to_string()));
        }

        self.dumper.ensure_available()?;

        if request.format().ships_remote() && self.shipper.is_none() {
            return Err(BackupError::Config(
                "s3zip format requested but s3_storage is not configured".to_string(),
            ));
        }

        let dest = request.dest();
        if fs::symlink_metadata(dest).is_ok() {
            if !request.force() {
                return Err(BackupError::DestinationExists(dest.to_path_buf()));
            }
            tracing::warn!("Destination already exist: {}. Removing it.", dest.display());
            remove_path(dest)
                .with_context(|| format!("Failed to remove {}", dest.display()))?;
        }
        Ok(true)
    }

    /// Manifest, filestore and dump, in that order, all inside `work_dir`.
    async fn assemble(
        &self,
        session: &mut dyn Session,
        request: &BackupRequest,
        work_dir: &Path,
    ) -> crate::errors::Result<()> {
        let format = request.format();

        if format.includes_manifest() {
            let manifest = Manifest::build(session, self.app_version).await?;
            manifest.write_to(&work_dir.join(MANIFEST_FILENAME))?;
            tracing::info!(
                "✓ Manifest written ({} installed modules, PostgreSQL {})",
                manifest.modules.len(),
                manifest.pg_version
            );
        }

        if request.include_filestore() {
            collect_filestore(&self.filestore_root.join(request.db_name()), work_dir)?;
        }

        let dialect = format.dump_dialect();
        self.dumper
            .dump(request.db_name(), dialect, &work_dir.join(dialect.member_name()))
            .await
    }

    /// Turns the assembled working directory into the requested output shape.
    async fn package(
        &self,
        request: &BackupRequest,
        work_dir: &Path,
        staging: tempfile::TempDir,
        now: DateTime<Utc>,
    ) -> crate::errors::Result<ArchiveArtifact> {
        let dest = request.dest();
        match request.format() {
            BackupFormat::Dump => {
                let dump = work_dir.join(BackupFormat::Dump.dump_dialect().member_name());
                move_into_place(&dump, dest)?;
                Ok(ArchiveArtifact::RawDump(dest.to_path_buf()))
            }
            BackupFormat::Folder => {
                move_into_place(work_dir, dest)?;
                Ok(ArchiveArtifact::Folder(dest.to_path_buf()))
            }
            BackupFormat::Zip | BackupFormat::S3Zip => {
                let archive_path = staging.path().join(object_name(
                    request.db_name(),
                    now,
                    self.archiver.extension(),
                ));
                self.archiver.compress(work_dir, &archive_path).await?;
                // Uncompressed members are no longer needed once the archive exists.
                fs::remove_dir_all(work_dir)?;
                Ok(ArchiveArtifact::Compressed {
                    path: archive_path,
                    staging,
                })
            }
        }
    }

    async fn ship(
        &self,
        request: &BackupRequest,
        archive: &Path,
        now: DateTime<Utc>,
    ) -> crate::errors::Result<UploadRecord> {
        let shipper = self.shipper.ok_or_else(|| {
            BackupError::Config("s3_storage is not configured".to_string())
        })?;
        shipper
            .ship(
                self.database,
                request.db_name(),
                archive,
                self.archiver.extension(),
                now,
                request.dest(),
            )
            .await
    }
}
