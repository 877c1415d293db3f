pub(crate) mod archive; // Archive assembly and compression
pub(crate) mod db_dump; // pg_dump invocation
pub(crate) mod filestore; // Attachment tree copy
mod logic; // Orchestration of the pipeline stages
pub(crate) mod manifest; // manifest.json builder
pub(crate) mod report; // Failure report sidecar
pub(crate) mod s3_upload; // Object storage shipping and accounting
#[cfg(test)]
mod test_support;

use std::path::{Path, PathBuf};

use crate::config::AppConfig;
use crate::errors::{BackupError, Result};
use crate::utils::is_valid_db_name;
use crate::utils::setting::PgDatabaseAccess;
use db_dump::PgDump;
use s3_upload::{RemoteShipper, S3ObjectStore};

pub use logic::{BackupOutcome, BackupPipeline, Stage, StageError};

pub const MANIFEST_FILENAME: &str = "manifest.json";
pub const DBDUMP_FILENAME: &str = "db.dump";
pub const SQL_DUMP_FILENAME: &str = "dump.sql";
pub const FILESTORE_DIRNAME: &str = "filestore";

/// Output format selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BackupFormat {
    /// Compressed archive uploaded to object storage.
    #[value(name = "s3zip")]
    S3Zip,
    /// Compressed archive written to the destination file.
    #[value(name = "zip")]
    Zip,
    /// Custom-format pg_dump file only.
    #[value(name = "dump")]
    Dump,
    /// Uncompressed directory tree.
    #[value(name = "folder")]
    Folder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpDialect {
    Plain,
    Custom,
}

impl DumpDialect {
    pub fn member_name(self) -> &'static str {
        match self {
            DumpDialect::Plain => SQL_DUMP_FILENAME,
            DumpDialect::Custom => DBDUMP_FILENAME,
        }
    }
}

impl BackupFormat {
    pub fn dump_dialect(self) -> DumpDialect {
        match self {
            BackupFormat::Dump | BackupFormat::Folder => DumpDialect::Custom,
            BackupFormat::S3Zip | BackupFormat::Zip => DumpDialect::Plain,
        }
    }

    pub fn includes_manifest(self) -> bool {
        self != BackupFormat::Dump
    }

    pub fn ships_remote(self) -> bool {
        self == BackupFormat::S3Zip
    }
}

impl std::fmt::Display for BackupFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackupFormat::S3Zip => "s3zip",
            BackupFormat::Zip => "zip",
            BackupFormat::Dump => "dump",
            BackupFormat::Folder => "folder",
        };
        f.write_str(name)
    }
}

/// Public entry point for the backup process.
/// Wires the PostgreSQL, pg_dump, compression and S3 collaborators into the pipeline.
pub async fn run_backup_flow(
    app_config: &AppConfig,
    request: &BackupRequest,
) -> std::result::Result<BackupOutcome, StageError> {
    let database = PgDatabaseAccess::new(&app_config.source_db_url);
    let dumper = PgDump::locate(app_config.pg_dump_path.as_deref(), &app_config.source_db_url);
    let archiver = archive::select_archiver(&app_config.compression);

    let shipper = match &app_config.storage {
        Some(storage) if request.format().ships_remote() => {
            tracing::debug!("Object storage: {:?}", storage);
            let store = S3ObjectStore::connect(storage).await;
            Some(RemoteShipper::new(Box::new(store), storage.key_prefix.clone()))
        }
        _ => None,
    };

    let pipeline = BackupPipeline {
        database: &database,
        dumper: &dumper,
        archiver: archiver.as_ref(),
        shipper: shipper.as_ref(),
        filestore_root: &app_config.filestore_root,
        app_version: &app_config.app_version,
    };
    pipeline.run(request).await
}

/// A validated backup invocation. Immutable once built.
#[derive(Debug, Clone)]
pub struct BackupRequest {
    db_name: String,
    dest: PathBuf,
    format: BackupFormat,
    include_filestore: bool,
    force: bool,
    if_exists: bool,
}

impl BackupRequest {
    pub fn new(
        db_name: impl Into<String>,
        dest: impl Into<PathBuf>,
        format: BackupFormat,
        include_filestore: bool,
        force: bool,
        if_exists: bool,
    ) -> Result<Self> {
        let db_name = db_name.into();
        let dest = dest.into();
        if !is_valid_db_name(&db_name) {
            return Err(BackupError::Config(format!(
                "Invalid database name: {:?}",
                db_name
            )));
        }
        if dest.as_os_str().is_empty() || dest.file_name().is_none() {
            return Err(BackupError::Config(format!(
                "Invalid destination: {:?}",
                dest
            )));
        }
        Ok(BackupRequest {
            db_name,
            dest,
            format,
            // A bare dump never carries the filestore.
            include_filestore: include_filestore && format != BackupFormat::Dump,
            force,
            if_exists,
        })
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    pub fn format(&self) -> BackupFormat {
        self.format
    }

    pub fn include_filestore(&self) -> bool {
        self.include_filestore
    }

    pub fn force(&self) -> bool {
        self.force
    }

    pub fn if_exists(&self) -> bool {
        self.if_exists
    }
}
