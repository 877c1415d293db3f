// dbship/src/backup/db_dump.rs
use anyhow::Context;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::backup::DumpDialect;
use crate::errors::{BackupError, Result};
use crate::utils::{db_url_for, find_executable, redact_url};

/// Produces a database snapshot in the requested dialect at `dest`.
#[async_trait]
pub trait DumpProducer: Send + Sync {
    /// Checks that the producer can run at all. Called once the source is known to exist.
    fn ensure_available(&self) -> Result<()> {
        Ok(())
    }

    async fn dump(&self, db_name: &str, dialect: DumpDialect, dest: &Path) -> Result<()>;
}

/// `pg_dump` driven as a subprocess, its stdout streamed straight into the destination file.
pub struct PgDump {
    /// Resolved executable, or why it could not be found.
    program: std::result::Result<PathBuf, String>,
    server_url: String,
}

impl PgDump {
    pub fn new(program: impl Into<PathBuf>, server_url: impl Into<String>) -> Self {
        PgDump {
            program: Ok(program.into()),
            server_url: server_url.into(),
        }
    }

    /// Uses the configured `pg_dump`, or the one on PATH. A missing executable is
    /// reported by `ensure_available`, not here.
    pub fn locate(configured: Option<&Path>, server_url: &str) -> Self {
        let program = match find_executable("pg_dump", configured) {
            Ok(program) => {
                tracing::debug!("Found pg_dump executable at: {}", program.display());
                Ok(program)
            }
            Err(e) => Err(format!("{:#}", e)),
        };
        PgDump {
            program,
            server_url: server_url.to_string(),
        }
    }

    fn program(&self) -> Result<&Path> {
        self.program
            .as_deref()
            .map_err(|reason| BackupError::Config(reason.to_string()))
    }

    pub fn command_args(&self, db_name: &str, dialect: DumpDialect) -> anyhow::Result<Vec<String>> {
        let mut args = vec!["--no-owner".to_string()];
        if dialect == DumpDialect::Custom {
            args.push("--format=c".to_string());
        }
        args.push(db_url_for(&self.server_url, db_name)?);
        Ok(args)
    }
}

#[async_trait]
impl DumpProducer for PgDump {
    fn ensure_available(&self) -> Result<()> {
        self.program().map(|_| ())
    }

    async fn dump(&self, db_name: &str, dialect: DumpDialect, dest: &Path) -> Result<()> {
        let program = self.program()?;
        let args = self.command_args(db_name, dialect)?;
        let printable: Vec<String> = args
            .iter()
            .map(|a| if a.contains("://") { redact_url(a) } else { a.clone() })
            .collect();
        tracing::info!(
            "Dumping {} to {} ({} {})",
            db_name,
            dest.display(),
            program.display(),
            printable.join(" ")
        );

        let mut child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to execute {}", program.display()))?;

        let mut stdout = child.stdout.take().context("pg_dump stdout was not captured")?;
        let mut stderr = child.stderr.take().context("pg_dump stderr was not captured")?;

        // Drained concurrently so a chatty stderr cannot stall the stdout pipe.
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).await.map(|_| buf)
        });

        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("Failed to create dump file: {}", dest.display()))?;
        let written = tokio::io::copy(&mut stdout, &mut file)
            .await
            .with_context(|| format!("Failed to stream pg_dump output into {}", dest.display()))?;
        file.flush().await?;
        file.sync_all().await?;

        let status = child.wait().await.context("Failed to wait for pg_dump")?;
        let stderr_bytes = stderr_task
            .await
            .context("pg_dump stderr reader panicked")?
            .context("Failed to read pg_dump stderr")?;

        if !status.success() {
            return Err(BackupError::DumpFailed {
                db_name: db_name.to_string(),
                status: status.to_string(),
                stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
            });
        }

        tracing::info!("✓ Dump of {} written ({} bytes)", db_name, written);
        Ok(())
    }
}
