// Database access collaborator: existence checks, sessions and the accounting insert.
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Connection, PgConnection};
use std::collections::BTreeMap;

use crate::backup::s3_upload::UploadRecord;
use crate::utils::{db_url_for, redact_url};

pub const ACCOUNTING_TABLE: &str = "s3_backup_created";

#[async_trait]
pub trait DatabaseAccess: Send + Sync {
    async fn exists(&self, db_name: &str) -> Result<bool>;

    async fn open_session(&self, db_name: &str) -> Result<Box<dyn Session>>;
}

/// One connection to one database. Reads are sequential; `close` releases it.
#[async_trait]
pub trait Session: Send {
    fn db_name(&self) -> &str;

    /// `server_version_num` of the server, e.g. 160002.
    async fn server_version_num(&mut self) -> Result<i32>;

    /// Installed component name -> installed version.
    async fn installed_modules(&mut self) -> Result<BTreeMap<String, String>>;

    /// Inserts the accounting row and commits it.
    async fn insert_upload_record(&mut self, record: &UploadRecord) -> Result<()>;

    async fn close(self: Box<Self>) -> Result<()>;
}

pub struct PgDatabaseAccess {
    server_url: String,
}

impl PgDatabaseAccess {
    pub fn new(server_url: impl Into<String>) -> Self {
        PgDatabaseAccess {
            server_url: server_url.into(),
        }
    }
}

#[async_trait]
impl DatabaseAccess for PgDatabaseAccess {
    async fn exists(&self, db_name: &str) -> Result<bool> {
        let admin_url = db_url_for(&self.server_url, "postgres")?;
        let mut conn = PgConnection::connect(&admin_url).await.with_context(|| {
            format!(
                "Failed to connect to 'postgres' database on {}",
                redact_url(&admin_url)
            )
        })?;

        let db_exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
                .bind(db_name)
                .fetch_one(&mut conn)
                .await
                .with_context(|| format!("Failed to check existence of database '{}'", db_name))?;

        conn.close().await.ok();
        Ok(db_exists)
    }

    async fn open_session(&self, db_name: &str) -> Result<Box<dyn Session>> {
        let db_url = db_url_for(&self.server_url, db_name)?;
        tracing::debug!("Opening session on {}", redact_url(&db_url));
        let conn = PgConnection::connect(&db_url)
            .await
            .with_context(|| format!("Failed to connect to database {}", db_name))?;
        Ok(Box::new(PgSession {
            db_name: db_name.to_string(),
            conn,
        }))
    }
}

pub struct PgSession {
    db_name: String,
    conn: PgConnection,
}

#[async_trait]
impl Session for PgSession {
    fn db_name(&self) -> &str {
        &self.db_name
    }

    async fn server_version_num(&mut self) -> Result<i32> {
        let raw: String = sqlx::query_scalar("SHOW server_version_num")
            .fetch_one(&mut self.conn)
            .await
            .context("Failed to read server_version_num")?;
        raw.trim()
            .parse()
            .with_context(|| format!("Unexpected server_version_num: {}", raw))
    }

    async fn installed_modules(&mut self) -> Result<BTreeMap<String, String>> {
        let rows: Vec<(String, Option<String>)> = sqlx::query_as(
            "SELECT name, latest_version FROM ir_module_module WHERE state = 'installed' ORDER BY name",
        )
        .fetch_all(&mut self.conn)
        .await
        .context("Failed to fetch installed modules from ir_module_module")?;

        Ok(rows
            .into_iter()
            .map(|(name, version)| (name, version.unwrap_or_default()))
            .collect())
    }

    async fn insert_upload_record(&mut self, record: &UploadRecord) -> Result<()> {
        let mut tx = self.conn.begin().await?;
        sqlx::query(&format!(
            "INSERT INTO {} (name, size, create_date, write_date) VALUES ($1, $2, $3, $4)",
            ACCOUNTING_TABLE
        ))
        .bind(&record.name)
        .bind(record.size_gb)
        .bind(record.created_at.naive_utc())
        .bind(record.written_at.naive_utc())
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to insert into {}", ACCOUNTING_TABLE))?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit {} row", ACCOUNTING_TABLE))?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let PgSession { db_name, conn } = *self;
        conn.close()
            .await
            .with_context(|| format!("Failed to close session on {}", db_name))
    }
}
