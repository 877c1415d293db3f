// dbship/src/backup/manifest.rs
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::errors::{BackupError, Result};
use crate::utils::setting::Session;

pub const DUMP_FORMAT_VERSION: &str = "1";

/// Metadata document stored as the first member of every archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub odoo_dump: String,
    pub db_name: String,
    pub version: String,
    pub version_info: Vec<Value>,
    pub major_version: String,
    pub pg_version: String,
    pub modules: BTreeMap<String, String>,
}

impl Manifest {
    /// Reads the installed component set and server version through `session`.
    /// Nothing is written through the session.
    pub async fn build(session: &mut dyn Session, app_version: &str) -> Result<Manifest> {
        let db_name = session.db_name().to_string();
        let unavailable = |source: anyhow::Error| BackupError::SourceUnavailable {
            db_name: db_name.clone(),
            source,
        };

        let server_version = session.server_version_num().await.map_err(unavailable)?;
        let modules = session.installed_modules().await.map_err(unavailable)?;

        Ok(Manifest {
            odoo_dump: DUMP_FORMAT_VERSION.to_string(),
            db_name: db_name.clone(),
            version: app_version.to_string(),
            version_info: version_info(app_version),
            major_version: major_version(app_version),
            pg_version: pg_version(server_version),
            modules,
        })
    }

    /// Writes the manifest as pretty JSON (4-space indent).
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut ser)
            .map_err(|e| BackupError::Other(e.into()))?;
        fs::write(path, buf)?;
        Ok(())
    }
}

/// "major.minor" from a `server_version_num` such as 160002 or 90624.
pub fn pg_version(server_version_num: i32) -> String {
    format!(
        "{}.{}",
        server_version_num / 10000,
        (server_version_num / 100) % 100
    )
}

/// First two dotted components of the release string.
pub fn major_version(app_version: &str) -> String {
    app_version
        .split('.')
        .take(2)
        .collect::<Vec<_>>()
        .join(".")
}

/// Release tuple: numeric components padded to three, then level, serial and suffix.
pub fn version_info(app_version: &str) -> Vec<Value> {
    let mut parts: Vec<Value> = app_version
        .split('.')
        .map_while(|p| p.parse::<u64>().ok())
        .take(3)
        .map(Value::from)
        .collect();
    while parts.len() < 3 {
        parts.push(json!(0));
    }
    parts.extend([json!("final"), json!(0), json!("")]);
    parts
}
