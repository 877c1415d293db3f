// Fakes for the trait seams of the backup pipeline.
use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::backup::DumpDialect;
use crate::backup::db_dump::DumpProducer;
use crate::backup::s3_upload::{ObjectStore, UploadRecord};
use crate::errors::{BackupError, Result};
use crate::utils::setting::{DatabaseAccess, Session};

pub(crate) struct FakeSession {
    pub db_name: String,
    pub server_version: Option<i32>,
    pub modules: BTreeMap<String, String>,
    pub records: Arc<Mutex<Vec<UploadRecord>>>,
    pub closed: Arc<AtomicUsize>,
}

impl FakeSession {
    pub fn standalone(db_name: &str) -> Self {
        FakeSession {
            db_name: db_name.to_string(),
            server_version: Some(160002),
            modules: default_modules(),
            records: Arc::default(),
            closed: Arc::default(),
        }
    }
}

fn default_modules() -> BTreeMap<String, String> {
    [("base", "16.0.1.3"), ("sale", "16.0.1.2")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[async_trait]
impl Session for FakeSession {
    fn db_name(&self) -> &str {
        &self.db_name
    }

    async fn server_version_num(&mut self) -> anyhow::Result<i32> {
        self.server_version
            .ok_or_else(|| anyhow!("permission denied for server_version_num"))
    }

    async fn installed_modules(&mut self) -> anyhow::Result<BTreeMap<String, String>> {
        Ok(self.modules.clone())
    }

    async fn insert_upload_record(&mut self, record: &UploadRecord) -> anyhow::Result<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn close(self: Box<Self>) -> anyhow::Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct FakeDatabase {
    pub present: bool,
    pub server_version: Option<i32>,
    pub records: Arc<Mutex<Vec<UploadRecord>>>,
    pub opened: Arc<AtomicUsize>,
    pub closed: Arc<AtomicUsize>,
}

impl FakeDatabase {
    pub fn new(present: bool) -> Self {
        FakeDatabase {
            present,
            server_version: Some(160002),
            records: Arc::default(),
            opened: Arc::default(),
            closed: Arc::default(),
        }
    }

    pub fn records(&self) -> Vec<UploadRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl DatabaseAccess for FakeDatabase {
    async fn exists(&self, _db_name: &str) -> anyhow::Result<bool> {
        Ok(self.present)
    }

    async fn open_session(&self, db_name: &str) -> anyhow::Result<Box<dyn Session>> {
        if !self.present {
            return Err(anyhow!("database \"{}\" does not exist", db_name));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            db_name: db_name.to_string(),
            server_version: self.server_version,
            modules: default_modules(),
            records: self.records.clone(),
            closed: self.closed.clone(),
        }))
    }
}

/// Writes a small marker dump, or fails like pg_dump would.
#[derive(Default)]
pub(crate) struct FakeDumper {
    pub calls: Arc<Mutex<Vec<(String, DumpDialect)>>>,
    pub fail: bool,
    /// Behave like a host without pg_dump installed.
    pub unavailable: bool,
}

#[async_trait]
impl DumpProducer for FakeDumper {
    fn ensure_available(&self) -> Result<()> {
        if self.unavailable {
            return Err(BackupError::Config(
                "pg_dump executable not found in PATH".to_string(),
            ));
        }
        Ok(())
    }

    async fn dump(&self, db_name: &str, dialect: DumpDialect, dest: &Path) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((db_name.to_string(), dialect));
        if self.fail {
            return Err(BackupError::DumpFailed {
                db_name: db_name.to_string(),
                status: "exit status: 1".to_string(),
                stderr: "pg_dump: error: connection refused".to_string(),
            });
        }
        std::fs::write(dest, format!("-- dump of {} ({:?})\n", db_name, dialect))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) enum HeadBehaviour {
    /// Report the size of what was put.
    #[default]
    Stored,
    Length(i64),
    Fail,
}

#[derive(Default)]
pub(crate) struct FakeStore {
    pub objects: Arc<Mutex<HashMap<String, u64>>>,
    pub puts: Arc<AtomicUsize>,
    pub heads: Arc<AtomicUsize>,
    pub fail_put: bool,
    pub head: HeadBehaviour,
}

#[async_trait]
impl ObjectStore for FakeStore {
    fn bucket(&self) -> &str {
        "test-bucket"
    }

    async fn put_file(&self, path: &Path, key: &str) -> anyhow::Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.fail_put {
            return Err(anyhow!("connection reset by peer"));
        }
        let len = std::fs::metadata(path)?.len();
        self.objects.lock().unwrap().insert(key.to_string(), len);
        Ok(())
    }

    async fn head_content_length(&self, key: &str) -> anyhow::Result<Option<i64>> {
        self.heads.fetch_add(1, Ordering::SeqCst);
        match self.head {
            HeadBehaviour::Stored => Ok(self
                .objects
                .lock()
                .unwrap()
                .get(key)
                .map(|len| *len as i64)),
            HeadBehaviour::Length(len) => Ok(Some(len)),
            HeadBehaviour::Fail => Err(anyhow!("404 Not Found")),
        }
    }
}
