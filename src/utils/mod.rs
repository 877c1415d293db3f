pub mod logger;
pub mod setting;

use anyhow::{Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use url::Url;
use which::which;

/// Finds an executable in the system PATH, unless an explicit path was configured.
pub fn find_executable(name: &str, configured: Option<&Path>) -> Result<PathBuf> {
    match configured {
        Some(path) => {
            if path.is_file() {
                Ok(path.to_path_buf())
            } else {
                Err(anyhow::anyhow!(
                    "Configured {} executable does not exist: {}",
                    name,
                    path.display()
                ))
            }
        }
        None => which(name).with_context(|| {
            format!(
                "{} executable not found in PATH. Please ensure it is installed and in your PATH.",
                name
            )
        }),
    }
}

/// Database names go into URLs, file names and object keys; keep them to a safe alphabet.
pub fn is_valid_db_name(db_name: &str) -> bool {
    static DB_NAME: OnceLock<Regex> = OnceLock::new();
    let re = DB_NAME.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]*$").expect("valid regex"));
    re.is_match(db_name)
}

/// Points a server URL at one specific database.
pub fn db_url_for(server_url: &str, db_name: &str) -> Result<String> {
    let mut parsed = Url::parse(server_url)
        .with_context(|| format!("Invalid database URL format: {}", redact_url(server_url)))?;
    parsed.set_path(&format!("/{}", db_name));
    Ok(parsed.to_string())
}

/// URL with the password replaced, for log lines.
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_name_validation() {
        assert!(is_valid_db_name("shop"));
        assert!(is_valid_db_name("shop_prod-2.1"));
        assert!(!is_valid_db_name(""));
        assert!(!is_valid_db_name("-shop"));
        assert!(!is_valid_db_name("shop/../etc"));
        assert!(!is_valid_db_name("shop db"));
    }

    #[test]
    fn test_db_url_for_replaces_path() -> Result<()> {
        let url = db_url_for("postgres://odoo:pw@db:5433/postgres", "shop")?;
        assert_eq!(url, "postgres://odoo:pw@db:5433/shop");
        Ok(())
    }

    #[test]
    fn test_redact_url_hides_password() {
        let redacted = redact_url("postgres://odoo:hunter2@db:5432/shop");
        assert!(!redacted.contains("hunter2"));
        assert!(redacted.contains("odoo"));
        assert_eq!(redact_url("not a url"), "<invalid url>");
    }

    #[test]
    fn test_find_executable_rejects_missing_configured_path() {
        let missing = Path::new("/definitely/not/here/pg_dump");
        assert!(find_executable("pg_dump", Some(missing)).is_err());
    }
}
