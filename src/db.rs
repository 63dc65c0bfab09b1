use crate::AffinityError;
use crate::schema::MIGRATIONS;
use rusqlite::Connection;
use std::path::{Path, PathBuf};

#[cfg(unix)]
fn ensure_secure_permissions(db_path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(dir) = db_path.parent()
        && !dir.as_os_str().is_empty()
        && !dir.exists()
    {
        std::fs::create_dir_all(dir)?;
        // Only tighten dirs we created
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    if db_path.exists() {
        std::fs::set_permissions(db_path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_secure_permissions(db_path: &Path) -> std::io::Result<()> {
    if let Some(dir) = db_path.parent()
        && !dir.as_os_str().is_empty()
        && !dir.exists()
    {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

pub fn default_db_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".affinity").join("affinity.db")
}

/// Apply standard PRAGMAs (before migrations).
fn apply_pragmas(conn: &Connection) -> Result<(), AffinityError> {
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

pub fn open_db(db_path: &Path) -> Result<Connection, AffinityError> {
    ensure_secure_permissions(db_path)?;

    let mut conn = Connection::open(db_path)?;
    apply_pragmas(&conn)?;
    MIGRATIONS.to_latest(&mut conn)?;

    #[cfg(unix)]
    {
        if db_path.exists() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(db_path, std::fs::Permissions::from_mode(0o600))?;
        }
    }

    log::debug!("opened database {}", db_path.display());
    Ok(conn)
}

/// Fresh migrated in-memory database. Used by tests and dry runs.
pub fn open_memory_db() -> Result<Connection, AffinityError> {
    let mut conn = Connection::open_in_memory()?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    MIGRATIONS.to_latest(&mut conn)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_db_creates_parent_and_migrates() {
        let dir = tempfile::TempDir::new().unwrap();
        let db_path = dir.path().join("nested").join("affinity.db");

        let conn = open_db(&db_path).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM model_versions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
        assert!(db_path.exists());

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |r| r.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn reopen_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let db_path = dir.path().join("affinity.db");
        drop(open_db(&db_path).unwrap());
        let conn = open_db(&db_path).unwrap();
        conn.execute("INSERT INTO preferences (name) VALUES ('again')", [])
            .unwrap();
    }
}
