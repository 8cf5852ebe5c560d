//! Versioned schema migrations. Migration files are plain SQL named
//! `<version>.sql`; the stem is the version marker recorded in the
//! `migrations` table. A migration whose marker already exists is
//! skipped, so re-running a directory is harmless.

use chrono::Local;
use iqrfd_api::{Error, Result};
use rusqlite::Connection;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Applies all pending migrations from `dir`, returning how many
/// ran. An empty or unparsable migration file is a fatal
/// initialization error.
pub fn apply(conn: &Connection, dir: &Path) -> Result<usize> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS migrations ( \
	 version TEXT PRIMARY KEY NOT NULL, \
	 appliedAt TEXT NOT NULL)",
    )
    .map_err(|e| Error::StoreError(format!("migrations table: {}", e)))?;

    let executed = executed_versions(conn)?;
    let mut applied = 0;

    for version in available(dir)? {
        if executed.contains(&version) {
            continue;
        }

        let path = dir.join(format!("{}.sql", &version));
        let contents = fs::read_to_string(&path).map_err(|e| {
            Error::StoreError(format!(
                "unable to read migration file '{}': {}",
                path.display(),
                e
            ))
        })?;

        debug!("applying migration {}", &version);

        conn.execute_batch("BEGIN")
            .map_err(|e| Error::StoreError(format!("{}", e)))?;

        let res = apply_statements(conn, &contents, &version).and_then(|_| {
            conn.execute(
                "INSERT INTO migrations (version, appliedAt) VALUES (?1, ?2)",
                rusqlite::params![
                    version,
                    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
                ],
            )
            .map_err(|e| {
                Error::StoreError(format!("migration {}: {}", &version, e))
            })
        });

        match res {
            Ok(_) => {
                conn.execute_batch("COMMIT")
                    .map_err(|e| Error::StoreError(format!("{}", e)))?;
                applied += 1;
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(e);
            }
        }
    }
    Ok(applied)
}

/// Splits a migration file into statements (comment and blank lines
/// removed, `;` terminated) and executes them in order. A file with
/// no statements is an error.
pub fn apply_statements(
    conn: &Connection,
    contents: &str,
    version: &str,
) -> Result<()> {
    let body = contents
        .lines()
        .filter(|line| !line.is_empty() && !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");

    let statements = body
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    if statements.is_empty() {
        return Err(Error::StoreError(format!(
            "empty migration file: {}",
            version
        )));
    }

    for statement in statements {
        conn.execute(statement, []).map_err(|e| {
            Error::StoreError(format!("migration {}: {}", version, e))
        })?;
    }
    Ok(())
}

fn executed_versions(conn: &Connection) -> Result<HashSet<String>> {
    let mut stmt = conn
        .prepare("SELECT version FROM migrations")
        .map_err(|e| Error::StoreError(format!("{}", e)))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| Error::StoreError(format!("{}", e)))?;

    rows.collect::<rusqlite::Result<HashSet<_>>>()
        .map_err(|e| Error::StoreError(format!("{}", e)))
}

// Migration file stems from the directory, lexically sorted.

fn available(dir: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(dir).map_err(|e| {
        Error::StoreError(format!(
            "migration directory '{}': {}",
            dir.display(),
            e
        ))
    })?;
    let mut stems = vec![];

    for entry in entries {
        let entry =
            entry.map_err(|e| Error::StoreError(format!("{}", e)))?;
        let path = entry.path();

        if path.is_file() && path.extension().is_some_and(|e| e == "sql") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                stems.push(stem.to_string());
            }
        }
    }
    stems.sort();
    Ok(stems)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("iqrfd-migrate-{}-{}", name, std::process::id()));

        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_apply_in_order_and_skip_applied() {
        let dir = scratch_dir("order");

        // Written out of order on purpose; lexical order of the
        // stems decides.

        write!(
            File::create(dir.join("0002_second.sql")).unwrap(),
            "INSERT INTO a (v) VALUES (2);"
        )
        .unwrap();
        write!(
            File::create(dir.join("0001_first.sql")).unwrap(),
            "CREATE TABLE a (v INTEGER);\nINSERT INTO a (v) VALUES (1);"
        )
        .unwrap();

        let conn = Connection::open_in_memory().unwrap();

        assert_eq!(apply(&conn, &dir).unwrap(), 2);

        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM a", [], |row| row.get(0))
            .unwrap();

        assert_eq!(n, 2);

        // Second run finds both markers and does nothing.

        assert_eq!(apply(&conn, &dir).unwrap(), 0);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_empty_migration_is_fatal() {
        let dir = scratch_dir("empty");

        write!(
            File::create(dir.join("0001_empty.sql")).unwrap(),
            "-- nothing here\n"
        )
        .unwrap();

        let conn = Connection::open_in_memory().unwrap();

        assert!(apply(&conn, &dir).is_err());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_directory_is_fatal() {
        let conn = Connection::open_in_memory().unwrap();

        assert!(apply(&conn, Path::new("/nonexistent/migrations")).is_err());
    }

    #[test]
    fn test_failed_migration_rolls_back() {
        let dir = scratch_dir("rollback");

        write!(
            File::create(dir.join("0001_bad.sql")).unwrap(),
            "CREATE TABLE b (v INTEGER);\nINSERT INTO missing (v) VALUES (1);"
        )
        .unwrap();

        let conn = Connection::open_in_memory().unwrap();

        assert!(apply(&conn, &dir).is_err());

        // The marker must not exist, so a fixed file can re-run.

        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))
            .unwrap();

        assert_eq!(n, 0);

        let _ = fs::remove_dir_all(&dir);
    }
}
