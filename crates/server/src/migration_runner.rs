//! Lightweight migration runner for rusqlite.
//!
//! Reads numbered SQL files from the `migrations/` directory, tracks applied
//! versions in `schema_versions`, and runs any pending migrations in order
//! at startup.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use rusqlite::{params, Connection};
use tracing::info;

/// Run all pending migrations against the given connection.
///
/// Call this at startup before any other database operations.
pub fn run_migrations(conn: &mut Connection) -> anyhow::Result<()> {
    // Pragmas for safe concurrent access
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )",
    )?;

    let migrations_dir = find_migrations_dir()?;

    let mut files: Vec<(i64, String, PathBuf)> = vec![];
    for entry in fs::read_dir(&migrations_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "sql") {
            let Some(name) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            if let Some(version) = parse_version(&name) {
                files.push((version, name, path));
            }
        }
    }
    files.sort_by_key(|(v, _, _)| *v);

    let applied: HashSet<i64> = conn
        .prepare("SELECT version FROM schema_versions")?
        .query_map([], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();

    let mut pending = 0;
    for (version, name, path) in &files {
        if applied.contains(version) {
            continue;
        }

        let sql = fs::read_to_string(path)?;
        conn.execute_batch(&sql)
            .map_err(|e| anyhow::anyhow!("migration {name} failed: {e}"))?;

        conn.execute(
            "INSERT OR IGNORE INTO schema_versions (version, name) VALUES (?1, ?2)",
            params![version, name],
        )?;

        info!(
            component = "migrations",
            event = "migration.applied",
            version = version,
            name = %name,
            "Applied migration"
        );
        pending += 1;
    }

    let total = files.len();
    info!(
        component = "migrations",
        event = "migrations.complete",
        total = total,
        applied = pending,
        skipped = total - pending,
        "Migration check complete"
    );

    Ok(())
}

/// Walk up from CARGO_MANIFEST_DIR to find the `migrations/` directory.
fn find_migrations_dir() -> anyhow::Result<PathBuf> {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    for ancestor in manifest_dir.ancestors() {
        let candidate = ancestor.join("migrations");
        if candidate.is_dir() {
            return Ok(candidate);
        }
    }
    anyhow::bail!(
        "Could not find migrations/ directory (searched from {})",
        manifest_dir.display()
    )
}

/// Extract numeric version prefix from a migration filename like "001_initial".
fn parse_version(name: &str) -> Option<i64> {
    name.split('_').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_version_prefix() {
        assert_eq!(parse_version("001_initial"), Some(1));
        assert_eq!(parse_version("012_groups"), Some(12));
        assert_eq!(parse_version("readme"), None);
    }

    #[test]
    fn migrations_apply_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut conn = Connection::open(dir.path().join("chat.db")).expect("open");

        run_migrations(&mut conn).expect("first run");
        run_migrations(&mut conn).expect("second run is a no-op");

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_versions", [], |row| row.get(0))
            .expect("count versions");
        assert!(count >= 1);
    }
}
