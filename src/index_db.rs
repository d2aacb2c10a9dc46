//! Derived SQLite index: schema versioning, forward migrations, corruption
//! detection and rebuild-from-manifest.
//!
//! The index is disposable. Everything in it is either re-derivable from the
//! manifest (search rows, cross references) or a cache (previews, snapshots),
//! so a damaged file is quarantined and replaced rather than repaired.
//!
//! Connections are opened per operation; WAL lets readers keep working while a
//! rebuild transaction is open, and they only observe the new rows on commit.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::IndexConfig;
use crate::document::ProjectDocument;
use crate::error::{IoContext, Result, VaultError};
use crate::projection::{project, tags_column, Projection};
use crate::search::register_fold;
use crate::util::{blake3_hash, unique_stamped_path};

pub(crate) const INDEX_DIR: &str = ".panelvault";
pub(crate) const INDEX_FILE: &str = "index.sqlite";
pub(crate) const INDEX_BACKUP_DIR: &str = "backups";

/// Highest schema id this build knows how to produce.
pub(crate) const SCHEMA_VERSION: i64 = 3;

const BOOTSTRAP_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS index_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
";

const V1_SQL: &str = "
CREATE TABLE IF NOT EXISTS search_docs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    doc_id TEXT NOT NULL UNIQUE,
    doc_type TEXT NOT NULL,
    path TEXT NOT NULL,
    page_id TEXT,
    page_number INTEGER,
    character_id TEXT,
    text TEXT NOT NULL DEFAULT '',
    tags TEXT NOT NULL DEFAULT ''
);

CREATE VIRTUAL TABLE IF NOT EXISTS search_fts USING fts5(
    text,
    content='search_docs', content_rowid='id',
    tokenize='unicode61'
);

CREATE TRIGGER IF NOT EXISTS search_docs_ai AFTER INSERT ON search_docs BEGIN
    INSERT INTO search_fts(rowid, text) VALUES (new.id, new.text);
END;

CREATE TRIGGER IF NOT EXISTS search_docs_ad AFTER DELETE ON search_docs BEGIN
    INSERT INTO search_fts(search_fts, rowid, text) VALUES ('delete', old.id, old.text);
END;

CREATE TRIGGER IF NOT EXISTS search_docs_au AFTER UPDATE ON search_docs BEGIN
    INSERT INTO search_fts(search_fts, rowid, text) VALUES ('delete', old.id, old.text);
    INSERT INTO search_fts(rowid, text) VALUES (new.id, new.text);
END;

CREATE TABLE IF NOT EXISTS crossrefs (
    from_id TEXT NOT NULL,
    to_id TEXT NOT NULL,
    PRIMARY KEY (from_id, to_id)
);

CREATE TABLE IF NOT EXISTS previews (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    page_id TEXT NOT NULL,
    panel_id TEXT NOT NULL DEFAULT '',
    kind TEXT NOT NULL,
    width INTEGER NOT NULL,
    height INTEGER NOT NULL,
    blob BLOB NOT NULL,
    bytes INTEGER NOT NULL,
    checksum TEXT NOT NULL,
    UNIQUE (page_id, panel_id, kind, width, height)
);

CREATE TABLE IF NOT EXISTS snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    subject_kind TEXT NOT NULL,
    subject_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    payload BLOB NOT NULL
);
";

const V3_SQL: &str = "
CREATE INDEX IF NOT EXISTS idx_search_docs_page ON search_docs(page_number, doc_id);
CREATE INDEX IF NOT EXISTS idx_search_docs_type ON search_docs(doc_type, page_number, doc_id);
CREATE INDEX IF NOT EXISTS idx_crossrefs_to ON crossrefs(to_id, from_id);
CREATE INDEX IF NOT EXISTS idx_previews_access ON previews(last_access_at);
CREATE INDEX IF NOT EXISTS idx_snapshots_subject ON snapshots(subject_kind, subject_id, created_at);
";

struct Migration {
    version: i64,
    name: &'static str,
    apply: fn(&Connection) -> rusqlite::Result<()>,
}

static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "base tables",
        apply: migrate_base_tables,
    },
    Migration {
        version: 2,
        name: "preview access tracking",
        apply: migrate_preview_tracking,
    },
    Migration {
        version: 3,
        name: "composite indexes",
        apply: migrate_composite_indexes,
    },
];

fn migrate_base_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(V1_SQL)
}

fn migrate_preview_tracking(conn: &Connection) -> rusqlite::Result<()> {
    add_column_if_missing(conn, "previews", "last_access_at", "INTEGER")?;
    add_column_if_missing(conn, "previews", "created_at", "INTEGER")
}

fn migrate_composite_indexes(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(V3_SQL)
}

fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    decl: &str,
) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let exists = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .filter_map(|r| r.ok())
        .any(|name| name == column);
    if !exists {
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))?;
    }
    Ok(())
}

pub(crate) fn apply_pragmas(conn: &Connection, busy_timeout_ms: u64) -> Result<()> {
    conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA cache_size = -8000;",
    )?;
    Ok(())
}

pub(crate) fn schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .optional()?
        .flatten()
        .unwrap_or(0);
    Ok(version)
}

/// Bring the schema to `SCHEMA_VERSION`. Each step commits together with its version bump.
pub(crate) fn migrate(conn: &Connection, busy_timeout_ms: u64) -> Result<i64> {
    conn.execute_batch(BOOTSTRAP_SQL)?;
    let mut current = schema_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(VaultError::Conflict(format!(
            "index schema {current} is newer than supported {SCHEMA_VERSION}"
        )));
    }
    let start = current;
    for step in MIGRATIONS.iter().filter(|m| m.version > start) {
        let tx = begin_immediate(conn, busy_timeout_ms)?;
        // Another connection may have migrated while we waited for the lock.
        if schema_version(&tx)? >= step.version {
            tx.commit()?;
            continue;
        }
        (step.apply)(&tx)?;
        tx.execute("DELETE FROM schema_version", [])?;
        tx.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            params![step.version],
        )?;
        tx.commit()?;
        info!(version = step.version, step = step.name, "index schema migrated");
        current = step.version;
    }
    Ok(current)
}

/// `BEGIN IMMEDIATE`, retrying on busy until `timeout_ms` elapses.
///
/// The connection's busy handler already waits; the loop covers the cases
/// where SQLite returns `SQLITE_BUSY` without consulting it.
pub(crate) fn begin_immediate(conn: &Connection, timeout_ms: u64) -> Result<Transaction<'_>> {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let mut wait = Duration::from_millis(5);
    loop {
        match Transaction::new_unchecked(conn, TransactionBehavior::Immediate) {
            Ok(tx) => return Ok(tx),
            Err(err) => {
                let err = VaultError::from(err);
                if !err.is_busy() || Instant::now() >= deadline {
                    return Err(err);
                }
                debug!(?wait, "database busy, retrying");
                thread::sleep(wait);
                wait = (wait * 2).min(Duration::from_millis(200));
            }
        }
    }
}

pub(crate) fn meta_get(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row("SELECT value FROM index_meta WHERE key = ?1", params![key], |row| {
            row.get::<_, String>(0)
        })
        .optional()?)
}

pub(crate) fn meta_set(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO index_meta (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, Utc::now().timestamp()],
    )?;
    Ok(())
}

pub(crate) fn document_hash(document: &ProjectDocument) -> Result<String> {
    let bytes = serde_json::to_vec(document)?;
    Ok(blake3_hash(&bytes).to_hex().to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub(crate) enum IndexHealth {
    Healthy,
    Rebuilt { backup: PathBuf },
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct RebuildReport {
    pub(crate) documents: usize,
    pub(crate) crossrefs: usize,
    pub(crate) document_hash: String,
    pub(crate) elapsed_ms: u128,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct IndexStatus {
    pub(crate) path: PathBuf,
    pub(crate) schema_version: i64,
    pub(crate) documents: usize,
    pub(crate) crossrefs: usize,
    pub(crate) previews: usize,
    pub(crate) preview_bytes: u64,
    pub(crate) snapshots: usize,
    pub(crate) document_hash: Option<String>,
    pub(crate) last_rebuild_at: Option<String>,
}

/// Handle on a project's index file. Cheap to clone; holds no connection.
#[derive(Debug, Clone)]
pub(crate) struct IndexStore {
    root: PathBuf,
    path: PathBuf,
    busy_timeout_ms: u64,
}

impl IndexStore {
    pub(crate) fn for_project(root: &Path, config: &IndexConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            path: root.join(INDEX_DIR).join(INDEX_FILE),
            busy_timeout_ms: config.busy_timeout_ms,
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn busy_timeout_ms(&self) -> u64 {
        self.busy_timeout_ms
    }

    pub(crate) fn backup_dir(&self) -> PathBuf {
        self.root.join(INDEX_DIR).join(INDEX_BACKUP_DIR)
    }

    /// Open a fresh connection with the schema at the current version.
    pub(crate) fn connect(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).at(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        apply_pragmas(&conn, self.busy_timeout_ms)?;
        register_fold(&conn)?;
        migrate(&conn, self.busy_timeout_ms)?;
        Ok(conn)
    }

    /// Open and run `PRAGMA quick_check`.
    pub(crate) fn quick_check(&self) -> Result<()> {
        let conn = self.connect()?;
        let verdict: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if verdict != "ok" {
            return Err(VaultError::Corrupt(format!("quick_check: {verdict}")));
        }
        Ok(())
    }

    /// Check the index; if it is damaged, quarantine it and rebuild from `document`.
    pub(crate) fn detect_and_rebuild(&self, document: &ProjectDocument) -> Result<IndexHealth> {
        match self.quick_check() {
            Ok(()) => Ok(IndexHealth::Healthy),
            Err(err) if err.is_corruption() => {
                warn!(path = %self.path.display(), error = %err, "index damaged, rebuilding");
                let backup = self.quarantine()?;
                self.rebuild(document)?;
                Ok(IndexHealth::Rebuilt { backup })
            }
            Err(err) => Err(err),
        }
    }

    /// Move the index and its WAL/SHM siblings into the backups folder.
    fn quarantine(&self) -> Result<PathBuf> {
        let dir = self.backup_dir();
        fs::create_dir_all(&dir).at(&dir)?;
        let target = unique_stamped_path(Utc::now(), |stamp| dir.join(format!("index.{stamp}.corrupt")));
        fs::rename(&self.path, &target).at(&self.path)?;
        for suffix in ["-wal", "-shm"] {
            let side = sidecar(&self.path, suffix);
            if side.exists() {
                let to = sidecar(&target, suffix);
                fs::rename(&side, &to).at(&side)?;
            }
        }
        info!(backup = %target.display(), "damaged index preserved");
        Ok(target)
    }

    /// Replace all search rows and cross references with a fresh projection.
    pub(crate) fn rebuild(&self, document: &ProjectDocument) -> Result<RebuildReport> {
        let started = Instant::now();
        let projection = project(document)?;
        let hash = document_hash(document)?;
        let conn = self.connect()?;
        let tx = begin_immediate(&conn, self.busy_timeout_ms)?;
        write_projection(&tx, &projection)?;
        meta_set(&tx, "document_hash", &hash)?;
        meta_set(&tx, "last_rebuild_at", &Utc::now().to_rfc3339())?;
        tx.commit()?;

        let report = RebuildReport {
            documents: projection.docs.len(),
            crossrefs: projection.refs.len(),
            document_hash: hash,
            elapsed_ms: started.elapsed().as_millis(),
        };
        info!(
            documents = report.documents,
            crossrefs = report.crossrefs,
            elapsed_ms = report.elapsed_ms as u64,
            "index rebuilt"
        );
        Ok(report)
    }

    /// Rebuild only when the stored document hash differs. Returns whether it rebuilt.
    pub(crate) fn ensure_fresh(&self, document: &ProjectDocument) -> Result<bool> {
        let hash = document_hash(document)?;
        let conn = self.connect()?;
        if meta_get(&conn, "document_hash")?.as_deref() == Some(hash.as_str()) {
            debug!("index already fresh");
            return Ok(false);
        }
        drop(conn);
        self.rebuild(document)?;
        Ok(true)
    }

    pub(crate) fn status(&self) -> Result<IndexStatus> {
        let conn = self.connect()?;
        let count = |sql: &str| -> Result<i64> { Ok(conn.query_row(sql, [], |row| row.get(0))?) };
        Ok(IndexStatus {
            path: self.path.clone(),
            schema_version: schema_version(&conn)?,
            documents: count("SELECT COUNT(*) FROM search_docs")? as usize,
            crossrefs: count("SELECT COUNT(*) FROM crossrefs")? as usize,
            previews: count("SELECT COUNT(*) FROM previews")? as usize,
            preview_bytes: count("SELECT COALESCE(SUM(bytes), 0) FROM previews")? as u64,
            snapshots: count("SELECT COUNT(*) FROM snapshots")? as usize,
            document_hash: meta_get(&conn, "document_hash")?,
            last_rebuild_at: meta_get(&conn, "last_rebuild_at")?,
        })
    }
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn write_projection(tx: &Transaction, projection: &Projection) -> Result<()> {
    tx.execute("DELETE FROM search_docs", [])?;
    tx.execute("DELETE FROM crossrefs", [])?;
    {
        let mut insert = tx.prepare(
            "INSERT INTO search_docs (doc_id, doc_type, path, page_id, page_number, character_id, text, tags)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for doc in &projection.docs {
            insert.execute(params![
                doc.doc_id,
                doc.doc_type.as_str(),
                doc.path,
                doc.page_id,
                doc.page_number,
                doc.character_id,
                doc.text,
                tags_column(&doc.tags),
            ])?;
        }
        let mut link =
            tx.prepare("INSERT OR IGNORE INTO crossrefs (from_id, to_id) VALUES (?1, ?2)")?;
        for edge in &projection.refs {
            link.execute(params![edge.from_id, edge.to_id])?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::fixtures::{accented, sample};

    fn store(dir: &Path) -> IndexStore {
        IndexStore::for_project(dir, &IndexConfig::default())
    }

    fn column_names(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})")).unwrap();
        stmt.query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn fresh_index_reaches_latest_schema() {
        let dir = tempfile::tempdir().unwrap();
        let conn = store(dir.path()).connect().unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
        assert!(column_names(&conn, "previews").contains(&"last_access_at".to_string()));
    }

    #[test]
    fn migrates_a_v1_index_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let index = store(dir.path());
        fs::create_dir_all(index.path().parent().unwrap()).unwrap();
        {
            let conn = Connection::open(index.path()).unwrap();
            conn.execute_batch(BOOTSTRAP_SQL).unwrap();
            conn.execute_batch(V1_SQL).unwrap();
            conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])
                .unwrap();
            conn.execute(
                "INSERT INTO previews (page_id, kind, width, height, blob, bytes, checksum)
                 VALUES ('p1', 'thumbnail', 10, 10, x'00', 1, 'c')",
                [],
            )
            .unwrap();
        }

        let conn = index.connect().unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
        let access: Option<i64> = conn
            .query_row("SELECT last_access_at FROM previews", [], |row| row.get(0))
            .unwrap();
        assert_eq!(access, None);
        let indexes: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'idx_previews_access'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(indexes, 1);
    }

    #[test]
    fn migration_steps_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let index = store(dir.path());
        let conn = index.connect().unwrap();
        conn.execute("DELETE FROM schema_version", []).unwrap();
        conn.execute("INSERT INTO schema_version (version) VALUES (1)", []).unwrap();
        assert_eq!(migrate(&conn, 1000).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn readers_keep_their_snapshot_while_rebuild_commits() {
        let dir = tempfile::tempdir().unwrap();
        let index = store(dir.path());
        let first = index.rebuild(&sample()).unwrap();

        let reader = index.connect().unwrap();
        let read = reader.unchecked_transaction().unwrap();
        let count = |conn: &Connection| -> i64 {
            conn.query_row("SELECT COUNT(*) FROM search_docs", [], |row| row.get(0)).unwrap()
        };
        assert_eq!(count(&*read), first.documents as i64);

        let second = index.rebuild(&accented()).unwrap();
        assert_ne!(second.documents, first.documents);
        assert_eq!(count(&*read), first.documents as i64);
        assert_eq!(
            meta_get(&read, "document_hash").unwrap().as_deref(),
            Some(first.document_hash.as_str())
        );
        read.rollback().unwrap();

        assert_eq!(count(&reader), second.documents as i64);
        assert_eq!(index.status().unwrap().document_hash.as_deref(), Some(second.document_hash.as_str()));
    }

    #[test]
    fn rebuild_populates_rows() {
        let dir = tempfile::tempdir().unwrap();
        let index = store(dir.path());
        let report = index.rebuild(&sample()).unwrap();
        assert_eq!(report.documents, 8);
        let status = index.status().unwrap();
        assert_eq!(status.documents, 8);
        assert_eq!(status.crossrefs, report.crossrefs);
        assert_eq!(status.document_hash.as_deref(), Some(report.document_hash.as_str()));
    }

    #[test]
    fn ensure_fresh_skips_unchanged_document() {
        let dir = tempfile::tempdir().unwrap();
        let index = store(dir.path());
        let mut doc = sample();
        assert!(index.ensure_fresh(&doc).unwrap());
        assert!(!index.ensure_fresh(&doc).unwrap());
        doc.name = "changed".into();
        assert!(index.ensure_fresh(&doc).unwrap());
    }

    #[test]
    fn healthy_index_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let index = store(dir.path());
        index.rebuild(&sample()).unwrap();
        assert_eq!(index.detect_and_rebuild(&sample()).unwrap(), IndexHealth::Healthy);
    }

    #[test]
    fn corrupt_index_is_quarantined_and_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let index = store(dir.path());
        index.rebuild(&sample()).unwrap();
        let _ = fs::remove_file(sidecar(index.path(), "-wal"));
        let _ = fs::remove_file(sidecar(index.path(), "-shm"));
        fs::write(index.path(), b"this is not a sqlite database, just noise ".repeat(200)).unwrap();

        let health = index.detect_and_rebuild(&sample()).unwrap();
        let IndexHealth::Rebuilt { backup } = health else {
            panic!("expected rebuild, got {health:?}");
        };
        assert!(backup.starts_with(index.backup_dir()));
        assert!(fs::read(&backup).unwrap().starts_with(b"this is not a sqlite"));
        assert_eq!(index.status().unwrap().documents, 8);
    }

    #[test]
    fn rebuild_rejects_invalid_document_without_touching_rows() {
        let dir = tempfile::tempdir().unwrap();
        let index = store(dir.path());
        index.rebuild(&sample()).unwrap();
        let mut bad = sample();
        let dup = bad.issues[0].pages[0].panels[0].clone();
        bad.issues[0].pages[1].panels.push(dup);
        assert!(matches!(index.rebuild(&bad), Err(VaultError::Validation(_))));
        assert_eq!(index.status().unwrap().documents, 8);
    }
}
