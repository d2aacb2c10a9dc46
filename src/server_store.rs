//! Authoritative relational store behind the sync server.
//!
//! One SQLite file holds every project: the per-project version counter, the
//! append-only operation log, published index snapshots, and the
//! project-scoped search tables that answer remote queries with the same SQL
//! builder as the local index.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::{IoContext, Result, VaultError};
use crate::index_db::{apply_pragmas, begin_immediate};
use crate::projection::{tags_column, DocType};
use crate::protocol::{
    IndexSnapshot, LoggedOp, ProjectInfo, PublishIndexRequest, PullResponse, PushRequest, PushResponse,
};
use crate::search::{
    register_fold, search_with, where_used_with, SearchBackend, SearchQuery, SearchResult, SearchTables, WhereUsed,
};
use crate::util::{blake3_hash, now_micros, random_token};

const SERVER_SQL: &str = "
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS project_versions (
    project_id TEXT PRIMARY KEY REFERENCES projects(id) ON DELETE CASCADE,
    version INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS project_members (
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    actor TEXT NOT NULL,
    PRIMARY KEY (project_id, actor)
);

CREATE TABLE IF NOT EXISTS api_tokens (
    token_hash TEXT PRIMARY KEY,
    actor TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_ops (
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    version INTEGER NOT NULL,
    op_id TEXT NOT NULL,
    actor TEXT NOT NULL,
    op_type TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (project_id, version),
    UNIQUE (project_id, op_id)
);

CREATE TABLE IF NOT EXISTS index_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    document_hash TEXT NOT NULL,
    published_by TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    payload TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_index_snapshots_project ON index_snapshots(project_id, id);

CREATE TABLE IF NOT EXISTS remote_docs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    doc_id TEXT NOT NULL,
    doc_type TEXT NOT NULL,
    path TEXT NOT NULL,
    page_id TEXT,
    page_number INTEGER,
    character_id TEXT,
    text TEXT NOT NULL DEFAULT '',
    tags TEXT NOT NULL DEFAULT '',
    UNIQUE (project_id, doc_id)
);

CREATE INDEX IF NOT EXISTS idx_remote_docs_page ON remote_docs(project_id, page_number, doc_id);

CREATE VIRTUAL TABLE IF NOT EXISTS remote_fts USING fts5(
    text,
    content='remote_docs', content_rowid='id',
    tokenize='unicode61'
);

CREATE TRIGGER IF NOT EXISTS remote_docs_ai AFTER INSERT ON remote_docs BEGIN
    INSERT INTO remote_fts(rowid, text) VALUES (new.id, new.text);
END;

CREATE TRIGGER IF NOT EXISTS remote_docs_ad AFTER DELETE ON remote_docs BEGIN
    INSERT INTO remote_fts(remote_fts, rowid, text) VALUES ('delete', old.id, old.text);
END;

CREATE TRIGGER IF NOT EXISTS remote_docs_au AFTER UPDATE ON remote_docs BEGIN
    INSERT INTO remote_fts(remote_fts, rowid, text) VALUES ('delete', old.id, old.text);
    INSERT INTO remote_fts(rowid, text) VALUES (new.id, new.text);
END;

CREATE TABLE IF NOT EXISTS remote_crossrefs (
    project_id TEXT NOT NULL,
    from_id TEXT NOT NULL,
    to_id TEXT NOT NULL,
    PRIMARY KEY (project_id, from_id, to_id)
);

CREATE INDEX IF NOT EXISTS idx_remote_crossrefs_to ON remote_crossrefs(project_id, to_id);
";

pub(crate) const REMOTE_TABLES: SearchTables = SearchTables {
    docs: "remote_docs",
    fts: "remote_fts",
    crossrefs: "remote_crossrefs",
    scope_column: Some("project_id"),
};

fn token_hash(token: &str) -> String {
    blake3_hash(token.as_bytes()).to_hex().to_string()
}

#[derive(Debug, Clone)]
pub(crate) struct ServerStore {
    path: PathBuf,
    busy_timeout_ms: u64,
    max_pull_limit: usize,
}

impl ServerStore {
    pub(crate) fn open(config: &ServerConfig, busy_timeout_ms: u64) -> Result<Self> {
        Self::open_at(&config.db_path, busy_timeout_ms, config.max_pull_limit)
    }

    pub(crate) fn open_at(path: &Path, busy_timeout_ms: u64, max_pull_limit: usize) -> Result<Self> {
        if max_pull_limit == 0 {
            return Err(VaultError::invalid("max_pull_limit must be positive"));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).at(parent)?;
        }
        let store = Self {
            path: path.to_path_buf(),
            busy_timeout_ms,
            max_pull_limit,
        };
        let conn = store.connect()?;
        conn.execute_batch(SERVER_SQL)?;
        Ok(store)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        apply_pragmas(&conn, self.busy_timeout_ms)?;
        register_fold(&conn)?;
        Ok(conn)
    }

    pub(crate) fn create_project(&self, id: Option<&str>, name: &str, members: &[String]) -> Result<ProjectInfo> {
        let name = name.trim();
        if name.is_empty() {
            return Err(VaultError::invalid("project name is empty"));
        }
        let id = match id.map(str::trim) {
            Some("") => return Err(VaultError::invalid("project id is empty")),
            Some(id) => id.to_string(),
            None => format!("prj-{}", Uuid::new_v4().simple()),
        };
        let conn = self.connect()?;
        let tx = begin_immediate(&conn, self.busy_timeout_ms)?;
        let exists: bool = tx
            .query_row("SELECT 1 FROM projects WHERE id = ?1", params![id], |_| Ok(true))
            .optional()?
            .unwrap_or(false);
        if exists {
            return Err(VaultError::Conflict(format!("project {id} already exists")));
        }
        let now = Utc::now().timestamp();
        tx.execute(
            "INSERT INTO projects (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![id, name, now],
        )?;
        tx.execute(
            "INSERT INTO project_versions (project_id, version, updated_at) VALUES (?1, 0, ?2)",
            params![id, now],
        )?;
        for actor in members {
            tx.execute(
                "INSERT OR IGNORE INTO project_members (project_id, actor) VALUES (?1, ?2)",
                params![id, actor],
            )?;
        }
        tx.commit()?;
        info!(project = %id, members = members.len(), "project created");
        Ok(ProjectInfo {
            id,
            name: name.to_string(),
            version: 0,
        })
    }

    pub(crate) fn add_member(&self, project_id: &str, actor: &str) -> Result<()> {
        let conn = self.connect()?;
        require_project(&conn, project_id)?;
        conn.execute(
            "INSERT OR IGNORE INTO project_members (project_id, actor) VALUES (?1, ?2)",
            params![project_id, actor],
        )?;
        Ok(())
    }

    /// Mint a bearer token for `actor`. Only its hash is stored.
    pub(crate) fn issue_token(&self, actor: &str) -> Result<String> {
        let token = random_token();
        self.register_token(actor, &token)?;
        Ok(token)
    }

    pub(crate) fn register_token(&self, actor: &str, token: &str) -> Result<()> {
        if actor.trim().is_empty() {
            return Err(VaultError::invalid("actor is empty"));
        }
        if token.len() < 16 {
            return Err(VaultError::invalid("token must be at least 16 characters"));
        }
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO api_tokens (token_hash, actor, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(token_hash) DO UPDATE SET actor = excluded.actor",
            params![token_hash(token), actor.trim(), Utc::now().timestamp()],
        )?;
        info!(actor = actor.trim(), "token issued");
        Ok(())
    }

    pub(crate) fn authenticate(&self, token: &str) -> Result<String> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT actor FROM api_tokens WHERE token_hash = ?1",
            params![token_hash(token)],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .ok_or_else(|| VaultError::Unauthorized("unknown token".to_string()))
    }

    pub(crate) fn list_projects(&self, actor: &str) -> Result<Vec<ProjectInfo>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT p.id, p.name, v.version FROM projects p
             JOIN project_versions v ON v.project_id = p.id
             JOIN project_members m ON m.project_id = p.id
             WHERE m.actor = ?1 ORDER BY p.id",
        )?;
        let rows = stmt.query_map(params![actor], |row| {
            Ok(ProjectInfo {
                id: row.get(0)?,
                name: row.get(1)?,
                version: row.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Projects are invisible to non-members, so both cases read as not found.
    pub(crate) fn require_member(&self, project_id: &str, actor: &str) -> Result<()> {
        let conn = self.connect()?;
        let member = conn
            .query_row(
                "SELECT 1 FROM project_members WHERE project_id = ?1 AND actor = ?2",
                params![project_id, actor],
                |_| Ok(()),
            )
            .optional()?;
        member.ok_or_else(|| VaultError::not_found(format!("project {project_id}")))
    }

    /// Append `request.ops` to the project's log under the write lock.
    ///
    /// Ops whose `op_id` is already logged are skipped, so a retried batch is
    /// harmless. Nothing is written when the project is missing or the batch
    /// is rejected.
    pub(crate) fn push(&self, project_id: &str, actor: &str, request: &PushRequest) -> Result<PushResponse> {
        if request.client_version < 0 {
            return Err(VaultError::invalid("client_version must not be negative"));
        }
        let mut batch_ids = HashSet::new();
        for op in &request.ops {
            if op.op_id.trim().is_empty() {
                return Err(VaultError::invalid("op_id is empty"));
            }
            if op.op_type.trim().is_empty() {
                return Err(VaultError::invalid(format!("op {} has no op_type", op.op_id)));
            }
            if !batch_ids.insert(op.op_id.as_str()) {
                return Err(VaultError::invalid(format!("duplicate op_id in batch: {}", op.op_id)));
            }
        }

        let conn = self.connect()?;
        let tx = begin_immediate(&conn, self.busy_timeout_ms)?;
        let mut version = current_version(&tx, project_id)?;
        if request.client_version > version {
            return Err(VaultError::Conflict(format!(
                "client_version {} is ahead of server version {version}",
                request.client_version
            )));
        }

        let now = now_micros();
        let mut accepted = 0usize;
        {
            let mut seen = tx.prepare("SELECT 1 FROM sync_ops WHERE project_id = ?1 AND op_id = ?2")?;
            let mut append = tx.prepare(
                "INSERT INTO sync_ops
                     (project_id, version, op_id, actor, op_type, entity_type, entity_id, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for op in &request.ops {
                if seen.exists(params![project_id, op.op_id])? {
                    debug!(project = project_id, op_id = %op.op_id, "op already logged, skipping");
                    continue;
                }
                version += 1;
                append.execute(params![
                    project_id,
                    version,
                    op.op_id,
                    actor,
                    op.op_type,
                    op.entity_type,
                    op.entity_id,
                    serde_json::to_string(&op.payload)?,
                    now,
                ])?;
                accepted += 1;
            }
        }
        if accepted > 0 {
            tx.execute(
                "UPDATE project_versions SET version = ?1, updated_at = ?2 WHERE project_id = ?3",
                params![version, Utc::now().timestamp(), project_id],
            )?;
        }
        tx.commit()?;

        info!(
            project = project_id,
            actor,
            accepted,
            skipped = request.ops.len() - accepted,
            server_version = version,
            "ops pushed"
        );
        Ok(PushResponse {
            project_id: project_id.to_string(),
            server_version: version,
            accepted,
        })
    }

    /// Ops with `version > since`, ascending, at most `limit` (capped by the server).
    pub(crate) fn pull(&self, project_id: &str, since: i64, limit: Option<usize>) -> Result<PullResponse> {
        if since < 0 {
            return Err(VaultError::invalid("since must not be negative"));
        }
        let limit = match limit {
            Some(0) => return Err(VaultError::invalid("limit must be positive")),
            Some(limit) => limit.min(self.max_pull_limit),
            None => self.max_pull_limit,
        };
        let conn = self.connect()?;
        let tx = rusqlite::Transaction::new_unchecked(&conn, TransactionBehavior::Deferred)?;
        let server_version = current_version(&tx, project_id)?;
        let mut ops = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT version, op_id, actor, op_type, entity_type, entity_id, payload, created_at
                 FROM sync_ops WHERE project_id = ?1 AND version > ?2
                 ORDER BY version ASC LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![project_id, since, limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            })?;
            for row in rows {
                let (version, op_id, actor, op_type, entity_type, entity_id, payload, created_at) = row?;
                ops.push(LoggedOp {
                    project_id: project_id.to_string(),
                    version,
                    op_id,
                    actor,
                    op_type,
                    entity_type,
                    entity_id,
                    payload: serde_json::from_str(&payload)?,
                    created_at,
                });
            }
        }
        tx.commit()?;
        debug!(project = project_id, since, returned = ops.len(), server_version, "ops pulled");
        Ok(PullResponse {
            project_id: project_id.to_string(),
            server_version,
            ops,
        })
    }

    /// Store a derived index snapshot and replace the project's remote search rows.
    pub(crate) fn publish_index(
        &self,
        project_id: &str,
        actor: &str,
        request: &PublishIndexRequest,
    ) -> Result<IndexSnapshot> {
        let mut ids = HashSet::new();
        for doc in &request.documents {
            if doc.doc_id.trim().is_empty() {
                return Err(VaultError::invalid("index document with empty doc_id"));
            }
            if !ids.insert(doc.doc_id.as_str()) {
                return Err(VaultError::invalid(format!("duplicate index doc id: {}", doc.doc_id)));
            }
        }

        let conn = self.connect()?;
        let tx = begin_immediate(&conn, self.busy_timeout_ms)?;
        require_project(&tx, project_id)?;
        let created_at = now_micros();
        tx.execute(
            "INSERT INTO index_snapshots (project_id, document_hash, published_by, created_at, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                project_id,
                request.document_hash,
                actor,
                created_at,
                serde_json::to_string(request)?
            ],
        )?;
        let snapshot_id = tx.last_insert_rowid();
        // Only the newest snapshot is served; older payloads are superseded.
        let superseded = tx.execute(
            "DELETE FROM index_snapshots WHERE project_id = ?1 AND id < ?2",
            params![project_id, snapshot_id],
        )?;
        tx.execute("DELETE FROM remote_docs WHERE project_id = ?1", params![project_id])?;
        tx.execute("DELETE FROM remote_crossrefs WHERE project_id = ?1", params![project_id])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO remote_docs
                     (project_id, doc_id, doc_type, path, page_id, page_number, character_id, text, tags)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for doc in &request.documents {
                insert.execute(params![
                    project_id,
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
            let mut link = tx.prepare(
                "INSERT OR IGNORE INTO remote_crossrefs (project_id, from_id, to_id) VALUES (?1, ?2, ?3)",
            )?;
            for edge in &request.crossrefs {
                link.execute(params![project_id, edge.from_id, edge.to_id])?;
            }
        }
        tx.commit()?;
        info!(
            project = project_id,
            snapshot_id,
            superseded,
            documents = request.documents.len(),
            "index snapshot published"
        );
        Ok(IndexSnapshot {
            project_id: project_id.to_string(),
            snapshot_id,
            document_hash: request.document_hash.clone(),
            published_by: actor.to_string(),
            created_at,
            documents: request.documents.clone(),
            crossrefs: request.crossrefs.clone(),
        })
    }

    pub(crate) fn latest_index(&self, project_id: &str) -> Result<IndexSnapshot> {
        let conn = self.connect()?;
        require_project(&conn, project_id)?;
        let row = conn
            .query_row(
                "SELECT id, published_by, created_at, payload FROM index_snapshots
                 WHERE project_id = ?1 ORDER BY id DESC LIMIT 1",
                params![project_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((snapshot_id, published_by, created_at, payload)) = row else {
            return Err(VaultError::not_found(format!("index snapshot for project {project_id}")));
        };
        let published: PublishIndexRequest = serde_json::from_str(&payload)?;
        Ok(IndexSnapshot {
            project_id: project_id.to_string(),
            snapshot_id,
            document_hash: published.document_hash,
            published_by,
            created_at,
            documents: published.documents,
            crossrefs: published.crossrefs,
        })
    }

    /// Search view over one project's published rows.
    pub(crate) fn project_search(&self, project_id: &str) -> ProjectSearch<'_> {
        ProjectSearch {
            store: self,
            project_id: project_id.to_string(),
        }
    }
}

fn require_project(conn: &Connection, project_id: &str) -> Result<()> {
    conn.query_row("SELECT 1 FROM projects WHERE id = ?1", params![project_id], |_| Ok(()))
        .optional()?
        .ok_or_else(|| VaultError::not_found(format!("project {project_id}")))
}

fn current_version(conn: &Connection, project_id: &str) -> Result<i64> {
    conn.query_row(
        "SELECT version FROM project_versions WHERE project_id = ?1",
        params![project_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| VaultError::not_found(format!("project {project_id}")))
}

pub(crate) struct ProjectSearch<'a> {
    store: &'a ServerStore,
    project_id: String,
}

impl SearchBackend for ProjectSearch<'_> {
    fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>> {
        let conn = self.store.connect()?;
        require_project(&conn, &self.project_id)?;
        search_with(&conn, &REMOTE_TABLES, Some(&self.project_id), query)
    }

    fn where_used(&self, doc_id: &str) -> Result<Vec<SearchResult>> {
        let conn = self.store.connect()?;
        require_project(&conn, &self.project_id)?;
        where_used_with(&conn, &REMOTE_TABLES, Some(&self.project_id), WhereUsed::DocId(doc_id))
    }

    fn where_used_by_path(&self, path: &str) -> Result<Vec<SearchResult>> {
        let conn = self.store.connect()?;
        require_project(&conn, &self.project_id)?;
        where_used_with(&conn, &REMOTE_TABLES, Some(&self.project_id), WhereUsed::Path(path))
    }
}

/// Count of published rows per document type, for status output.
pub(crate) fn type_counts(snapshot: &IndexSnapshot) -> Vec<(DocType, usize)> {
    DocType::ALL
        .into_iter()
        .map(|t| (t, snapshot.documents.iter().filter(|d| d.doc_type == t).count()))
        .filter(|(_, n)| *n > 0)
        .collect()
}
