//! Append-only change history per page or script, pruned to the newest K.

use std::fmt;

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, VaultError};
use crate::index_db::{begin_immediate, IndexStore};
use crate::util::now_micros;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum SubjectKind {
    Page,
    Script,
}

impl SubjectKind {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Page => "page",
            Self::Script => "script",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "page" => Some(Self::Page),
            "script" => Some(Self::Script),
            _ => None,
        }
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) struct Subject {
    pub(crate) kind: SubjectKind,
    pub(crate) id: String,
}

impl Subject {
    pub(crate) fn page(id: &str) -> Self {
        Self {
            kind: SubjectKind::Page,
            id: id.to_string(),
        }
    }

    pub(crate) fn script(id: &str) -> Self {
        Self {
            kind: SubjectKind::Script,
            id: id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct SnapshotMeta {
    pub(crate) id: i64,
    pub(crate) subject: Subject,
    pub(crate) created_at: i64,
    pub(crate) bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct SnapshotRecord {
    pub(crate) meta: SnapshotMeta,
    pub(crate) payload: Vec<u8>,
}

pub(crate) struct SnapshotLog {
    index: IndexStore,
    keep: usize,
}

fn meta_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, i64, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn to_meta((id, kind, subject_id, created_at, bytes): (i64, String, String, i64, i64)) -> Result<SnapshotMeta> {
    let kind = SubjectKind::parse(&kind)
        .ok_or_else(|| VaultError::Corrupt(format!("snapshot {id} has unknown subject kind {kind:?}")))?;
    Ok(SnapshotMeta {
        id,
        subject: Subject { kind, id: subject_id },
        created_at,
        bytes: bytes as usize,
    })
}

impl SnapshotLog {
    pub(crate) fn new(index: IndexStore, keep: usize) -> Self {
        Self { index, keep }
    }

    /// Append `payload` for `subject`, then prune the subject to the retention limit.
    pub(crate) fn record(&self, subject: &Subject, payload: &[u8]) -> Result<SnapshotMeta> {
        let conn = self.index.connect()?;
        let tx = begin_immediate(&conn, self.index.busy_timeout_ms())?;
        // Same-microsecond records still sort in insertion order.
        let last: Option<i64> = tx.query_row(
            "SELECT MAX(created_at) FROM snapshots WHERE subject_kind = ?1 AND subject_id = ?2",
            params![subject.kind.as_str(), subject.id],
            |row| row.get(0),
        )?;
        let now = now_micros();
        let created_at = match last {
            Some(last) if last >= now => last + 1,
            _ => now,
        };
        tx.execute(
            "INSERT INTO snapshots (subject_kind, subject_id, created_at, payload) VALUES (?1, ?2, ?3, ?4)",
            params![subject.kind.as_str(), subject.id, created_at, payload],
        )?;
        let id = tx.last_insert_rowid();
        let pruned = prune_in(&tx, subject, self.keep)?;
        tx.commit()?;
        debug!(kind = %subject.kind, subject = %subject.id, id, pruned, "snapshot recorded");
        Ok(SnapshotMeta {
            id,
            subject: subject.clone(),
            created_at,
            bytes: payload.len(),
        })
    }

    /// Newest first, metadata only.
    pub(crate) fn list(&self, subject: &Subject, limit: usize) -> Result<Vec<SnapshotMeta>> {
        let conn = self.index.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, subject_kind, subject_id, created_at, length(payload) FROM snapshots
             WHERE subject_kind = ?1 AND subject_id = ?2
             ORDER BY created_at DESC, id DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![subject.kind.as_str(), subject.id, limit as i64],
            meta_from_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(to_meta(row?)?);
        }
        Ok(out)
    }

    pub(crate) fn get(&self, id: i64) -> Result<SnapshotRecord> {
        let conn = self.index.connect()?;
        let row = conn
            .query_row(
                "SELECT id, subject_kind, subject_id, created_at, length(payload), payload
                 FROM snapshots WHERE id = ?1",
                params![id],
                |row| Ok((meta_from_row(row)?, row.get::<_, Vec<u8>>(5)?)),
            )
            .optional()?;
        let Some((meta, payload)) = row else {
            return Err(VaultError::not_found(format!("snapshot {id}")));
        };
        Ok(SnapshotRecord {
            meta: to_meta(meta)?,
            payload,
        })
    }

    pub(crate) fn latest(&self, subject: &Subject) -> Result<Option<SnapshotRecord>> {
        match self.list(subject, 1)?.first() {
            Some(meta) => self.get(meta.id).map(Some),
            None => Ok(None),
        }
    }

    /// Delete all but the newest `keep` records of `subject`.
    pub(crate) fn prune(&self, subject: &Subject, keep: usize) -> Result<usize> {
        let conn = self.index.connect()?;
        let tx = begin_immediate(&conn, self.index.busy_timeout_ms())?;
        let removed = prune_in(&tx, subject, keep)?;
        tx.commit()?;
        Ok(removed)
    }
}

fn prune_in(conn: &rusqlite::Connection, subject: &Subject, keep: usize) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM snapshots
         WHERE subject_kind = ?1 AND subject_id = ?2
           AND id NOT IN (
               SELECT id FROM snapshots
               WHERE subject_kind = ?1 AND subject_id = ?2
               ORDER BY created_at DESC, id DESC LIMIT ?3
           )",
        params![subject.kind.as_str(), subject.id, keep as i64],
    )?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::document::fixtures::sample;

    fn log(dir: &std::path::Path, keep: usize) -> SnapshotLog {
        SnapshotLog::new(IndexStore::for_project(dir, &IndexConfig::default()), keep)
    }

    #[test]
    fn record_list_get() {
        let dir = tempfile::tempdir().unwrap();
        let log = log(dir.path(), 50);
        let page = Subject::page("p1");
        let first = log.record(&page, b"v1").unwrap();
        let second = log.record(&page, b"v2").unwrap();
        log.record(&Subject::script("s1"), b"draft").unwrap();

        let listed = log.list(&page, 10).unwrap();
        assert_eq!(listed.iter().map(|m| m.id).collect::<Vec<_>>(), vec![second.id, first.id]);
        assert!(listed[0].created_at > listed[1].created_at);
        assert_eq!(listed[0].bytes, 2);

        let record = log.get(first.id).unwrap();
        assert_eq!(record.payload, b"v1");
        assert_eq!(record.meta.subject, page);
        assert_eq!(log.latest(&page).unwrap().unwrap().payload, b"v2");
        assert!(log.latest(&Subject::page("p9")).unwrap().is_none());
    }

    #[test]
    fn missing_snapshot_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = log(dir.path(), 5).get(42).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn record_keeps_newest_k() {
        let dir = tempfile::tempdir().unwrap();
        let log = log(dir.path(), 3);
        let page = Subject::page("p1");
        for n in 0..5u8 {
            log.record(&page, &[n]).unwrap();
        }
        log.record(&Subject::page("p2"), b"other").unwrap();
        let kept: Vec<Vec<u8>> = log
            .list(&page, 10)
            .unwrap()
            .into_iter()
            .map(|m| log.get(m.id).unwrap().payload)
            .collect();
        assert_eq!(kept, vec![vec![4], vec![3], vec![2]]);
        assert_eq!(log.list(&Subject::page("p2"), 10).unwrap().len(), 1);
    }

    #[test]
    fn explicit_prune_returns_removed_count() {
        let dir = tempfile::tempdir().unwrap();
        let log = log(dir.path(), 50);
        let script = Subject::script("s1");
        for n in 0..4u8 {
            log.record(&script, &[n]).unwrap();
        }
        assert_eq!(log.prune(&script, 1).unwrap(), 3);
        assert_eq!(log.prune(&script, 1).unwrap(), 0);
        assert_eq!(log.latest(&script).unwrap().unwrap().payload, vec![3]);
    }

    #[test]
    fn snapshots_survive_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let index = IndexStore::for_project(dir.path(), &IndexConfig::default());
        let log = SnapshotLog::new(index.clone(), 50);
        log.record(&Subject::page("p1"), b"kept").unwrap();
        index.rebuild(&sample()).unwrap();
        assert_eq!(log.list(&Subject::page("p1"), 10).unwrap().len(), 1);
    }
}
