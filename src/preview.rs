//! Byte-bounded cache of rendered thumbnails and geometry blobs.
//!
//! Entries live in the `previews` table of the project index. Every write
//! enforces the byte cap inside the same transaction as the upsert, evicting
//! least-recently-touched rows first (never-touched rows before anything else).

use std::fmt;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, VaultError};
use crate::index_db::{begin_immediate, IndexStore};
use crate::util::{blake3_hash, now_micros};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) enum PreviewKind {
    #[serde(rename = "thumbnail")]
    Thumbnail,
    #[serde(rename = "geometry-cache")]
    GeometryCache,
}

impl PreviewKind {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Thumbnail => "thumbnail",
            Self::GeometryCache => "geometry-cache",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "thumbnail" => Some(Self::Thumbnail),
            "geometry-cache" | "geometry" => Some(Self::GeometryCache),
            _ => None,
        }
    }
}

impl fmt::Display for PreviewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) struct PreviewKey {
    pub(crate) page_id: String,
    #[serde(default)]
    pub(crate) panel_id: Option<String>,
    pub(crate) kind: PreviewKind,
    pub(crate) width: u32,
    pub(crate) height: u32,
}

impl PreviewKey {
    pub(crate) fn page(page_id: &str, kind: PreviewKind, width: u32, height: u32) -> Self {
        Self {
            page_id: page_id.to_string(),
            panel_id: None,
            kind,
            width,
            height,
        }
    }

    pub(crate) fn with_panel(mut self, panel_id: &str) -> Self {
        self.panel_id = Some(panel_id.to_string());
        self
    }

    /// The table stores "no panel" as `''` so the unique key covers it.
    fn panel_column(&self) -> &str {
        self.panel_id.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub(crate) struct PutReport {
    pub(crate) bytes: u64,
    pub(crate) evicted: usize,
    pub(crate) total_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub(crate) struct CacheStats {
    pub(crate) entries: usize,
    pub(crate) total_bytes: u64,
    pub(crate) max_bytes: u64,
}

pub(crate) struct PreviewCache {
    index: IndexStore,
    max_bytes: u64,
}

impl PreviewCache {
    pub(crate) fn new(index: IndexStore, max_bytes: u64) -> Self {
        Self { index, max_bytes }
    }

    pub(crate) fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Blob for `key`, touching its access time. `None` on a miss.
    pub(crate) fn get(&self, key: &PreviewKey) -> Result<Option<Vec<u8>>> {
        let conn = self.index.connect()?;
        let tx = begin_immediate(&conn, self.index.busy_timeout_ms())?;
        let row = tx
            .query_row(
                "SELECT id, blob, checksum FROM previews
                 WHERE page_id = ?1 AND panel_id = ?2 AND kind = ?3 AND width = ?4 AND height = ?5",
                params![key.page_id, key.panel_column(), key.kind.as_str(), key.width, key.height],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?, row.get::<_, String>(2)?)),
            )
            .optional()?;
        let Some((id, blob, checksum)) = row else {
            tx.commit()?;
            return Ok(None);
        };
        if blake3_hash(&blob).to_hex().as_str() != checksum {
            warn!(page_id = %key.page_id, kind = %key.kind, "preview checksum mismatch, dropping entry");
            tx.execute("DELETE FROM previews WHERE id = ?1", params![id])?;
            tx.commit()?;
            return Ok(None);
        }
        let touch = next_touch(&tx)?;
        tx.execute(
            "UPDATE previews SET last_access_at = ?1 WHERE id = ?2",
            params![touch, id],
        )?;
        tx.commit()?;
        Ok(Some(blob))
    }

    /// Upsert `blob` under `key`, then evict until the cache fits its cap.
    pub(crate) fn put(&self, key: &PreviewKey, blob: &[u8]) -> Result<PutReport> {
        let bytes = blob.len() as u64;
        if bytes > self.max_bytes {
            return Err(VaultError::invalid(format!(
                "preview of {bytes} bytes exceeds cache cap of {} bytes",
                self.max_bytes
            )));
        }
        let checksum = blake3_hash(blob).to_hex().to_string();

        let conn = self.index.connect()?;
        let tx = begin_immediate(&conn, self.index.busy_timeout_ms())?;
        let touch = next_touch(&tx)?;
        let id: i64 = tx.query_row(
            "INSERT INTO previews
                 (page_id, panel_id, kind, width, height, blob, bytes, checksum, last_access_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(page_id, panel_id, kind, width, height) DO UPDATE SET
                 blob = excluded.blob,
                 bytes = excluded.bytes,
                 checksum = excluded.checksum,
                 last_access_at = excluded.last_access_at
             RETURNING id",
            params![
                key.page_id,
                key.panel_column(),
                key.kind.as_str(),
                key.width,
                key.height,
                blob,
                bytes as i64,
                checksum,
                touch,
            ],
            |row| row.get(0),
        )?;
        let (evicted, total_bytes) = evict_to_cap(&tx, self.max_bytes, id)?;
        tx.commit()?;

        if evicted > 0 {
            info!(evicted, total_bytes, max_bytes = self.max_bytes, "preview cache evicted entries");
        }
        debug!(page_id = %key.page_id, kind = %key.kind, bytes, "preview stored");
        Ok(PutReport {
            bytes,
            evicted,
            total_bytes,
        })
    }

    /// Cached blob, or run `generate` once and store its output.
    ///
    /// Two callers missing at the same time may both generate; the upsert
    /// makes the last writer win.
    pub(crate) fn get_or_create<F>(&self, key: &PreviewKey, generate: F) -> Result<Vec<u8>>
    where
        F: FnOnce() -> Result<Vec<u8>>,
    {
        if let Some(blob) = self.get(key)? {
            return Ok(blob);
        }
        let blob = generate()?;
        self.put(key, &blob)?;
        Ok(blob)
    }

    pub(crate) fn invalidate_page(&self, page_id: &str) -> Result<usize> {
        let conn = self.index.connect()?;
        let removed = conn.execute("DELETE FROM previews WHERE page_id = ?1", params![page_id])?;
        debug!(page_id, removed, "page previews invalidated");
        Ok(removed)
    }

    pub(crate) fn stats(&self) -> Result<CacheStats> {
        let conn = self.index.connect()?;
        let (entries, total_bytes): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(bytes), 0) FROM previews",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(CacheStats {
            entries: entries as usize,
            total_bytes: total_bytes as u64,
            max_bytes: self.max_bytes,
        })
    }
}

/// Strictly increasing access stamp, even when the wall clock stalls or steps back.
fn next_touch(conn: &Connection) -> Result<i64> {
    let latest: Option<i64> =
        conn.query_row("SELECT MAX(last_access_at) FROM previews", [], |row| row.get(0))?;
    let now = now_micros();
    Ok(match latest {
        Some(latest) if latest >= now => latest + 1,
        _ => now,
    })
}

/// Delete the fewest least-recently-touched rows needed to fit `max_bytes`.
fn evict_to_cap(conn: &Connection, max_bytes: u64, keep_id: i64) -> Result<(usize, u64)> {
    let total: i64 = conn.query_row("SELECT COALESCE(SUM(bytes), 0) FROM previews", [], |row| row.get(0))?;
    let mut total = total as u64;
    if total <= max_bytes {
        return Ok((0, total));
    }

    let mut victims = Vec::new();
    {
        let mut stmt = conn.prepare(
            "SELECT id, bytes FROM previews WHERE id != ?1
             ORDER BY last_access_at IS NOT NULL, last_access_at, id",
        )?;
        let mut rows = stmt.query(params![keep_id])?;
        while total > max_bytes {
            let Some(row) = rows.next()? else {
                break;
            };
            let id: i64 = row.get(0)?;
            let bytes: i64 = row.get(1)?;
            victims.push(id);
            total = total.saturating_sub(bytes as u64);
        }
    }
    for id in &victims {
        conn.execute("DELETE FROM previews WHERE id = ?1", params![id])?;
    }
    Ok((victims.len(), total))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::config::IndexConfig;

    fn cache(dir: &std::path::Path, max_bytes: u64) -> PreviewCache {
        PreviewCache::new(IndexStore::for_project(dir, &IndexConfig::default()), max_bytes)
    }

    fn thumb(page: &str) -> PreviewKey {
        PreviewKey::page(page, PreviewKind::Thumbnail, 64, 96)
    }

    #[test]
    fn put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 1_000);
        assert_eq!(cache.get(&thumb("p1")).unwrap(), None);
        cache.put(&thumb("p1"), b"png-bytes").unwrap();
        assert_eq!(cache.get(&thumb("p1")).unwrap().as_deref(), Some(&b"png-bytes"[..]));

        let panel = thumb("p1").with_panel("p1-1");
        assert_eq!(cache.get(&panel).unwrap(), None);
        cache.put(&panel, b"panel").unwrap();
        cache.put(&thumb("p1"), b"replaced").unwrap();
        let stats = cache.stats().unwrap();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.total_bytes, (b"panel".len() + b"replaced".len()) as u64);
    }

    #[test]
    fn evicts_least_recently_touched_first() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 100);
        cache.put(&thumb("a"), &[1; 40]).unwrap();
        cache.put(&thumb("b"), &[2; 40]).unwrap();
        assert!(cache.get(&thumb("a")).unwrap().is_some());

        let report = cache.put(&thumb("c"), &[3; 40]).unwrap();
        assert_eq!(report.evicted, 1);
        assert_eq!(report.total_bytes, 80);
        assert!(cache.get(&thumb("b")).unwrap().is_none());
        assert!(cache.get(&thumb("a")).unwrap().is_some());
        assert!(cache.get(&thumb("c")).unwrap().is_some());
        assert!(cache.stats().unwrap().total_bytes <= 100);
    }

    #[test]
    fn never_touched_rows_go_first() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 100);
        cache.put(&thumb("fresh"), &[1; 50]).unwrap();
        {
            let conn = cache.index.connect().unwrap();
            conn.execute(
                "INSERT INTO previews (page_id, kind, width, height, blob, bytes, checksum)
                 VALUES ('legacy', 'thumbnail', 1, 1, ?1, 40, ?2)",
                params![vec![0u8; 40], blake3_hash(&[0u8; 40]).to_hex().to_string()],
            )
            .unwrap();
        }
        cache.put(&thumb("new"), &[2; 30]).unwrap();
        let conn = cache.index.connect().unwrap();
        let legacy: i64 = conn
            .query_row("SELECT COUNT(*) FROM previews WHERE page_id = 'legacy'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(legacy, 0);
        assert!(cache.get(&thumb("fresh")).unwrap().is_some());
    }

    #[test]
    fn oversized_blob_is_rejected_without_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 10);
        cache.put(&thumb("a"), &[1; 8]).unwrap();
        let err = cache.put(&thumb("b"), &[1; 11]).unwrap_err();
        assert!(matches!(err, VaultError::Validation(_)));
        assert_eq!(cache.stats().unwrap().entries, 1);
    }

    #[test]
    fn get_or_create_generates_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 1_000);
        let calls = Cell::new(0);
        let generate = || {
            calls.set(calls.get() + 1);
            Ok(b"rendered".to_vec())
        };
        let key = PreviewKey::page("p1", PreviewKind::GeometryCache, 10, 10);
        assert_eq!(cache.get_or_create(&key, generate).unwrap(), b"rendered");
        assert_eq!(cache.get_or_create(&key, generate).unwrap(), b"rendered");
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn generator_failure_stores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 1_000);
        let err = cache
            .get_or_create(&thumb("p1"), || Err(VaultError::Transport("renderer down".into())))
            .unwrap_err();
        assert!(matches!(err, VaultError::Transport(_)));
        assert_eq!(cache.stats().unwrap().entries, 0);
    }

    #[test]
    fn invalidate_page_drops_all_its_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 1_000);
        cache.put(&thumb("p1"), b"a").unwrap();
        cache.put(&thumb("p1").with_panel("x"), b"b").unwrap();
        cache.put(&thumb("p2"), b"c").unwrap();
        assert_eq!(cache.invalidate_page("p1").unwrap(), 2);
        assert_eq!(cache.stats().unwrap().entries, 1);
    }

    #[test]
    fn checksum_mismatch_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 1_000);
        cache.put(&thumb("p1"), b"good").unwrap();
        cache
            .index
            .connect()
            .unwrap()
            .execute("UPDATE previews SET blob = x'00'", [])
            .unwrap();
        assert_eq!(cache.get(&thumb("p1")).unwrap(), None);
        assert_eq!(cache.stats().unwrap().entries, 0);
    }

    #[test]
    fn touch_clock_is_strictly_increasing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 1_000);
        cache.put(&thumb("p1"), b"x").unwrap();
        let conn = cache.index.connect().unwrap();
        conn.execute("UPDATE previews SET last_access_at = ?1", params![i64::MAX / 2]).unwrap();
        assert_eq!(next_touch(&conn).unwrap(), i64::MAX / 2 + 1);
    }
}
