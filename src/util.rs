use std::env;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use blake3::Hash;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{IoContext, Result, VaultError};

const TOKEN_BYTES: usize = 32;

/// Sortable UTC stamp used in backup and snapshot file names.
pub(crate) const STAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.6fZ";

pub(crate) fn stamp(at: DateTime<Utc>) -> String {
    at.format(STAMP_FORMAT).to_string()
}

/// Pick the first stamp at or after `now` whose rendered path does not exist yet.
/// Advancing by a microsecond keeps lexicographic order equal to creation order.
pub(crate) fn unique_stamped_path(
    now: DateTime<Utc>,
    render: impl Fn(&str) -> PathBuf,
) -> PathBuf {
    let mut at = now;
    loop {
        let candidate = render(&stamp(at));
        if !candidate.exists() {
            return candidate;
        }
        at += Duration::microseconds(1);
    }
}

pub(crate) fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

pub(crate) fn blake3_hash(bytes: &[u8]) -> Hash {
    blake3::hash(bytes)
}

/// 32 bytes from the OS generator, hex encoded. Used for bearer tokens.
pub(crate) fn random_token() -> String {
    let mut buf = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}

pub(crate) fn env_optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

pub(crate) fn env_u64(name: &str, default: u64) -> Result<u64> {
    match env_optional(name) {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map_err(|_| VaultError::invalid(format!("Invalid {name}"))),
        None => Ok(default),
    }
}

pub(crate) fn env_usize(name: &str, default: usize) -> Result<usize> {
    match env_optional(name) {
        Some(value) => value
            .trim()
            .parse::<usize>()
            .map_err(|_| VaultError::invalid(format!("Invalid {name}"))),
        None => Ok(default),
    }
}

/// Write `bytes` next to `path`, fsync, then rename over `path`.
/// Readers see either the previous file or the new one, never a prefix.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let tmp = dir.join(format!(".{name}.tmp-{}", std::process::id()));

    let written = (|| -> Result<()> {
        let mut file = File::create(&tmp).at(&tmp)?;
        file.write_all(bytes).at(&tmp)?;
        file.sync_all().at(&tmp)?;
        Ok(())
    })();
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }

    if let Err(source) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(VaultError::io(path, source));
    }
    sync_dir(dir);
    Ok(())
}

/// Persist the rename itself. Best effort: not every platform can open a directory.
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
    #[cfg(not(unix))]
    let _ = dir;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_sort_chronologically() {
        let a = Utc::now();
        let b = a + Duration::microseconds(1);
        let c = a + Duration::seconds(61);
        let mut stamps = vec![stamp(c), stamp(a), stamp(b)];
        stamps.sort();
        assert_eq!(stamps, vec![stamp(a), stamp(b), stamp(c)]);
    }

    #[test]
    fn unique_stamped_path_skips_existing() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let render = |s: &str| dir.path().join(format!("x.{s}.bak"));
        let first = unique_stamped_path(now, render);
        fs::write(&first, b"1").unwrap();
        let second = unique_stamped_path(now, render);
        assert_ne!(first, second);
        assert!(second.file_name() > first.file_name());
    }

    #[test]
    fn write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn random_tokens_are_hex_and_distinct() {
        let tokens: Vec<String> = (0..64).map(|_| random_token()).collect();
        for token in &tokens {
            assert_eq!(token.len(), 64);
            assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        }
        let distinct: std::collections::HashSet<&String> = tokens.iter().collect();
        assert_eq!(distinct.len(), tokens.len());
    }
}
