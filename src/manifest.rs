//! Crash-safe persistence of the canonical project document.
//!
//! Layout under a project root:
//!
//! ```text
//! manifest.json                                   live document
//! backups/manifest.json.<stamp>.bak               one per save, newest sorts last
//! backups/manifest.json.crash-<stamp>.autosave    periodic recovery copies
//! script/ pages/ assets/ styles/ exports/         owned by collaborators
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::document::ProjectDocument;
use crate::error::{IoContext, Result, VaultError};
use crate::util::{unique_stamped_path, write_atomic};

pub(crate) const MANIFEST_NAME: &str = "manifest.json";
pub(crate) const BACKUP_DIR: &str = "backups";
pub(crate) const STANDARD_DIRS: [&str; 6] = ["script", "pages", "assets", "styles", "exports", BACKUP_DIR];

const BACKUP_SUFFIX: &str = ".bak";
const CRASH_SUFFIX: &str = ".autosave";

#[derive(Debug, Clone)]
pub(crate) struct ManifestHandle {
    pub(crate) root: PathBuf,
    pub(crate) manifest_path: PathBuf,
    pub(crate) document: ProjectDocument,
    /// Set when `open` had to fall back to a backup.
    pub(crate) recovered_from: Option<PathBuf>,
}

pub(crate) fn manifest_path(root: &Path) -> PathBuf {
    root.join(MANIFEST_NAME)
}

pub(crate) fn backup_dir(root: &Path) -> PathBuf {
    root.join(BACKUP_DIR)
}

fn scaffold(root: &Path) -> Result<()> {
    fs::create_dir_all(root).at(root)?;
    for dir in STANDARD_DIRS {
        let path = root.join(dir);
        fs::create_dir_all(&path).at(&path)?;
    }
    Ok(())
}

fn encode(document: &ProjectDocument) -> Result<Vec<u8>> {
    let mut json = serde_json::to_string_pretty(document)?;
    json.push('\n');
    Ok(json.into_bytes())
}

fn decode(path: &Path) -> Result<ProjectDocument> {
    let bytes = fs::read(path).at(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Create a new project at `root` and write its first manifest.
pub(crate) fn init(root: &Path, document: ProjectDocument) -> Result<ManifestHandle> {
    document.validate()?;
    let manifest = manifest_path(root);
    if manifest.exists() {
        return Err(VaultError::invalid(format!(
            "refusing to overwrite existing manifest: {}",
            manifest.display()
        )));
    }
    scaffold(root)?;
    write_atomic(&manifest, &encode(&document)?)?;
    info!(root = %root.display(), project = %document.id, "initialized project");
    Ok(ManifestHandle {
        root: root.to_path_buf(),
        manifest_path: manifest,
        document,
        recovered_from: None,
    })
}

/// Load the manifest, falling back to the newest readable backup.
pub(crate) fn open(root: &Path) -> Result<ManifestHandle> {
    let manifest = manifest_path(root);
    let primary_err = match decode(&manifest) {
        Ok(document) => {
            return Ok(ManifestHandle {
                root: root.to_path_buf(),
                manifest_path: manifest,
                document,
                recovered_from: None,
            });
        }
        Err(err) => err,
    };
    let backups = list_backups(root);
    if backups.is_empty() && !manifest.exists() {
        return Err(VaultError::not_found(format!("manifest under {}", root.display())));
    }
    warn!(path = %manifest.display(), error = %primary_err, "manifest unreadable, trying backups");

    for backup in backups {
        match decode(&backup) {
            Ok(document) => {
                info!(backup = %backup.display(), "recovered manifest from backup");
                return Ok(ManifestHandle {
                    root: root.to_path_buf(),
                    manifest_path: manifest,
                    document,
                    recovered_from: Some(backup),
                });
            }
            Err(err) => debug!(backup = %backup.display(), error = %err, "backup unusable"),
        }
    }

    Err(VaultError::Corrupt(format!(
        "no valid manifest or backup under {} ({primary_err})",
        root.display()
    )))
}

/// Persist the handle's document: backup the current file, then temp-write and rename.
pub(crate) fn save(handle: &ManifestHandle) -> Result<()> {
    handle.document.validate()?;
    let bytes = encode(&handle.document)?;

    if handle.manifest_path.exists() {
        let backups = backup_dir(&handle.root);
        fs::create_dir_all(&backups).at(&backups)?;
        let target = unique_stamped_path(Utc::now(), |stamp| {
            backups.join(format!("{MANIFEST_NAME}.{stamp}{BACKUP_SUFFIX}"))
        });
        // A failed copy aborts the save: the caller keeps the previous version on disk.
        fs::copy(&handle.manifest_path, &target).at(&target)?;
        debug!(backup = %target.display(), "manifest backed up");
    }

    write_atomic(&handle.manifest_path, &bytes)?;
    info!(path = %handle.manifest_path.display(), bytes = bytes.len(), "manifest saved");
    Ok(())
}

/// Scaffold `new_root`, rebind the handle to it and save there.
pub(crate) fn save_as(handle: &mut ManifestHandle, new_root: &Path) -> Result<()> {
    handle.document.validate()?;
    scaffold(new_root)?;
    handle.root = new_root.to_path_buf();
    handle.manifest_path = manifest_path(new_root);
    handle.recovered_from = None;
    save(handle)
}

/// Write a recovery copy next to the backups without touching the live manifest.
pub(crate) fn autosave_crash_snapshot(handle: &ManifestHandle) -> Result<PathBuf> {
    let dir = backup_dir(&handle.root);
    fs::create_dir_all(&dir).at(&dir)?;
    let target = unique_stamped_path(Utc::now(), |stamp| {
        dir.join(format!("{MANIFEST_NAME}.crash-{stamp}{CRASH_SUFFIX}"))
    });
    write_atomic(&target, &encode(&handle.document)?)?;
    debug!(path = %target.display(), "crash snapshot written");
    Ok(target)
}

/// Timestamped `.bak` files, newest first.
pub(crate) fn list_backups(root: &Path) -> Vec<PathBuf> {
    list_matching(root, BACKUP_SUFFIX)
}

pub(crate) fn list_crash_snapshots(root: &Path) -> Vec<PathBuf> {
    list_matching(root, CRASH_SUFFIX)
}

fn list_matching(root: &Path, suffix: &str) -> Vec<PathBuf> {
    let prefix = format!("{MANIFEST_NAME}.");
    let mut files: Vec<PathBuf> = WalkDir::new(backup_dir(root))
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy();
            name.starts_with(&prefix)
                && name.ends_with(suffix)
                && (suffix == CRASH_SUFFIX || !name.contains(".crash-"))
        })
        .map(|entry| entry.into_path())
        .collect();
    files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
    files
}

/// Delete all but the newest `keep` backups. Returns how many were removed.
pub(crate) fn prune_backups(root: &Path, keep: usize) -> Result<usize> {
    let mut removed = 0;
    for old in list_backups(root).into_iter().skip(keep) {
        fs::remove_file(&old).at(&old)?;
        removed += 1;
    }
    if removed > 0 {
        debug!(removed, keep, "pruned manifest backups");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::fixtures::sample;

    #[test]
    fn init_scaffolds_and_writes_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("proj");
        let handle = init(&root, sample()).unwrap();
        for sub in STANDARD_DIRS {
            assert!(root.join(sub).is_dir(), "{sub} missing");
        }
        let raw = fs::read_to_string(&handle.manifest_path).unwrap();
        assert!(raw.ends_with('\n'));
        assert!(raw.contains("\n  \"name\": \"Night Shift\""));
    }

    #[test]
    fn init_refuses_existing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        init(dir.path(), sample()).unwrap();
        assert!(matches!(init(dir.path(), sample()), Err(VaultError::Validation(_))));
    }

    #[test]
    fn save_then_open_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = init(dir.path(), sample()).unwrap();
        handle.document.name = "Renamed".into();
        handle.document.issues[0].pages[0].panels[0].note = Some("closer".into());
        save(&handle).unwrap();
        let reopened = open(dir.path()).unwrap();
        assert_eq!(reopened.document, handle.document);
        assert!(reopened.recovered_from.is_none());
    }

    #[test]
    fn each_save_leaves_a_backup() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = init(dir.path(), sample()).unwrap();
        for n in 0..5 {
            handle.document.name = format!("rev {n}");
            save(&handle).unwrap();
        }
        assert!(list_backups(dir.path()).len() >= 4);
        // newest backup holds the revision before the last save
        let newest = decode(&list_backups(dir.path())[0]).unwrap();
        assert_eq!(newest.name, "rev 3");
    }

    #[test]
    fn garbage_manifest_falls_back_to_latest_backup() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = init(dir.path(), sample()).unwrap();
        handle.document.name = "second".into();
        save(&handle).unwrap();
        handle.document.name = "third".into();
        save(&handle).unwrap();
        fs::write(manifest_path(dir.path()), b"{ not json").unwrap();

        let recovered = open(dir.path()).unwrap();
        assert_eq!(recovered.document.name, "second");
        assert!(recovered.recovered_from.is_some());
    }

    #[test]
    fn unreadable_backups_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = init(dir.path(), sample()).unwrap();
        save(&handle).unwrap();
        handle.document.name = "later".into();
        save(&handle).unwrap();
        let newest = list_backups(dir.path())[0].clone();
        fs::write(&newest, b"garbage").unwrap();
        fs::write(manifest_path(dir.path()), b"garbage").unwrap();

        let recovered = open(dir.path()).unwrap();
        assert_eq!(recovered.document.name, "Night Shift");
    }

    #[test]
    fn open_of_empty_root_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = open(&dir.path().join("nope")).unwrap_err();
        assert!(err.is_not_found(), "{err}");
        assert!(!err.is_corruption());
    }

    #[test]
    fn missing_manifest_with_backup_still_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let handle = init(dir.path(), sample()).unwrap();
        save(&handle).unwrap();
        fs::remove_file(manifest_path(dir.path())).unwrap();
        let recovered = open(dir.path()).unwrap();
        assert!(recovered.recovered_from.is_some());
    }

    #[test]
    fn open_without_any_valid_copy_fails() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(manifest_path(dir.path()), b"garbage").unwrap();
        assert!(matches!(open(dir.path()), Err(VaultError::Corrupt(_))));
    }

    #[test]
    fn save_as_rebinds_and_scaffolds() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = init(&dir.path().join("a"), sample()).unwrap();
        let target = dir.path().join("b");
        save_as(&mut handle, &target).unwrap();
        assert_eq!(handle.root, target);
        assert!(target.join("exports").is_dir());
        assert_eq!(open(&target).unwrap().document, handle.document);
    }

    #[test]
    fn crash_snapshot_leaves_manifest_and_backups_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = init(dir.path(), sample()).unwrap();
        let before = fs::read(&handle.manifest_path).unwrap();
        handle.document.name = "unsaved edit".into();
        let first = autosave_crash_snapshot(&handle).unwrap();
        let second = autosave_crash_snapshot(&handle).unwrap();
        assert_ne!(first, second);
        assert_eq!(fs::read(&handle.manifest_path).unwrap(), before);
        assert!(list_backups(dir.path()).is_empty());
        assert_eq!(list_crash_snapshots(dir.path()).len(), 2);
        assert_eq!(decode(&second).unwrap().name, "unsaved edit");
    }

    #[test]
    fn duplicate_ids_block_save() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = init(dir.path(), sample()).unwrap();
        let before = fs::read(&handle.manifest_path).unwrap();
        let dup = handle.document.issues[0].pages[0].panels[0].clone();
        handle.document.issues[0].pages[1].panels.push(dup);
        assert!(matches!(save(&handle), Err(VaultError::Validation(_))));
        assert_eq!(fs::read(&handle.manifest_path).unwrap(), before);
        assert!(list_backups(dir.path()).is_empty());
    }

    #[test]
    fn prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = init(dir.path(), sample()).unwrap();
        for n in 0..4 {
            handle.document.name = format!("rev {n}");
            save(&handle).unwrap();
        }
        let newest = list_backups(dir.path())[0].clone();
        assert_eq!(prune_backups(dir.path(), 1).unwrap(), 3);
        assert_eq!(list_backups(dir.path()), vec![newest]);
    }
}
