//! A project on disk: manifest, config and the derived index, wired together
//! the way the commands use them.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::{config_file_path, load_file_config, FileConfig};
use crate::document::ProjectDocument;
use crate::error::Result;
use crate::index_builder::{BuildHandle, BuildOutcome, IndexBuilder};
use crate::index_db::IndexStore;
use crate::manifest::{self, ManifestHandle};
use crate::preview::PreviewCache;
use crate::snapshots::SnapshotLog;

pub(crate) struct Project {
    pub(crate) handle: ManifestHandle,
    pub(crate) config: FileConfig,
    index: IndexStore,
    build: BuildHandle,
}

/// `explicit` wins; otherwise `<root>/panelvault.json`. Env overrides apply last.
pub(crate) fn resolve_config(root: &Path, explicit: Option<&Path>) -> Result<FileConfig> {
    let path: PathBuf = explicit.map(Path::to_path_buf).unwrap_or_else(|| config_file_path(root));
    load_file_config(&path).with_env_overrides()
}

impl Project {
    /// Create the project and start the initial index build in the background.
    pub(crate) fn init(root: &Path, name: &str, config: FileConfig) -> Result<Self> {
        let handle = manifest::init(root, ProjectDocument::empty(name))?;
        Self::from_handle(handle, config)
    }

    /// Open the project and start bringing its index up to date in the background.
    pub(crate) fn open(root: &Path, config: FileConfig) -> Result<Self> {
        let handle = manifest::open(root)?;
        Self::from_handle(handle, config)
    }

    fn from_handle(handle: ManifestHandle, config: FileConfig) -> Result<Self> {
        let index = IndexStore::for_project(&handle.root, &config.index);
        let build = IndexBuilder::spawn(index.clone(), handle.document.clone())?;
        Ok(Self {
            handle,
            config,
            index,
            build,
        })
    }

    pub(crate) fn root(&self) -> &Path {
        &self.handle.root
    }

    pub(crate) fn document(&self) -> &ProjectDocument {
        &self.handle.document
    }

    pub(crate) fn index(&self) -> &IndexStore {
        &self.index
    }

    /// The most recent background build.
    pub(crate) fn index_build(&self) -> &BuildHandle {
        &self.build
    }

    /// Block until the most recent background build has finished.
    pub(crate) fn wait_index(&self) -> Result<BuildOutcome> {
        self.build.ready()
    }

    pub(crate) fn previews(&self) -> PreviewCache {
        PreviewCache::new(self.index.clone(), self.config.preview.max_bytes)
    }

    pub(crate) fn snapshots(&self) -> SnapshotLog {
        SnapshotLog::new(self.index.clone(), self.config.snapshots.keep)
    }

    /// Persist the document and apply the backup retention setting.
    pub(crate) fn save(&self) -> Result<()> {
        manifest::save(&self.handle)?;
        if let Some(keep) = self.config.manifest.max_backups {
            manifest::prune_backups(&self.handle.root, keep)?;
        }
        Ok(())
    }

    /// Move the project to `new_root` and build the index there.
    pub(crate) fn save_as(&mut self, new_root: &Path) -> Result<()> {
        manifest::save_as(&mut self.handle, new_root)?;
        self.index = IndexStore::for_project(&self.handle.root, &self.config.index);
        info!(root = %new_root.display(), "project saved to new location");
        self.refresh_index()?;
        Ok(())
    }

    /// Start a new background build for the current document once the
    /// previous one has finished.
    pub(crate) fn refresh_index(&mut self) -> Result<&BuildHandle> {
        if let Err(err) = self.build.ready() {
            debug!(error = %err, "previous index build failed");
        }
        self.build = IndexBuilder::spawn(self.index.clone(), self.handle.document.clone())?;
        Ok(&self.build)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::document::fixtures::{balloon, page, panel};
    use crate::document::{Issue, TagDef};
    use crate::index_db::IndexHealth;
    use crate::search::{SearchBackend, SearchQuery};

    #[test]
    fn init_save_corrupt_recover_and_search() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("comic");
        let mut document = ProjectDocument::empty("Night Shift");
        document.tags.push(TagDef {
            name: "greet".into(),
            description: None,
        });
        document.issues.push(Issue {
            id: "i1".into(),
            number: 1,
            title: String::new(),
            pages: vec![page("p1", 1, None, vec![panel("x1", None, vec![balloon("b1", None, "Hi @greet")])])],
        });
        manifest::init(&root, document).unwrap();
        let project = Project::open(&root, FileConfig::default()).unwrap();
        project.save().unwrap();

        fs::write(manifest::manifest_path(&root), b"{ truncated").unwrap();
        let recovered = Project::open(&root, FileConfig::default()).unwrap();
        assert!(recovered.handle.recovered_from.is_some());
        assert_eq!(recovered.document().name, "Night Shift");

        recovered.wait_index().unwrap();
        let hits = recovered.index().search(&SearchQuery::tags(["greet"])).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "balloon:b1");
    }

    #[test]
    fn open_builds_the_index_in_the_background() {
        let dir = tempfile::tempdir().unwrap();
        manifest::init(dir.path(), crate::document::fixtures::sample()).unwrap();
        let project = Project::open(dir.path(), FileConfig::default()).unwrap();
        let outcome = project.wait_index().unwrap();
        assert!(outcome.rebuilt);
        assert!(project.index_build().is_ready());
        let hits = project.index().search(&SearchQuery::text("Hello")).unwrap();
        assert_eq!(hits.len(), 1);

        let reopened = Project::open(dir.path(), FileConfig::default()).unwrap();
        assert!(!reopened.wait_index().unwrap().rebuilt);
    }

    #[test]
    fn open_reports_a_damaged_index_as_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        manifest::init(dir.path(), crate::document::fixtures::sample()).unwrap();
        let project = Project::open(dir.path(), FileConfig::default()).unwrap();
        assert_eq!(project.wait_index().unwrap().health, IndexHealth::Healthy);
        let index_path = project.index().path().to_path_buf();
        drop(project);

        for suffix in ["-wal", "-shm"] {
            let mut side = index_path.clone().into_os_string();
            side.push(suffix);
            let _ = fs::remove_file(side);
        }
        fs::write(&index_path, b"not a database ".repeat(300)).unwrap();

        let reopened = Project::open(dir.path(), FileConfig::default()).unwrap();
        let outcome = reopened.wait_index().unwrap();
        assert!(matches!(outcome.health, IndexHealth::Rebuilt { .. }), "{:?}", outcome.health);
        assert_eq!(reopened.index().search(&SearchQuery::text("Hello")).unwrap().len(), 1);
    }

    #[test]
    fn refresh_picks_up_document_edits() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = Project::init(dir.path(), "P", FileConfig::default()).unwrap();
        project.wait_index().unwrap();
        project.handle.document.issues.push(Issue {
            id: "i1".into(),
            number: 1,
            title: String::new(),
            pages: vec![page("p1", 1, None, vec![panel("x1", None, vec![balloon("b1", None, "Fresh ink")])])],
        });
        project.save().unwrap();
        project.refresh_index().unwrap();
        assert!(project.wait_index().unwrap().rebuilt);
        assert_eq!(project.index().search(&SearchQuery::text("ink")).unwrap().len(), 1);
    }

    #[test]
    fn backup_retention_follows_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FileConfig::default();
        config.manifest.max_backups = Some(2);
        let project = Project::init(dir.path(), "P", config).unwrap();
        for _ in 0..5 {
            project.save().unwrap();
        }
        assert_eq!(manifest::list_backups(project.root()).len(), 2);
    }

    #[test]
    fn config_resolution_prefers_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("custom.json");
        fs::write(&explicit, r#"{"snapshots": {"keep": 7}}"#).unwrap();
        fs::write(config_file_path(dir.path()), r#"{"snapshots": {"keep": 3}}"#).unwrap();
        assert_eq!(resolve_config(dir.path(), Some(&explicit)).unwrap().snapshots.keep, 7);
        assert_eq!(resolve_config(dir.path(), None).unwrap().snapshots.keep, 3);
    }
}
