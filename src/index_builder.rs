//! Initial index build on a worker thread, with a readiness signal callers can poll or wait on.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info};

use crate::document::ProjectDocument;
use crate::error::{Result, VaultError};
use crate::index_db::{IndexHealth, IndexStore};

#[derive(Debug, Clone, Serialize)]
pub(crate) struct BuildOutcome {
    pub(crate) health: IndexHealth,
    pub(crate) rebuilt: bool,
}

enum BuildState {
    Running,
    Done(std::result::Result<BuildOutcome, String>),
}

type Shared = Arc<(Mutex<BuildState>, Condvar)>;

pub(crate) struct BuildHandle {
    shared: Shared,
    worker: Option<thread::JoinHandle<()>>,
}

pub(crate) struct IndexBuilder;

impl IndexBuilder {
    /// Check (and self-heal) the index, then bring it up to date with `document`.
    pub(crate) fn spawn(index: IndexStore, document: ProjectDocument) -> Result<BuildHandle> {
        let shared: Shared = Arc::new((Mutex::new(BuildState::Running), Condvar::new()));
        let signal = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("panelvault-index".to_string())
            .spawn(move || {
                let result = build(&index, &document).map_err(|err| {
                    error!(error = %err, "background index build failed");
                    err.to_string()
                });
                let (lock, cvar) = &*signal;
                if let Ok(mut state) = lock.lock() {
                    *state = BuildState::Done(result);
                }
                cvar.notify_all();
            })
            .map_err(|err| VaultError::Transport(format!("spawn index worker: {err}")))?;
        Ok(BuildHandle {
            shared,
            worker: Some(worker),
        })
    }
}

fn build(index: &IndexStore, document: &ProjectDocument) -> Result<BuildOutcome> {
    let health = index.detect_and_rebuild(document)?;
    let rebuilt = match health {
        IndexHealth::Rebuilt { .. } => true,
        IndexHealth::Healthy => index.ensure_fresh(document)?,
    };
    info!(rebuilt, "index ready");
    Ok(BuildOutcome { health, rebuilt })
}

impl BuildHandle {
    pub(crate) fn is_ready(&self) -> bool {
        let (lock, _) = &*self.shared;
        lock.lock()
            .map(|state| matches!(*state, BuildState::Done(_)))
            .unwrap_or(true)
    }

    /// Block until the build finishes, keeping the handle for later callers.
    pub(crate) fn ready(&self) -> Result<BuildOutcome> {
        let (lock, cvar) = &*self.shared;
        let state = lock.lock().map_err(|_| poisoned())?;
        let state = cvar
            .wait_while(state, |state| matches!(state, BuildState::Running))
            .map_err(|_| poisoned())?;
        finished(&state)
    }

    /// Block until the build finishes and reap the worker.
    pub(crate) fn wait(mut self) -> Result<BuildOutcome> {
        let outcome = self.ready();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        outcome
    }

    /// `Ok(None)` when the build is still running after `timeout`.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Result<Option<BuildOutcome>> {
        let (lock, cvar) = &*self.shared;
        let state = lock.lock().map_err(|_| poisoned())?;
        let (state, _) = cvar
            .wait_timeout_while(state, timeout, |state| matches!(state, BuildState::Running))
            .map_err(|_| poisoned())?;
        match *state {
            BuildState::Running => Ok(None),
            BuildState::Done(_) => finished(&state).map(Some),
        }
    }
}

impl Drop for BuildHandle {
    /// Joins the worker: the build runs to commit or rollback.
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn finished(state: &BuildState) -> Result<BuildOutcome> {
    match state {
        BuildState::Done(Ok(outcome)) => Ok(outcome.clone()),
        BuildState::Done(Err(message)) => Err(VaultError::Corrupt(format!("index build failed: {message}"))),
        BuildState::Running => Err(VaultError::Conflict("index build still running".to_string())),
    }
}

fn poisoned() -> VaultError {
    VaultError::Conflict("index build state lock poisoned".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::document::fixtures::sample;
    use crate::search::{SearchBackend, SearchQuery};

    #[test]
    fn builds_in_background_and_signals_ready() {
        let dir = tempfile::tempdir().unwrap();
        let index = IndexStore::for_project(dir.path(), &IndexConfig::default());
        let handle = IndexBuilder::spawn(index.clone(), sample()).unwrap();
        let outcome = handle.wait_timeout(Duration::from_secs(30)).unwrap().unwrap();
        assert!(handle.is_ready());
        assert!(outcome.rebuilt);
        assert_eq!(outcome.health, IndexHealth::Healthy);
        handle.wait().unwrap();
        assert_eq!(index.search(&SearchQuery::text("Hello")).unwrap().len(), 1);
    }

    #[test]
    fn ready_can_be_called_repeatedly() {
        let dir = tempfile::tempdir().unwrap();
        let index = IndexStore::for_project(dir.path(), &IndexConfig::default());
        let handle = IndexBuilder::spawn(index, sample()).unwrap();
        let first = handle.ready().unwrap();
        let second = handle.ready().unwrap();
        assert!(first.rebuilt);
        assert_eq!(first.rebuilt, second.rebuilt);
        assert!(handle.is_ready());
    }

    #[test]
    fn second_build_of_same_document_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let index = IndexStore::for_project(dir.path(), &IndexConfig::default());
        IndexBuilder::spawn(index.clone(), sample()).unwrap().wait().unwrap();
        let outcome = IndexBuilder::spawn(index, sample()).unwrap().wait().unwrap();
        assert!(!outcome.rebuilt);
    }

    #[test]
    fn failure_is_reported_to_waiter() {
        let dir = tempfile::tempdir().unwrap();
        let index = IndexStore::for_project(dir.path(), &IndexConfig::default());
        let mut bad = sample();
        bad.characters.push(bad.characters[0].clone());
        let err = IndexBuilder::spawn(index, bad).unwrap().wait().unwrap_err();
        assert!(err.to_string().contains("duplicate character id"));
    }
}
