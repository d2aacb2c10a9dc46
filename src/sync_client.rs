//! Client half of sync: HTTP calls to the sync server and the local pending-op
//! state that `reconcile` drains.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::{IoContext, Result, VaultError};
use crate::protocol::{
    ErrorBody, IndexSnapshot, LoggedOp, ProjectInfo, PublishIndexRequest, PullResponse, PushRequest, PushResponse,
    SyncOp,
};
use crate::search::{SearchBackend, SearchQuery, SearchResult};
use crate::util::write_atomic;

pub(crate) const SYNC_STATE_FILE: &str = "sync-state.json";

pub(crate) struct SyncClient {
    agent: ureq::Agent,
    base_url: String,
    token: String,
    pull_page_size: usize,
}

impl SyncClient {
    pub(crate) fn new(base_url: &str, token: &str, timeout_ms: u64, pull_page_size: usize) -> Result<Self> {
        let parsed = url::Url::parse(base_url)
            .map_err(|e| VaultError::invalid(format!("invalid server url {base_url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(VaultError::invalid(format!("unsupported scheme in {base_url}")));
        }
        if token.trim().is_empty() {
            return Err(VaultError::invalid("sync token is empty"));
        }
        let timeout = Duration::from_millis(timeout_ms);
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        Ok(Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.trim().to_string(),
            pull_page_size: pull_page_size.max(1),
        })
    }

    pub(crate) fn from_config(config: &SyncConfig) -> Result<Self> {
        let url = config
            .server_url
            .as_deref()
            .ok_or_else(|| VaultError::invalid("sync.server_url is not set (or PANELVAULT_SERVER_URL)"))?;
        let token = config
            .token
            .as_deref()
            .ok_or_else(|| VaultError::invalid("sync.token is not set (or PANELVAULT_TOKEN)"))?;
        Self::new(url, token, config.timeout_ms, config.pull_page_size)
    }

    fn url(&self, segments: &[&str]) -> String {
        let mut url = self.base_url.clone();
        for segment in segments {
            url.push('/');
            url.push_str(&urlencoding::encode(segment));
        }
        url
    }

    fn authorized(&self, request: ureq::Request) -> ureq::Request {
        request.set("Authorization", &format!("Bearer {}", self.token))
    }

    pub(crate) fn list_projects(&self) -> Result<Vec<ProjectInfo>> {
        let request = self.authorized(self.agent.get(&self.url(&["projects"])));
        read_json(request.call())
    }

    pub(crate) fn push_ops(&self, project_id: &str, base_version: i64, ops: &[SyncOp]) -> Result<PushResponse> {
        let body = PushRequest {
            client_version: base_version,
            ops: ops.to_vec(),
        };
        let request = self.authorized(self.agent.post(&self.url(&["projects", project_id, "sync", "push"])));
        read_json(request.send_json(serde_json::to_value(&body)?))
    }

    pub(crate) fn pull_ops(&self, project_id: &str, since: i64, limit: Option<usize>) -> Result<PullResponse> {
        let mut request = self
            .authorized(self.agent.get(&self.url(&["projects", project_id, "sync", "pull"])))
            .query("since", &since.to_string());
        if let Some(limit) = limit {
            request = request.query("limit", &limit.to_string());
        }
        read_json(request.call())
    }

    pub(crate) fn fetch_index(&self, project_id: &str) -> Result<IndexSnapshot> {
        let request = self.authorized(self.agent.get(&self.url(&["projects", project_id, "index"])));
        read_json(request.call())
    }

    pub(crate) fn publish_index(&self, project_id: &str, body: &PublishIndexRequest) -> Result<serde_json::Value> {
        let request = self.authorized(self.agent.put(&self.url(&["projects", project_id, "index"])));
        read_json(request.send_json(serde_json::to_value(body)?))
    }

    /// Search and where-used against one project's published index.
    pub(crate) fn project<'a>(&'a self, project_id: &str) -> RemoteProject<'a> {
        RemoteProject {
            client: self,
            project_id: project_id.to_string(),
        }
    }
}

fn read_json<T: DeserializeOwned>(result: std::result::Result<ureq::Response, ureq::Error>) -> Result<T> {
    match result {
        Ok(response) => response
            .into_json::<T>()
            .map_err(|e| VaultError::Transport(format!("read response: {e}"))),
        Err(ureq::Error::Status(status, response)) => {
            let text = response.into_string().unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .map(|body| body.error)
                .unwrap_or(text);
            Err(VaultError::Http { status, message })
        }
        Err(ureq::Error::Transport(err)) => Err(VaultError::Transport(err.to_string())),
    }
}

pub(crate) struct RemoteProject<'a> {
    client: &'a SyncClient,
    project_id: String,
}

impl SearchBackend for RemoteProject<'_> {
    fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>> {
        // Validate locally so bad input fails the same way on both backends.
        query.validate()?;
        let mut request = self.client.authorized(
            self.client
                .agent
                .get(&self.client.url(&["projects", &self.project_id, "search"])),
        );
        let mut pairs: Vec<(&str, String)> = Vec::new();
        if let Some(text) = &query.text {
            pairs.push(("text", text.clone()));
        }
        if let Some(character) = &query.character {
            pairs.push(("character", character.clone()));
        }
        if let Some(scene) = &query.scene {
            pairs.push(("scene", scene.clone()));
        }
        if !query.tags.is_empty() {
            pairs.push(("tags", query.tags.join(",")));
        }
        if !query.types.is_empty() {
            pairs.push(("types", query.types.join(",")));
        }
        if let Some(from) = query.page_from {
            pairs.push(("page_from", from.to_string()));
        }
        if let Some(to) = query.page_to {
            pairs.push(("page_to", to.to_string()));
        }
        if let Some(limit) = query.limit {
            pairs.push(("limit", limit.to_string()));
        }
        if let Some(offset) = query.offset {
            pairs.push(("offset", offset.to_string()));
        }
        for (name, value) in &pairs {
            request = request.query(name, value);
        }
        read_json(request.call())
    }

    fn where_used(&self, doc_id: &str) -> Result<Vec<SearchResult>> {
        let request = self
            .client
            .authorized(
                self.client
                    .agent
                    .get(&self.client.url(&["projects", &self.project_id, "where-used"])),
            )
            .query("doc_id", doc_id);
        read_json(request.call())
    }

    fn where_used_by_path(&self, path: &str) -> Result<Vec<SearchResult>> {
        let request = self
            .client
            .authorized(
                self.client
                    .agent
                    .get(&self.client.url(&["projects", &self.project_id, "where-used"])),
            )
            .query("path", path);
        read_json(request.call())
    }
}

/// Pull cursor and not-yet-pushed ops, kept beside the manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct SyncState {
    #[serde(default)]
    pub(crate) project_id: Option<String>,
    #[serde(default)]
    pub(crate) cursor: i64,
    #[serde(default)]
    pub(crate) pending: Vec<SyncOp>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ReconcileReport {
    pub(crate) pushed: usize,
    pub(crate) accepted: usize,
    pub(crate) server_version: i64,
    pub(crate) cursor: i64,
    pub(crate) remote_ops: Vec<LoggedOp>,
}

impl SyncState {
    pub(crate) fn path(root: &Path) -> PathBuf {
        root.join(SYNC_STATE_FILE)
    }

    pub(crate) fn load(root: &Path) -> Result<Self> {
        let path = Self::path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path).at(&path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub(crate) fn save(&self, root: &Path) -> Result<()> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        write_atomic(&Self::path(root), &bytes)
    }

    /// Bind the state to `project_id`, refusing to mix two projects' cursors.
    pub(crate) fn bind(&mut self, project_id: &str) -> Result<()> {
        match &self.project_id {
            Some(bound) if bound != project_id => Err(VaultError::Conflict(format!(
                "sync state belongs to project {bound}, not {project_id}"
            ))),
            Some(_) => Ok(()),
            None => {
                self.project_id = Some(project_id.to_string());
                Ok(())
            }
        }
    }

    /// Queue a mutation under a fresh op id.
    pub(crate) fn record(
        &mut self,
        op_type: &str,
        entity_type: &str,
        entity_id: &str,
        payload: serde_json::Value,
    ) -> Result<&SyncOp> {
        for (name, value) in [("op_type", op_type), ("entity_type", entity_type), ("entity_id", entity_id)] {
            if value.trim().is_empty() {
                return Err(VaultError::invalid(format!("{name} is empty")));
            }
        }
        self.pending.push(SyncOp {
            op_id: Uuid::new_v4().to_string(),
            op_type: op_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            payload,
        });
        Ok(&self.pending[self.pending.len() - 1])
    }
}

/// Push pending ops, then pull until caught up. Returns the ops other clients wrote.
///
/// State is saved after the push and after every pulled page, so an
/// interrupted reconcile resumes where it stopped. Retrying a push whose
/// response was lost is safe because the server skips known op ids.
pub(crate) fn reconcile(root: &Path, client: &SyncClient, project_id: &str) -> Result<ReconcileReport> {
    let mut state = SyncState::load(root)?;
    state.bind(project_id)?;

    let pushed = state.pending.len();
    let own: HashSet<String> = state.pending.iter().map(|op| op.op_id.clone()).collect();
    let mut accepted = 0;
    if !state.pending.is_empty() {
        let response = client.push_ops(project_id, state.cursor, &state.pending)?;
        accepted = response.accepted;
        state.pending.clear();
        state.save(root)?;
        info!(project = project_id, pushed, accepted, server_version = response.server_version, "pending ops pushed");
    }

    let mut remote_ops = Vec::new();
    let mut server_version;
    loop {
        let page = client.pull_ops(project_id, state.cursor, Some(client.pull_page_size))?;
        server_version = page.server_version;
        let Some(last) = page.ops.last().map(|op| op.version) else {
            break;
        };
        state.cursor = last;
        state.save(root)?;
        debug!(project = project_id, cursor = state.cursor, page = page.ops.len(), "pulled page");
        remote_ops.extend(page.ops.into_iter().filter(|op| !own.contains(&op.op_id)));
        if state.cursor >= server_version {
            break;
        }
    }
    state.save(root)?;

    info!(
        project = project_id,
        cursor = state.cursor,
        server_version,
        remote = remote_ops.len(),
        "reconciled"
    );
    Ok(ReconcileReport {
        pushed,
        accepted,
        server_version,
        cursor: state.cursor,
        remote_ops,
    })
}
