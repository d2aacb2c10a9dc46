//! HTTP front of the sync server: a tiny_http listener shared by a fixed pool
//! of worker threads, bearer-token auth, JSON in and out.

use std::collections::HashMap;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use serde::Serialize;
use tiny_http::{Header, Method, Request, Response, Server};
use tracing::{debug, info, warn};
use url::form_urlencoded;

use crate::config::ServerConfig;
use crate::error::{Result, VaultError};
use crate::protocol::{
    CreateProjectRequest, ErrorBody, IssueTokenRequest, IssueTokenResponse, PublishIndexRequest, PushRequest,
};
use crate::search::{SearchBackend, SearchQuery};
use crate::server_store::ServerStore;
use crate::util::blake3_hash;

const MAX_BODY_BYTES: u64 = 64 * 1024 * 1024;

/// A request reduced to what the handlers look at.
#[derive(Debug, Clone, Default)]
pub(crate) struct ApiRequest {
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) query: HashMap<String, String>,
    pub(crate) bearer: Option<String>,
    pub(crate) admin_key: Option<String>,
    pub(crate) body: String,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ApiResponse {
    pub(crate) status: u16,
    pub(crate) body: String,
}

impl ApiResponse {
    fn json<T: Serialize>(status: u16, value: &T) -> Result<Self> {
        Ok(Self {
            status,
            body: serde_json::to_string(value)?,
        })
    }

    fn error(err: &VaultError) -> Self {
        let body = serde_json::to_string(&ErrorBody { error: err.to_string() })
            .unwrap_or_else(|_| "{\"error\":\"internal\"}".to_string());
        Self {
            status: err.http_status(),
            body,
        }
    }
}

#[derive(Clone)]
pub(crate) struct SyncService {
    store: ServerStore,
    admin_key_hash: Option<String>,
}

impl SyncService {
    pub(crate) fn new(store: ServerStore, admin_key: Option<&str>) -> Self {
        Self {
            store,
            admin_key_hash: admin_key.map(|k| blake3_hash(k.as_bytes()).to_hex().to_string()),
        }
    }

    pub(crate) fn handle(&self, request: &ApiRequest) -> ApiResponse {
        match self.route(request) {
            Ok(response) => response,
            Err(err) => {
                if err.http_status() >= 500 {
                    warn!(method = %request.method, path = %request.path, error = %err, "request failed");
                }
                ApiResponse::error(&err)
            }
        }
    }

    fn route(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let segments: Vec<String> = request
            .path
            .trim_matches('/')
            .split('/')
            .map(|s| {
                urlencoding::decode(s)
                    .map(|d| d.into_owned())
                    .map_err(|_| VaultError::invalid("path is not valid utf-8"))
            })
            .collect::<Result<_>>()?;
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

        match (request.method.as_str(), segments.as_slice()) {
            ("GET", ["healthz"]) => ApiResponse::json(200, &serde_json::json!({ "ok": true })),
            ("POST", ["admin", "projects"]) => {
                self.require_admin(request)?;
                let body: CreateProjectRequest = serde_json::from_str(&request.body)?;
                let project = self.store.create_project(body.id.as_deref(), &body.name, &body.members)?;
                ApiResponse::json(201, &project)
            }
            ("POST", ["admin", "tokens"]) => {
                self.require_admin(request)?;
                let body: IssueTokenRequest = serde_json::from_str(&request.body)?;
                let token = self.store.issue_token(&body.actor)?;
                ApiResponse::json(201, &IssueTokenResponse { actor: body.actor, token })
            }
            ("GET", ["projects"]) => {
                let actor = self.actor(request)?;
                ApiResponse::json(200, &self.store.list_projects(&actor)?)
            }
            (method, ["projects", project, rest @ ..]) => {
                let actor = self.actor(request)?;
                self.store.require_member(project, &actor)?;
                self.project_route(method, project, rest, &actor, request)
            }
            _ => Err(VaultError::not_found(format!("route {} {}", request.method, request.path))),
        }
    }

    fn project_route(
        &self,
        method: &str,
        project: &str,
        rest: &[&str],
        actor: &str,
        request: &ApiRequest,
    ) -> Result<ApiResponse> {
        match (method, rest) {
            ("GET", ["index"]) => ApiResponse::json(200, &self.store.latest_index(project)?),
            ("PUT", ["index"]) => {
                let body: PublishIndexRequest = serde_json::from_str(&request.body)?;
                let snapshot = self.store.publish_index(project, actor, &body)?;
                ApiResponse::json(
                    200,
                    &serde_json::json!({
                        "project_id": snapshot.project_id,
                        "snapshot_id": snapshot.snapshot_id,
                        "documents": snapshot.documents.len(),
                    }),
                )
            }
            ("GET", ["search"]) => {
                let query = search_query(&request.query)?;
                ApiResponse::json(200, &self.store.project_search(project).search(&query)?)
            }
            ("GET", ["where-used"]) => {
                let search = self.store.project_search(project);
                let hits = match (request.query.get("doc_id"), request.query.get("path")) {
                    (Some(doc_id), None) => search.where_used(doc_id)?,
                    (None, Some(path)) => search.where_used_by_path(path)?,
                    _ => return Err(VaultError::invalid("pass exactly one of doc_id or path")),
                };
                ApiResponse::json(200, &hits)
            }
            ("POST", ["sync", "push"]) => {
                let body: PushRequest = serde_json::from_str(&request.body)?;
                ApiResponse::json(200, &self.store.push(project, actor, &body)?)
            }
            ("GET", ["sync", "pull"]) => {
                let since = parse_param::<i64>(&request.query, "since")?.unwrap_or(0);
                let limit = parse_param::<usize>(&request.query, "limit")?;
                ApiResponse::json(200, &self.store.pull(project, since, limit)?)
            }
            _ => Err(VaultError::not_found(format!("route {} {}", request.method, request.path))),
        }
    }

    fn actor(&self, request: &ApiRequest) -> Result<String> {
        let token = request
            .bearer
            .as_deref()
            .ok_or_else(|| VaultError::Unauthorized("missing bearer token".to_string()))?;
        self.store.authenticate(token)
    }

    fn require_admin(&self, request: &ApiRequest) -> Result<()> {
        let Some(expected) = &self.admin_key_hash else {
            return Err(VaultError::Unauthorized("admin key not configured".to_string()));
        };
        let given = request
            .admin_key
            .as_deref()
            .map(|k| blake3_hash(k.as_bytes()).to_hex().to_string());
        if given.as_deref() != Some(expected.as_str()) {
            return Err(VaultError::Unauthorized("bad admin key".to_string()));
        }
        Ok(())
    }
}

fn parse_param<T: std::str::FromStr>(query: &HashMap<String, String>, name: &str) -> Result<Option<T>> {
    match query.get(name).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| VaultError::invalid(format!("invalid {name}: {raw}"))),
        None => Ok(None),
    }
}

fn list_param(query: &HashMap<String, String>, name: &str) -> Vec<String> {
    query
        .get(name)
        .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default()
}

pub(crate) fn search_query(query: &HashMap<String, String>) -> Result<SearchQuery> {
    Ok(SearchQuery {
        text: query.get("text").cloned(),
        character: query.get("character").cloned(),
        scene: query.get("scene").cloned(),
        tags: list_param(query, "tags"),
        types: list_param(query, "types"),
        page_from: parse_param(query, "page_from")?,
        page_to: parse_param(query, "page_to")?,
        limit: parse_param(query, "limit")?,
        offset: parse_param(query, "offset")?,
    })
}

fn header_value(request: &Request, name: &str) -> Option<String> {
    request
        .headers()
        .iter()
        .find(|h| h.field.as_str().as_str().eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str().trim().to_string())
}

fn read_request(request: &mut Request) -> Result<ApiRequest> {
    let url = request.url().to_string();
    let (path, raw_query) = url.split_once('?').unwrap_or((url.as_str(), ""));
    let query: HashMap<String, String> = form_urlencoded::parse(raw_query.as_bytes()).into_owned().collect();
    let bearer = header_value(request, "Authorization")
        .and_then(|v| v.strip_prefix("Bearer ").map(|t| t.trim().to_string()));
    let admin_key = header_value(request, "X-Admin-Key");
    let mut body = String::new();
    request
        .as_reader()
        .take(MAX_BODY_BYTES)
        .read_to_string(&mut body)
        .map_err(|e| VaultError::invalid(format!("read body: {e}")))?;
    Ok(ApiRequest {
        method: request.method().as_str().to_uppercase(),
        path: path.to_string(),
        query,
        bearer,
        admin_key,
        body,
    })
}

fn respond(request: Request, response: ApiResponse) {
    let mut reply = Response::from_string(response.body).with_status_code(response.status);
    if let Ok(header) = Header::from_bytes("Content-Type", "application/json") {
        reply = reply.with_header(header);
    }
    let _ = request.respond(reply);
}

fn serve_one(service: &SyncService, mut request: Request) {
    let method = request.method().clone();
    let response = match read_request(&mut request) {
        Ok(api) => service.handle(&api),
        Err(err) => ApiResponse::error(&err),
    };
    debug!(method = %method, url = %request.url(), status = response.status, "request handled");
    if method == Method::Head {
        respond(request, ApiResponse { status: response.status, body: String::new() });
    } else {
        respond(request, response);
    }
}

/// Listener plus worker threads. Dropping without `shutdown` leaves the workers running.
pub(crate) struct RunningServer {
    addr: SocketAddr,
    server: Arc<Server>,
    stopping: Arc<AtomicBool>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl RunningServer {
    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Block until every worker exits.
    pub(crate) fn join(self) {
        for worker in self.workers {
            let _ = worker.join();
        }
    }

    pub(crate) fn shutdown(self) {
        self.stopping.store(true, Ordering::SeqCst);
        for _ in &self.workers {
            self.server.unblock();
        }
        for worker in self.workers {
            let _ = worker.join();
        }
        info!(addr = %self.addr, "sync server stopped");
    }
}

pub(crate) fn start(service: SyncService, bind: &str, port: u16, workers: usize) -> Result<RunningServer> {
    let listen = format!("{bind}:{port}");
    let server = Server::http(&listen).map_err(|e| VaultError::Transport(format!("listen on {listen}: {e}")))?;
    let addr = server
        .server_addr()
        .to_ip()
        .ok_or_else(|| VaultError::Transport(format!("{listen} is not an ip listener")))?;
    let server = Arc::new(server);
    let stopping = Arc::new(AtomicBool::new(false));

    let workers = (0..workers.max(1))
        .map(|n| {
            let server = Arc::clone(&server);
            let stopping = Arc::clone(&stopping);
            let service = service.clone();
            thread::Builder::new()
                .name(format!("panelvault-http-{n}"))
                .spawn(move || loop {
                    match server.recv() {
                        Ok(request) => serve_one(&service, request),
                        Err(err) => {
                            if stopping.load(Ordering::SeqCst) {
                                break;
                            }
                            warn!(error = %err, "accept failed");
                        }
                    }
                })
                .map_err(|e| VaultError::Transport(format!("spawn worker: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    info!(%addr, workers = workers.len(), "sync server listening");
    Ok(RunningServer {
        addr,
        server,
        stopping,
        workers,
    })
}

/// Open the store from `config` and serve until the process is killed.
pub(crate) fn serve(config: &ServerConfig, busy_timeout_ms: u64) -> Result<()> {
    let store = ServerStore::open(config, busy_timeout_ms)?;
    info!(db = %store.path().display(), "server store ready");
    if config.admin_key.is_none() {
        warn!("no admin key configured, provisioning routes are disabled");
    }
    let service = SyncService::new(store, config.admin_key.as_deref());
    start(service, &config.bind, config.port, config.workers)?.join();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::fixtures::sample;
    use crate::index_db::document_hash;
    use crate::projection::project;
    use crate::protocol::{ProjectInfo, PullResponse, PushResponse, SyncOp};

    struct Fixture {
        _dir: tempfile::TempDir,
        service: SyncService,
        token: String,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = ServerStore::open_at(&dir.path().join("server.sqlite"), 5_000, 1_000).unwrap();
        store.create_project(Some("prj-1"), "Night Shift", &["ana".into()]).unwrap();
        let token = store.issue_token("ana").unwrap();
        Fixture {
            _dir: dir,
            service: SyncService::new(store, Some("admin-secret")),
            token,
        }
    }

    fn request(method: &str, path: &str, token: Option<&str>) -> ApiRequest {
        ApiRequest {
            method: method.to_string(),
            path: path.to_string(),
            bearer: token.map(str::to_string),
            ..Default::default()
        }
    }

    fn error_of(response: &ApiResponse) -> String {
        serde_json::from_str::<ErrorBody>(&response.body).unwrap().error
    }

    #[test]
    fn health_needs_no_auth() {
        let f = fixture();
        assert_eq!(f.service.handle(&request("GET", "/healthz", None)).status, 200);
    }

    #[test]
    fn auth_errors_map_to_401_and_404() {
        let f = fixture();
        let missing = f.service.handle(&request("GET", "/projects", None));
        assert_eq!(missing.status, 401);
        assert!(error_of(&missing).contains("bearer"));
        assert_eq!(f.service.handle(&request("GET", "/projects", Some("bogus-token-value"))).status, 401);
        assert_eq!(
            f.service.handle(&request("GET", "/projects/unknown/sync/pull", Some(&f.token))).status,
            404
        );
        assert_eq!(f.service.handle(&request("DELETE", "/projects", Some(&f.token))).status, 404);
    }

    #[test]
    fn push_and_pull_through_handlers() {
        let f = fixture();
        let mut push = request("POST", "/projects/prj-1/sync/push", Some(&f.token));
        push.body = serde_json::to_string(&PushRequest {
            client_version: 0,
            ops: vec![SyncOp {
                op_id: "op-1".into(),
                op_type: "create".into(),
                entity_type: "page".into(),
                entity_id: "p9".into(),
                payload: serde_json::Value::Null,
            }],
        })
        .unwrap();
        let pushed = f.service.handle(&push);
        assert_eq!(pushed.status, 200, "{}", pushed.body);
        let pushed: PushResponse = serde_json::from_str(&pushed.body).unwrap();
        assert_eq!((pushed.server_version, pushed.accepted), (1, 1));

        let mut pull = request("GET", "/projects/prj-1/sync/pull", Some(&f.token));
        pull.query.insert("since".into(), "0".into());
        let pulled: PullResponse = serde_json::from_str(&f.service.handle(&pull).body).unwrap();
        assert_eq!(pulled.ops.len(), 1);
        assert_eq!(pulled.ops[0].actor, "ana");

        pull.query.insert("since".into(), "soon".into());
        assert_eq!(f.service.handle(&pull).status, 400);

        push.body = "{not json".into();
        assert_eq!(f.service.handle(&push).status, 400);
    }

    #[test]
    fn stale_client_version_conflicts() {
        let f = fixture();
        let mut push = request("POST", "/projects/prj-1/sync/push", Some(&f.token));
        push.body = r#"{"client_version": 7, "ops": []}"#.into();
        assert_eq!(f.service.handle(&push).status, 409);
    }

    #[test]
    fn admin_routes_check_the_key() {
        let f = fixture();
        let mut create = request("POST", "/admin/projects", None);
        create.body = r#"{"id": "prj-2", "name": "Second", "members": ["ana"]}"#.into();
        assert_eq!(f.service.handle(&create).status, 401);
        create.admin_key = Some("wrong".into());
        assert_eq!(f.service.handle(&create).status, 401);
        create.admin_key = Some("admin-secret".into());
        let created = f.service.handle(&create);
        assert_eq!(created.status, 201);
        let info: ProjectInfo = serde_json::from_str(&created.body).unwrap();
        assert_eq!(info.id, "prj-2");
        assert_eq!(f.service.handle(&create).status, 409);

        let mut token = request("POST", "/admin/tokens", None);
        token.admin_key = Some("admin-secret".into());
        token.body = r#"{"actor": "bo"}"#.into();
        let issued: IssueTokenResponse = serde_json::from_str(&f.service.handle(&token).body).unwrap();
        assert_eq!(issued.actor, "bo");
        let listed = f.service.handle(&request("GET", "/projects", Some(&issued.token)));
        assert_eq!(listed.body, "[]");
    }

    #[test]
    fn search_reads_query_string() {
        let f = fixture();
        let doc = sample();
        let mut publish = request("PUT", "/projects/prj-1/index", Some(&f.token));
        publish.body = serde_json::to_string(&PublishIndexRequest::from_projection(
            document_hash(&doc).unwrap(),
            project(&doc).unwrap(),
        ))
        .unwrap();
        assert_eq!(f.service.handle(&publish).status, 200);

        let mut search = request("GET", "/projects/prj-1/search", Some(&f.token));
        search.query.insert("tags".into(), "greet".into());
        search.query.insert("types".into(), "balloon,script_line".into());
        let hits: Vec<crate::search::SearchResult> =
            serde_json::from_str(&f.service.handle(&search).body).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "balloon:b1");

        search.query.insert("limit".into(), "0".into());
        assert_eq!(f.service.handle(&search).status, 400);

        let mut used = request("GET", "/projects/prj-1/where-used", Some(&f.token));
        used.query.insert("doc_id".into(), "character:c-ava".into());
        let hits: Vec<crate::search::SearchResult> = serde_json::from_str(&f.service.handle(&used).body).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn serves_over_http_on_ephemeral_port() {
        let f = fixture();
        let running = start(f.service.clone(), "127.0.0.1", 0, 2).unwrap();
        let base = running.base_url();

        let health: serde_json::Value = ureq::get(&format!("{base}/healthz")).call().unwrap().into_json().unwrap();
        assert_eq!(health["ok"], true);

        let projects: Vec<ProjectInfo> = ureq::get(&format!("{base}/projects"))
            .set("Authorization", &format!("Bearer {}", f.token))
            .call()
            .unwrap()
            .into_json()
            .unwrap();
        assert_eq!(projects.len(), 1);

        match ureq::get(&format!("{base}/projects")).call() {
            Err(ureq::Error::Status(code, response)) => {
                assert_eq!(code, 401);
                let body: ErrorBody = response.into_json().unwrap();
                assert!(body.error.contains("unauthorized"));
            }
            other => panic!("expected 401, got {other:?}"),
        }
        running.shutdown();
    }
}
