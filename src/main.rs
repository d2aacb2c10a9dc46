mod cli;
mod config;
mod document;
mod error;
mod index_builder;
mod index_db;
mod logging;
mod manifest;
mod preview;
mod project;
mod projection;
mod protocol;
mod search;
mod server_store;
mod snapshots;
mod sync_client;
mod sync_server;
mod util;

use std::fs;
use std::path::Path;

use clap::Parser;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use crate::cli::{
    AdminCommand, Cli, Command, IndexCommand, PreviewCommand, PreviewKeyArgs, SearchArgs, SnapshotCommand,
    SubjectArgs, SyncCommand,
};
use crate::config::{config_file_path, save_file_config, FileConfig};
use crate::document::ProjectDocument;
use crate::error::{IoContext, Result, VaultError};
use crate::index_db::{document_hash, IndexHealth};
use crate::logging::{init_logging, LogConfig};
use crate::preview::{PreviewKey, PreviewKind};
use crate::project::{resolve_config, Project};
use crate::protocol::PublishIndexRequest;
use crate::search::{SearchBackend, SearchQuery, SearchResult};
use crate::server_store::{type_counts, ServerStore};
use crate::snapshots::{SnapshotRecord, Subject};
use crate::sync_client::{reconcile, SyncClient, SyncState};

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(&LogConfig::from_verbosity(cli.verbose, cli.log_format));

    let root = cli.root.as_path();
    let config = resolve_config(root, cli.config.as_deref())?;
    let json = cli.json;

    match cli.command {
        Command::Init { name } => {
            let project = Project::init(root, &name, config.clone())?;
            let config_path = cli.config.unwrap_or_else(|| config_file_path(root));
            if !config_path.exists() {
                save_file_config(&config_path, &config)?;
            }
            if json {
                print_json(project.document())?;
            } else {
                println!("Created project {:?} ({}) at {}", name, project.document().id, root.display());
            }
            Ok(())
        }

        Command::Show => {
            let project = Project::open(root, config)?;
            if json {
                print_json(project.document())?;
                return Ok(());
            }
            let doc = project.document();
            println!("{} ({})", doc.name, doc.id);
            if let Some(backup) = &project.handle.recovered_from {
                println!("recovered from: {}", backup.display());
            }
            println!("issues:     {}", doc.issues.len());
            println!("pages:      {}", doc.pages().count());
            println!("scripts:    {}", doc.scripts.len());
            println!("characters: {}", doc.characters.len());
            println!("tags:       {}", doc.tags.len());
            Ok(())
        }

        Command::Save { from } => {
            let mut project = Project::open(root, config)?;
            if let Some(path) = from {
                let raw = fs::read_to_string(&path).at(&path)?;
                let document: ProjectDocument = serde_json::from_str(&raw)?;
                document.validate()?;
                project.handle.document = document;
            }
            project.save()?;
            if !project.refresh_index()?.is_ready() {
                debug!("waiting for index refresh");
            }
            let outcome = project.wait_index()?;
            if json {
                print_json(&json!({ "manifest": project.handle.manifest_path, "index": outcome }))?;
            } else {
                println!("Saved {}", project.handle.manifest_path.display());
                if outcome.rebuilt {
                    println!("Index refreshed");
                }
            }
            Ok(())
        }

        Command::SaveAs { new_root } => {
            let mut project = Project::open(root, config)?;
            project.save_as(&new_root)?;
            println!("Saved {}", project.handle.manifest_path.display());
            Ok(())
        }

        Command::Autosave => {
            let project = Project::open(root, config)?;
            let path = manifest::autosave_crash_snapshot(&project.handle)?;
            println!("{}", path.display());
            Ok(())
        }

        Command::Backups { prune } => {
            let removed = match prune {
                Some(keep) => manifest::prune_backups(root, keep)?,
                None => 0,
            };
            let backups = manifest::list_backups(root);
            let crash = manifest::list_crash_snapshots(root);
            if json {
                print_json(&json!({ "backups": backups, "crash_snapshots": crash, "pruned": removed }))?;
            } else {
                for path in &backups {
                    println!("backup  {}", path.display());
                }
                for path in &crash {
                    println!("crash   {}", path.display());
                }
                if removed > 0 {
                    println!("pruned {removed} backup(s)");
                }
            }
            Ok(())
        }

        Command::Index(command) => run_index(root, config, command, json),

        Command::Search { query, remote, project } => {
            let query = search_query(query);
            let results = if remote {
                let project_id = sync_project(root, project)?;
                let client = SyncClient::from_config(&config.sync)?;
                client.project(&project_id).search(&query)?
            } else {
                let project = Project::open(root, config)?;
                project.wait_index()?;
                project.index().search(&query)?
            };
            print_results(&results, json)
        }

        Command::WhereUsed { target, path } => {
            let project = Project::open(root, config)?;
            project.wait_index()?;
            let results = if path {
                project.index().where_used_by_path(&target)?
            } else {
                project.index().where_used(&target)?
            };
            print_results(&results, json)
        }

        Command::Preview(command) => run_preview(root, config, command, json),

        Command::Snapshot(command) => run_snapshot(root, config, command, json),

        Command::Sync(command) => run_sync(root, config, command, json),

        Command::Serve { bind, port, db, workers } => {
            let mut server = config.server.clone();
            if let Some(bind) = bind {
                server.bind = bind;
            }
            if let Some(port) = port {
                server.port = port;
            }
            if let Some(db) = db {
                server.db_path = db;
            }
            if let Some(workers) = workers {
                server.workers = workers;
            }
            sync_server::serve(&server, config.index.busy_timeout_ms)?;
            Ok(())
        }

        Command::Admin(command) => run_admin(&config, command, json),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_results(results: &[SearchResult], json: bool) -> std::result::Result<(), Box<dyn std::error::Error>> {
    if json {
        print_json(results)?;
        return Ok(());
    }
    if results.is_empty() {
        println!("No results");
        return Ok(());
    }
    for hit in results {
        let page = hit.page_id.as_deref().unwrap_or("-");
        println!("{:<10} {:<24} page={page} {}", hit.doc_type, hit.doc_id, hit.path);
        if let Some(snippet) = &hit.snippet {
            println!("    {snippet}");
        }
    }
    Ok(())
}

fn search_query(args: SearchArgs) -> SearchQuery {
    SearchQuery {
        text: args.text,
        character: args.character,
        scene: args.scene,
        tags: args.tags,
        types: args.types,
        page_from: args.page_from,
        page_to: args.page_to,
        limit: args.limit,
        offset: args.offset,
    }
}

/// `--project`, else the project the sync state is bound to, else the document id.
fn sync_project(root: &Path, explicit: Option<String>) -> Result<String> {
    if let Some(id) = explicit {
        return Ok(id);
    }
    if let Some(id) = SyncState::load(root)?.project_id {
        return Ok(id);
    }
    Ok(manifest::open(root)?.document.id)
}

fn run_index(
    root: &Path,
    config: FileConfig,
    command: IndexCommand,
    json: bool,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let project = Project::open(root, config)?;
    match command {
        IndexCommand::Rebuild => {
            if let Err(err) = project.wait_index() {
                info!(error = %err, "background build failed, rebuilding anyway");
            }
            let report = project.index().rebuild(project.document())?;
            if json {
                print_json(&report)?;
            } else {
                println!(
                    "Indexed {} documents, {} cross-references in {} ms",
                    report.documents, report.crossrefs, report.elapsed_ms
                );
            }
        }
        IndexCommand::Status => {
            if let Err(err) = project.wait_index() {
                info!(error = %err, "background build failed");
            }
            let status = project.index().status()?;
            let fresh = status.document_hash.as_deref() == Some(document_hash(project.document())?.as_str());
            if json {
                print_json(&json!({ "status": status, "fresh": fresh }))?;
            } else {
                println!("path:           {}", status.path.display());
                println!("schema version: {}", status.schema_version);
                println!("documents:      {}", status.documents);
                println!("crossrefs:      {}", status.crossrefs);
                println!("previews:       {} ({} bytes)", status.previews, status.preview_bytes);
                println!("snapshots:      {}", status.snapshots);
                println!("fresh:          {fresh}");
            }
        }
        IndexCommand::Check => {
            let health = project.wait_index()?.health;
            if json {
                print_json(&health)?;
            } else {
                match health {
                    IndexHealth::Healthy => println!("ok"),
                    IndexHealth::Rebuilt { backup } => {
                        println!("index was damaged; moved to {} and rebuilt", backup.display())
                    }
                }
            }
        }
    }
    Ok(())
}

fn preview_key(args: &PreviewKeyArgs) -> Result<PreviewKey> {
    let kind = PreviewKind::parse(&args.kind)
        .ok_or_else(|| VaultError::invalid(format!("unknown preview kind {:?}", args.kind)))?;
    let key = PreviewKey::page(&args.page, kind, args.width, args.height);
    Ok(match &args.panel {
        Some(panel) => key.with_panel(panel),
        None => key,
    })
}

fn run_preview(
    root: &Path,
    config: FileConfig,
    command: PreviewCommand,
    json: bool,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let project = Project::open(root, config)?;
    let cache = project.previews();
    match command {
        PreviewCommand::Get { key, out, fill_from } => {
            let key = preview_key(&key)?;
            let blob = match fill_from {
                Some(source) => Some(cache.get_or_create(&key, || fs::read(&source).at(&source))?),
                None => cache.get(&key)?,
            };
            match blob {
                Some(blob) => {
                    fs::write(&out, &blob).at(&out)?;
                    println!("{} bytes -> {}", blob.len(), out.display());
                }
                None => {
                    eprintln!("No cached {} for page {}", key.kind, key.page_id);
                    std::process::exit(1);
                }
            }
        }
        PreviewCommand::Put { key, file } => {
            let key = preview_key(&key)?;
            let blob = fs::read(&file).at(&file)?;
            let report = cache.put(&key, &blob)?;
            if json {
                print_json(&report)?;
            } else {
                println!(
                    "Stored {} bytes; evicted {}; cache holds {} of {} bytes",
                    report.bytes,
                    report.evicted,
                    report.total_bytes,
                    cache.max_bytes()
                );
            }
        }
        PreviewCommand::Invalidate { page } => {
            let removed = cache.invalidate_page(&page)?;
            println!("Removed {removed} entries");
        }
        PreviewCommand::Stats => {
            let stats = cache.stats()?;
            if json {
                print_json(&stats)?;
            } else {
                println!("{} entries, {} / {} bytes", stats.entries, stats.total_bytes, stats.max_bytes);
            }
        }
    }
    Ok(())
}

fn subject(args: &SubjectArgs) -> Result<Subject> {
    match (&args.page, &args.script) {
        (Some(page), None) => Ok(Subject::page(page)),
        (None, Some(script)) => Ok(Subject::script(script)),
        _ => Err(VaultError::invalid("pass exactly one of --page or --script")),
    }
}

/// Current JSON of the subject inside the document.
fn subject_payload(document: &ProjectDocument, subject: &Subject) -> Result<Vec<u8>> {
    let bytes = match subject.kind {
        snapshots::SubjectKind::Page => {
            let page = document
                .page(&subject.id)
                .ok_or_else(|| VaultError::not_found(format!("page {}", subject.id)))?;
            serde_json::to_vec_pretty(page)?
        }
        snapshots::SubjectKind::Script => {
            let script = document
                .scripts
                .iter()
                .find(|s| s.id == subject.id)
                .ok_or_else(|| VaultError::not_found(format!("script {}", subject.id)))?;
            serde_json::to_vec_pretty(script)?
        }
    };
    Ok(bytes)
}

fn write_payload(record: &SnapshotRecord, out: Option<&Path>) -> Result<()> {
    match out {
        Some(path) => {
            fs::write(path, &record.payload).at(path)?;
            println!("{} bytes -> {}", record.payload.len(), path.display());
        }
        None => println!("{}", String::from_utf8_lossy(&record.payload)),
    }
    Ok(())
}

fn run_snapshot(
    root: &Path,
    config: FileConfig,
    command: SnapshotCommand,
    json: bool,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let project = Project::open(root, config)?;
    let log = project.snapshots();
    match command {
        SnapshotCommand::Record { subject: args, file } => {
            let subject = subject(&args)?;
            let payload = match file {
                Some(path) => fs::read(&path).at(&path)?,
                None => subject_payload(project.document(), &subject)?,
            };
            let meta = log.record(&subject, &payload)?;
            if json {
                print_json(&meta)?;
            } else {
                println!("Recorded snapshot {} of {} {}", meta.id, meta.subject.kind, meta.subject.id);
            }
        }
        SnapshotCommand::List { subject: args, limit } => {
            let metas = log.list(&subject(&args)?, limit)?;
            if json {
                print_json(&metas)?;
            } else {
                for meta in &metas {
                    let at = chrono::DateTime::<chrono::Utc>::from_timestamp_micros(meta.created_at)
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_default();
                    println!("{:>6}  {at}  {} bytes", meta.id, meta.bytes);
                }
            }
        }
        SnapshotCommand::Latest { subject: args, out } => {
            let subject = subject(&args)?;
            match log.latest(&subject)? {
                Some(record) => write_payload(&record, out.as_deref())?,
                None => {
                    eprintln!("No snapshots of {} {}", subject.kind, subject.id);
                    std::process::exit(1);
                }
            }
        }
        SnapshotCommand::Show { id, out } => write_payload(&log.get(id)?, out.as_deref())?,
        SnapshotCommand::Prune { subject: args, keep } => {
            let removed = log.prune(&subject(&args)?, keep)?;
            println!("Removed {removed} snapshots");
        }
    }
    Ok(())
}

fn run_sync(
    root: &Path,
    config: FileConfig,
    command: SyncCommand,
    json: bool,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    match command {
        SyncCommand::Record {
            op_type,
            entity_type,
            entity_id,
            payload,
            project,
        } => {
            let project_id = sync_project(root, project)?;
            let payload = match payload {
                Some(raw) => serde_json::from_str(&raw)?,
                None => serde_json::Value::Null,
            };
            let mut state = SyncState::load(root)?;
            state.bind(&project_id)?;
            let op_id = state.record(&op_type, &entity_type, &entity_id, payload)?.op_id.clone();
            state.save(root)?;
            println!("{op_id}");
        }
        SyncCommand::Reconcile { project } => {
            let project_id = sync_project(root, project)?;
            let client = SyncClient::from_config(&config.sync)?;
            let report = reconcile(root, &client, &project_id)?;
            if json {
                print_json(&report)?;
            } else {
                println!(
                    "pushed {} (accepted {}), pulled {} remote ops; server at {}, cursor {}",
                    report.pushed,
                    report.accepted,
                    report.remote_ops.len(),
                    report.server_version,
                    report.cursor
                );
            }
        }
        SyncCommand::Push { project } => {
            let project_id = sync_project(root, project)?;
            let client = SyncClient::from_config(&config.sync)?;
            let mut state = SyncState::load(root)?;
            state.bind(&project_id)?;
            if state.pending.is_empty() {
                println!("Nothing to push");
                return Ok(());
            }
            let response = client.push_ops(&project_id, state.cursor, &state.pending)?;
            state.pending.clear();
            state.save(root)?;
            if json {
                print_json(&response)?;
            } else {
                println!("accepted {}; server at {}", response.accepted, response.server_version);
            }
        }
        SyncCommand::Pull { project, since, limit } => {
            let project_id = sync_project(root, project)?;
            let client = SyncClient::from_config(&config.sync)?;
            print_json(&client.pull_ops(&project_id, since, limit)?)?;
        }
        SyncCommand::Projects => {
            let client = SyncClient::from_config(&config.sync)?;
            let projects = client.list_projects()?;
            if json {
                print_json(&projects)?;
            } else {
                for p in &projects {
                    println!("{:<24} v{:<6} {}", p.id, p.version, p.name);
                }
            }
        }
        SyncCommand::PublishIndex { project } => {
            let project_id = sync_project(root, project)?;
            let client = SyncClient::from_config(&config.sync)?;
            let local = Project::open(root, config)?;
            let projection = projection::project(local.document())?;
            let body = PublishIndexRequest::from_projection(document_hash(local.document())?, projection);
            let response = client.publish_index(&project_id, &body)?;
            print_json(&response)?;
        }
        SyncCommand::FetchIndex { project, out } => {
            let project_id = sync_project(root, project)?;
            let client = SyncClient::from_config(&config.sync)?;
            let snapshot = client.fetch_index(&project_id)?;
            if let Some(path) = out {
                fs::write(&path, serde_json::to_vec_pretty(&snapshot)?).at(&path)?;
            }
            if json {
                print_json(&snapshot)?;
            } else {
                println!(
                    "snapshot {} by {} ({} documents, {} crossrefs)",
                    snapshot.snapshot_id,
                    snapshot.published_by,
                    snapshot.documents.len(),
                    snapshot.crossrefs.len()
                );
                for (doc_type, count) in type_counts(&snapshot) {
                    println!("  {doc_type:<10} {count}");
                }
            }
        }
    }
    Ok(())
}

fn open_server_store(config: &FileConfig, db: Option<&Path>) -> Result<ServerStore> {
    let path = db.unwrap_or(&config.server.db_path);
    ServerStore::open_at(path, config.index.busy_timeout_ms, config.server.max_pull_limit)
}

fn run_admin(
    config: &FileConfig,
    command: AdminCommand,
    json: bool,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    match command {
        AdminCommand::CreateProject { name, id, members, db } => {
            let store = open_server_store(config, db.as_deref())?;
            let info = store.create_project(id.as_deref(), &name, &members)?;
            if json {
                print_json(&info)?;
            } else {
                println!("{}", info.id);
            }
        }
        AdminCommand::IssueToken { actor, token, db } => {
            let store = open_server_store(config, db.as_deref())?;
            let token = match token {
                Some(token) => {
                    store.register_token(&actor, &token)?;
                    token
                }
                None => store.issue_token(&actor)?,
            };
            if json {
                print_json(&json!({ "actor": actor, "token": token }))?;
            } else {
                println!("{token}");
            }
        }
        AdminCommand::AddMember { project, actor, db } => {
            let store = open_server_store(config, db.as_deref())?;
            store.add_member(&project, &actor)?;
            println!("{actor} can now sync {project}");
        }
    }
    Ok(())
}
